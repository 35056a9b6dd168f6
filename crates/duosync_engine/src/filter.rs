//! Scope filters deciding which paths take part in synchronization.

use globset::{Glob, GlobSet, GlobSetBuilder};

/// Predicate over replica-relative paths.
///
/// Both replicas' detectors and the planner apply the same filter. A path
/// the filter rejects is never scanned, never tombstoned and never written.
pub trait ScopeFilter: Send + Sync {
    /// Returns true if `path` is synchronized.
    fn includes(&self, path: &str) -> bool;
}

/// Includes every path.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ScopeFilter for AllowAll {
    fn includes(&self, _path: &str) -> bool {
        true
    }
}

impl<F> ScopeFilter for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn includes(&self, path: &str) -> bool {
        self(path)
    }
}

/// Glob based filter.
///
/// File-name excludes match the last path segment (`*.lnk`), path excludes
/// match the whole relative path (`build/**`). When include patterns are
/// given, a path must also match one of them.
#[derive(Debug, Clone)]
pub struct GlobFilter {
    exclude_names: GlobSet,
    exclude_paths: GlobSet,
    includes: Option<GlobSet>,
}

impl GlobFilter {
    /// Starts building a filter.
    pub fn builder() -> GlobFilterBuilder {
        GlobFilterBuilder::default()
    }

    /// A filter excluding the given file-name patterns.
    pub fn excluding_names<I, S>(patterns: I) -> Result<Self, globset::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        patterns
            .into_iter()
            .fold(Self::builder(), |builder, pattern| builder.exclude_name(pattern))
            .build()
    }
}

impl ScopeFilter for GlobFilter {
    fn includes(&self, path: &str) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        if self.exclude_names.is_match(name) || self.exclude_paths.is_match(path) {
            return false;
        }
        self.includes.as_ref().map_or(true, |set| set.is_match(path))
    }
}

/// Builder for [`GlobFilter`].
#[derive(Debug, Clone, Default)]
pub struct GlobFilterBuilder {
    exclude_names: Vec<String>,
    exclude_paths: Vec<String>,
    includes: Vec<String>,
}

impl GlobFilterBuilder {
    /// Excludes files whose name matches `pattern`.
    pub fn exclude_name(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_names.push(pattern.into());
        self
    }

    /// Excludes paths matching `pattern`.
    pub fn exclude_path(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_paths.push(pattern.into());
        self
    }

    /// Restricts the filter to paths matching `pattern` (or any other
    /// include pattern).
    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.includes.push(pattern.into());
        self
    }

    /// Compiles the patterns.
    pub fn build(self) -> Result<GlobFilter, globset::Error> {
        let includes = if self.includes.is_empty() {
            None
        } else {
            Some(compile(&self.includes)?)
        };
        Ok(GlobFilter {
            exclude_names: compile(&self.exclude_names)?,
            exclude_paths: compile(&self.exclude_paths)?,
            includes,
        })
    }
}

fn compile(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    patterns
        .iter()
        .map(|pattern| Glob::new(pattern))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .fold(&mut GlobSetBuilder::new(), |builder, glob| builder.add(glob))
        .build()
}
