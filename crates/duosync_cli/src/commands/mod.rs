//! CLI command implementations.

pub mod gc;
pub mod once;
pub mod run;
pub mod status;

use crate::PairArgs;
use duosync_engine::{
    AppliedChange, GlobFilter, Replica, SkippedChange, SyncConfig, SyncListener, SyncOptions,
    SyncOrchestrator, CONTROL_DIR,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors specific to the command line.
#[derive(Error, Debug)]
pub enum CliError {
    /// The folder has never been synchronized.
    #[error("no duosync replica at {0}")]
    NotAReplica(PathBuf),

    /// Both arguments name the same folder.
    #[error("cannot synchronize {0} with itself")]
    SameFolder(PathBuf),
}

/// Prints every applied and skipped change.
pub struct ConsoleListener;

impl SyncListener for ConsoleListener {
    fn on_applied(&self, change: &AppliedChange) {
        println!("{change}");
    }

    fn on_skipped(&self, change: &SkippedChange) {
        println!("{change}");
    }
}

/// Opens both folders and builds an orchestrator for them.
pub fn open_pair(
    pair: &PairArgs,
    listener: Option<Arc<dyn SyncListener>>,
) -> Result<SyncOrchestrator, Box<dyn std::error::Error>> {
    if let (Ok(left), Ok(right)) = (pair.left.canonicalize(), pair.right.canonicalize()) {
        if left == right {
            return Err(CliError::SameFolder(left).into());
        }
    }
    let left = Replica::open_directory(&pair.left)?;
    let right = Replica::open_directory(&pair.right)?;

    let filter = pair
        .excludes
        .iter()
        .fold(GlobFilter::builder(), |builder, pattern| builder.exclude_name(pattern.clone()))
        .build()?;

    let options = if pair.no_recycle {
        SyncOptions::none()
    } else {
        SyncOptions::all()
    };
    let config = SyncConfig::default()
        .with_direction(pair.direction)
        .with_policy(pair.policy)
        .with_options(options);

    let mut builder = SyncOrchestrator::builder(Arc::new(left), Arc::new(right))
        .config(config)
        .filter(Arc::new(filter));
    if let Some(listener) = listener {
        builder = builder.listener(listener);
    }
    Ok(builder.build()?)
}

/// Opens an existing replica folder.
pub fn open_existing(path: &Path) -> Result<Replica, Box<dyn std::error::Error>> {
    if !path.join(CONTROL_DIR).is_dir() {
        return Err(CliError::NotAReplica(path.to_path_buf()).into());
    }
    Ok(Replica::open_directory(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use duosync_engine::{ConflictPolicy, SyncDirection};
    use tempfile::tempdir;

    fn pair(left: &Path, right: &Path) -> PairArgs {
        PairArgs {
            left: left.to_path_buf(),
            right: right.to_path_buf(),
            direction: SyncDirection::Bidirectional,
            policy: ConflictPolicy::NewestWins,
            excludes: vec!["*.lnk".into()],
            no_recycle: false,
        }
    }

    #[test]
    fn status_needs_an_existing_replica() {
        let dir = tempdir().unwrap();
        let err = open_existing(dir.path()).unwrap_err();
        assert!(err.to_string().starts_with("no duosync replica"));
        assert!(!dir.path().join(CONTROL_DIR).exists());
    }

    #[test]
    fn a_folder_cannot_sync_with_itself() {
        let dir = tempdir().unwrap();
        let err = open_pair(&pair(dir.path(), dir.path()), None).unwrap_err();
        assert!(err.to_string().contains("with itself"));
    }

    #[test]
    fn once_pass_copies_and_skips_excluded_names() {
        let left = tempdir().unwrap();
        let right = tempdir().unwrap();
        std::fs::write(left.path().join("notes.txt"), b"hello").unwrap();
        std::fs::write(left.path().join("shortcut.lnk"), b"link").unwrap();

        let orchestrator = open_pair(&pair(left.path(), right.path()), None).unwrap();
        let report = orchestrator.run_pass().unwrap();

        assert_eq!(report.applied_to_remote.len(), 1);
        assert_eq!(std::fs::read(right.path().join("notes.txt")).unwrap(), b"hello");
        assert!(!right.path().join("shortcut.lnk").exists());
    }
}
