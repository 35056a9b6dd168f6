//! Delta computation: decides what each replica has to apply.
//!
//! An item is part of the delta towards a replica when that replica's
//! knowledge does not know the other side's version of it. Per item the
//! causal order of the two records decides between nothing, a one-way
//! change and a conflict; a one-way change is translated into the concrete
//! operation the target needs (create, update, rename, delete or a plain
//! metadata stamp). A last pass checks destination paths for collisions.

use crate::config::SyncDirection;
use crate::error::{ItemFailure, SkipReason, SyncResult};
use crate::filter::ScopeFilter;
use crate::recycle::RecycleReason;
use duosync_protocol::{
    Causality, ChangeKind, Conflict, ConflictKind, ConflictResolution, ConflictResolver, ItemId,
    ItemRecord, Knowledge, VersionVector,
};
use duosync_storage::MetadataStore;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// The two ends of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Side {
    Local,
    Remote,
}

impl Side {
    pub(crate) fn other(self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

/// What the applier does for one item.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    /// Store the record; the files already agree.
    Stamp,
    Create,
    Update,
    Rename,
    Delete,
    /// Write over a different item that lost a path conflict. `kind` is
    /// what the change was before the conflict.
    ReplaceLoser { loser: ItemRecord, kind: ChangeKind },
    /// Report the item as skipped.
    Skip { kind: ChangeKind, failure: ItemFailure },
    /// Leave the item for a later session.
    Defer,
}

/// Metadata the source side stores once the change is applied.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FollowUp {
    pub record: ItemRecord,
    /// Version the source side must not claim to know before then.
    pub loser_version: VersionVector,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PlannedChange {
    pub action: Action,
    /// State the target ends up with.
    pub record: ItemRecord,
    /// Target's current record.
    pub current: Option<ItemRecord>,
    pub recycle: Option<RecycleReason>,
    /// Version registered as a knowledge exception until the change lands.
    pub offered: Option<VersionVector>,
    pub follow_up: Option<FollowUp>,
}

impl PlannedChange {
    fn new(action: Action, record: ItemRecord, current: Option<ItemRecord>) -> Self {
        Self {
            action,
            record,
            current,
            recycle: None,
            offered: None,
            follow_up: None,
        }
    }

    /// Kind reported to listeners.
    pub(crate) fn kind(&self) -> ChangeKind {
        match &self.action {
            Action::Create => ChangeKind::Create,
            Action::ReplaceLoser { kind, .. } => *kind,
            Action::Update => ChangeKind::Update,
            Action::Rename => ChangeKind::Rename,
            Action::Delete => ChangeKind::Delete,
            Action::Skip { kind, .. } => *kind,
            Action::Stamp | Action::Defer => record_kind(&self.record),
        }
    }

    /// Path on the target before the change.
    pub(crate) fn current_path(&self) -> Option<&str> {
        self.current
            .as_ref()
            .filter(|c| c.is_live())
            .map(|c| c.path.as_str())
    }

    fn claimed_path(&self) -> Option<&str> {
        if !matches!(self.action, Action::Create | Action::Update | Action::Rename) {
            return None;
        }
        match self.current_path() {
            Some(current) if current == self.record.path => None,
            _ => Some(self.record.path.as_str()),
        }
    }

    fn vacated_path(&self) -> Option<&str> {
        match self.action {
            Action::Delete => self.current_path(),
            Action::Rename | Action::Update | Action::ReplaceLoser { .. } => self
                .current_path()
                .filter(|current| *current != self.record.path),
            _ => None,
        }
    }

    fn defer(&mut self) {
        self.action = Action::Defer;
        self.recycle = None;
        self.follow_up = None;
    }

    fn replace(&mut self, loser: ItemRecord) {
        let kind = self.kind();
        self.action = Action::ReplaceLoser { loser, kind };
        self.recycle = Some(RecycleReason::ConflictLoser);
    }

    fn skip(&mut self, failure: ItemFailure) {
        let kind = self.kind();
        self.action = Action::Skip { kind, failure };
        self.recycle = None;
        self.follow_up = None;
    }

    /// Returns true if the change runs before the renames of its side.
    pub(crate) fn runs_before_renames(&self) -> bool {
        self.order() < 3
    }

    fn order(&self) -> u8 {
        match self.action {
            Action::Stamp | Action::Defer => 0,
            Action::Skip { .. } => 1,
            Action::Delete => 2,
            Action::Rename => 3,
            Action::Update => 4,
            Action::Create | Action::ReplaceLoser { .. } => 5,
        }
    }
}

fn record_kind(record: &ItemRecord) -> ChangeKind {
    if record.tombstone {
        ChangeKind::Delete
    } else {
        record.last_kind
    }
}

fn with_version(mut record: ItemRecord, version: &VersionVector) -> ItemRecord {
    record.version = version.clone();
    record
}

/// Everything one replica has to apply.
#[derive(Debug, Default)]
pub(crate) struct SidePlan {
    pub changes: Vec<PlannedChange>,
    /// Items of the other side this replica did not know at exchange.
    pub incoming: usize,
}

impl SidePlan {
    fn sort(&mut self) {
        self.changes
            .sort_by(|a, b| (a.order(), &a.record.path).cmp(&(b.order(), &b.record.path)));
    }
}

/// Plan for one session.
#[derive(Debug, Default)]
pub(crate) struct SyncPlan {
    pub local: SidePlan,
    pub remote: SidePlan,
    pub conflicts: Vec<Conflict>,
}

impl SyncPlan {
    pub(crate) fn side(&self, side: Side) -> &SidePlan {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut SidePlan {
        match side {
            Side::Local => &mut self.local,
            Side::Remote => &mut self.remote,
        }
    }

    /// Knowledge exceptions `side` must hold while the session applies.
    pub(crate) fn exceptions(&self, side: Side) -> Vec<(ItemId, VersionVector)> {
        let own = self.side(side).changes.iter().filter_map(|change| {
            change
                .offered
                .clone()
                .map(|version| (change.record.item_id, version))
        });
        let follow_ups = self
            .side(side.other())
            .changes
            .iter()
            .filter_map(|change| change.follow_up.as_ref())
            .map(|follow_up| (follow_up.record.item_id, follow_up.loser_version.clone()));
        own.chain(follow_ups).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.local.changes.is_empty() && self.remote.changes.is_empty()
    }
}

/// Inputs of the planner, captured during the knowledge exchange.
pub(crate) struct PlanInput<'a> {
    pub local: &'a dyn MetadataStore,
    pub remote: &'a dyn MetadataStore,
    pub local_knowledge: &'a Knowledge,
    pub remote_knowledge: &'a Knowledge,
    pub direction: SyncDirection,
    pub resolver: &'a dyn ConflictResolver,
    pub filter: &'a dyn ScopeFilter,
}

struct View<'a> {
    records: HashMap<ItemId, ItemRecord>,
    paths: HashMap<String, ItemId>,
    knowledge: &'a Knowledge,
}

impl<'a> View<'a> {
    fn load(store: &dyn MetadataStore, knowledge: &'a Knowledge) -> SyncResult<Self> {
        let records: HashMap<ItemId, ItemRecord> =
            store.all()?.map(|record| (record.item_id, record)).collect();
        let paths = records
            .values()
            .filter(|record| record.is_live())
            .map(|record| (record.path.clone(), record.item_id))
            .collect();
        Ok(Self {
            records,
            paths,
            knowledge,
        })
    }

    fn live_at(&self, path: &str) -> Option<&ItemRecord> {
        self.paths.get(path).and_then(|id| self.records.get(id))
    }
}

/// Computes the plan for one session.
pub(crate) fn compute(input: &PlanInput<'_>) -> SyncResult<SyncPlan> {
    let mut planner = Planner {
        local: View::load(input.local, input.local_knowledge)?,
        remote: View::load(input.remote, input.remote_knowledge)?,
        input,
        plan: SyncPlan::default(),
    };
    planner.run();
    Ok(planner.plan)
}

struct Planner<'a> {
    input: &'a PlanInput<'a>,
    local: View<'a>,
    remote: View<'a>,
    plan: SyncPlan,
}

impl<'a> Planner<'a> {
    fn view(&self, side: Side) -> &View<'a> {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }

    fn permitted(&self, target: Side) -> bool {
        match target {
            Side::Local => self.input.direction.applies_to_local(),
            Side::Remote => self.input.direction.applies_to_remote(),
        }
    }

    /// Items of `source` the other side does not know.
    fn delta(&self, source: Side) -> BTreeSet<ItemId> {
        let target = self.view(source.other()).knowledge;
        self.view(source)
            .records
            .values()
            .filter(|record| !target.knows(record.item_id, &record.version))
            .map(|record| record.item_id)
            .collect()
    }

    fn run(&mut self) {
        let to_remote = self.delta(Side::Local);
        let to_local = self.delta(Side::Remote);
        self.plan.local.incoming = to_local.len();
        self.plan.remote.incoming = to_remote.len();

        for item in to_remote.union(&to_local) {
            self.plan_item(*item, to_remote.contains(item), to_local.contains(item));
        }

        self.resolve_collisions(Side::Remote);
        self.resolve_collisions(Side::Local);
        self.plan.local.sort();
        self.plan.remote.sort();
    }

    fn push(&mut self, target: Side, change: PlannedChange) {
        self.plan.side_mut(target).changes.push(change);
    }

    fn plan_item(&mut self, item: ItemId, new_for_remote: bool, new_for_local: bool) {
        let local = self.local.records.get(&item).cloned();
        let remote = self.remote.records.get(&item).cloned();

        match (local, remote) {
            (Some(l), None) => {
                if new_for_remote {
                    self.one_way(Side::Remote, l, None);
                }
            }
            (None, Some(r)) => {
                if new_for_local {
                    self.one_way(Side::Local, r, None);
                }
            }
            (Some(l), Some(r)) => match l.version.compare(&r.version) {
                Causality::Equal => {
                    if new_for_remote {
                        self.stamp(Side::Remote, r);
                    }
                    if new_for_local {
                        self.stamp(Side::Local, l);
                    }
                }
                Causality::After => {
                    if new_for_remote {
                        self.one_way(Side::Remote, l, Some(r));
                    }
                }
                Causality::Before => {
                    if new_for_local {
                        self.one_way(Side::Local, r, Some(l));
                    }
                }
                Causality::Concurrent => self.conflict(l, r, new_for_remote, new_for_local),
            },
            (None, None) => {}
        }
    }

    fn stamp(&mut self, target: Side, record: ItemRecord) {
        if self.permitted(target) {
            let current = Some(record.clone());
            self.push(target, PlannedChange::new(Action::Stamp, record, current));
        }
    }

    fn one_way(&mut self, target: Side, source: ItemRecord, current: Option<ItemRecord>) {
        if !self.permitted(target) {
            return;
        }
        let offered = source.version.clone();
        let change = self.translate(source, current, false, offered);
        self.push(target, change);
    }

    /// Turns the source record into the operation the target needs.
    fn translate(
        &self,
        source: ItemRecord,
        current: Option<ItemRecord>,
        loser: bool,
        offered: VersionVector,
    ) -> PlannedChange {
        let live = current.clone().filter(ItemRecord::is_live);
        let (action, record, recycle) = match (source.is_live(), live) {
            (false, None) => (Action::Stamp, source, None),
            (false, Some(_)) => {
                let reason = if loser {
                    RecycleReason::ConflictLoser
                } else {
                    RecycleReason::Deleted
                };
                (Action::Delete, source, Some(reason))
            }
            (true, None) => (Action::Create, source, None),
            (true, Some(target)) => {
                let same_content = match (&source.fingerprint, &target.fingerprint) {
                    (Some(a), Some(b)) => a.same_content(b),
                    _ => false,
                };
                if same_content {
                    let record = ItemRecord {
                        fingerprint: target.fingerprint.clone(),
                        ..source
                    };
                    let action = if record.path == target.path {
                        Action::Stamp
                    } else {
                        Action::Rename
                    };
                    (action, record, None)
                } else {
                    let reason = if loser {
                        RecycleReason::ConflictLoser
                    } else {
                        RecycleReason::PreviousOnUpdate
                    };
                    (Action::Update, source, Some(reason))
                }
            }
        };

        let mut change = PlannedChange::new(action, record, current);
        if change.action == Action::Stamp {
            return change;
        }
        change.recycle = recycle;
        if self.in_scope(&change) {
            change.offered = Some(offered);
        } else {
            change.skip(ItemFailure::filtered_out());
        }
        change
    }

    fn in_scope(&self, change: &PlannedChange) -> bool {
        let filter = self.input.filter;
        let destination = change.record.tombstone || filter.includes(&change.record.path);
        let origin = change.current_path().map_or(true, |path| filter.includes(path));
        destination && origin
    }

    fn conflict(&mut self, l: ItemRecord, r: ItemRecord, new_for_remote: bool, new_for_local: bool) {
        if !new_for_remote && !new_for_local {
            return;
        }
        let merged = l.version.merge(&r.version);
        let Some(mut conflict) = Conflict::between(l.clone(), r.clone()) else {
            self.stamp(Side::Local, with_version(l, &merged));
            self.stamp(Side::Remote, with_version(r, &merged));
            return;
        };

        let resolution = conflict.settle(self.input.resolver);
        let kind = conflict.kind;
        debug!(item = %l.item_id, path = %conflict.path(), ?kind, ?resolution, "conflict");
        self.plan.conflicts.push(conflict);

        let winner = match resolution {
            ConflictResolution::KeepLocal => Side::Local,
            ConflictResolution::AcceptRemote => Side::Remote,
            ConflictResolution::Skip => {
                let sides = [
                    (Side::Local, &r, &l, new_for_local),
                    (Side::Remote, &l, &r, new_for_remote),
                ];
                for (target, incoming, current, is_new) in sides {
                    if is_new && self.permitted(target) {
                        let mut change = PlannedChange::new(
                            Action::Defer,
                            incoming.clone(),
                            Some(current.clone()),
                        );
                        change.offered = Some(incoming.version.clone());
                        change.skip(ItemFailure::conflict(format!(
                            "{kind:?} conflict was not resolved"
                        )));
                        self.push(target, change);
                    }
                }
                return;
            }
        };

        let loser = winner.other();
        let (w, x) = match winner {
            Side::Local => (l, r),
            Side::Remote => (r, l),
        };

        if self.permitted(loser) {
            let offered = w.version.clone();
            let mut change = self.translate(with_version(w.clone(), &merged), Some(x.clone()), true, offered);
            let applies = !matches!(change.action, Action::Skip { .. });
            if applies && self.permitted(winner) {
                change.follow_up = Some(FollowUp {
                    record: with_version(w, &merged),
                    loser_version: x.version.clone(),
                });
            }
            self.push(loser, change);
        } else {
            let offered = x.version.clone();
            let mut change = PlannedChange::new(Action::Defer, x, Some(w));
            change.offered = Some(offered);
            change.skip(ItemFailure::conflict(format!(
                "{kind:?} conflict was won by a side that cannot be copied"
            )));
            self.push(winner, change);
        }
    }

    /// Checks every path a change on `target` moves an item to.
    fn resolve_collisions(&mut self, target: Side) {
        let source = target.other();
        let vacated: HashSet<String> = self
            .plan
            .side(target)
            .changes
            .iter()
            .filter_map(|change| change.vacated_path().map(str::to_string))
            .collect();

        for index in 0..self.plan.side(target).changes.len() {
            let change = &self.plan.side(target).changes[index];
            let Some(destination) = change.claimed_path().map(str::to_string) else {
                continue;
            };
            if vacated.contains(&destination) {
                continue;
            }
            let Some(occupant) = self
                .view(target)
                .live_at(&destination)
                .filter(|occupant| occupant.item_id != change.record.item_id)
                .cloned()
            else {
                continue;
            };

            if self
                .view(source)
                .knowledge
                .knows(occupant.item_id, &occupant.version)
            {
                self.plan.side_mut(target).changes[index].skip(ItemFailure::conflict(format!(
                    "{destination} is occupied by another item"
                )));
            } else {
                self.path_conflict(target, index, occupant);
            }
        }
    }

    /// Two distinct items arrive at one path, one on each replica.
    ///
    /// The winner is written over the loser, which becomes a tombstone on
    /// that replica. The losing item's own change is deferred; the
    /// tombstone reaches the other replica in a later session.
    fn path_conflict(&mut self, target: Side, index: usize, occupant: ItemRecord) {
        let source = target.other();
        let change = &self.plan.side(target).changes[index];
        let incoming = change.record.clone();
        let incoming_kind = change.kind();
        let path = incoming.path.clone();

        let mirror = self
            .plan
            .side(source)
            .changes
            .iter()
            .position(|c| {
                c.record.item_id == occupant.item_id
                    && c.record.path == occupant.path
                    && self.claims_path(c)
            });
        let both_created = incoming_kind == ChangeKind::Create
            && mirror.map_or(occupant.last_kind == ChangeKind::Create, |m| {
                self.plan.side(source).changes[m].kind() == ChangeKind::Create
            });

        let (local, remote) = match target {
            Side::Remote => (incoming.clone(), occupant.clone()),
            Side::Local => (occupant.clone(), incoming.clone()),
        };
        let mut conflict = if both_created {
            Conflict::create_create(local, remote)
        } else {
            Conflict::path_collision(local, remote)
        };
        let resolution = conflict.settle(self.input.resolver);
        let kind = conflict.kind;
        debug!(path = %path, ?kind, ?resolution, "path conflict");
        self.plan.conflicts.push(conflict);

        let incoming_wins = matches!(
            (resolution, source),
            (ConflictResolution::KeepLocal, Side::Local)
                | (ConflictResolution::AcceptRemote, Side::Remote)
        );

        if resolution == ConflictResolution::Skip {
            let failure = ItemFailure::conflict(format!("{path} was claimed by two items"));
            self.plan.side_mut(target).changes[index].skip(failure.clone());
            if let Some(m) = mirror {
                self.plan.side_mut(source).changes[m].skip(failure);
            }
        } else if incoming_wins {
            self.plan.side_mut(target).changes[index].replace(occupant);
            if let Some(m) = mirror {
                self.plan.side_mut(source).changes[m].defer();
            }
        } else if let Some(m) = mirror {
            let loser = self
                .view(source)
                .records
                .get(&incoming.item_id)
                .filter(|record| record.is_live())
                .cloned()
                .unwrap_or(incoming);
            self.plan.side_mut(target).changes[index].defer();
            self.plan.side_mut(source).changes[m].replace(loser);
        } else {
            self.plan.side_mut(target).changes[index].skip(ItemFailure::conflict(format!(
                "{path} is kept by an item that cannot be copied"
            )));
        }
    }

    /// Returns true if `change` moves its item onto a path, or was skipped
    /// because of a collision there.
    fn claims_path(&self, change: &PlannedChange) -> bool {
        match &change.action {
            Action::Create | Action::Update | Action::Rename => true,
            Action::Skip { kind, failure } => {
                matches!(kind, ChangeKind::Create | ChangeKind::Update | ChangeKind::Rename)
                    && failure.reason == SkipReason::UnresolvableConflict
                    && !self.plan.conflicts.iter().any(|conflict| {
                        conflict.local.item_id == change.record.item_id
                            && !matches!(
                                conflict.kind,
                                ConflictKind::CreateCreate | ConflictKind::PathCollision
                            )
                    })
            }
            _ => false,
        }
    }
}
