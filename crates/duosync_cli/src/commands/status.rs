//! Status command implementation.

use super::open_existing;
use duosync_protocol::{Knowledge, VersionVector};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Replica status.
#[derive(Debug, Serialize)]
pub struct StatusResult {
    /// Replica folder.
    pub path: String,
    /// Replica id.
    pub replica_id: String,
    /// Number of live items.
    pub live_items: usize,
    /// Number of tombstones.
    pub tombstones: usize,
    /// Knowledge of this replica.
    pub knowledge: KnowledgeSummary,
    /// Remembered knowledge of peers, by replica id.
    pub peers: BTreeMap<String, KnowledgeSummary>,
    /// Item records (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<ItemSummary>>,
}

/// Knowledge in printable form.
#[derive(Debug, Serialize)]
pub struct KnowledgeSummary {
    /// Tick per replica id.
    pub vector: BTreeMap<String, u64>,
    /// Number of items offered but not learned.
    pub exceptions: usize,
}

impl From<&Knowledge> for KnowledgeSummary {
    fn from(knowledge: &Knowledge) -> Self {
        Self {
            vector: vector_map(&knowledge.vector),
            exceptions: knowledge.exceptions.len(),
        }
    }
}

/// A single item record.
#[derive(Debug, Serialize)]
pub struct ItemSummary {
    /// Item id.
    pub item_id: String,
    /// Path (last path for tombstones).
    pub path: String,
    /// Whether the item is deleted.
    pub tombstone: bool,
    /// Size in bytes for live items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Short content hash for live items.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Version vector.
    pub version: BTreeMap<String, u64>,
}

fn vector_map(vector: &VersionVector) -> BTreeMap<String, u64> {
    vector.iter().map(|(id, tick)| (id.to_string(), tick)).collect()
}

/// Runs the status command.
pub fn run(path: &Path, show_items: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let replica = open_existing(path)?;
    let store = replica.store();

    let mut records: Vec<_> = store.all()?.collect();
    records.sort_by(|a, b| a.path.cmp(&b.path));
    let tombstones = records.iter().filter(|record| record.tombstone).count();

    let result = StatusResult {
        path: path.display().to_string(),
        replica_id: replica.id().to_string(),
        live_items: records.len() - tombstones,
        tombstones,
        knowledge: KnowledgeSummary::from(&store.knowledge()?),
        peers: store
            .peer_knowledge()?
            .iter()
            .map(|(id, knowledge)| (id.to_string(), KnowledgeSummary::from(knowledge)))
            .collect(),
        items: show_items.then(|| {
            records
                .iter()
                .map(|record| ItemSummary {
                    item_id: record.item_id.to_string(),
                    path: record.path.clone(),
                    tombstone: record.tombstone,
                    size: record.fingerprint.as_ref().map(|fp| fp.size),
                    hash: record.fingerprint.as_ref().map(|fp| fp.short_hex()),
                    version: vector_map(&record.version),
                })
                .collect()
        }),
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &StatusResult) {
    println!("duosync Replica Status");
    println!("======================");
    println!();
    println!("Path:    {}", result.path);
    println!("Replica: {}", result.replica_id);
    println!();
    println!("Items:");
    println!("  Live:       {}", result.live_items);
    println!("  Tombstones: {}", result.tombstones);
    println!();
    println!("Knowledge:");
    print_knowledge(&result.knowledge);

    if !result.peers.is_empty() {
        println!();
        println!("Peers:");
        for (id, knowledge) in &result.peers {
            println!("  [{id}]");
            print_knowledge(knowledge);
        }
    }

    if let Some(items) = &result.items {
        println!();
        println!("Records:");
        for item in items {
            let state = if item.tombstone { "deleted" } else { "live" };
            match (&item.hash, item.size) {
                (Some(hash), Some(size)) => {
                    println!("  {} ({state}, {size} bytes, {hash})", item.path)
                }
                _ => println!("  {} ({state})", item.path),
            }
        }
    }
}

fn print_knowledge(knowledge: &KnowledgeSummary) {
    for (id, tick) in &knowledge.vector {
        println!("    {id}: {tick}");
    }
    if knowledge.exceptions > 0 {
        println!("    ({} pending items)", knowledge.exceptions);
    }
}
