use std::collections::HashMap;

use serde::Serialize;

use crate::sync::catalog::CatalogEntry;
use crate::sync::state::LocalFileRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Skip,
    Download,
    /// Upstream is unchanged but the promoted version is missing or damaged.
    Repair,
}

#[derive(Debug, Clone)]
pub struct LocalState {
    pub record: LocalFileRecord,
    pub intact: bool,
}

#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub entry: CatalogEntry,
    pub action: PlanAction,
    pub reason: &'static str,
}

impl PlannedFile {
    pub fn needs_transfer(&self) -> bool {
        self.action != PlanAction::Skip
    }
}

pub fn plan(catalog: &[CatalogEntry], local: &HashMap<String, LocalState>) -> Vec<PlannedFile> {
    catalog
        .iter()
        .map(|entry| {
            let (action, reason) = decide(entry, local.get(&entry.name));
            PlannedFile {
                entry: entry.clone(),
                action,
                reason,
            }
        })
        .collect()
}

fn decide(entry: &CatalogEntry, local: Option<&LocalState>) -> (PlanAction, &'static str) {
    let Some(local) = local else {
        return (PlanAction::Download, "not downloaded yet");
    };
    if remote_changed(entry, &local.record) {
        return (PlanAction::Download, "changed upstream");
    }
    if !local.intact {
        return (PlanAction::Repair, "promoted version is damaged");
    }
    (PlanAction::Skip, "unchanged")
}

fn remote_changed(entry: &CatalogEntry, record: &LocalFileRecord) -> bool {
    if let (Some(remote), Some(local)) = (entry.digest.as_deref(), record.digest.as_deref()) {
        return !remote.eq_ignore_ascii_case(local);
    }
    if i64::try_from(entry.size).ok() != Some(record.size) {
        return true;
    }
    if entry.last_modified != record.remote_modified {
        return true;
    }
    if let (Some(remote), Some(local)) = (entry.etag.as_deref(), record.etag.as_deref()) {
        return remote != local;
    }
    false
}
