//! Change classification against last-known state, and conflict resolution.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};

use crate::config::ConflictPolicy;
use crate::hashing::normalize_value;
use crate::models::conflict::{
    ConflictInfo, ConflictKind, ConflictResolution, ResolutionAction, Winner,
};
use crate::models::record::AirtableRecord;
use crate::models::state::SyncState;

/// Current hashes of both sides, joined against the persisted state.
pub struct ClassifierInput<'a> {
    /// record id → hash over all Airtable fields
    pub airtable_hashes: &'a HashMap<String, String>,
    /// record id → hash over the sheet row (id-column excluded); rows
    /// without an id are not keyed here
    pub sheet_hashes: &'a HashMap<String, String>,
    pub previous: &'a SyncState,
}

/// Per-record verdicts for one run. A record id lands in exactly one bucket.
#[derive(Debug, Default)]
pub struct Classification {
    pub no_change: Vec<String>,
    /// Airtable edited, sheet untouched: push Airtable → sheet.
    pub airtable_changed: Vec<String>,
    /// Sheet edited, Airtable untouched: push sheet → Airtable.
    pub sheets_changed: Vec<String>,
    /// Gone from Airtable, sheet untouched: delete the sheet row.
    pub deleted_in_airtable: Vec<String>,
    /// Gone from the sheet, Airtable untouched: delete the record.
    pub deleted_in_sheets: Vec<String>,
    pub new_in_airtable: Vec<String>,
    pub new_in_sheets: Vec<String>,
    /// Present on both sides with no prior state (typically a pre-populated
    /// sheet on the first run). The policy decides which side seeds the other.
    pub both_new: Vec<String>,
    /// Gone from both sides; only the state entry remains to clean up.
    pub vanished: Vec<String>,
    pub conflicts: Vec<ConflictInfo>,
}

/// Apply the three-way classification matrix to every record id seen on
/// either side or in the persisted state. On a first run (no prior state)
/// everything is new on its own side and nothing conflicts.
pub fn classify(input: &ClassifierInput<'_>) -> Classification {
    let mut out = Classification::default();

    let mut ids: HashSet<&String> = input.airtable_hashes.keys().collect();
    ids.extend(input.sheet_hashes.keys());
    ids.extend(input.previous.records.keys());

    let mut ordered: Vec<&String> = ids.into_iter().collect();
    ordered.sort();

    for id in ordered {
        let a = input.airtable_hashes.get(id);
        let s = input.sheet_hashes.get(id);
        let last = input.previous.record(id);

        let Some(last) = last else {
            match (a, s) {
                (Some(_), Some(_)) => out.both_new.push(id.clone()),
                (Some(_), None) => out.new_in_airtable.push(id.clone()),
                (None, Some(_)) => out.new_in_sheets.push(id.clone()),
                (None, None) => {}
            }
            continue;
        };

        let a_changed = a.is_some_and(|h| *h != last.content_hash);
        // A missing sheet hash (state written by an older version) cannot
        // prove the row unchanged, so treat presence as changed.
        let s_changed = s.is_some_and(|h| last.sheet_hash.as_ref() != Some(h));

        match (a, s) {
            (Some(_), Some(_)) => match (a_changed, s_changed) {
                (false, false) => out.no_change.push(id.clone()),
                (true, false) => out.airtable_changed.push(id.clone()),
                (false, true) => out.sheets_changed.push(id.clone()),
                (true, true) => out.conflicts.push(ConflictInfo {
                    record_id: id.clone(),
                    kind: ConflictKind::BothModified,
                    airtable_hash: a.cloned(),
                    sheet_hash: s.cloned(),
                    last_known_hash: Some(last.content_hash.clone()),
                }),
            },
            (Some(_), None) => {
                if a_changed {
                    out.conflicts.push(ConflictInfo {
                        record_id: id.clone(),
                        kind: ConflictKind::DeletedInSheets,
                        airtable_hash: a.cloned(),
                        sheet_hash: None,
                        last_known_hash: Some(last.content_hash.clone()),
                    });
                } else {
                    out.deleted_in_sheets.push(id.clone());
                }
            }
            (None, Some(_)) => {
                if s_changed {
                    out.conflicts.push(ConflictInfo {
                        record_id: id.clone(),
                        kind: ConflictKind::DeletedInAirtable,
                        airtable_hash: None,
                        sheet_hash: s.cloned(),
                        last_known_hash: Some(last.content_hash.clone()),
                    });
                } else {
                    out.deleted_in_airtable.push(id.clone());
                }
            }
            (None, None) => out.vanished.push(id.clone()),
        }
    }

    out
}

/// Decide the outcome of each conflict under the configured policy.
///
/// `NewestWins` degrades to `AirtableWins` for both-modified records, since
/// neither provider exposes reliable per-cell modification timestamps, and
/// treats deletions as newer than edits.
pub fn resolve_conflicts(
    conflicts: &[ConflictInfo],
    policy: ConflictPolicy,
) -> Vec<ConflictResolution> {
    conflicts
        .iter()
        .map(|c| {
            let (action, winner, reason) = match (policy, c.kind) {
                (ConflictPolicy::AirtableWins, ConflictKind::BothModified) => (
                    ResolutionAction::UseAirtable,
                    Winner::Airtable,
                    "both sides modified; Airtable is authoritative".to_string(),
                ),
                (ConflictPolicy::AirtableWins, ConflictKind::DeletedInAirtable) => (
                    ResolutionAction::Delete,
                    Winner::Airtable,
                    "deleted in Airtable; removing sheet row".to_string(),
                ),
                (ConflictPolicy::AirtableWins, ConflictKind::DeletedInSheets) => (
                    ResolutionAction::UseAirtable,
                    Winner::Airtable,
                    "row deleted in sheet but record edited in Airtable; restoring".to_string(),
                ),
                (ConflictPolicy::SheetsWins, ConflictKind::BothModified) => (
                    ResolutionAction::UseSheets,
                    Winner::Sheets,
                    "both sides modified; sheet is authoritative".to_string(),
                ),
                (ConflictPolicy::SheetsWins, ConflictKind::DeletedInSheets) => (
                    ResolutionAction::Delete,
                    Winner::Sheets,
                    "deleted in sheet; removing Airtable record".to_string(),
                ),
                (ConflictPolicy::SheetsWins, ConflictKind::DeletedInAirtable) => (
                    ResolutionAction::UseSheets,
                    Winner::Sheets,
                    "record deleted in Airtable but row edited in sheet; restoring".to_string(),
                ),
                (ConflictPolicy::NewestWins, ConflictKind::BothModified) => (
                    ResolutionAction::UseAirtable,
                    Winner::Airtable,
                    "newest-wins cannot order edits without cell timestamps; \
                     falling back to Airtable"
                        .to_string(),
                ),
                (ConflictPolicy::NewestWins, ConflictKind::DeletedInAirtable) => (
                    ResolutionAction::Delete,
                    Winner::Airtable,
                    "newest-wins treats deletion as newer than the edit".to_string(),
                ),
                (ConflictPolicy::NewestWins, ConflictKind::DeletedInSheets) => (
                    ResolutionAction::Delete,
                    Winner::Sheets,
                    "newest-wins treats deletion as newer than the edit".to_string(),
                ),
            };
            ConflictResolution {
                record_id: c.record_id.clone(),
                action,
                winner,
                reason,
            }
        })
        .collect()
}

/// Would writing `incoming` change the record? Compares only the incoming
/// keys, after normalization, so untouched fields don't count as changes.
pub fn has_record_changed(existing: &AirtableRecord, incoming: &Map<String, Value>) -> bool {
    for (name, new_value) in incoming {
        let old = existing.field(name).map(normalize_value);
        let new = normalize_value(new_value);
        let new_is_empty =
            matches!(&new, Value::Null) || matches!(&new, Value::String(s) if s.is_empty());
        match old {
            Some(old) if old == new => {}
            None if new_is_empty => {}
            _ => return true,
        }
    }
    false
}
