use serde::Serialize;

/// How the two sides disagree about one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    BothModified,
    DeletedInAirtable,
    DeletedInSheets,
}

/// One detected conflict, with whatever is still known about each side.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictInfo {
    pub record_id: String,
    pub kind: ConflictKind,
    /// Current Airtable-side content hash, if the record still exists there.
    pub airtable_hash: Option<String>,
    /// Current sheet-side row hash, if the row still exists there.
    pub sheet_hash: Option<String>,
    /// Last-known Airtable-side hash from the persisted state, if any.
    pub last_known_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    UseAirtable,
    UseSheets,
    Delete,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Airtable,
    Sheets,
}

/// The decided outcome for one conflict.
#[derive(Debug, Clone, Serialize)]
pub struct ConflictResolution {
    pub record_id: String,
    pub action: ResolutionAction,
    pub winner: Winner,
    pub reason: String,
}
