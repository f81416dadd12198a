use serde::{Deserialize, Serialize};
use std::path::Path;

/// Which way records flow for a given sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    AirtableToSheets,
    SheetsToAirtable,
    Bidirectional,
}

/// Who wins when both sides changed the same record since the last run.
///
/// `NewestWins` degrades to `AirtableWins` for both-modified records: neither
/// provider exposes reliable per-cell modification timestamps, so "newest"
/// cannot be determined for edits. Deletions are treated as newer than edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    AirtableWins,
    SheetsWins,
    NewestWins,
}

/// Whether per-row conversion errors abort the run (strict) or skip the row
/// (lenient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    Strict,
    #[default]
    Lenient,
}

/// A sheet tab, addressed either by its numeric id or by its title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SheetRef {
    Id(i64),
    Name(String),
}

/// One entry of the column mapping: an Airtable field id paired with a
/// zero-based sheet column index. Keys and values must each be unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub field_id: String,
    pub column_index: usize,
}

/// Immutable-per-run description of one sync. Stored as JSON in the row
/// store; unknown fields from older versions are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub id: String,
    pub user_id: String,
    pub airtable_base_id: String,
    pub airtable_table_id: String,
    pub spreadsheet_id: String,
    pub sheet: SheetRef,
    pub direction: SyncDirection,

    /// Ordered mapping from Airtable field id to sheet column index. When
    /// empty, fields map positionally in schema order.
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,

    /// Column reserved for Airtable record ids. Defaults to "AA" so it never
    /// collides with user columns A-Z.
    #[serde(default = "default_id_column_index")]
    pub id_column_index: usize,

    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    #[serde(default)]
    pub delete_extras: bool,

    #[serde(default = "default_true")]
    pub resolve_linked_records: bool,

    #[serde(default)]
    pub create_missing_linked_records: bool,

    #[serde(default = "default_true")]
    pub skip_header_row: bool,

    #[serde(default)]
    pub validation_mode: ValidationMode,

    #[serde(default)]
    pub airtable_view: Option<String>,

    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_airtable_batch")]
    pub airtable_batch_size: usize,

    #[serde(default = "default_sheets_batch")]
    pub sheets_batch_size: usize,

    /// Bound on concurrent provider calls within one stage.
    #[serde(default = "default_fan_out")]
    pub max_fan_out: usize,
}

fn default_id_column_index() -> usize {
    26
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> usize {
    3
}

fn default_airtable_batch() -> usize {
    10
}

fn default_sheets_batch() -> usize {
    100
}

fn default_fan_out() -> usize {
    10
}

impl SyncConfig {
    /// The Airtable API rejects batches larger than 10 records.
    pub fn airtable_batch(&self) -> usize {
        self.airtable_batch_size.clamp(1, 10)
    }

    pub fn sheets_batch(&self) -> usize {
        self.sheets_batch_size.max(1)
    }

    pub fn fan_out(&self) -> usize {
        self.max_fan_out.max(1)
    }

    /// Reject configs that cannot produce a well-defined run.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen_fields = std::collections::HashSet::new();
        let mut seen_columns = std::collections::HashSet::new();
        for m in &self.field_mappings {
            if !seen_fields.insert(m.field_id.as_str()) {
                anyhow::bail!("duplicate field id in mapping: {}", m.field_id);
            }
            if !seen_columns.insert(m.column_index) {
                anyhow::bail!("duplicate column index in mapping: {}", m.column_index);
            }
            if m.column_index == self.id_column_index {
                anyhow::bail!(
                    "column {} is reserved for record ids and cannot be mapped",
                    m.column_index
                );
            }
        }
        Ok(())
    }
}

/// Runner settings loaded from `basesync.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// How often the scheduler looks for due syncs.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_db_path() -> String {
    "./basesync.db".to_string()
}

fn default_interval_secs() -> u64 {
    300
}

impl RunnerConfig {
    /// Load from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: RunnerConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}
