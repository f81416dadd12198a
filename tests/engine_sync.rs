//! End-to-end engine runs against in-memory provider mocks and the SQLite
//! row store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use basesync::clients::airtable::{AirtableClient, ListOptions};
use basesync::clients::sheets::{SheetsClient, column_letter_to_number};
use basesync::config::{FieldMapping, SheetRef, SyncConfig, SyncDirection};
use basesync::engine::SyncEngine;
use basesync::error::ProviderError;
use basesync::hashing::{hash_record_fields, hash_sheet_row};
use basesync::invoker::CancelToken;
use basesync::models::record::{AirtableRecord, TableSchema};
use basesync::models::sheet::{CellValue, SheetRow};
use basesync::models::state::SyncState;
use basesync::resolver::LinkedRecordResolver;
use basesync::stores::StateStore;
use basesync::sync_db::SyncDb;
use basesync::tokens::{AccessToken, Provider, TokenProvider};

// ── Mock collaborators ──

struct MockAirtable {
    tables: Mutex<HashMap<String, Vec<AirtableRecord>>>,
    schema: Vec<TableSchema>,
    create_failures: Mutex<VecDeque<ProviderError>>,
    create_calls: AtomicUsize,
    next_id: AtomicUsize,
}

impl MockAirtable {
    fn new(schema: Vec<TableSchema>) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            schema,
            create_failures: Mutex::new(VecDeque::new()),
            create_calls: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    fn seed(&self, table: &str, records: Vec<AirtableRecord>) {
        self.tables.lock().unwrap().insert(table.to_string(), records);
    }

    fn records(&self, table: &str) -> Vec<AirtableRecord> {
        self.tables.lock().unwrap().get(table).cloned().unwrap_or_default()
    }

    fn fail_next_creates(&self, failures: Vec<ProviderError>) {
        *self.create_failures.lock().unwrap() = failures.into();
    }
}

#[async_trait]
impl AirtableClient for MockAirtable {
    async fn list_records(
        &self,
        _token: &AccessToken,
        _base: &str,
        table: &str,
        _opts: &ListOptions,
    ) -> Result<Vec<AirtableRecord>, ProviderError> {
        Ok(self.records(table))
    }

    async fn get_base_schema(
        &self,
        _token: &AccessToken,
        _base: &str,
    ) -> Result<Vec<TableSchema>, ProviderError> {
        Ok(self.schema.clone())
    }

    async fn create_records(
        &self,
        _token: &AccessToken,
        _base: &str,
        table: &str,
        fields: &[Map<String, Value>],
    ) -> Result<Vec<AirtableRecord>, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.create_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut tables = self.tables.lock().unwrap();
        let records = tables.entry(table.to_string()).or_default();
        let mut created = Vec::new();
        for f in fields {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let record = AirtableRecord {
                id: format!("rec{n:014}"),
                created_time: Some("2026-01-01T00:00:00Z".into()),
                fields: f.clone(),
            };
            records.push(record.clone());
            created.push(record);
        }
        Ok(created)
    }

    async fn update_records(
        &self,
        _token: &AccessToken,
        _base: &str,
        table: &str,
        updates: &[(String, Map<String, Value>)],
    ) -> Result<(), ProviderError> {
        let mut tables = self.tables.lock().unwrap();
        let records = tables.entry(table.to_string()).or_default();
        for (id, fields) in updates {
            let record = records
                .iter_mut()
                .find(|r| r.id == *id)
                .ok_or_else(|| ProviderError::api(404, format!("record {id} not found")))?;
            for (k, v) in fields {
                record.fields.insert(k.clone(), v.clone());
            }
        }
        Ok(())
    }

    async fn delete_records(
        &self,
        _token: &AccessToken,
        _base: &str,
        table: &str,
        ids: &[String],
    ) -> Result<(), ProviderError> {
        let mut tables = self.tables.lock().unwrap();
        let records = tables.entry(table.to_string()).or_default();
        records.retain(|r| !ids.contains(&r.id));
        Ok(())
    }
}

struct MockSheets {
    rows: Mutex<Vec<SheetRow>>,
    hidden: Mutex<Vec<usize>>,
    column_count: Mutex<usize>,
}

impl MockSheets {
    fn new(rows: Vec<SheetRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
            hidden: Mutex::new(Vec::new()),
            column_count: Mutex::new(26),
        }
    }

    fn snapshot(&self) -> Vec<SheetRow> {
        self.rows.lock().unwrap().clone()
    }

    fn hidden_columns(&self) -> Vec<usize> {
        self.hidden.lock().unwrap().clone()
    }
}

/// A1 cell reference → (zero-based column, one-based row).
fn parse_cell(cell: &str) -> (usize, usize) {
    let split = cell.find(|c: char| c.is_ascii_digit()).unwrap();
    let col = column_letter_to_number(&cell[..split]).unwrap() - 1;
    let row = cell[split..].parse().unwrap();
    (col, row)
}

#[async_trait]
impl SheetsClient for MockSheets {
    async fn get_sheet_data(
        &self,
        _token: &AccessToken,
        _spreadsheet: &str,
        _sheet: &SheetRef,
        _range: &str,
    ) -> Result<Vec<SheetRow>, ProviderError> {
        Ok(self.snapshot())
    }

    async fn update_sheet_data(
        &self,
        _token: &AccessToken,
        _spreadsheet: &str,
        _sheet: &SheetRef,
        range: &str,
        values: &[SheetRow],
    ) -> Result<(), ProviderError> {
        let start = range.split(':').next().unwrap();
        let (start_col, start_row) = parse_cell(start);
        let mut rows = self.rows.lock().unwrap();
        for (i, incoming) in values.iter().enumerate() {
            let target = start_row - 1 + i;
            while rows.len() <= target {
                rows.push(Vec::new());
            }
            let row = &mut rows[target];
            for (j, cell) in incoming.iter().enumerate() {
                let col = start_col + j;
                while row.len() <= col {
                    row.push(CellValue::Empty);
                }
                row[col] = cell.clone();
            }
        }
        Ok(())
    }

    async fn append_rows(
        &self,
        _token: &AccessToken,
        _spreadsheet: &str,
        _sheet: &SheetRef,
        values: &[SheetRow],
    ) -> Result<(), ProviderError> {
        self.rows.lock().unwrap().extend(values.iter().cloned());
        Ok(())
    }

    async fn delete_rows(
        &self,
        _token: &AccessToken,
        _spreadsheet: &str,
        _sheet_id: i64,
        start_row: usize,
        count: usize,
    ) -> Result<(), ProviderError> {
        let mut rows = self.rows.lock().unwrap();
        let end = (start_row + count).min(rows.len());
        if start_row < rows.len() {
            rows.drain(start_row..end);
        }
        Ok(())
    }

    async fn ensure_columns_exist(
        &self,
        _token: &AccessToken,
        _spreadsheet: &str,
        _sheet_id: i64,
        min_columns: usize,
    ) -> Result<(), ProviderError> {
        let mut count = self.column_count.lock().unwrap();
        if *count < min_columns {
            *count = min_columns;
        }
        Ok(())
    }

    async fn hide_column(
        &self,
        _token: &AccessToken,
        _spreadsheet: &str,
        _sheet_id: i64,
        column_index: usize,
    ) -> Result<(), ProviderError> {
        self.hidden.lock().unwrap().push(column_index);
        Ok(())
    }

    async fn resolve_sheet_id(
        &self,
        _token: &AccessToken,
        _spreadsheet: &str,
        _sheet: &SheetRef,
    ) -> Result<i64, ProviderError> {
        Ok(0)
    }
}

struct StaticTokens;

#[async_trait]
impl TokenProvider for StaticTokens {
    async fn for_user(&self, _user: &str, _provider: Provider) -> anyhow::Result<AccessToken> {
        Ok(AccessToken::new("test-token"))
    }
}

// ── Fixtures ──

fn main_schema(with_owner: bool) -> Vec<TableSchema> {
    let mut fields = vec![
        json!({"id": "fldName", "name": "Name", "type": "singleLineText"}),
        json!({"id": "fldAge", "name": "Age", "type": "number"}),
    ];
    if with_owner {
        fields.push(json!({
            "id": "fldOwner", "name": "Owner", "type": "multipleRecordLinks",
            "options": {"linkedTableId": "tblPeople"}
        }));
    }
    let mut tables = vec![json!({
        "id": "tblMain", "name": "Tasks", "primaryFieldId": "fldName",
        "fields": fields
    })];
    if with_owner {
        tables.push(json!({
            "id": "tblPeople", "name": "People", "primaryFieldId": "fldPName",
            "fields": [{"id": "fldPName", "name": "Name", "type": "singleLineText"}]
        }));
    }
    tables
        .into_iter()
        .map(|t| serde_json::from_value(t).unwrap())
        .collect()
}

fn record(id: &str, fields: Value) -> AirtableRecord {
    AirtableRecord {
        id: id.to_string(),
        created_time: Some("2026-01-01T00:00:00Z".into()),
        fields: fields.as_object().unwrap().clone(),
    }
}

fn config(direction: SyncDirection, mappings: Vec<(&str, usize)>) -> SyncConfig {
    let mut cfg: SyncConfig = serde_json::from_value(json!({
        "id": "cfg1",
        "user_id": "u1",
        "airtable_base_id": "appMain",
        "airtable_table_id": "tblMain",
        "spreadsheet_id": "ssMain",
        "sheet": "Sheet1",
        "direction": "airtable_to_sheets",
        "skip_header_row": false
    }))
    .unwrap();
    cfg.direction = direction;
    cfg.field_mappings = mappings
        .into_iter()
        .map(|(field_id, column_index)| FieldMapping {
            field_id: field_id.to_string(),
            column_index,
        })
        .collect();
    cfg
}

struct Harness {
    engine: SyncEngine,
    db: Arc<SyncDb>,
    airtable: Arc<MockAirtable>,
    sheets: Arc<MockSheets>,
}

fn harness(cfg: &SyncConfig, airtable: MockAirtable, sheets: MockSheets) -> Harness {
    let db = Arc::new(SyncDb::open_in_memory().unwrap());
    db.upsert_config(cfg, true).unwrap();
    let airtable = Arc::new(airtable);
    let sheets = Arc::new(sheets);
    let engine = SyncEngine::new(
        db.clone(),
        Arc::new(StaticTokens),
        airtable.clone(),
        sheets.clone(),
        db.clone(),
        db.clone(),
        Arc::new(LinkedRecordResolver::default()),
    );
    Harness { engine, db, airtable, sheets }
}

fn cell_text(row: &SheetRow, col: usize) -> String {
    row.get(col).map(|c| c.as_trimmed_str()).unwrap_or_default()
}

// ── Scenarios ──

#[tokio::test]
async fn first_run_airtable_to_empty_sheet() {
    let cfg = config(SyncDirection::AirtableToSheets, vec![("fldName", 0), ("fldAge", 1)]);
    let airtable = MockAirtable::new(main_schema(false));
    airtable.seed(
        "tblMain",
        vec![
            record("recA", json!({"Name": "Alice", "Age": 30})),
            record("recB", json!({"Name": "Bob", "Age": null})),
        ],
    );
    let h = harness(&cfg, airtable, MockSheets::new(vec![]));

    let result = h.engine.run_sync("cfg1", &CancelToken::new()).await;
    assert_eq!(result.added, 2, "errors: {:?}", result.errors);
    assert_eq!(result.updated, 0);
    assert_eq!(result.deleted, 0);

    let rows = h.sheets.snapshot();
    assert_eq!(rows.len(), 2);
    assert_eq!(cell_text(&rows[0], 0), "Alice");
    assert_eq!(cell_text(&rows[0], 1), "30");
    assert_eq!(cell_text(&rows[0], 26), "recA");
    assert_eq!(cell_text(&rows[1], 0), "Bob");
    assert!(rows[1][1].is_empty());
    assert_eq!(cell_text(&rows[1], 26), "recB");
    assert!(h.sheets.hidden_columns().contains(&26));

    let state = StateStore::get(h.db.as_ref(), "cfg1").unwrap().unwrap();
    assert_eq!(state.records.len(), 2);
}

#[tokio::test]
async fn second_run_with_no_changes_is_idempotent() {
    let cfg = config(SyncDirection::AirtableToSheets, vec![("fldName", 0), ("fldAge", 1)]);
    let airtable = MockAirtable::new(main_schema(false));
    airtable.seed("tblMain", vec![record("recA", json!({"Name": "Alice", "Age": 30}))]);
    let h = harness(&cfg, airtable, MockSheets::new(vec![]));

    let first = h.engine.run_sync("cfg1", &CancelToken::new()).await;
    assert_eq!(first.added, 1);
    let state_before = StateStore::get(h.db.as_ref(), "cfg1").unwrap().unwrap();

    let second = h.engine.run_sync("cfg1", &CancelToken::new()).await;
    assert_eq!((second.added, second.updated, second.deleted), (0, 0, 0));

    let state_after = StateStore::get(h.db.as_ref(), "cfg1").unwrap().unwrap();
    assert_eq!(
        state_before.records["recA"].content_hash,
        state_after.records["recA"].content_hash
    );
    assert_eq!(
        state_before.records["recA"].sheet_hash,
        state_after.records["recA"].sheet_hash
    );
}

#[tokio::test]
async fn formula_injection_round_trip() {
    // Sheet → Airtable: the value is stored verbatim.
    let cfg = config(SyncDirection::SheetsToAirtable, vec![("fldName", 0)]);
    let airtable = MockAirtable::new(main_schema(false));
    let sheets = MockSheets::new(vec![vec![CellValue::text("= 1+1")]]);
    let h = harness(&cfg, airtable, sheets);

    let result = h.engine.run_sync("cfg1", &CancelToken::new()).await;
    assert_eq!(result.added, 1, "errors: {:?}", result.errors);
    let records = h.airtable.records("tblMain");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].fields["Name"], json!("= 1+1"));

    // Airtable → sheet: the cell comes back apostrophe-guarded.
    let mut back = config(SyncDirection::AirtableToSheets, vec![("fldName", 0)]);
    back.id = "cfg2".into();
    h.db.upsert_config(&back, true).unwrap();
    let result = h.engine.run_sync("cfg2", &CancelToken::new()).await;
    assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
    let rows = h.sheets.snapshot();
    assert_eq!(cell_text(&rows[0], 0), "'= 1+1");
}

#[tokio::test]
async fn primary_field_identity_recovery() {
    let cfg = config(SyncDirection::SheetsToAirtable, vec![("fldName", 0), ("fldAge", 1)]);
    let airtable = MockAirtable::new(main_schema(false));
    airtable.seed("tblMain", vec![record("recA", json!({"Name": "Alice", "Age": 30}))]);
    // Row with matching primary-field value but a blank id cell.
    let sheets = MockSheets::new(vec![vec![CellValue::text("Alice"), CellValue::Number(30.0)]]);
    let h = harness(&cfg, airtable, sheets);

    let result = h.engine.run_sync("cfg1", &CancelToken::new()).await;
    assert_eq!(result.added, 0, "errors: {:?}", result.errors);
    assert_eq!(result.updated, 0);
    assert_eq!(h.airtable.records("tblMain").len(), 1);

    // The recovered id was written back into the id-column.
    let rows = h.sheets.snapshot();
    assert_eq!(cell_text(&rows[0], 26), "recA");
    assert!(h.sheets.hidden_columns().contains(&26));
}

#[tokio::test]
async fn both_modified_conflict_airtable_wins() {
    let cfg = config(SyncDirection::Bidirectional, vec![("fldName", 0)]);
    let airtable = MockAirtable::new(main_schema(false));
    airtable.seed("tblMain", vec![record("recA", json!({"Name": "Alicia"}))]);
    let sheets = MockSheets::new(vec![{
        let mut row = vec![CellValue::text("Allie")];
        row.resize(27, CellValue::Empty);
        row[26] = CellValue::text("recA");
        row
    }]);
    let h = harness(&cfg, airtable, sheets);

    // Last-known state: both sides agreed on "Alice".
    let mut prior = SyncState::new("cfg1");
    let old_fields = json!({"Name": "Alice"}).as_object().unwrap().clone();
    let mut old_row = vec![CellValue::text("Alice")];
    old_row.resize(27, CellValue::Empty);
    old_row[26] = CellValue::text("recA");
    prior.upsert(basesync::models::state::RecordState {
        record_id: "recA".into(),
        content_hash: hash_record_fields(&old_fields),
        sheet_hash: Some(hash_sheet_row(&old_row, 26)),
        airtable_modified_time: None,
        sheets_modified_time: None,
        captured_at: "2026-01-01T00:00:00Z".into(),
    });
    StateStore::put(h.db.as_ref(), "cfg1", &prior).unwrap();

    let result = h.engine.run_sync("cfg1", &CancelToken::new()).await;
    assert_eq!(result.conflicts, 1, "errors: {:?}", result.errors);
    assert_eq!(result.updated, 1);

    // Airtable wins: the sheet now shows "Alicia" and both hashes advanced.
    let rows = h.sheets.snapshot();
    assert_eq!(cell_text(&rows[0], 0), "Alicia");
    let state = StateStore::get(h.db.as_ref(), "cfg1").unwrap().unwrap();
    let new_fields = json!({"Name": "Alicia"}).as_object().unwrap().clone();
    assert_eq!(state.records["recA"].content_hash, hash_record_fields(&new_fields));
    assert_eq!(
        state.records["recA"].sheet_hash.as_deref(),
        Some(hash_sheet_row(&rows[0], 26).as_str())
    );
}

#[tokio::test]
async fn linked_records_render_primary_field_values() {
    let cfg = config(
        SyncDirection::AirtableToSheets,
        vec![("fldName", 0), ("fldOwner", 1)],
    );
    let airtable = MockAirtable::new(main_schema(true));
    airtable.seed(
        "tblMain",
        vec![record("recA", json!({"Name": "Task 1", "Owner": [{"id": "recX"}]}))],
    );
    airtable.seed("tblPeople", vec![record("recX", json!({"Name": "Jane"}))]);
    let h = harness(&cfg, airtable, MockSheets::new(vec![]));

    let result = h.engine.run_sync("cfg1", &CancelToken::new()).await;
    assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
    let rows = h.sheets.snapshot();
    assert_eq!(cell_text(&rows[0], 1), "Jane");
}

#[tokio::test(start_paused = true)]
async fn rate_limited_create_retries_until_success() {
    let cfg = config(SyncDirection::SheetsToAirtable, vec![("fldName", 0)]);
    let airtable = MockAirtable::new(main_schema(false));
    airtable.fail_next_creates(vec![
        ProviderError::api(429, "Too Many Requests"),
        ProviderError::api(429, "Too Many Requests"),
    ]);
    let sheets = MockSheets::new(vec![vec![CellValue::text("New task")]]);
    let h = harness(&cfg, airtable, sheets);

    let result = h.engine.run_sync("cfg1", &CancelToken::new()).await;
    assert_eq!(result.added, 1, "errors: {:?}", result.errors);
    assert!(result.errors.is_empty());
    assert_eq!(h.airtable.create_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn bidirectional_convergence_without_conflicts() {
    let cfg = config(SyncDirection::Bidirectional, vec![("fldName", 0), ("fldAge", 1)]);
    let airtable = MockAirtable::new(main_schema(false));
    airtable.seed("tblMain", vec![record("recA", json!({"Name": "Alice", "Age": 30}))]);
    // One sheet-originated row without an id.
    let sheets = MockSheets::new(vec![vec![CellValue::text("Bob"), CellValue::Number(44.0)]]);
    let h = harness(&cfg, airtable, sheets);

    let result = h.engine.run_sync("cfg1", &CancelToken::new()).await;
    assert!(result.errors.is_empty(), "errors: {:?}", result.errors);
    assert_eq!(result.added, 2); // Bob created in Airtable, Alice appended to sheet

    let records = h.airtable.records("tblMain");
    assert_eq!(records.len(), 2);
    let rows = h.sheets.snapshot();
    assert_eq!(rows.len(), 2);

    // Every row now carries a record id and the state tracks both.
    for row in &rows {
        assert!(!cell_text(row, 26).is_empty());
    }
    let state = StateStore::get(h.db.as_ref(), "cfg1").unwrap().unwrap();
    assert_eq!(state.records.len(), 2);

    // A second round has nothing left to do.
    let again = h.engine.run_sync("cfg1", &CancelToken::new()).await;
    assert_eq!((again.added, again.updated, again.deleted), (0, 0, 0));
    assert!(again.errors.is_empty(), "errors: {:?}", again.errors);
}

#[tokio::test]
async fn delete_extras_removes_stale_sheet_rows() {
    let mut cfg = config(SyncDirection::AirtableToSheets, vec![("fldName", 0)]);
    cfg.delete_extras = true;
    let airtable = MockAirtable::new(main_schema(false));
    airtable.seed("tblMain", vec![record("recA", json!({"Name": "Keep"}))]);
    let sheets = MockSheets::new(vec![
        {
            let mut row = vec![CellValue::text("Keep")];
            row.resize(27, CellValue::Empty);
            row[26] = CellValue::text("recA");
            row
        },
        {
            let mut row = vec![CellValue::text("Stale")];
            row.resize(27, CellValue::Empty);
            row[26] = CellValue::text("recGONE");
            row
        },
    ]);
    let h = harness(&cfg, airtable, sheets);

    let result = h.engine.run_sync("cfg1", &CancelToken::new()).await;
    assert_eq!(result.deleted, 1, "errors: {:?}", result.errors);
    let rows = h.sheets.snapshot();
    assert_eq!(rows.len(), 1);
    assert_eq!(cell_text(&rows[0], 0), "Keep");
}

#[tokio::test]
async fn strict_mode_terminates_without_advancing_state() {
    let mut cfg = config(SyncDirection::SheetsToAirtable, vec![("fldName", 0), ("fldAge", 1)]);
    cfg.validation_mode = basesync::ValidationMode::Strict;
    let airtable = MockAirtable::new(main_schema(false));
    let sheets = MockSheets::new(vec![vec![
        CellValue::text("Alice"),
        CellValue::text("not-a-number"),
    ]]);
    let h = harness(&cfg, airtable, sheets);

    let result = h.engine.run_sync("cfg1", &CancelToken::new()).await;
    assert!(!result.succeeded());
    assert_eq!(result.added, 0);
    assert!(h.airtable.records("tblMain").is_empty());
    assert!(StateStore::get(h.db.as_ref(), "cfg1").unwrap().is_none());
}

#[tokio::test]
async fn lenient_mode_skips_bad_rows_and_continues() {
    let cfg = config(SyncDirection::SheetsToAirtable, vec![("fldName", 0), ("fldAge", 1)]);
    let airtable = MockAirtable::new(main_schema(false));
    let sheets = MockSheets::new(vec![
        vec![CellValue::text("Alice"), CellValue::text("not-a-number")],
        vec![CellValue::text("Bob"), CellValue::Number(44.0)],
    ]);
    let h = harness(&cfg, airtable, sheets);

    let result = h.engine.run_sync("cfg1", &CancelToken::new()).await;
    assert_eq!(result.added, 1);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].row.is_some());
    let records = h.airtable.records("tblMain");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].fields["Name"], json!("Bob"));
}

#[tokio::test]
async fn cancelled_run_reports_and_preserves_state() {
    let cfg = config(SyncDirection::AirtableToSheets, vec![("fldName", 0)]);
    let airtable = MockAirtable::new(main_schema(false));
    airtable.seed("tblMain", vec![record("recA", json!({"Name": "Alice"}))]);
    let h = harness(&cfg, airtable, MockSheets::new(vec![]));

    let cancel = CancelToken::new();
    cancel.cancel();
    let result = h.engine.run_sync("cfg1", &cancel).await;
    assert!(!result.succeeded());
    assert!(result
        .errors
        .iter()
        .any(|e| e.kind == basesync::error::ErrorKind::Cancelled));
    assert!(StateStore::get(h.db.as_ref(), "cfg1").unwrap().is_none());
}
