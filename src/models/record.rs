use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The closed set of Airtable field types. Unknown API type names are kept
/// verbatim in `Unknown` so the converter can still do best-effort string
/// coercion and the run can report what it saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldType {
    SingleLineText,
    MultilineText,
    RichText,
    Email,
    Url,
    PhoneNumber,
    Number,
    Currency,
    Percent,
    Duration,
    Rating,
    AutoNumber,
    Checkbox,
    Date,
    DateTime,
    CreatedTime,
    LastModifiedTime,
    SingleSelect,
    MultipleSelects,
    MultipleRecordLinks,
    MultipleAttachments,
    Formula,
    Rollup,
    Count,
    Lookup,
    CreatedBy,
    LastModifiedBy,
    SingleCollaborator,
    MultipleCollaborators,
    Barcode,
    Button,
    Unknown(String),
}

impl From<String> for FieldType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "singleLineText" => Self::SingleLineText,
            "multilineText" => Self::MultilineText,
            "richText" => Self::RichText,
            "email" => Self::Email,
            "url" => Self::Url,
            "phoneNumber" => Self::PhoneNumber,
            "number" => Self::Number,
            "currency" => Self::Currency,
            "percent" => Self::Percent,
            "duration" => Self::Duration,
            "rating" => Self::Rating,
            "autoNumber" => Self::AutoNumber,
            "checkbox" => Self::Checkbox,
            "date" => Self::Date,
            "dateTime" => Self::DateTime,
            "createdTime" => Self::CreatedTime,
            "lastModifiedTime" => Self::LastModifiedTime,
            "singleSelect" => Self::SingleSelect,
            "multipleSelects" => Self::MultipleSelects,
            "multipleRecordLinks" => Self::MultipleRecordLinks,
            "multipleAttachments" => Self::MultipleAttachments,
            "formula" => Self::Formula,
            "rollup" => Self::Rollup,
            "count" => Self::Count,
            "lookup" | "multipleLookupValues" => Self::Lookup,
            "createdBy" => Self::CreatedBy,
            "lastModifiedBy" => Self::LastModifiedBy,
            "singleCollaborator" => Self::SingleCollaborator,
            "multipleCollaborators" => Self::MultipleCollaborators,
            "barcode" => Self::Barcode,
            "button" => Self::Button,
            _ => Self::Unknown(s),
        }
    }
}

impl From<FieldType> for String {
    fn from(t: FieldType) -> Self {
        match t {
            FieldType::SingleLineText => "singleLineText".into(),
            FieldType::MultilineText => "multilineText".into(),
            FieldType::RichText => "richText".into(),
            FieldType::Email => "email".into(),
            FieldType::Url => "url".into(),
            FieldType::PhoneNumber => "phoneNumber".into(),
            FieldType::Number => "number".into(),
            FieldType::Currency => "currency".into(),
            FieldType::Percent => "percent".into(),
            FieldType::Duration => "duration".into(),
            FieldType::Rating => "rating".into(),
            FieldType::AutoNumber => "autoNumber".into(),
            FieldType::Checkbox => "checkbox".into(),
            FieldType::Date => "date".into(),
            FieldType::DateTime => "dateTime".into(),
            FieldType::CreatedTime => "createdTime".into(),
            FieldType::LastModifiedTime => "lastModifiedTime".into(),
            FieldType::SingleSelect => "singleSelect".into(),
            FieldType::MultipleSelects => "multipleSelects".into(),
            FieldType::MultipleRecordLinks => "multipleRecordLinks".into(),
            FieldType::MultipleAttachments => "multipleAttachments".into(),
            FieldType::Formula => "formula".into(),
            FieldType::Rollup => "rollup".into(),
            FieldType::Count => "count".into(),
            FieldType::Lookup => "lookup".into(),
            FieldType::CreatedBy => "createdBy".into(),
            FieldType::LastModifiedBy => "lastModifiedBy".into(),
            FieldType::SingleCollaborator => "singleCollaborator".into(),
            FieldType::MultipleCollaborators => "multipleCollaborators".into(),
            FieldType::Barcode => "barcode".into(),
            FieldType::Button => "button".into(),
            FieldType::Unknown(s) => s,
        }
    }
}

impl FieldType {
    /// Computed or system-maintained types: readable, never written.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Self::Formula
                | Self::Rollup
                | Self::Count
                | Self::Lookup
                | Self::CreatedTime
                | Self::LastModifiedTime
                | Self::CreatedBy
                | Self::LastModifiedBy
                | Self::AutoNumber
                | Self::Button
        )
    }

    /// Types we can read from a sheet but cannot faithfully write to
    /// Airtable (no round-trippable cell representation).
    pub fn is_write_unsupported(&self) -> bool {
        matches!(
            self,
            Self::MultipleAttachments
                | Self::SingleCollaborator
                | Self::MultipleCollaborators
                | Self::Barcode
        )
    }

    pub fn is_writable(&self) -> bool {
        !self.is_read_only() && !self.is_write_unsupported()
    }
}

/// One Airtable record as returned by the list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AirtableRecord {
    pub id: String,
    #[serde(default, rename = "createdTime")]
    pub created_time: Option<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl AirtableRecord {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// A select-field choice as exposed by the schema endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectChoice {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldOptions {
    #[serde(default)]
    pub choices: Vec<SelectChoice>,
    #[serde(default, rename = "linkedTableId")]
    pub linked_table_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub options: Option<FieldOptions>,
}

impl FieldSchema {
    pub fn linked_table_id(&self) -> Option<&str> {
        self.options.as_ref()?.linked_table_id.as_deref()
    }

    pub fn choices(&self) -> &[SelectChoice] {
        self.options.as_ref().map(|o| o.choices.as_slice()).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: String,
    pub name: String,
    #[serde(rename = "primaryFieldId")]
    pub primary_field_id: String,
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    pub fn primary_field(&self) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.id == self.primary_field_id)
    }

    pub fn field_by_id(&self, id: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.id == id)
    }

    /// Fields that carry `multipleRecordLinks` values, with their target
    /// table ids.
    pub fn link_fields(&self) -> Vec<&FieldSchema> {
        self.fields
            .iter()
            .filter(|f| f.field_type == FieldType::MultipleRecordLinks)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_type_round_trip() {
        for name in ["singleLineText", "checkbox", "multipleRecordLinks", "dateTime"] {
            let t = FieldType::from(name.to_string());
            assert_eq!(String::from(t), name);
        }
    }

    #[test]
    fn test_unknown_type_preserved() {
        let t = FieldType::from("aiText".to_string());
        assert_eq!(t, FieldType::Unknown("aiText".to_string()));
        assert_eq!(String::from(t), "aiText");
    }

    #[test]
    fn test_read_only_set() {
        assert!(FieldType::Formula.is_read_only());
        assert!(FieldType::AutoNumber.is_read_only());
        assert!(FieldType::Button.is_read_only());
        assert!(!FieldType::Checkbox.is_read_only());
        assert!(!FieldType::MultipleRecordLinks.is_read_only());
    }

    #[test]
    fn test_writable_excludes_attachments() {
        assert!(!FieldType::MultipleAttachments.is_writable());
        assert!(!FieldType::Barcode.is_writable());
        assert!(FieldType::Number.is_writable());
    }

    #[test]
    fn test_schema_deserialization() {
        let json = r#"{
            "id": "tbl1",
            "name": "Tasks",
            "primaryFieldId": "fld1",
            "fields": [
                {"id": "fld1", "name": "Name", "type": "singleLineText"},
                {"id": "fld2", "name": "Owner", "type": "multipleRecordLinks",
                 "options": {"linkedTableId": "tbl2"}},
                {"id": "fld3", "name": "Status", "type": "singleSelect",
                 "options": {"choices": [{"id": "sel1", "name": "Open"}]}}
            ]
        }"#;
        let schema: TableSchema = serde_json::from_str(json).unwrap();
        assert_eq!(schema.primary_field().unwrap().name, "Name");
        assert_eq!(schema.link_fields().len(), 1);
        assert_eq!(schema.link_fields()[0].linked_table_id(), Some("tbl2"));
        assert_eq!(schema.field_by_id("fld3").unwrap().choices()[0].name, "Open");
    }
}
