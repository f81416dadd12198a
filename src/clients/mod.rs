pub mod airtable;
pub mod sheets;

pub use airtable::{AirtableClient, HttpAirtableClient, ListOptions};
pub use sheets::{HttpSheetsClient, SheetsClient, column_letter_to_number, column_number_to_letter};
