use ledgerlabel_core::{LabeledTransaction, RawTransaction};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CsvError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Missing required column: {0}")]
    MissingColumn(String),
}

const REQUIRED_COLUMNS: &[&str] = &["date", "description", "amount"];

/// One input row. Only `date`, `description` and `amount` are required
/// columns; field-level problems are left to transaction validation.
#[derive(Debug, Deserialize)]
struct InputRow {
    #[serde(default)]
    account_id: String,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    amount: Option<String>,
}

impl From<InputRow> for RawTransaction {
    fn from(row: InputRow) -> Self {
        RawTransaction {
            account_id: row.account_id,
            date: row.date,
            description: row.description,
            amount: row.amount,
        }
    }
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    account_id: &'a str,
    date: String,
    description: &'a str,
    amount: String,
    normalized: &'a str,
    category: Option<&'a str>,
    vendor: Option<&'a str>,
    source: String,
    confidence: Option<String>,
}

pub fn read_transactions<R: Read>(data: R) -> Result<Vec<RawTransaction>, CsvError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(data);

    let headers = reader.headers()?.clone();
    for column in REQUIRED_COLUMNS {
        if !headers.iter().any(|h| h.eq_ignore_ascii_case(column)) {
            return Err(CsvError::MissingColumn(column.to_string()));
        }
    }
    let lowered: csv::StringRecord = headers.iter().map(|h| h.to_ascii_lowercase()).collect();
    reader.set_headers(lowered);

    let mut records = Vec::new();
    for row in reader.deserialize::<InputRow>() {
        records.push(row?.into());
    }
    Ok(records)
}

pub fn write_labeled<W: Write>(out: W, labeled: &[LabeledTransaction]) -> Result<(), CsvError> {
    let mut writer = csv::Writer::from_writer(out);
    for item in labeled {
        let tx = &item.transaction;
        writer.serialize(OutputRow {
            account_id: &tx.account_id,
            date: tx.date.to_string(),
            description: &tx.description,
            amount: tx.amount.to_string(),
            normalized: &tx.normalized,
            category: item.category.as_deref(),
            vendor: item.vendor.as_deref(),
            source: item.source.to_string(),
            confidence: item.confidence.map(|c| format!("{c:.2}")),
        })?;
    }
    writer.flush()?;
    Ok(())
}
