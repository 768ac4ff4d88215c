//! CSV loading for the command-line host using Polars
//!
//! Roles are resolved only by explicit column name. A column missing from the
//! header leaves its role unresolved; the engine then reports the schema error.

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;

use crate::data::{ColumnRoles, TransactionInput, TransactionRecord};

/// Timestamp layouts tried in order after RFC 3339
const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%d.%m.%Y %H:%M",
];

const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%m/%d/%Y", "%d.%m.%Y"];

/// Column name expected for each role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub customer_id: String,
    pub transaction_date: String,
    pub quantity: String,
    pub unit_price: String,
    /// Optional authoritative line total
    pub amount: Option<String>,
}

impl Default for ColumnMapping {
    fn default() -> Self {
        Self {
            customer_id: "CustomerID".to_string(),
            transaction_date: "InvoiceDate".to_string(),
            quantity: "Quantity".to_string(),
            unit_price: "UnitPrice".to_string(),
            amount: None,
        }
    }
}

impl ColumnMapping {
    /// Resolve roles against a CSV header
    pub fn resolve(&self, header: &[&str]) -> ColumnRoles {
        let present = |name: &str| header.iter().any(|c| *c == name).then(|| name.to_string());
        ColumnRoles {
            customer_id: present(&self.customer_id),
            transaction_date: present(&self.transaction_date),
            quantity: present(&self.quantity),
            unit_price: present(&self.unit_price),
            amount: self.amount.as_deref().and_then(present),
        }
    }
}

/// Load transaction lines from a CSV file
///
/// # Arguments
/// * `file_path` - Path to the CSV file (with header)
/// * `mapping` - Column name per role
///
/// # Returns
/// * `TransactionInput` ready for the engine; rows without a customer id are skipped
pub fn load_transactions(file_path: &str, mapping: &ColumnMapping) -> anyhow::Result<TransactionInput> {
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(10_000))
        .try_into_reader_with_file_path(Some(file_path.into()))?
        .finish()
        .with_context(|| format!("reading {}", file_path))?;

    let header: Vec<&str> = df.get_column_names().iter().map(|c| c.as_str()).collect();
    let roles = mapping.resolve(&header);
    tracing::debug!(rows = df.height(), columns = header.len(), "csv loaded");

    if mapping.amount.is_none() && header.iter().any(|c| c.eq_ignore_ascii_case("totalamount")) {
        tracing::warn!("ignoring existing TotalAmount column; line totals are quantity x unit price unless --amount-col is given");
    }

    // Hand unresolved roles to the engine so every problem is reported at once
    if roles.validate().is_err() {
        return Ok(TransactionInput::new(roles, Vec::new()));
    }

    let ids = string_values(&df, &mapping.customer_id)?;
    let dates = string_values(&df, &mapping.transaction_date)?;
    let quantities = float_values(&df, &mapping.quantity)?;
    let prices = float_values(&df, &mapping.unit_price)?;
    let amounts = match roles.amount.as_deref() {
        Some(column) => Some(float_values(&df, column)?),
        None => None,
    };

    let mut records = Vec::with_capacity(df.height());
    let mut skipped = 0usize;
    for row in 0..df.height() {
        let Some(customer_id) = ids[row].as_deref() else {
            skipped += 1;
            continue;
        };

        let raw_date = dates[row]
            .as_deref()
            .with_context(|| format!("row {}: missing {}", row, mapping.transaction_date))?;
        let timestamp = parse_timestamp(raw_date)
            .with_context(|| format!("row {}: unrecognised date '{}'", row, raw_date))?;

        // Unparseable numbers travel as NaN so validation names the row
        let mut record = TransactionRecord::new(
            customer_id,
            timestamp,
            quantities[row].unwrap_or(f64::NAN),
            prices[row].unwrap_or(f64::NAN),
        );
        if let Some(amounts) = &amounts {
            record = record.with_amount(amounts[row].unwrap_or(f64::NAN));
        }
        records.push(record);
    }

    if skipped > 0 {
        tracing::info!(skipped, "rows without a customer id skipped");
    }

    Ok(TransactionInput::new(roles, records))
}

/// Parse a timestamp in any of the supported layouts; date-only values mean midnight
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

/// Column values as strings; integral floats lose their ".0"
fn string_values(df: &DataFrame, name: &str) -> anyhow::Result<Vec<Option<String>>> {
    let series = df.column(name)?.as_materialized_series();
    let values: Vec<Option<String>> = match series.dtype() {
        DataType::Float32 | DataType::Float64 => series
            .cast(&DataType::Float64)?
            .f64()?
            .into_iter()
            .map(|v| {
                v.map(|v| {
                    if v.fract() == 0.0 && v.abs() < 1e15 {
                        format!("{}", v as i64)
                    } else {
                        v.to_string()
                    }
                })
            })
            .collect(),
        _ => series
            .cast(&DataType::String)?
            .str()?
            .into_iter()
            .map(|v| v.map(str::to_string))
            .collect(),
    };
    Ok(values)
}

fn float_values(df: &DataFrame, name: &str) -> anyhow::Result<Vec<Option<f64>>> {
    let series = df.column(name)?.as_materialized_series().cast(&DataType::Float64)?;
    Ok(series.f64()?.into_iter().collect())
}
