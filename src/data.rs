//! Transaction records, column roles and RFM metric computation

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Advisory, Result, SchemaIssue, SegmentationError};

/// Semantic role of a source column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    /// Customer identifier
    CustomerId,
    /// Transaction timestamp
    TransactionDate,
    /// Units sold on the line
    Quantity,
    /// Price per unit
    UnitPrice,
    /// Optional user-supplied line total
    Amount,
}

impl ColumnRole {
    /// Roles the engine cannot run without
    pub const REQUIRED: [ColumnRole; 4] = [
        ColumnRole::CustomerId,
        ColumnRole::TransactionDate,
        ColumnRole::Quantity,
        ColumnRole::UnitPrice,
    ];

    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnRole::CustomerId => "customer_id",
            ColumnRole::TransactionDate => "transaction_date",
            ColumnRole::Quantity => "quantity",
            ColumnRole::UnitPrice => "unit_price",
            ColumnRole::Amount => "amount",
        }
    }
}

impl fmt::Display for ColumnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source column resolved for each role, as handed over by ingestion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRoles {
    /// Column holding the customer identifier
    pub customer_id: Option<String>,
    /// Column holding the transaction date
    pub transaction_date: Option<String>,
    /// Column holding the quantity
    pub quantity: Option<String>,
    /// Column holding the unit price
    pub unit_price: Option<String>,
    /// Column holding an authoritative line total, if any
    pub amount: Option<String>,
}

impl ColumnRoles {
    /// Roles with all required columns resolved
    pub fn new(
        customer_id: impl Into<String>,
        transaction_date: impl Into<String>,
        quantity: impl Into<String>,
        unit_price: impl Into<String>,
    ) -> Self {
        Self {
            customer_id: Some(customer_id.into()),
            transaction_date: Some(transaction_date.into()),
            quantity: Some(quantity.into()),
            unit_price: Some(unit_price.into()),
            amount: None,
        }
    }

    /// Also resolve the optional amount role
    pub fn with_amount(mut self, column: impl Into<String>) -> Self {
        self.amount = Some(column.into());
        self
    }

    /// Column resolved for `role`
    pub fn column(&self, role: ColumnRole) -> Option<&str> {
        match role {
            ColumnRole::CustomerId => self.customer_id.as_deref(),
            ColumnRole::TransactionDate => self.transaction_date.as_deref(),
            ColumnRole::Quantity => self.quantity.as_deref(),
            ColumnRole::UnitPrice => self.unit_price.as_deref(),
            ColumnRole::Amount => self.amount.as_deref(),
        }
    }

    /// Check every required role at once.
    ///
    /// Returns a single `Schema` error listing every unresolved role and
    /// every source column claimed by more than one role.
    pub fn validate(&self) -> Result<()> {
        let mut issues: Vec<SchemaIssue> = ColumnRole::REQUIRED
            .iter()
            .filter(|role| self.column(**role).map_or(true, |c| c.trim().is_empty()))
            .map(|role| SchemaIssue::Unresolved(*role))
            .collect();

        let mut by_column: BTreeMap<&str, Vec<ColumnRole>> = BTreeMap::new();
        for role in ColumnRole::REQUIRED.iter().chain(std::iter::once(&ColumnRole::Amount)) {
            if let Some(column) = self.column(*role).filter(|c| !c.trim().is_empty()) {
                by_column.entry(column).or_default().push(*role);
            }
        }
        for (column, roles) in by_column {
            if roles.len() > 1 {
                issues.push(SchemaIssue::SharedColumn {
                    column: column.to_string(),
                    roles,
                });
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(SegmentationError::Schema { issues })
        }
    }
}

/// One transaction line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Customer the line belongs to
    pub customer_id: String,
    /// When the transaction happened
    pub timestamp: NaiveDateTime,
    /// Units on the line
    pub quantity: f64,
    /// Price per unit
    pub unit_price: f64,
    /// User-supplied line total; authoritative when present
    pub amount: Option<f64>,
}

impl TransactionRecord {
    /// Create a record without a supplied line total
    pub fn new(
        customer_id: impl Into<String>,
        timestamp: NaiveDateTime,
        quantity: f64,
        unit_price: f64,
    ) -> Self {
        Self {
            customer_id: customer_id.into(),
            timestamp,
            quantity,
            unit_price,
            amount: None,
        }
    }

    /// Attach a user-supplied line total
    pub fn with_amount(mut self, amount: f64) -> Self {
        self.amount = Some(amount);
        self
    }

    /// Value of the line: the supplied amount, else quantity × unit price
    pub fn line_value(&self) -> f64 {
        self.amount.unwrap_or(self.quantity * self.unit_price)
    }
}

/// Immutable snapshot handed to the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInput {
    /// Where each role came from
    pub roles: ColumnRoles,
    /// Transaction lines in input order
    pub records: Vec<TransactionRecord>,
}

impl TransactionInput {
    /// Bundle roles and records
    pub fn new(roles: ColumnRoles, records: Vec<TransactionRecord>) -> Self {
        Self { roles, records }
    }

    /// Validate roles, then the values carried by each role.
    ///
    /// Value checks report the first offending row per role. A record's
    /// `amount` is only honored when the amount role is resolved.
    pub fn validate(&self) -> Result<()> {
        self.roles.validate()?;

        let mut issues = Vec::new();
        let mut first_bad = |role: ColumnRole, found: Option<(usize, String)>| {
            if let Some((row, value)) = found {
                issues.push(SchemaIssue::InvalidValue { role, row, value });
            }
        };

        first_bad(
            ColumnRole::CustomerId,
            self.records
                .iter()
                .position(|r| r.customer_id.trim().is_empty())
                .map(|row| (row, "\"\"".to_string())),
        );
        first_bad(
            ColumnRole::Quantity,
            self.records
                .iter()
                .enumerate()
                .find(|(_, r)| !r.quantity.is_finite())
                .map(|(row, r)| (row, r.quantity.to_string())),
        );
        first_bad(
            ColumnRole::UnitPrice,
            self.records
                .iter()
                .enumerate()
                .find(|(_, r)| !r.unit_price.is_finite())
                .map(|(row, r)| (row, r.unit_price.to_string())),
        );
        if self.roles.amount.is_some() {
            first_bad(
                ColumnRole::Amount,
                self.records
                    .iter()
                    .enumerate()
                    .find(|(_, r)| r.amount.is_some_and(|a| !a.is_finite()))
                    .map(|(row, r)| (row, format!("{:?}", r.amount))),
            );
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(SegmentationError::Schema { issues })
        }
    }

    fn line_value(&self, record: &TransactionRecord) -> f64 {
        if self.roles.amount.is_some() {
            record.line_value()
        } else {
            record.quantity * record.unit_price
        }
    }

    /// Schema error for a row whose value leaves the finite range
    fn overflow_at(&self, row: usize, record: &TransactionRecord, value: String) -> SegmentationError {
        let role = if self.roles.amount.is_some() && record.amount.is_some() {
            ColumnRole::Amount
        } else {
            ColumnRole::UnitPrice
        };
        SegmentationError::Schema {
            issues: vec![SchemaIssue::InvalidValue { role, row, value }],
        }
    }
}

/// RFM metrics for one customer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerMetrics {
    /// Customer identifier
    pub customer_id: String,
    /// Days since the latest transaction
    pub recency: u32,
    /// Number of transaction lines
    pub frequency: u32,
    /// Total value of all lines
    pub monetary: f64,
}

impl CustomerMetrics {
    /// `[recency, frequency, monetary]` as floats
    pub fn as_array(&self) -> [f64; 3] {
        [self.recency as f64, self.frequency as f64, self.monetary]
    }
}

/// Output of the metric stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsTable {
    /// One row per qualifying customer, in order of first appearance
    pub rows: Vec<CustomerMetrics>,
    /// Date recency was measured against
    pub reference_date: NaiveDate,
    /// Customers dropped by the monetary filter
    pub excluded: usize,
}

impl MetricsTable {
    /// Number of customers
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Unscaled RFM matrix (n_customers, 3)
    pub fn raw_features(&self) -> Array2<f64> {
        let mut raw = Array2::zeros((self.rows.len(), 3));
        for (mut row, metrics) in raw.outer_iter_mut().zip(&self.rows) {
            let [r, f, m] = metrics.as_array();
            row[0] = r;
            row[1] = f;
            row[2] = m;
        }
        raw
    }
}

struct Accumulator<'a> {
    customer_id: &'a str,
    last_seen: NaiveDateTime,
    count: u32,
    monetary: f64,
}

/// Compute RFM metrics per customer
///
/// # Arguments
/// * `input` - Validated transaction snapshot
/// * `reference_date` - Date recency is measured against (default: latest transaction date)
/// * `monetary_filter` - Drop customers whose monetary total is not positive
///
/// # Returns
/// * The metrics table and any advisories raised while computing it
pub fn compute_customer_metrics(
    input: &TransactionInput,
    reference_date: Option<NaiveDate>,
    monetary_filter: bool,
) -> Result<(MetricsTable, Vec<Advisory>)> {
    input.validate()?;

    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut customers: Vec<Accumulator<'_>> = Vec::new();

    for (row, record) in input.records.iter().enumerate() {
        let value = input.line_value(record);
        if !value.is_finite() {
            return Err(input.overflow_at(
                row,
                record,
                format!("{} x {} overflows", record.quantity, record.unit_price),
            ));
        }
        match index.get(record.customer_id.as_str()) {
            Some(&slot) => {
                let acc = &mut customers[slot];
                acc.last_seen = acc.last_seen.max(record.timestamp);
                acc.count += 1;
                acc.monetary += value;
                if !acc.monetary.is_finite() {
                    return Err(input.overflow_at(
                        row,
                        record,
                        format!("monetary total of {} overflows at {}", acc.customer_id, value),
                    ));
                }
            }
            None => {
                index.insert(record.customer_id.as_str(), customers.len());
                customers.push(Accumulator {
                    customer_id: record.customer_id.as_str(),
                    last_seen: record.timestamp,
                    count: 1,
                    monetary: value,
                });
            }
        }
    }

    let latest = customers.iter().map(|c| c.last_seen).max();
    let Some(latest) = latest else {
        return Err(SegmentationError::EmptyResult {
            customers: 0,
            transactions: input.records.len(),
            excluded: 0,
        });
    };
    let reference_date = reference_date.unwrap_or_else(|| latest.date());

    let total_customers = customers.len();
    let mut advisories = Vec::new();
    let mut future = 0usize;
    let mut rows = Vec::with_capacity(total_customers);

    for acc in customers {
        if monetary_filter && acc.monetary <= 0.0 {
            continue;
        }
        let days = (reference_date - acc.last_seen.date()).num_days();
        if days < 0 {
            future += 1;
        }
        rows.push(CustomerMetrics {
            customer_id: acc.customer_id.to_string(),
            recency: u32::try_from(days.max(0)).unwrap_or(u32::MAX),
            frequency: acc.count,
            monetary: acc.monetary,
        });
    }

    let excluded = total_customers - rows.len();
    if rows.is_empty() {
        return Err(SegmentationError::EmptyResult {
            customers: total_customers,
            transactions: input.records.len(),
            excluded,
        });
    }

    if future > 0 {
        advisories.push(Advisory::FutureTransactions {
            customers: future,
            reference_date,
        });
    }
    if excluded > 0 {
        advisories.push(Advisory::CustomersExcluded { count: excluded });
    }

    tracing::debug!(
        customers = rows.len(),
        excluded,
        %reference_date,
        "computed customer metrics"
    );

    Ok((
        MetricsTable {
            rows,
            reference_date,
            excluded,
        },
        advisories,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(date: &str) -> NaiveDateTime {
        NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn roles() -> ColumnRoles {
        ColumnRoles::new("CustomerID", "InvoiceDate", "Quantity", "UnitPrice")
    }

    fn create_test_input() -> TransactionInput {
        TransactionInput::new(
            roles(),
            vec![
                TransactionRecord::new("17850", at("2010-12-01"), 6.0, 2.55),
                TransactionRecord::new("17850", at("2010-12-01"), 6.0, 3.39),
                TransactionRecord::new("13047", at("2010-12-01"), 8.0, 2.75),
                TransactionRecord::new("17850", at("2011-11-01"), 6.0, 1.85),
                TransactionRecord::new("12345", at("2011-12-05"), 2.0, 7.65),
            ],
        )
    }

    fn invalid_value(err: SegmentationError) -> (ColumnRole, usize, String) {
        match err {
            SegmentationError::Schema { mut issues } => match issues.pop() {
                Some(SchemaIssue::InvalidValue { role, row, value }) if issues.is_empty() => (role, row, value),
                other => panic!("expected a single invalid value, got {:?}", other),
            },
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_line_value_overflow_names_row() {
        let input = TransactionInput::new(
            roles(),
            vec![
                TransactionRecord::new("a", at("2011-01-01"), 2.0, 5.0),
                TransactionRecord::new("b", at("2011-01-02"), 1e200, 1e200),
            ],
        );
        let (role, row, value) = invalid_value(compute_customer_metrics(&input, None, true).unwrap_err());
        assert_eq!(role, ColumnRole::UnitPrice);
        assert_eq!(row, 1);
        assert!(value.contains("overflows"), "{value}");
    }

    #[test]
    fn test_monetary_sum_overflow_names_row() {
        let input = TransactionInput::new(
            roles().with_amount("TotalAmount"),
            vec![
                TransactionRecord::new("a", at("2011-01-01"), 1.0, 1.0).with_amount(1e308),
                TransactionRecord::new("b", at("2011-01-01"), 1.0, 1.0),
                TransactionRecord::new("a", at("2011-01-02"), 1.0, 1.0).with_amount(1e308),
            ],
        );
        let (role, row, value) = invalid_value(compute_customer_metrics(&input, None, true).unwrap_err());
        assert_eq!(role, ColumnRole::Amount);
        assert_eq!(row, 2);
        assert!(value.contains("monetary total of a"), "{value}");
    }

    #[test]
    fn test_compute_customer_metrics() {
        let (table, advisories) = compute_customer_metrics(&create_test_input(), None, true).unwrap();

        assert!(advisories.is_empty());
        assert_eq!(table.reference_date, NaiveDate::from_ymd_opt(2011, 12, 5).unwrap());
        assert_eq!(table.len(), 3);

        let first = &table.rows[0];
        assert_eq!(first.customer_id, "17850");
        assert_eq!(first.frequency, 3);
        assert_eq!(first.recency, 34);
        assert!((first.monetary - (6.0 * 2.55 + 6.0 * 3.39 + 6.0 * 1.85)).abs() < 1e-9);

        assert_eq!(table.rows[2].customer_id, "12345");
        assert_eq!(table.rows[2].recency, 0);
    }

    #[test]
    fn test_explicit_reference_date() {
        let reference = NaiveDate::from_ymd_opt(2011, 12, 9).unwrap();
        let (table, _) = compute_customer_metrics(&create_test_input(), Some(reference), true).unwrap();
        assert_eq!(table.rows[2].recency, 4);
        assert_eq!(table.reference_date, reference);
    }

    #[test]
    fn test_reference_before_transactions_clamps_recency() {
        let reference = NaiveDate::from_ymd_opt(2011, 1, 1).unwrap();
        let (table, advisories) = compute_customer_metrics(&create_test_input(), Some(reference), true).unwrap();

        assert!(table.rows.iter().all(|r| r.recency == 0 || r.customer_id == "13047"));
        assert!(advisories.contains(&Advisory::FutureTransactions {
            customers: 2,
            reference_date: reference,
        }));
    }

    #[test]
    fn test_refunds_are_excluded() {
        let mut input = create_test_input();
        input
            .records
            .push(TransactionRecord::new("13047", at("2010-12-02"), -8.0, 2.75));

        let (table, advisories) = compute_customer_metrics(&input, None, true).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.excluded, 1);
        assert!(table.rows.iter().all(|r| r.customer_id != "13047"));
        assert_eq!(advisories, vec![Advisory::CustomersExcluded { count: 1 }]);

        let (unfiltered, _) = compute_customer_metrics(&input, None, false).unwrap();
        assert_eq!(unfiltered.len(), 3);
    }

    #[test]
    fn test_all_non_positive_is_empty_result() {
        let input = TransactionInput::new(
            roles(),
            (0..5)
                .map(|i| TransactionRecord::new(format!("c{i}"), at("2011-01-01"), -1.0, 10.0))
                .collect(),
        );

        let err = compute_customer_metrics(&input, None, true).unwrap_err();
        assert_eq!(
            err,
            SegmentationError::EmptyResult {
                customers: 5,
                transactions: 5,
                excluded: 5,
            }
        );
        assert!(err.to_string().contains("0 qualifying customers"));
    }

    #[test]
    fn test_no_records_is_empty_result() {
        let input = TransactionInput::new(roles(), Vec::new());
        let err = compute_customer_metrics(&input, None, true).unwrap_err();
        assert!(matches!(err, SegmentationError::EmptyResult { customers: 0, .. }));
    }

    #[test]
    fn test_unresolved_roles_are_all_reported() {
        let mut bad = roles();
        bad.customer_id = None;
        bad.unit_price = None;
        let input = TransactionInput::new(bad, Vec::new());

        let err = compute_customer_metrics(&input, None, true).unwrap_err();
        assert_eq!(
            err,
            SegmentationError::Schema {
                issues: vec![
                    SchemaIssue::Unresolved(ColumnRole::CustomerId),
                    SchemaIssue::Unresolved(ColumnRole::UnitPrice),
                ],
            }
        );
    }

    #[test]
    fn test_shared_column_is_unusable() {
        let shared = ColumnRoles::new("id", "date", "qty", "qty");
        let err = shared.validate().unwrap_err();
        assert!(matches!(
            err,
            SegmentationError::Schema { ref issues }
                if issues == &vec![SchemaIssue::SharedColumn {
                    column: "qty".to_string(),
                    roles: vec![ColumnRole::Quantity, ColumnRole::UnitPrice],
                }]
        ));
    }

    #[test]
    fn test_non_finite_value_is_reported_with_row() {
        let mut input = create_test_input();
        input.records[3].unit_price = f64::NAN;

        let err = compute_customer_metrics(&input, None, true).unwrap_err();
        assert_eq!(
            err,
            SegmentationError::Schema {
                issues: vec![SchemaIssue::InvalidValue {
                    role: ColumnRole::UnitPrice,
                    row: 3,
                    value: "NaN".to_string(),
                }],
            }
        );
    }

    #[test]
    fn test_supplied_amount_is_authoritative() {
        let records = vec![
            TransactionRecord::new("a", at("2011-01-01"), 2.0, 5.0).with_amount(99.0),
            TransactionRecord::new("a", at("2011-01-02"), 1.0, 1.0),
        ];

        let with_amount = TransactionInput::new(roles().with_amount("TotalAmount"), records.clone());
        let (table, _) = compute_customer_metrics(&with_amount, None, true).unwrap();
        assert!((table.rows[0].monetary - 100.0).abs() < 1e-9);
        assert_eq!(with_amount.records[0].amount, Some(99.0));

        let without_amount = TransactionInput::new(roles(), records);
        let (table, _) = compute_customer_metrics(&without_amount, None, true).unwrap();
        assert!((table.rows[0].monetary - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_raw_features_shape() {
        let (table, _) = compute_customer_metrics(&create_test_input(), None, true).unwrap();
        let raw = table.raw_features();
        assert_eq!(raw.shape(), &[3, 3]);
        assert_eq!(raw[[0, 1]], 3.0);
    }
}
