//! Error and advisory types for the segmentation engine

use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

use crate::data::ColumnRole;
use crate::features::Feature;

/// Result type alias used by every engine stage
pub type Result<T> = std::result::Result<T, SegmentationError>;

/// Fatal errors raised by the segmentation engine.
///
/// Validation errors are deterministic: running again on the same input
/// reproduces the same error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SegmentationError {
    /// One or more required column roles are unresolved or unusable
    #[error("schema error: {}", join_issues(.issues))]
    Schema {
        /// Every problem found, in role order
        issues: Vec<SchemaIssue>,
    },

    /// No customer survived validity filtering
    #[error(
        "empty result: 0 qualifying customers ({customers} customers in {transactions} transactions, {excluded} excluded with non-positive monetary value)"
    )]
    EmptyResult {
        /// Distinct customers seen in the input
        customers: usize,
        /// Transaction rows seen in the input
        transactions: usize,
        /// Customers removed by the monetary filter
        excluded: usize,
    },

    /// A parameter is invalid or infeasible for the data at hand
    #[error("invalid parameter `{parameter}`: {message}")]
    Parameter {
        /// Name of the offending parameter
        parameter: &'static str,
        /// What is wrong, with the observed values
        message: String,
    },

    /// The clustering solver failed for a candidate partition count
    #[error("clustering failed at k = {k}: {message}")]
    ClusteringFailure {
        /// Partition count being fitted
        k: usize,
        /// Solver diagnostics
        message: String,
    },
}

impl SegmentationError {
    /// Create a new Parameter error
    pub fn parameter(parameter: &'static str, message: impl Into<String>) -> Self {
        Self::Parameter {
            parameter,
            message: message.into(),
        }
    }

    /// Create a new ClusteringFailure error
    pub fn clustering_failure(k: usize, message: impl Into<String>) -> Self {
        Self::ClusteringFailure {
            k,
            message: message.into(),
        }
    }
}

/// A single schema problem
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SchemaIssue {
    /// No source column was resolved for the role
    Unresolved(ColumnRole),
    /// Several roles were resolved onto the same source column
    SharedColumn {
        /// Source column name
        column: String,
        /// Roles pointing at it
        roles: Vec<ColumnRole>,
    },
    /// A value in a numeric role cannot be used
    InvalidValue {
        /// Role of the offending field
        role: ColumnRole,
        /// Zero-based record index
        row: usize,
        /// The observed value
        value: String,
    },
}

impl fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaIssue::Unresolved(role) => write!(f, "required role `{role}` is unresolved"),
            SchemaIssue::SharedColumn { column, roles } => {
                let names: Vec<String> = roles.iter().map(ToString::to_string).collect();
                write!(f, "column `{column}` is mapped to several roles ({})", names.join(", "))
            }
            SchemaIssue::InvalidValue { role, row, value } => {
                write!(f, "role `{role}` has unusable value {value} at row {row}")
            }
        }
    }
}

fn join_issues(issues: &[SchemaIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Non-fatal conditions handled with safe defaults.
///
/// Advisories are collected in detection order and returned with the result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    /// A feature is constant across customers and was scaled to 0.0
    ZeroVariance {
        /// The constant feature
        feature: Feature,
    },
    /// Several customers share identical scaled features
    CollapsedValues {
        /// Distinct scaled points
        distinct: usize,
        /// Total customers
        samples: usize,
    },
    /// `k_max` was lowered to a feasible value
    KMaxClamped {
        /// Configured value
        requested: usize,
        /// Value actually searched
        clamped_to: usize,
        /// What bounded it
        limit: KLimit,
    },
    /// The quality score is undefined for this k and was taken as 0.0
    ScoreUndefined {
        /// Partition count
        k: usize,
    },
    /// Transactions dated after the reference date; recency clamped to 0
    FutureTransactions {
        /// Customers affected
        customers: usize,
        /// Reference date in use
        reference_date: NaiveDate,
    },
    /// Customers dropped by the monetary filter
    CustomersExcluded {
        /// Number of customers dropped
        count: usize,
    },
    /// An empty cluster was refilled after fitting
    EmptyClusterRepaired {
        /// Partition count
        k: usize,
        /// The cluster that was empty
        cluster: usize,
    },
}

/// Bound that forced a `k_max` clamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KLimit {
    /// Number of customers
    Samples,
    /// Number of distinct scaled points
    DistinctPoints,
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::ZeroVariance { feature } => {
                write!(f, "{feature} is constant across customers; scaled to 0.0")
            }
            Advisory::CollapsedValues { distinct, samples } => {
                write!(f, "only {distinct} distinct feature vectors among {samples} customers")
            }
            Advisory::KMaxClamped {
                requested,
                clamped_to,
                limit,
            } => {
                let what = match limit {
                    KLimit::Samples => "customer count",
                    KLimit::DistinctPoints => "distinct point count",
                };
                write!(f, "k_max {requested} clamped to {clamped_to} ({what})")
            }
            Advisory::ScoreUndefined { k } => {
                write!(f, "quality score undefined for k = {k}; using 0.0")
            }
            Advisory::FutureTransactions {
                customers,
                reference_date,
            } => write!(
                f,
                "{customers} customers have transactions after {reference_date}; recency clamped to 0"
            ),
            Advisory::CustomersExcluded { count } => {
                write!(f, "{count} customers excluded with non-positive monetary value")
            }
            Advisory::EmptyClusterRepaired { k, cluster } => {
                write!(f, "cluster {cluster} was empty at k = {k} and was refilled")
            }
        }
    }
}
