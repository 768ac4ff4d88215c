//! SegmentForge: automated RFM customer segmentation
//!
//! The engine derives Recency/Frequency/Monetary metrics from transaction
//! lines, scales them, picks the number of segments by silhouette score,
//! partitions customers with K-Means and names each segment from an ordered
//! rule table. [`segment`] is a pure function from an immutable input
//! snapshot to an immutable result bundle; it performs no I/O.
//!
//! CSV ingestion ([`ingest`]) and chart rendering ([`viz`]) belong to the
//! command-line host and are not used by the engine.

pub mod cli;
pub mod config;
pub mod data;
pub mod error;
pub mod features;
pub mod ingest;
pub mod labeling;
pub mod model;
pub mod pipeline;
pub mod selection;
pub mod summary;
pub mod viz;

// Re-export public items for easier access
pub use cli::Args;
pub use config::SegmentationConfig;
pub use data::{compute_customer_metrics, ColumnRole, ColumnRoles, CustomerMetrics, MetricsTable, TransactionInput, TransactionRecord};
pub use error::{Advisory, Result, SchemaIssue, SegmentationError};
pub use features::{scale_features, Feature, FeatureScaler, ScaledFeatures};
pub use labeling::{label_clusters, Band, BandPattern, BandTriple, ClusterLabel, LabelRule, RuleTable};
pub use model::{fit_partition, partition_customers, ClusterAssignment, KMeansSettings, Partition};
pub use pipeline::{segment, segment_with_k, CustomerSegment, SegmentationResult, Stage};
pub use selection::{select_k, KScore, SelectionParams, SelectionReport};
pub use summary::{summarize_segments, SegmentProfile, SegmentSummary};
