//! Per-segment statistics for reporting

use serde::Serialize;

use crate::data::CustomerMetrics;
use crate::labeling::{BandTriple, ClusterLabel};
use crate::model::ClusterAssignment;

/// Aggregated view of one labeled cluster
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentProfile {
    /// Cluster id
    pub cluster: usize,
    /// Segment label
    pub label: String,
    /// Bands the label came from
    pub bands: BandTriple,
    /// Members
    pub customer_count: usize,
    /// Share of all customers, in percent
    pub customer_share: f64,
    /// Mean recency (days)
    pub mean_recency: f64,
    /// Mean frequency
    pub mean_frequency: f64,
    /// Mean monetary value
    pub mean_monetary: f64,
    /// Median recency (days)
    pub median_recency: f64,
    /// Median frequency
    pub median_frequency: f64,
    /// Median monetary value
    pub median_monetary: f64,
    /// Sum of monetary value
    pub total_monetary: f64,
    /// Share of all monetary value, in percent
    pub monetary_share: f64,
}

/// All segment profiles of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SegmentSummary {
    /// One profile per cluster, in cluster order
    pub segments: Vec<SegmentProfile>,
    /// Customers across all segments
    pub total_customers: usize,
    /// Monetary value across all segments
    pub total_monetary: f64,
}

impl SegmentSummary {
    /// Whether there are no segments
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Profile of a cluster id
    pub fn segment(&self, cluster: usize) -> Option<&SegmentProfile> {
        self.segments.iter().find(|s| s.cluster == cluster)
    }
}

/// Aggregate per-segment statistics
///
/// # Arguments
/// * `metrics` - Customer rows aligned with `assignment`
/// * `assignment` - Cluster of each row
/// * `labels` - Label of each cluster
///
/// # Returns
/// * The summary; empty when there are no labeled clusters or no customers
pub fn summarize_segments(
    metrics: &[CustomerMetrics],
    assignment: &ClusterAssignment,
    labels: &[ClusterLabel],
) -> SegmentSummary {
    if labels.is_empty() || metrics.is_empty() {
        return SegmentSummary::default();
    }

    let total_customers = metrics.len();
    let total_monetary: f64 = metrics.iter().map(|m| m.monetary).sum();

    let segments = labels
        .iter()
        .map(|label| {
            let members: Vec<&CustomerMetrics> = metrics
                .iter()
                .zip(&assignment.clusters)
                .filter(|&(_, &cluster)| cluster == label.cluster)
                .map(|(m, _)| m)
                .collect();

            let count = members.len();
            let recency: Vec<f64> = members.iter().map(|m| m.recency as f64).collect();
            let frequency: Vec<f64> = members.iter().map(|m| m.frequency as f64).collect();
            let monetary: Vec<f64> = members.iter().map(|m| m.monetary).collect();
            let segment_monetary: f64 = monetary.iter().sum();

            SegmentProfile {
                cluster: label.cluster,
                label: label.label.clone(),
                bands: label.bands,
                customer_count: count,
                customer_share: percentage(count as f64, total_customers as f64),
                mean_recency: mean(&recency),
                mean_frequency: mean(&frequency),
                mean_monetary: mean(&monetary),
                median_recency: median(recency),
                median_frequency: median(frequency),
                median_monetary: median(monetary),
                total_monetary: segment_monetary,
                monetary_share: percentage(segment_monetary, total_monetary),
            }
        })
        .collect();

    SegmentSummary {
        segments,
        total_customers,
        total_monetary,
    }
}

fn percentage(part: f64, total: f64) -> f64 {
    if total == 0.0 {
        0.0
    } else {
        part / total * 100.0
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labeling::{label_clusters, RuleTable};

    fn create_test_data() -> (Vec<CustomerMetrics>, ClusterAssignment) {
        let rows: Vec<CustomerMetrics> = [(2, 20, 2000.0), (4, 18, 1000.0), (200, 1, 15.0), (250, 2, 35.0), (60, 6, 300.0)]
            .iter()
            .enumerate()
            .map(|(i, &(recency, frequency, monetary))| CustomerMetrics {
                customer_id: format!("c{i}"),
                recency,
                frequency,
                monetary,
            })
            .collect();
        let assignment = ClusterAssignment {
            k: 3,
            customer_ids: rows.iter().map(|r| r.customer_id.clone()).collect(),
            clusters: vec![0, 0, 1, 1, 2],
        };
        (rows, assignment)
    }

    #[test]
    fn test_summarize_segments() {
        let (rows, assignment) = create_test_data();
        let labels = label_clusters(&rows, &assignment, &RuleTable::default()).unwrap();
        let summary = summarize_segments(&rows, &assignment, &labels);

        assert_eq!(summary.len(), 3);
        assert_eq!(summary.total_customers, 5);
        assert!((summary.total_monetary - 3350.0).abs() < 1e-9);

        let champions = summary.segment(0).unwrap();
        assert_eq!(champions.label, "Champions");
        assert_eq!(champions.customer_count, 2);
        assert!((champions.customer_share - 40.0).abs() < 1e-9);
        assert!((champions.mean_monetary - 1500.0).abs() < 1e-9);
        assert!((champions.median_recency - 3.0).abs() < 1e-9);
        assert!((champions.total_monetary - 3000.0).abs() < 1e-9);
        assert!((champions.monetary_share - 3000.0 / 3350.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_shares_sum_to_hundred() {
        let (rows, assignment) = create_test_data();
        let labels = label_clusters(&rows, &assignment, &RuleTable::default()).unwrap();
        let summary = summarize_segments(&rows, &assignment, &labels);

        let customers: f64 = summary.segments.iter().map(|s| s.customer_share).sum();
        let monetary: f64 = summary.segments.iter().map(|s| s.monetary_share).sum();
        assert!((customers - 100.0).abs() < 1e-9);
        assert!((monetary - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_monetary_total() {
        let (mut rows, assignment) = create_test_data();
        for row in &mut rows {
            row.monetary = 0.0;
        }
        let labels = label_clusters(&rows, &assignment, &RuleTable::default()).unwrap();
        let summary = summarize_segments(&rows, &assignment, &labels);
        assert!(summary.segments.iter().all(|s| s.monetary_share == 0.0));
    }

    #[test]
    fn test_no_segments_is_empty() {
        let assignment = ClusterAssignment {
            k: 0,
            customer_ids: Vec::new(),
            clusters: Vec::new(),
        };
        let summary = summarize_segments(&[], &assignment, &[]);
        assert!(summary.is_empty());
        assert_eq!(summary.total_customers, 0);
    }

    #[test]
    fn test_median() {
        assert_eq!(median(vec![3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(vec![4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(Vec::new()), 0.0);
    }
}
