//! Rule-based segment labels
//!
//! Each cluster gets a band per RFM dimension from its standing relative to
//! the other clusters of the same run. An ordered rule table then maps the
//! band triple to a label: first match wins, with a fallback label when no
//! rule matches.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::CustomerMetrics;
use crate::error::{Result, SegmentationError};
use crate::model::ClusterAssignment;

/// Relative standing of a cluster on one dimension.
///
/// For recency, `High` means the most recent buyers (fewest days).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    /// Bottom third of the clusters
    Low,
    /// Middle third
    Mid,
    /// Top third
    High,
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Band::Low => f.write_str("low"),
            Band::Mid => f.write_str("mid"),
            Band::High => f.write_str("high"),
        }
    }
}

/// Condition on one band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BandPattern {
    /// Matches every band
    Any,
    /// Matches exactly this band
    Is(Band),
    /// Matches this band or better
    AtLeast(Band),
    /// Matches this band or worse
    AtMost(Band),
}

impl BandPattern {
    /// Whether `band` satisfies the pattern
    pub fn matches(&self, band: Band) -> bool {
        match *self {
            BandPattern::Any => true,
            BandPattern::Is(expected) => band == expected,
            BandPattern::AtLeast(floor) => band >= floor,
            BandPattern::AtMost(ceiling) => band <= ceiling,
        }
    }
}

/// Bands of one cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BandTriple {
    /// Recency standing
    pub recency: Band,
    /// Frequency standing
    pub frequency: Band,
    /// Monetary standing
    pub monetary: Band,
}

impl BandTriple {
    /// Build from the three bands
    pub fn new(recency: Band, frequency: Band, monetary: Band) -> Self {
        Self {
            recency,
            frequency,
            monetary,
        }
    }
}

/// One row of the rule table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRule {
    /// Condition on recency
    pub recency: BandPattern,
    /// Condition on frequency
    pub frequency: BandPattern,
    /// Condition on monetary
    pub monetary: BandPattern,
    /// Label given on match
    pub label: String,
}

impl LabelRule {
    /// Create a rule
    pub fn new(recency: BandPattern, frequency: BandPattern, monetary: BandPattern, label: impl Into<String>) -> Self {
        Self {
            recency,
            frequency,
            monetary,
            label: label.into(),
        }
    }

    /// Whether all three conditions hold
    pub fn matches(&self, bands: &BandTriple) -> bool {
        self.recency.matches(bands.recency)
            && self.frequency.matches(bands.frequency)
            && self.monetary.matches(bands.monetary)
    }
}

/// Ordered rules plus a fallback label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTable {
    /// Evaluated top to bottom
    pub rules: Vec<LabelRule>,
    /// Label when nothing matches
    pub fallback: String,
}

/// Label used when no rule of the built-in table matches
pub const FALLBACK_LABEL: &str = "Others";

impl Default for RuleTable {
    fn default() -> Self {
        use Band::{High, Low, Mid};
        use BandPattern::{Any, AtLeast, Is};

        Self {
            rules: vec![
                LabelRule::new(Is(High), Is(High), Is(High), "Champions"),
                LabelRule::new(Is(High), Is(High), Any, "Loyal Customers"),
                LabelRule::new(Is(High), Any, Is(High), "Loyal Customers"),
                LabelRule::new(Is(High), Is(Low), Any, "New Customers"),
                LabelRule::new(Is(High), Any, Any, "Promising"),
                LabelRule::new(Is(Low), AtLeast(Mid), AtLeast(Mid), "At Risk"),
                LabelRule::new(Is(Low), Is(Low), Any, "Hibernating"),
                LabelRule::new(Is(Mid), AtLeast(Mid), AtLeast(Mid), "Potential Loyalists"),
                LabelRule::new(Is(Mid), Any, Any, "Needs Attention"),
            ],
            fallback: FALLBACK_LABEL.to_string(),
        }
    }
}

impl RuleTable {
    /// Create a table
    pub fn new(rules: Vec<LabelRule>, fallback: impl Into<String>) -> Self {
        Self {
            rules,
            fallback: fallback.into(),
        }
    }

    /// Label of the first matching rule, else the fallback
    pub fn label_for(&self, bands: &BandTriple) -> &str {
        self.rules
            .iter()
            .find(|rule| rule.matches(bands))
            .map_or(self.fallback.as_str(), |rule| rule.label.as_str())
    }

    /// Reject blank labels
    pub fn validate(&self) -> Result<()> {
        if self.fallback.trim().is_empty() {
            return Err(SegmentationError::parameter("rules", "fallback label must not be empty"));
        }
        if let Some(position) = self.rules.iter().position(|r| r.label.trim().is_empty()) {
            return Err(SegmentationError::parameter(
                "rules",
                format!("rule {position} has an empty label"),
            ));
        }
        Ok(())
    }
}

/// Mean unscaled RFM of one cluster
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClusterCentroid {
    /// Mean recency in days
    pub recency: f64,
    /// Mean frequency
    pub frequency: f64,
    /// Mean monetary value
    pub monetary: f64,
}

/// Label decided for one cluster
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterLabel {
    /// Cluster id
    pub cluster: usize,
    /// Assigned label
    pub label: String,
    /// Bands the label was derived from
    pub bands: BandTriple,
    /// Mean unscaled RFM
    pub centroid: ClusterCentroid,
    /// Number of members
    pub size: usize,
}

/// Mean unscaled RFM per cluster, with member counts
pub fn cluster_centroids(metrics: &[CustomerMetrics], assignment: &ClusterAssignment) -> Vec<(ClusterCentroid, usize)> {
    let mut sums = vec![[0.0f64; 3]; assignment.k];
    let mut counts = vec![0usize; assignment.k];

    for (row, &cluster) in metrics.iter().zip(&assignment.clusters) {
        for (sum, value) in sums[cluster].iter_mut().zip(row.as_array()) {
            *sum += value;
        }
        counts[cluster] += 1;
    }

    sums.into_iter()
        .zip(counts)
        .map(|([r, f, m], n)| {
            let n_f = n.max(1) as f64;
            (
                ClusterCentroid {
                    recency: r / n_f,
                    frequency: f / n_f,
                    monetary: m / n_f,
                },
                n,
            )
        })
        .collect()
}

/// Band of each value relative to the others.
///
/// Values are ranked ascending with ties sharing the average rank; the
/// relative position `rank / (n - 1)` is split in thirds.
fn relative_bands(values: &[f64]) -> Vec<Band> {
    let n = values.len();
    if n < 2 {
        return vec![Band::Mid; n];
    }
    let span = (n - 1) as f64;

    values
        .iter()
        .map(|&v| {
            let below = values.iter().filter(|&&o| o < v).count() as f64;
            let equal = values.iter().filter(|&&o| o == v).count() as f64;
            let rank = below + (equal - 1.0) / 2.0;
            if 3.0 * rank < span {
                Band::Low
            } else if 3.0 * rank > 2.0 * span {
                Band::High
            } else {
                Band::Mid
            }
        })
        .collect()
}

/// Bands for each centroid; recency is ranked on negated days
pub fn assign_bands(centroids: &[ClusterCentroid]) -> Vec<BandTriple> {
    let recency = relative_bands(&centroids.iter().map(|c| -c.recency).collect::<Vec<_>>());
    let frequency = relative_bands(&centroids.iter().map(|c| c.frequency).collect::<Vec<_>>());
    let monetary = relative_bands(&centroids.iter().map(|c| c.monetary).collect::<Vec<_>>());

    (0..centroids.len())
        .map(|i| BandTriple::new(recency[i], frequency[i], monetary[i]))
        .collect()
}

/// Label every cluster of an assignment
///
/// # Arguments
/// * `metrics` - Customer rows aligned with `assignment`
/// * `assignment` - Cluster of each row
/// * `rules` - Rule table to evaluate
///
/// # Returns
/// * One `ClusterLabel` per cluster id, in id order
pub fn label_clusters(
    metrics: &[CustomerMetrics],
    assignment: &ClusterAssignment,
    rules: &RuleTable,
) -> Result<Vec<ClusterLabel>> {
    rules.validate()?;
    if metrics.len() != assignment.len() {
        return Err(SegmentationError::parameter(
            "assignment",
            format!(
                "assignment covers {} customers but metrics hold {}",
                assignment.len(),
                metrics.len()
            ),
        ));
    }

    let centroids = cluster_centroids(metrics, assignment);
    let bands = assign_bands(&centroids.iter().map(|(c, _)| *c).collect::<Vec<_>>());

    let labels: Vec<ClusterLabel> = centroids
        .into_iter()
        .zip(bands)
        .enumerate()
        .map(|(cluster, ((centroid, size), bands))| ClusterLabel {
            cluster,
            label: rules.label_for(&bands).to_string(),
            bands,
            centroid,
            size,
        })
        .collect();

    for label in &labels {
        tracing::debug!(
            cluster = label.cluster,
            label = %label.label,
            recency = %label.bands.recency,
            frequency = %label.bands.frequency,
            monetary = %label.bands.monetary,
            "labeled cluster"
        );
    }
    Ok(labels)
}

/// Label of each customer, in assignment row order
pub fn customer_labels<'a>(assignment: &ClusterAssignment, labels: &'a [ClusterLabel]) -> Vec<&'a str> {
    assignment
        .clusters
        .iter()
        .map(|&cluster| labels[cluster].label.as_str())
        .collect()
}
