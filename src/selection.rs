//! Automatic choice of the number of segments

use rayon::prelude::*;
use serde::Serialize;

use crate::config::SegmentationConfig;
use crate::error::{Advisory, KLimit, Result, SegmentationError};
use crate::features::ScaledFeatures;
use crate::model::{fit_partition, KMeansSettings};

/// Search parameters for [`select_k`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionParams {
    /// Smallest k to try
    pub k_min: usize,
    /// Largest k to try
    pub k_max: usize,
    /// Solver settings, identical for every candidate
    pub settings: KMeansSettings,
    /// Fit candidates on the rayon pool
    pub parallel: bool,
    /// Score on a strided subset of this many rows
    pub score_sample_size: Option<usize>,
}

impl From<&SegmentationConfig> for SelectionParams {
    fn from(config: &SegmentationConfig) -> Self {
        Self {
            k_min: config.k_min,
            k_max: config.k_max,
            settings: KMeansSettings::from(config),
            parallel: config.parallel,
            score_sample_size: config.score_sample_size,
        }
    }
}

/// Quality of one candidate partition count
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KScore {
    /// Partition count
    pub k: usize,
    /// Mean silhouette coefficient in [-1, 1]
    pub score: f64,
    /// Within-cluster sum of squares
    pub inertia: f64,
}

/// Outcome of the search
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionReport {
    /// Chosen partition count
    pub selected_k: usize,
    /// Range as configured
    pub requested: (usize, usize),
    /// Range actually searched after clamping
    pub searched: (usize, usize),
    /// Score of every candidate, by increasing k
    pub curve: Vec<KScore>,
}

impl SelectionReport {
    /// Score recorded for `k`
    pub fn score_of(&self, k: usize) -> Option<f64> {
        self.curve.iter().find(|s| s.k == k).map(|s| s.score)
    }

    /// Score of the chosen k
    pub fn best_score(&self) -> f64 {
        self.score_of(self.selected_k).unwrap_or(0.0)
    }
}

/// Check a k range against the data and clamp `k_max` where needed
///
/// # Arguments
/// * `k_min`, `k_max` - Configured range
/// * `samples` - Number of customers
/// * `distinct` - Number of distinct scaled points
///
/// # Returns
/// * The range to search and the advisories raised by clamping
pub fn resolve_k_range(
    k_min: usize,
    k_max: usize,
    samples: usize,
    distinct: usize,
) -> Result<((usize, usize), Vec<Advisory>)> {
    if k_min == 0 {
        return Err(SegmentationError::parameter("k_min", "k_min must be at least 1"));
    }
    if k_min > k_max {
        return Err(SegmentationError::parameter(
            "k_min",
            format!("k_min ({k_min}) must not exceed k_max ({k_max})"),
        ));
    }
    if k_min > samples {
        return Err(SegmentationError::parameter(
            "k_min",
            format!("k_min ({k_min}) exceeds the number of customers ({samples}); set k_min to at most {samples}"),
        ));
    }
    if k_min > distinct {
        return Err(SegmentationError::parameter(
            "k_min",
            format!(
                "k_min ({k_min}) exceeds the number of distinct customer profiles ({distinct} among {samples} customers)"
            ),
        ));
    }

    let mut advisories = Vec::new();
    let mut upper = k_max;
    if upper > samples {
        advisories.push(Advisory::KMaxClamped {
            requested: k_max,
            clamped_to: samples,
            limit: KLimit::Samples,
        });
        upper = samples;
    }
    if upper > distinct {
        advisories.push(Advisory::KMaxClamped {
            requested: k_max,
            clamped_to: distinct,
            limit: KLimit::DistinctPoints,
        });
        upper = distinct;
    }

    Ok(((k_min, upper), advisories))
}

/// Pick the partition count with the best silhouette score
///
/// Every candidate is fitted with the same seed on the same read-only
/// matrix. Ties go to the smaller k.
///
/// # Returns
/// * The selection report and the advisories raised during the search
pub fn select_k(features: &ScaledFeatures, params: &SelectionParams) -> Result<(SelectionReport, Vec<Advisory>)> {
    let samples = features.n_samples();
    let distinct = features.distinct_points();

    let mut advisories = Vec::new();
    if distinct < samples {
        advisories.push(Advisory::CollapsedValues { distinct, samples });
    }

    let ((k_min, k_max), clamped) = resolve_k_range(params.k_min, params.k_max, samples, distinct)?;
    advisories.extend(clamped);

    let evaluate = |k: usize| -> Result<KScore> {
        let partition = fit_partition(features.matrix.view(), k, &params.settings)?;
        let score = if k == 1 {
            0.0
        } else {
            partition.silhouette(features.matrix.view(), params.score_sample_size, params.parallel)
        };
        tracing::debug!(k, score, inertia = partition.inertia, "scored candidate");
        Ok(KScore {
            k,
            score,
            inertia: partition.inertia,
        })
    };

    let results: Vec<Result<KScore>> = if params.parallel {
        (k_min..=k_max).into_par_iter().map(evaluate).collect()
    } else {
        (k_min..=k_max).map(evaluate).collect()
    };

    let curve = results.into_iter().collect::<Result<Vec<KScore>>>()?;
    if curve.iter().any(|s| s.k == 1) {
        advisories.push(Advisory::ScoreUndefined { k: 1 });
    }

    let best = best_candidate(&curve)
        .ok_or_else(|| SegmentationError::parameter("k_max", "no candidate partition counts"))?;

    tracing::debug!(selected_k = best.k, score = best.score, "selected partition count");

    Ok((
        SelectionReport {
            selected_k: best.k,
            requested: (params.k_min, params.k_max),
            searched: (k_min, k_max),
            curve,
        },
        advisories,
    ))
}

/// Highest score; on equal scores the earlier (smaller) k wins
fn best_candidate(curve: &[KScore]) -> Option<KScore> {
    curve
        .iter()
        .copied()
        .reduce(|best, candidate| if candidate.score > best.score { candidate } else { best })
}
