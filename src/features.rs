//! Log transform and standardization of RFM features

use std::fmt;

use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Advisory, Result, SegmentationError};

/// Standard deviations at or below this are treated as zero variance
const VARIANCE_EPSILON: f64 = 1e-12;

/// One RFM dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    /// Days since last purchase
    Recency,
    /// Number of purchases
    Frequency,
    /// Total spend
    Monetary,
}

impl Feature {
    /// Column order used by every feature matrix
    pub const ALL: [Feature; 3] = [Feature::Recency, Feature::Frequency, Feature::Monetary];

    /// Column index in a feature matrix
    pub fn index(&self) -> usize {
        match self {
            Feature::Recency => 0,
            Feature::Frequency => 1,
            Feature::Monetary => 2,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feature::Recency => f.write_str("recency"),
            Feature::Frequency => f.write_str("frequency"),
            Feature::Monetary => f.write_str("monetary"),
        }
    }
}

/// Fitted scaling parameters.
///
/// Each value goes through `sign(x)·ln(1 + |x|)`, then is standardized with
/// the population mean and standard deviation of the log values. A
/// zero-variance column maps every value to 0.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaler {
    /// Mean of the log-transformed columns
    pub means: [f64; 3],
    /// Population standard deviation of the log-transformed columns
    pub std_devs: [f64; 3],
}

impl FeatureScaler {
    /// Fit on a raw (n_samples, 3) matrix
    pub fn fit(raw: ArrayView2<f64>) -> Result<Self> {
        if raw.ncols() != 3 {
            return Err(SegmentationError::parameter(
                "features",
                format!("expected 3 RFM columns, found {}", raw.ncols()),
            ));
        }
        if raw.nrows() == 0 {
            return Err(SegmentationError::parameter("features", "cannot scale 0 customers"));
        }

        let logged = raw.mapv(log_compress);
        let mut means = [0.0; 3];
        let mut std_devs = [0.0; 3];
        for (j, column) in logged.axis_iter(Axis(1)).enumerate() {
            let mean = column.sum() / column.len() as f64;
            let variance = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / column.len() as f64;
            means[j] = mean;
            std_devs[j] = variance.sqrt();
        }

        Ok(Self { means, std_devs })
    }

    /// Features whose standard deviation is effectively zero
    pub fn constant_features(&self) -> Vec<Feature> {
        Feature::ALL
            .into_iter()
            .filter(|f| self.std_devs[f.index()] <= VARIANCE_EPSILON)
            .collect()
    }

    /// Scale one raw value of `feature`
    pub fn scale_value(&self, feature: Feature, value: f64) -> f64 {
        let j = feature.index();
        if self.std_devs[j] <= VARIANCE_EPSILON {
            0.0
        } else {
            (log_compress(value) - self.means[j]) / self.std_devs[j]
        }
    }

    /// Scale a raw (n_samples, 3) matrix
    pub fn transform(&self, raw: ArrayView2<f64>) -> Array2<f64> {
        let mut scaled = raw.to_owned();
        for feature in Feature::ALL {
            scaled
                .column_mut(feature.index())
                .mapv_inplace(|v| self.scale_value(feature, v));
        }
        scaled
    }

    /// Scale a single `[recency, frequency, monetary]` triple
    pub fn transform_one(&self, rfm: [f64; 3]) -> Array1<f64> {
        Feature::ALL
            .iter()
            .map(|f| self.scale_value(*f, rfm[f.index()]))
            .collect()
    }
}

/// Features ready for clustering
#[derive(Debug, Clone, PartialEq)]
pub struct ScaledFeatures {
    /// Scaled matrix (n_customers, 3), rows aligned with the metrics table
    pub matrix: Array2<f64>,
    /// Parameters used to produce it
    pub scaler: FeatureScaler,
}

impl ScaledFeatures {
    /// Number of customers
    pub fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    /// Number of distinct rows (exact comparison)
    pub fn distinct_points(&self) -> usize {
        let mut rows: Vec<[u64; 3]> = self
            .matrix
            .outer_iter()
            .map(|r| [normalize_bits(r[0]), normalize_bits(r[1]), normalize_bits(r[2])])
            .collect();
        rows.sort_unstable();
        rows.dedup();
        rows.len()
    }
}

/// Fit a scaler on `raw` and transform it
///
/// # Returns
/// * The scaled features and a `ZeroVariance` advisory per constant column
pub fn scale_features(raw: ArrayView2<f64>) -> Result<(ScaledFeatures, Vec<Advisory>)> {
    let scaler = FeatureScaler::fit(raw)?;
    let advisories: Vec<Advisory> = scaler
        .constant_features()
        .into_iter()
        .map(|feature| Advisory::ZeroVariance { feature })
        .collect();

    let matrix = scaler.transform(raw);
    tracing::debug!(
        samples = matrix.nrows(),
        constant = advisories.len(),
        "scaled features"
    );

    Ok((ScaledFeatures { matrix, scaler }, advisories))
}

fn log_compress(value: f64) -> f64 {
    value.signum() * value.abs().ln_1p()
}

fn normalize_bits(value: f64) -> u64 {
    // -0.0 and 0.0 must compare equal
    if value == 0.0 {
        0
    } else {
        value.to_bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_standardized_columns() {
        let raw = array![[1.0, 1.0, 10.0], [10.0, 3.0, 100.0], [100.0, 9.0, 1000.0], [30.0, 2.0, 50.0]];
        let (scaled, advisories) = scale_features(raw.view()).unwrap();

        assert!(advisories.is_empty());
        for column in scaled.matrix.axis_iter(Axis(1)) {
            let mean = column.sum() / column.len() as f64;
            let variance = column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / column.len() as f64;
            assert!(mean.abs() < 1e-9);
            assert!((variance - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_constant_column_is_zero() {
        let raw = array![[5.0, 1.0, 10.0], [5.0, 2.0, 20.0], [5.0, 3.0, 30.0]];
        let (scaled, advisories) = scale_features(raw.view()).unwrap();

        assert!(scaled.matrix.column(0).iter().all(|&v| v == 0.0));
        assert_eq!(advisories, vec![Advisory::ZeroVariance { feature: Feature::Recency }]);
    }

    #[test]
    fn test_all_identical_rows() {
        let raw = array![[3.0, 2.0, 40.0], [3.0, 2.0, 40.0]];
        let (scaled, advisories) = scale_features(raw.view()).unwrap();

        assert!(scaled.matrix.iter().all(|&v| v == 0.0));
        assert_eq!(advisories.len(), 3);
        assert_eq!(scaled.distinct_points(), 1);
    }

    #[test]
    fn test_single_customer() {
        let raw = array![[0.0, 1.0, 15.0]];
        let (scaled, _) = scale_features(raw.view()).unwrap();
        assert_eq!(scaled.matrix, array![[0.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_negative_monetary_stays_finite() {
        let raw = array![[1.0, 1.0, -50.0], [2.0, 2.0, 20.0], [3.0, 1.0, 0.0]];
        let (scaled, _) = scale_features(raw.view()).unwrap();
        assert!(scaled.matrix.iter().all(|v| v.is_finite()));
        assert!(scaled.matrix[[0, 2]] < scaled.matrix[[2, 2]]);
    }

    #[test]
    fn test_transform_one_matches_matrix() {
        let raw = array![[1.0, 1.0, 10.0], [10.0, 3.0, 100.0], [100.0, 9.0, 1000.0]];
        let (scaled, _) = scale_features(raw.view()).unwrap();
        let single = scaled.scaler.transform_one([10.0, 3.0, 100.0]);
        for j in 0..3 {
            assert!((single[j] - scaled.matrix[[1, j]]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_wrong_width_is_rejected() {
        let raw = array![[1.0, 2.0]];
        assert!(FeatureScaler::fit(raw.view()).is_err());
    }
}
