//! Engine configuration

use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SegmentationError};
use crate::labeling::RuleTable;

/// Options accepted by the segmentation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SegmentationConfig {
    /// Smallest partition count to try
    pub k_min: usize,
    /// Largest partition count to try
    pub k_max: usize,
    /// Date recency is measured against; latest transaction date when unset
    pub reference_date: Option<NaiveDate>,
    /// Drop customers whose monetary total is not positive
    pub monetary_filter: bool,
    /// Seed for every clustering run
    pub seed: u64,
    /// K-means restarts per fit, best inertia kept
    pub n_runs: usize,
    /// Maximum Lloyd iterations per restart
    pub max_iterations: u64,
    /// Convergence tolerance on centroid movement
    pub tolerance: f64,
    /// Evaluate candidate k values on the rayon pool
    pub parallel: bool,
    /// Score on an evenly strided subset of this many customers
    pub score_sample_size: Option<usize>,
    /// Label rules; the built-in table when unset
    pub rules: Option<RuleTable>,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            k_min: 3,
            k_max: 8,
            reference_date: None,
            monetary_filter: true,
            seed: 42,
            n_runs: 10,
            max_iterations: 300,
            tolerance: 1e-4,
            parallel: true,
            score_sample_size: None,
            rules: None,
        }
    }
}

impl SegmentationConfig {
    /// Default configuration searching `k_min..=k_max`
    pub fn new(k_min: usize, k_max: usize) -> Self {
        Self {
            k_min,
            k_max,
            ..Default::default()
        }
    }

    /// Set the reference date
    pub fn reference_date(mut self, date: NaiveDate) -> Self {
        self.reference_date = Some(date);
        self
    }

    /// Enable or disable the monetary filter
    pub fn monetary_filter(mut self, enabled: bool) -> Self {
        self.monetary_filter = enabled;
        self
    }

    /// Set the random seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the number of k-means restarts
    pub fn n_runs(mut self, n_runs: usize) -> Self {
        self.n_runs = n_runs;
        self
    }

    /// Set the maximum number of iterations
    pub fn max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the convergence tolerance
    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Toggle parallel candidate evaluation
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Score candidates on a subset of customers
    pub fn score_sample_size(mut self, size: usize) -> Self {
        self.score_sample_size = Some(size);
        self
    }

    /// Use a custom label rule table
    pub fn rules(mut self, rules: RuleTable) -> Self {
        self.rules = Some(rules);
        self
    }

    /// The rule table in effect
    pub fn rule_table(&self) -> RuleTable {
        self.rules.clone().unwrap_or_default()
    }

    /// Check values that do not depend on the data
    pub fn validate(&self) -> Result<()> {
        if self.k_min == 0 {
            return Err(SegmentationError::parameter("k_min", "k_min must be at least 1"));
        }
        if self.k_min > self.k_max {
            return Err(SegmentationError::parameter(
                "k_min",
                format!("k_min ({}) must not exceed k_max ({})", self.k_min, self.k_max),
            ));
        }
        if self.n_runs == 0 {
            return Err(SegmentationError::parameter("n_runs", "n_runs must be at least 1"));
        }
        if self.max_iterations == 0 {
            return Err(SegmentationError::parameter(
                "max_iterations",
                "max_iterations must be at least 1",
            ));
        }
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(SegmentationError::parameter(
                "tolerance",
                format!("tolerance must be positive and finite, got {}", self.tolerance),
            ));
        }
        if let Some(size) = self.score_sample_size {
            if size < 2 {
                return Err(SegmentationError::parameter(
                    "score_sample_size",
                    format!("score_sample_size must be at least 2, got {size}"),
                ));
            }
        }
        if let Some(rules) = &self.rules {
            rules.validate()?;
        }
        Ok(())
    }

    /// Parse a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source)
            .map_err(|e| SegmentationError::parameter("config", format!("invalid TOML: {e}")))
    }

    /// Read and parse a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            SegmentationError::parameter("config", format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labeling::{Band, BandPattern, LabelRule};
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = SegmentationConfig::default();
        assert_eq!((config.k_min, config.k_max), (3, 8));
        assert!(config.monetary_filter);
        assert!(config.reference_date.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_k_min_above_k_max() {
        let err = SegmentationConfig::new(5, 2).validate().unwrap_err();
        assert!(matches!(err, SegmentationError::Parameter { parameter: "k_min", .. }));
        assert!(err.to_string().contains("k_min (5) must not exceed k_max (2)"));
    }

    #[test]
    fn test_invalid_values() {
        assert!(SegmentationConfig::new(0, 3).validate().is_err());
        assert!(SegmentationConfig::new(2, 3).n_runs(0).validate().is_err());
        assert!(SegmentationConfig::new(2, 3).tolerance(f64::NAN).validate().is_err());
        assert!(SegmentationConfig::new(2, 3).score_sample_size(1).validate().is_err());
    }

    #[test]
    fn test_empty_label_is_rejected() {
        let rules = RuleTable::new(
            vec![LabelRule::new(BandPattern::Any, BandPattern::Any, BandPattern::Any, "")],
            "Others",
        );
        let err = SegmentationConfig::default().rules(rules).validate().unwrap_err();
        assert!(matches!(err, SegmentationError::Parameter { parameter: "rules", .. }));
    }

    #[test]
    fn test_from_toml() {
        let config = SegmentationConfig::from_toml_str(
            r#"
            k_min = 2
            k_max = 5
            reference_date = "2011-12-09"
            monetary_filter = false

            [rules]
            fallback = "Everyone Else"

            [[rules.rules]]
            recency = { is = "high" }
            frequency = "any"
            monetary = { at_least = "mid" }
            label = "Best"
            "#,
        )
        .unwrap();

        assert_eq!((config.k_min, config.k_max), (2, 5));
        assert_eq!(config.reference_date, NaiveDate::from_ymd_opt(2011, 12, 9));
        assert!(!config.monetary_filter);
        assert_eq!(config.seed, 42);

        let rules = config.rule_table();
        assert_eq!(rules.fallback, "Everyone Else");
        assert_eq!(rules.rules[0].recency, BandPattern::Is(Band::High));
        assert_eq!(rules.rules[0].monetary, BandPattern::AtLeast(Band::Mid));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = SegmentationConfig::from_toml_str("k_mni = 2").unwrap_err();
        assert!(matches!(err, SegmentationError::Parameter { parameter: "config", .. }));
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "k_min = 4\nk_max = 6\nseed = 7").unwrap();

        let config = SegmentationConfig::from_toml_file(file.path()).unwrap();
        assert_eq!((config.k_min, config.k_max, config.seed), (4, 6, 7));
    }
}
