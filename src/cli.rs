//! Command-line interface definitions and argument parsing

use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDate;
use clap::Parser;

use crate::config::SegmentationConfig;
use crate::ingest::ColumnMapping;

/// Automated customer segmentation from transaction history
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the input CSV file
    #[arg(short, long, default_value = "data.csv")]
    pub input: String,

    /// TOML file with engine options; flags override it
    #[arg(short, long, env = "SEGMENTFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Smallest number of segments to try
    #[arg(long)]
    pub k_min: Option<usize>,

    /// Largest number of segments to try
    #[arg(long)]
    pub k_max: Option<usize>,

    /// Use exactly this many segments instead of searching
    #[arg(short = 'k', long)]
    pub clusters: Option<usize>,

    /// Reference date for recency (YYYY-MM-DD); latest transaction date by default
    #[arg(long)]
    pub reference_date: Option<NaiveDate>,

    /// Keep customers whose monetary total is zero or negative
    #[arg(long)]
    pub keep_non_positive: bool,

    /// Random seed for clustering
    #[arg(long)]
    pub seed: Option<u64>,

    /// Maximum iterations for K-Means
    #[arg(long)]
    pub max_iters: Option<u64>,

    /// Tolerance for K-Means convergence
    #[arg(long)]
    pub tolerance: Option<f64>,

    /// Column holding the customer identifier
    #[arg(long, default_value = "CustomerID")]
    pub customer_col: String,

    /// Column holding the transaction date
    #[arg(long, default_value = "InvoiceDate")]
    pub date_col: String,

    /// Column holding the quantity
    #[arg(long, default_value = "Quantity")]
    pub quantity_col: String,

    /// Column holding the unit price
    #[arg(long, default_value = "UnitPrice")]
    pub price_col: String,

    /// Column holding an authoritative line total
    #[arg(long)]
    pub amount_col: Option<String>,

    /// Output path for the segment charts (PNG)
    #[arg(short, long)]
    pub plot: Option<String>,

    /// Print the full result as JSON instead of tables
    #[arg(long)]
    pub json: bool,

    /// Prediction mode: provide R,F,M values as comma-separated string
    /// Example: --predict "30,10,500.0" for Recency=30, Frequency=10, Monetary=500.0
    #[arg(long)]
    pub predict: Option<String>,

    /// Show the metrics and segment of one customer
    #[arg(long)]
    pub lookup: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Parse RFM values from the predict string
    /// Expected format: "recency,frequency,monetary"
    pub fn parse_rfm_values(&self) -> anyhow::Result<Option<(f64, f64, f64)>> {
        if let Some(ref predict_str) = self.predict {
            let parts: Vec<&str> = predict_str.split(',').collect();
            if parts.len() != 3 {
                anyhow::bail!("Predict values must be in format 'recency,frequency,monetary'");
            }

            let recency: f64 = parts[0]
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid recency value: {}", parts[0]))?;
            let frequency: f64 = parts[1]
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid frequency value: {}", parts[1]))?;
            let monetary: f64 = parts[2]
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid monetary value: {}", parts[2]))?;

            Ok(Some((recency, frequency, monetary)))
        } else {
            Ok(None)
        }
    }

    /// Engine options: the config file if given, then flag overrides
    pub fn segmentation_config(&self) -> anyhow::Result<SegmentationConfig> {
        let mut config = match &self.config {
            Some(path) => SegmentationConfig::from_toml_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => SegmentationConfig::default(),
        };

        if let Some(k_min) = self.k_min {
            config.k_min = k_min;
        }
        if let Some(k_max) = self.k_max {
            config.k_max = k_max;
        }
        if self.reference_date.is_some() {
            config.reference_date = self.reference_date;
        }
        if self.keep_non_positive {
            config.monetary_filter = false;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(max_iters) = self.max_iters {
            config.max_iterations = max_iters;
        }
        if let Some(tolerance) = self.tolerance {
            config.tolerance = tolerance;
        }

        Ok(config)
    }

    /// Column names to resolve against the CSV header
    pub fn column_mapping(&self) -> ColumnMapping {
        ColumnMapping {
            customer_id: self.customer_col.clone(),
            transaction_date: self.date_col.clone(),
            quantity: self.quantity_col.clone(),
            unit_price: self.price_col.clone(),
            amount: self.amount_col.clone(),
        }
    }
}
