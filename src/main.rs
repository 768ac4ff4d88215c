//! SegmentForge: RFM customer segmentation CLI
//!
//! Loads transactions from CSV, runs the segmentation engine, and prints or
//! plots the resulting segments.

use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use segmentforge::{ingest, segment, segment_with_k, viz, Args, SegmentationResult};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let start_time = Instant::now();

    let config = args.segmentation_config()?;
    tracing::debug!(?config, "configuration");

    let load_start = Instant::now();
    let input = ingest::load_transactions(&args.input, &args.column_mapping())
        .with_context(|| format!("loading transactions from {}", args.input))?;
    tracing::info!(
        records = input.records.len(),
        elapsed_secs = load_start.elapsed().as_secs_f64(),
        "transactions loaded"
    );

    let fit_start = Instant::now();
    let result = match args.clusters {
        Some(k) => segment_with_k(&input, &config, k),
        None => segment(&input, &config),
    }
    .context("segmentation failed")?;
    tracing::info!(
        customers = result.metrics.len(),
        k = result.k(),
        elapsed_secs = fit_start.elapsed().as_secs_f64(),
        "segments fitted"
    );
    for (customer_id, cluster, label) in result.labeled_customers() {
        tracing::trace!(customer_id, cluster, label, "customer segment");
    }

    let prediction = args.parse_rfm_values()?;

    if args.json {
        print_json(&args, &result, prediction)?;
    } else {
        viz::print_segment_report(&result);
        if let Some(rfm) = prediction {
            print_prediction(&result, rfm);
        }
        if let Some(customer_id) = &args.lookup {
            print_lookup(&result, customer_id)?;
        }
    }

    if let Some(plot_path) = &args.plot {
        for path in viz::generate_visualization_report(&result, plot_path)? {
            println!("Chart saved to: {}", path);
        }
    }

    tracing::info!(elapsed_secs = start_time.elapsed().as_secs_f64(), "done");
    Ok(())
}

/// Log to stderr; `info` by default, `debug` with --verbose, `RUST_LOG` wins
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Segment of an unseen customer
fn print_prediction(result: &SegmentationResult, (recency, frequency, monetary): (f64, f64, f64)) {
    let (cluster, label) = result.classify(recency, frequency, monetary);

    println!("\n=== Prediction ===");
    println!("Input RFM values: R={}, F={}, M={}", recency, frequency, monetary);
    println!("Predicted segment: {} (cluster {})", label, cluster);
    if let Some(profile) = result.summary.segment(cluster) {
        println!(
            "  Size: {} customers ({:.1}% of total)",
            profile.customer_count, profile.customer_share
        );
        println!(
            "  Mean RFM: R={:.1}, F={:.1}, M={:.2}",
            profile.mean_recency, profile.mean_frequency, profile.mean_monetary
        );
    }
}

fn print_lookup(result: &SegmentationResult, customer_id: &str) -> Result<()> {
    let customer = result
        .customer(customer_id)
        .with_context(|| format!("customer '{}' not found among segmented customers", customer_id))?;

    println!("\n=== Customer {} ===", customer_id);
    println!(
        "Recency: {} days, Frequency: {}, Monetary: {:.2}",
        customer.metrics.recency, customer.metrics.frequency, customer.metrics.monetary
    );
    println!("Segment: {} (cluster {})", customer.label, customer.cluster);
    Ok(())
}

fn print_json(args: &Args, result: &SegmentationResult, prediction: Option<(f64, f64, f64)>) -> Result<()> {
    let prediction = prediction.map(|(r, f, m)| {
        let (cluster, label) = result.classify(r, f, m);
        serde_json::json!({ "recency": r, "frequency": f, "monetary": m, "cluster": cluster, "label": label })
    });
    let lookup = match &args.lookup {
        Some(id) => Some(
            result
                .customer(id)
                .with_context(|| format!("customer '{}' not found among segmented customers", id))?,
        ),
        None => None,
    };

    let report = serde_json::json!({
        "result": result,
        "prediction": prediction,
        "lookup": lookup,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
