//! Chart rendering with Plotters and console reporting for the host binary

use plotters::prelude::*;

use crate::pipeline::SegmentationResult;
use crate::selection::SelectionReport;

/// Color palette for segments; wraps around for larger k
const SEGMENT_COLORS: [RGBColor; 8] = [
    RED,
    BLUE,
    GREEN,
    MAGENTA,
    CYAN,
    RGBColor(255, 140, 0),
    RGBColor(128, 0, 128),
    RGBColor(120, 120, 120),
];

/// Color of a segment
pub fn segment_color(cluster: usize) -> RGBColor {
    SEGMENT_COLORS[cluster % SEGMENT_COLORS.len()]
}

/// Output files derived from the main plot path: (scatter, sizes, score curve)
pub fn chart_paths(base_output_path: &str) -> (String, String, String) {
    let stem = base_output_path.strip_suffix(".png").unwrap_or(base_output_path);
    (
        format!("{}.png", stem),
        format!("{}_sizes.png", stem),
        format!("{}_scores.png", stem),
    )
}

/// Padded (min, max) of a set of values
fn padded_bounds(values: impl Iterator<Item = f64>, padding: f64) -> (f64, f64) {
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if min.is_finite() && max.is_finite() {
        (min - padding, max + padding)
    } else {
        (-padding, padding)
    }
}

/// Scatter plot of scaled frequency against scaled monetary, colored by segment
///
/// # Arguments
/// * `result` - Finished segmentation run
/// * `output_path` - Path to save the PNG plot
/// * `plot_title` - Title for the plot
pub fn create_segment_scatter(
    result: &SegmentationResult,
    output_path: &str,
    plot_title: Option<&str>,
) -> anyhow::Result<()> {
    let title = plot_title.unwrap_or("Customer Segments: Frequency vs Monetary (scaled)");

    let features = result.scaler.transform(result.metrics.raw_features().view());
    let frequency_values: Vec<f64> = features.column(1).to_vec();
    let monetary_values: Vec<f64> = features.column(2).to_vec();

    let (freq_min, freq_max) = padded_bounds(frequency_values.iter().copied(), 0.5);
    let (mon_min, mon_max) = padded_bounds(monetary_values.iter().copied(), 0.5);

    let root = BitMapBackend::new(output_path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 28))
        .margin(10)
        .x_label_area_size(50)
        .y_label_area_size(60)
        .build_cartesian_2d(freq_min..freq_max, mon_min..mon_max)?;

    chart
        .configure_mesh()
        .x_desc("Frequency (scaled)")
        .y_desc("Monetary (scaled)")
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    chart.draw_series(
        frequency_values
            .iter()
            .zip(&monetary_values)
            .zip(&result.assignment.clusters)
            .map(|((&freq, &mon), &cluster)| Circle::new((freq, mon), 3, segment_color(cluster).mix(0.6).filled())),
    )?;

    // Centers as larger squares, one legend entry per segment
    for (cluster, center) in result.centroids.outer_iter().enumerate() {
        let (freq, mon) = (center[1], center[2]);
        let color = segment_color(cluster);
        let label = result.label_of(cluster).unwrap_or("?");

        chart
            .draw_series(std::iter::once(Rectangle::new(
                [(freq - 0.1, mon - 0.1), (freq + 0.1, mon + 0.1)],
                color.filled(),
            )))?
            .label(format!("{}: {}", cluster, label))
            .legend(move |(x, y)| Rectangle::new([(x, y), (x + 10, y + 10)], color.filled()));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()?;
    tracing::info!(path = output_path, "segment scatter written");
    Ok(())
}

/// Bar chart of customers per segment
pub fn create_segment_size_chart(result: &SegmentationResult, output_path: &str) -> anyhow::Result<()> {
    let sizes = result.assignment.sizes();
    let max_size = sizes.iter().copied().max().unwrap_or(1).max(1) as f64;

    let root = BitMapBackend::new(output_path, (700, 450)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Segment Sizes", ("sans-serif", 28))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(-0.5f64..(sizes.len() as f64 - 0.5), 0f64..(max_size * 1.1))?;

    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(sizes.len())
        .x_label_formatter(&|x| {
            let cluster = x.round();
            if cluster >= 0.0 {
                result.label_of(cluster as usize).unwrap_or("").to_string()
            } else {
                String::new()
            }
        })
        .y_desc("Customers")
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    chart.draw_series(sizes.iter().enumerate().map(|(cluster, &size)| {
        let x = cluster as f64;
        Rectangle::new([(x - 0.4, 0.0), (x + 0.4, size as f64)], segment_color(cluster).filled())
    }))?;

    root.present()?;
    tracing::info!(path = output_path, "segment size chart written");
    Ok(())
}

/// Line chart of the quality score per candidate k, selected k highlighted
pub fn create_score_curve_chart(report: &SelectionReport, output_path: &str) -> anyhow::Result<()> {
    let k_first = report.curve.first().map_or(1, |s| s.k) as f64;
    let k_last = report.curve.last().map_or(1, |s| s.k) as f64;
    let (score_min, score_max) = padded_bounds(report.curve.iter().map(|s| s.score), 0.05);

    let root = BitMapBackend::new(output_path, (700, 450)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Silhouette Score by Number of Segments", ("sans-serif", 24))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d((k_first - 0.5)..(k_last + 0.5), score_min..score_max)?;

    chart
        .configure_mesh()
        .x_desc("k")
        .y_desc("Silhouette score")
        .axis_desc_style(("sans-serif", 15))
        .draw()?;

    chart.draw_series(LineSeries::new(report.curve.iter().map(|s| (s.k as f64, s.score)), &BLUE))?;
    chart.draw_series(report.curve.iter().map(|s| {
        let style = if s.k == report.selected_k { RED.filled() } else { BLUE.filled() };
        Circle::new((s.k as f64, s.score), if s.k == report.selected_k { 6 } else { 4 }, style)
    }))?;

    root.present()?;
    tracing::info!(path = output_path, "score curve written");
    Ok(())
}

/// Print the score curve, segment table and diagnostics to the console
pub fn print_segment_report(result: &SegmentationResult) {
    if let Some(report) = &result.selection {
        println!("\n=== Model Selection ===");
        println!("  k | silhouette |    inertia");
        println!("  --|------------|-----------");
        for score in &report.curve {
            let marker = if score.k == report.selected_k { " <" } else { "" };
            println!("{:3} | {:10.4} | {:10.2}{}", score.k, score.score, score.inertia, marker);
        }
        if report.searched != report.requested {
            println!(
                "Searched k in {}..={} (requested {}..={})",
                report.searched.0, report.searched.1, report.requested.0, report.requested.1
            );
        }
    }

    let summary = &result.summary;
    println!("\n=== Segment Summary ===");
    println!(
        "Customers: {}   Segments: {}   Reference date: {}",
        summary.total_customers,
        result.k(),
        result.metrics.reference_date
    );
    println!(
        "\n  {:<3} {:<20} {:>9} {:>7} {:>9} {:>9} {:>11} {:>8}",
        "id", "segment", "customers", "share", "recency", "freq", "monetary", "revenue"
    );
    for segment in &summary.segments {
        println!(
            "  {:<3} {:<20} {:>9} {:>6.1}% {:>9.1} {:>9.1} {:>11.2} {:>7.1}%",
            segment.cluster,
            segment.label,
            segment.customer_count,
            segment.customer_share,
            segment.mean_recency,
            segment.mean_frequency,
            segment.mean_monetary,
            segment.monetary_share,
        );
    }

    if !result.diagnostics.is_empty() {
        println!("\nDiagnostics:");
        for advisory in &result.diagnostics {
            println!("  - {}", advisory);
        }
    }
}

/// Write all charts next to `base_output_path` and return their paths
pub fn generate_visualization_report(result: &SegmentationResult, base_output_path: &str) -> anyhow::Result<Vec<String>> {
    let (scatter_path, sizes_path, scores_path) = chart_paths(base_output_path);

    create_segment_scatter(result, &scatter_path, None)?;
    create_segment_size_chart(result, &sizes_path)?;
    let mut written = vec![scatter_path, sizes_path];

    if let Some(report) = &result.selection {
        create_score_curve_chart(report, &scores_path)?;
        written.push(scores_path);
    }

    Ok(written)
}
