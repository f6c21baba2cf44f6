//! Rasterization of range-query results into PNG trend charts.
//!
//! Two styles are selectable per image config: `plotly` (the denser look,
//! point markers on every sample, light grid) and `matplotlib` (plain
//! lines). Both produce a PNG byte buffer; the charts are drawn without any
//! text so the renderer carries no font stack.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder};
use plotters::prelude::*;
use serde::Deserialize;
use thiserror::Error;

/// One plottable series: a label derived from the metric labels plus the
/// sampled points in time order.
#[derive(Debug, Clone)]
pub struct Series {
    pub label: String,
    pub points: Vec<(DateTime<Utc>, f64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlotEngine {
    #[default]
    Plotly,
    Matplotlib,
}

#[derive(Debug, Error)]
pub enum ChartError {
    #[error("nothing to draw")]
    NoPoints,
    #[error("drawing failed: {0}")]
    Draw(String),
    #[error("png encoding failed: {0}")]
    Encode(String),
}

fn draw_err<E: std::fmt::Display>(err: E) -> ChartError {
    ChartError::Draw(err.to_string())
}

/// Curve name built from the metric labels: `k=v` pairs sorted by key,
/// `__name__` excluded, truncated to 90 characters.
pub fn build_series_label(metric: &BTreeMap<String, String>) -> String {
    let pairs: Vec<String> = metric
        .iter()
        .filter(|(k, _)| k.as_str() != "__name__")
        .map(|(k, v)| format!("{k}={v}"))
        .collect();

    let label = if pairs.is_empty() {
        metric
            .get("__name__")
            .cloned()
            .unwrap_or_else(|| "series".to_owned())
    } else {
        pairs.join(", ")
    };

    if label.chars().count() > 90 {
        let truncated: String = label.chars().take(87).collect();
        format!("{truncated}...")
    } else {
        label
    }
}

/// Render the series into a PNG buffer. Series without points are skipped;
/// an input where nothing remains drawable is an error the pipeline maps to
/// its empty-series case.
pub fn render(series: &[Series], engine: PlotEngine) -> Result<Vec<u8>, ChartError> {
    let drawable: Vec<&Series> = series.iter().filter(|s| !s.points.is_empty()).collect();
    if drawable.is_empty() {
        return Err(ChartError::NoPoints);
    }

    let (width, height, line_width): (u32, u32, u32) = match engine {
        PlotEngine::Plotly => (1200, 600, 2),
        PlotEngine::Matplotlib => (1200, 540, 1),
    };

    let (t_min, t_max) = time_bounds(&drawable);
    let (v_min, v_max) = value_bounds(&drawable);

    let mut rgb = vec![255u8; (width * height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut rgb, (width, height)).into_drawing_area();
        root.fill(&WHITE).map_err(draw_err)?;

        let mut chart = ChartBuilder::on(&root)
            .margin(24)
            .x_label_area_size(0)
            .y_label_area_size(0)
            .build_cartesian_2d(t_min..t_max, v_min..v_max)
            .map_err(draw_err)?;

        let mut mesh = chart.configure_mesh();
        mesh.x_labels(0).y_labels(0);
        match engine {
            PlotEngine::Plotly => {
                mesh.light_line_style(RGBColor(234, 234, 242))
                    .bold_line_style(RGBColor(214, 214, 224));
            }
            PlotEngine::Matplotlib => {
                mesh.light_line_style(TRANSPARENT)
                    .bold_line_style(RGBColor(220, 220, 220));
            }
        }
        mesh.draw().map_err(draw_err)?;

        for (idx, series) in drawable.iter().enumerate() {
            tracing::debug!(series = series.label.as_str(), "drawing series");
            let color = Palette99::pick(idx).to_rgba();
            chart
                .draw_series(LineSeries::new(
                    series.points.iter().map(|(t, v)| (t.timestamp(), *v)),
                    color.stroke_width(line_width),
                ))
                .map_err(draw_err)?;

            if engine == PlotEngine::Plotly {
                chart
                    .draw_series(
                        series
                            .points
                            .iter()
                            .map(|(t, v)| Circle::new((t.timestamp(), *v), 3, color.filled())),
                    )
                    .map_err(draw_err)?;
            }
        }

        root.present().map_err(draw_err)?;
    }

    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(&rgb, width, height, ColorType::Rgb8)
        .map_err(|err| ChartError::Encode(err.to_string()))?;

    Ok(png)
}

fn time_bounds(series: &[&Series]) -> (i64, i64) {
    let mut min = i64::MAX;
    let mut max = i64::MIN;
    for s in series {
        for (t, _) in &s.points {
            min = min.min(t.timestamp());
            max = max.max(t.timestamp());
        }
    }
    if min >= max {
        // a single sample still needs a non-degenerate axis
        (min - 30, max + 30)
    } else {
        (min, max)
    }
}

fn value_bounds(series: &[&Series]) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for s in series {
        for (_, v) in &s.points {
            min = min.min(*v);
            max = max.max(*v);
        }
    }
    if !min.is_finite() || !max.is_finite() {
        return (0.0, 1.0);
    }
    if (max - min).abs() < f64::EPSILON {
        (min - 1.0, max + 1.0)
    } else {
        let pad = (max - min) * 0.05;
        (min - pad, max + pad)
    }
}
