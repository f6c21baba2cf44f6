//! Trend-graph pipeline: pull the producing query out of an alert's
//! `generatorURL`, re-execute it against the metrics backend over a lookback
//! window and rasterize the result.
//!
//! Every failure here is non-fatal; the orchestrator delivers text-only when
//! no image comes back.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::alert::{Alert, SOURCE_GRAFANA, SOURCE_PROMETHEUS};
use crate::chart::{self, PlotEngine, Series};

/// First eight bytes of every PNG stream.
pub const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Minimum believable chart size; anything shorter is a backend error page.
const MIN_PNG_LEN: usize = 100;

/// Caller-side cap on the range-query response body.
const MAX_RESPONSE_BYTES: usize = 5 * 1024 * 1024;

/// An image artifact is only ever delivered when it looks like a real PNG.
pub fn validate_png(bytes: &[u8]) -> bool {
    bytes.len() >= MIN_PNG_LEN && bytes[..PNG_MAGIC.len()] == PNG_MAGIC
}

/// `prometheus_image` / `grafana_image` configuration block.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct ImageSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// metrics backend base url; falls back to the generator URL's authority
    #[serde(default)]
    pub prometheus_url: Option<String>,
    #[serde(default = "default_lookback")]
    pub lookback_minutes: u64,
    #[serde(default = "default_step")]
    pub step: String,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "timeout_seconds", default = "default_timeout")]
    pub timeout: Duration,
    #[serde(default = "default_max_series")]
    pub max_series: usize,
    #[serde(default)]
    pub plot_engine: PlotEngine,
    #[serde(default)]
    pub use_proxy: bool,
}

fn default_true() -> bool {
    true
}

fn default_lookback() -> u64 {
    15
}

fn default_step() -> String {
    "30s".to_owned()
}

fn default_timeout() -> Duration {
    Duration::from_secs(8)
}

fn default_max_series() -> usize {
    8
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            prometheus_url: None,
            lookback_minutes: default_lookback(),
            step: default_step(),
            timeout: default_timeout(),
            max_series: default_max_series(),
            plot_engine: PlotEngine::default(),
            use_proxy: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("generator url carries no query expression")]
    NoQuery,
    #[error("range query failed: {0}")]
    QueryFailed(String),
    #[error("range query returned no plottable series")]
    EmptySeries,
    #[error("rendered bytes are not a valid png")]
    InvalidImage,
    #[error("range query timed out")]
    Timeout,
}

/// Standard prometheus range result: `data.result[].{metric, values}`.
#[derive(Debug, Deserialize)]
struct RangeResponse {
    status: String,
    #[serde(default)]
    data: RangeData,
}

#[derive(Debug, Default, Deserialize)]
struct RangeData {
    #[serde(default)]
    result: Vec<RangeSeries>,
}

#[derive(Debug, Deserialize)]
struct RangeSeries {
    #[serde(default)]
    metric: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

pub struct ImagePipeline {
    prometheus: SourcePipeline,
    grafana: SourcePipeline,
}

struct SourcePipeline {
    settings: ImageSettings,
    client: Client,
}

impl ImagePipeline {
    pub fn new(
        prometheus: ImageSettings,
        grafana: ImageSettings,
        proxy: Option<&str>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            prometheus: SourcePipeline::new(prometheus, proxy)?,
            grafana: SourcePipeline::new(grafana, proxy)?,
        })
    }

    /// Whether the pipeline can be activated for this alert at all: a known
    /// producer with an enabled image config and an absolute generator URL.
    pub fn activatable(&self, alert: &Alert) -> bool {
        let settings = match self.settings_for(alert) {
            Some(pipeline) => &pipeline.settings,
            None => return false,
        };
        settings.enabled && Url::parse(&alert.generator_url).is_ok()
    }

    fn settings_for(&self, alert: &Alert) -> Option<&SourcePipeline> {
        match alert.source() {
            SOURCE_PROMETHEUS => Some(&self.prometheus),
            SOURCE_GRAFANA => Some(&self.grafana),
            _ => None,
        }
    }

    /// Produce validated PNG bytes for the alert's query, or an error the
    /// orchestrator downgrades to text-only delivery.
    pub async fn render_trend(&self, alert: &Alert) -> Result<Vec<u8>, ImageError> {
        let pipeline = self.settings_for(alert).ok_or(ImageError::NoQuery)?;
        if !pipeline.settings.enabled {
            return Err(ImageError::NoQuery);
        }

        let generator = Url::parse(&alert.generator_url).map_err(|_| ImageError::NoQuery)?;
        let expressions = extract_expressions(&generator, alert.source());
        if expressions.is_empty() {
            return Err(ImageError::NoQuery);
        }

        let base = query_base(&pipeline.settings, &generator)?;
        let end = Utc::now();
        let start = end
            - chrono::Duration::minutes(pipeline.settings.lookback_minutes.max(1) as i64);

        let mut series: Vec<Series> = Vec::new();
        for expression in &expressions {
            let fetched = pipeline.fetch_range(&base, expression, start, end).await?;
            series.extend(fetched);
            if series.len() >= pipeline.settings.max_series {
                break;
            }
        }
        series.truncate(pipeline.settings.max_series);

        if series.iter().all(|s| s.points.is_empty()) {
            return Err(ImageError::EmptySeries);
        }

        debug!(
            alertname = alert.alertname(),
            series = series.len(),
            "rasterizing trend chart"
        );
        let png = chart::render(&series, pipeline.settings.plot_engine).map_err(|err| match err {
            chart::ChartError::NoPoints => ImageError::EmptySeries,
            _ => ImageError::InvalidImage,
        })?;

        if !validate_png(&png) {
            return Err(ImageError::InvalidImage);
        }

        Ok(png)
    }
}

impl SourcePipeline {
    fn new(settings: ImageSettings, proxy: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = Client::builder().pool_max_idle_per_host(20);
        if settings.use_proxy {
            if let Some(proxy) = proxy {
                builder = builder.proxy(reqwest::Proxy::all(proxy)?);
            }
        }
        Ok(Self {
            settings,
            client: builder.build()?,
        })
    }

    async fn fetch_range(
        &self,
        base: &str,
        expression: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Series>, ImageError> {
        let endpoint = format!("{base}/api/v1/query_range");
        let start = start.to_rfc3339();
        let end = end.to_rfc3339();
        let response = self
            .client
            .get(&endpoint)
            .query(&[
                ("query", expression),
                ("start", start.as_str()),
                ("end", end.as_str()),
                ("step", self.settings.step.as_str()),
            ])
            .timeout(self.settings.timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ImageError::Timeout
                } else {
                    ImageError::QueryFailed(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageError::QueryFailed(format!(
                "{endpoint} returned {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| ImageError::QueryFailed(err.to_string()))?;
        if body.len() > MAX_RESPONSE_BYTES {
            return Err(ImageError::QueryFailed(format!(
                "response exceeds {MAX_RESPONSE_BYTES} bytes"
            )));
        }

        let parsed: RangeResponse = serde_json::from_slice(&body)
            .map_err(|err| ImageError::QueryFailed(err.to_string()))?;
        if parsed.status != "success" {
            return Err(ImageError::QueryFailed(format!(
                "backend status {}",
                parsed.status
            )));
        }

        Ok(parsed
            .data
            .result
            .into_iter()
            .map(series_from_result)
            .collect())
    }
}

fn series_from_result(raw: RangeSeries) -> Series {
    let label = chart::build_series_label(&raw.metric);
    let points = raw
        .values
        .iter()
        .filter_map(|(ts, value)| {
            let value: f64 = value.parse().ok()?;
            if !value.is_finite() {
                return None;
            }
            let instant = Utc.timestamp_opt(*ts as i64, 0).single()?;
            Some((instant, value))
        })
        .collect();
    Series { label, points }
}

/// The metrics backend to query: configured `prometheus_url` wins, else the
/// authority of the generator URL itself.
fn query_base(settings: &ImageSettings, generator: &Url) -> Result<String, ImageError> {
    if let Some(configured) = &settings.prometheus_url {
        let parsed = Url::parse(configured).map_err(|_| {
            ImageError::QueryFailed(format!("configured prometheus_url {configured:?} is invalid"))
        })?;
        return authority(&parsed).ok_or_else(|| {
            ImageError::QueryFailed(format!("configured prometheus_url {configured:?} is invalid"))
        });
    }
    authority(generator).ok_or(ImageError::NoQuery)
}

fn authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    match url.port() {
        Some(port) => Some(format!("{}://{host}:{port}", url.scheme())),
        None => Some(format!("{}://{host}", url.scheme())),
    }
}

/// Pull the query expressions out of a generator URL.
///
/// Prometheus graph links carry `g0.expr` (and `g1.expr`, ... for overlay
/// panes); grafana links embed whichever of `query`, `expr` or `g0.expr` the
/// emitter used.
fn extract_expressions(generator: &Url, source: &str) -> Vec<String> {
    let pairs: Vec<(String, String)> = generator
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let lookup = |key: &str| {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .filter(|v| !v.is_empty())
    };

    if source == SOURCE_GRAFANA {
        for key in ["query", "expr", "g0.expr"] {
            if let Some(expression) = lookup(key) {
                return vec![expression];
            }
        }
        info!("grafana generator url carries no query parameter");
        return Vec::new();
    }

    let mut expressions = Vec::new();
    let mut pane = 0usize;
    loop {
        match lookup(&format!("g{pane}.expr")) {
            Some(expression) => expressions.push(expression),
            None => break,
        }
        pane += 1;
    }
    expressions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_validation_requires_magic_and_length() {
        let mut good = PNG_MAGIC.to_vec();
        good.resize(200, 0);
        assert!(validate_png(&good));

        // error page instead of an image
        assert!(!validate_png(b"<html>error</html>"));

        // right magic, implausibly short
        let mut short = PNG_MAGIC.to_vec();
        short.resize(50, 0);
        assert!(!validate_png(&short));
    }

    #[test]
    fn prometheus_expressions_come_from_g_expr_panes() {
        let url = Url::parse(
            "http://p:9090/graph?g0.expr=rate%28cpu%5B5m%5D%29&g0.tab=1&g1.expr=mem",
        )
        .unwrap();
        assert_eq!(
            extract_expressions(&url, SOURCE_PROMETHEUS),
            vec!["rate(cpu[5m])", "mem"]
        );
    }

    #[test]
    fn grafana_expression_prefers_query_parameter() {
        let url = Url::parse("http://g:3000/alerting/view?query=up&expr=down").unwrap();
        assert_eq!(extract_expressions(&url, SOURCE_GRAFANA), vec!["up"]);

        let expr_only = Url::parse("http://g:3000/alerting/view?expr=down").unwrap();
        assert_eq!(extract_expressions(&expr_only, SOURCE_GRAFANA), vec!["down"]);
    }

    #[test]
    fn missing_expression_yields_nothing() {
        let url = Url::parse("http://g:3000/alerting/view?panelId=4").unwrap();
        assert!(extract_expressions(&url, SOURCE_GRAFANA).is_empty());
        assert!(extract_expressions(&url, SOURCE_PROMETHEUS).is_empty());
    }

    #[test]
    fn query_base_prefers_configured_backend() {
        let generator = Url::parse("http://prom-internal:9090/graph?g0.expr=x").unwrap();
        let mut settings = ImageSettings::default();
        assert_eq!(
            query_base(&settings, &generator).unwrap(),
            "http://prom-internal:9090"
        );

        settings.prometheus_url = Some("https://prom.example.com".to_owned());
        assert_eq!(
            query_base(&settings, &generator).unwrap(),
            "https://prom.example.com"
        );
    }

    #[test]
    fn range_response_parses_standard_shape() {
        let raw = serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [{
                    "metric": {"__name__": "cpu", "instance": "n1"},
                    "values": [[1705312200.0, "0.5"], [1705312230.0, "0.75"], [1705312260.0, "NaN"]]
                }]
            }
        });
        let parsed: RangeResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.status, "success");
        let series = series_from_result(parsed.data.result.into_iter().next().unwrap());
        assert_eq!(series.label, "instance=n1");
        // the NaN sample is dropped
        assert_eq!(series.points.len(), 2);
        assert_eq!(series.points[1].1, 0.75);
    }

    #[test]
    fn activation_requires_known_source_and_absolute_url() {
        let pipeline = ImagePipeline::new(
            ImageSettings::default(),
            ImageSettings::default(),
            None,
        )
        .unwrap();

        let mut alert = crate::alert::normalize(&serde_json::json!({
            "version": "4",
            "groupKey": "k",
            "alerts": [{
                "labels": {"alertname": "HighCPU"},
                "startsAt": "2024-01-15T10:30:00Z",
                "generatorURL": "http://p:9090/graph?g0.expr=cpu"
            }]
        }))
        .unwrap()
        .remove(0);
        assert!(pipeline.activatable(&alert));

        alert.generator_url = "not a url".to_owned();
        assert!(!pipeline.activatable(&alert));

        alert
            .labels
            .insert("_source".to_owned(), "unknown".to_owned());
        assert!(!pipeline.activatable(&alert));
    }
}
