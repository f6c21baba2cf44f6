//! Canonical alert model and normalization of producer webhook payloads.
//!
//! Two producers are understood: the prometheus alertmanager webhook and the
//! grafana unified-alerting emitter. Both are parsed into the same [`Alert`]
//! record, tagged with a `_source` label that the routing engine treats as
//! authoritative.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

pub const SOURCE_PROMETHEUS: &str = "prometheus";
pub const SOURCE_GRAFANA: &str = "grafana";
pub const SOURCE_UNKNOWN: &str = "unknown";

/// Labels that identify an entity rather than an alert condition. Alerts in
/// one envelope that differ only in one of these collapse into a single
/// record carrying `merged_entities`.
pub const ENTITY_LABELS: &[&str] = &["pod", "instance", "service_name", "container", "host"];

/// The "alert has not ended" sentinel, `0001-01-01T00:00:00Z`.
pub fn open_sentinel() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

impl AlertStatus {
    /// Producers occasionally send unexpected status strings; anything that
    /// is not literally `resolved` counts as firing.
    fn from_wire(raw: Option<&str>) -> Self {
        match raw {
            Some("resolved") => AlertStatus::Resolved,
            _ => AlertStatus::Firing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Firing => "firing",
            AlertStatus::Resolved => "resolved",
        }
    }
}

/// One normalized alert. Immutable after the normalizer returns it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub status: AlertStatus,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    #[serde(rename = "startsAt")]
    pub starts_at: DateTime<Utc>,
    #[serde(rename = "endsAt")]
    pub ends_at: DateTime<Utc>,
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(rename = "silenceURL", skip_serializing_if = "Option::is_none")]
    pub silence_url: Option<String>,
    #[serde(rename = "dashboardURL", skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    #[serde(rename = "panelURL", skip_serializing_if = "Option::is_none")]
    pub panel_url: Option<String>,
    #[serde(rename = "valueString", skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<HashMap<String, Value>>,
    pub merged_entities: Vec<String>,
}

impl Alert {
    pub fn alertname(&self) -> &str {
        self.labels
            .get("alertname")
            .map(String::as_str)
            .unwrap_or("Unknown")
    }

    /// The `_source` label stamped by the normalizer.
    pub fn source(&self) -> &str {
        self.labels
            .get("_source")
            .map(String::as_str)
            .unwrap_or(SOURCE_UNKNOWN)
    }

    pub fn is_resolved(&self) -> bool {
        self.status == AlertStatus::Resolved
    }

    pub fn is_open(&self) -> bool {
        self.ends_at == open_sentinel()
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("unrecognized payload shape")]
    UnrecognizedPayload,
    #[error("no alert could be extracted from the envelope")]
    EmptyEnvelope,
}

/// Producer shapes the gateway accepts on `POST /webhook`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Prometheus,
    Grafana,
    Single,
    Unknown,
}

/// Identify the producer from the top-level payload object alone.
///
/// Discrimination rules, applied in order:
/// 1. numeric `orgId` => grafana
/// 2. `version == "1"` and `state` or `title` present => grafana
/// 3. `version` present and not `"1"`, with `groupKey` and `alerts` => prometheus
/// 4. `alerts` present => prometheus (lenient)
/// 5. `labels` and `status` present => a single inline alert
/// 6. anything else => unknown
pub fn identify(payload: &Value) -> PayloadKind {
    let Some(obj) = payload.as_object() else {
        return PayloadKind::Unknown;
    };

    if obj.get("orgId").map_or(false, Value::is_number) {
        return PayloadKind::Grafana;
    }

    let version = obj.get("version").and_then(Value::as_str);
    if version == Some("1") && (obj.contains_key("state") || obj.contains_key("title")) {
        return PayloadKind::Grafana;
    }
    if let Some(v) = version {
        if v != "1" && obj.contains_key("groupKey") && obj.contains_key("alerts") {
            return PayloadKind::Prometheus;
        }
    }
    if obj.contains_key("alerts") {
        return PayloadKind::Prometheus;
    }
    if obj.contains_key("labels") && obj.contains_key("status") {
        return PayloadKind::Single;
    }

    PayloadKind::Unknown
}

/// Prometheus alertmanager envelope (`version: "4"`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrometheusEnvelope {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    receiver: String,
    #[serde(default)]
    common_labels: BTreeMap<String, String>,
    #[serde(default)]
    common_annotations: BTreeMap<String, String>,
    #[serde(rename = "externalURL", default)]
    external_url: String,
    #[serde(default)]
    alerts: Vec<Value>,
}

/// Grafana unified-alerting envelope (`orgId`, `version: "1"`). Field-wise a
/// superset of the prometheus one; the extras ride on each alert entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrafanaEnvelope {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    receiver: String,
    #[serde(default)]
    common_labels: BTreeMap<String, String>,
    #[serde(default)]
    common_annotations: BTreeMap<String, String>,
    #[serde(rename = "externalURL", default)]
    external_url: String,
    #[serde(default)]
    alerts: Vec<Value>,
}

/// One alert entry as either producer sends it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAlert {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default = "open_sentinel", deserialize_with = "lenient_instant")]
    starts_at: DateTime<Utc>,
    #[serde(default = "open_sentinel", deserialize_with = "lenient_instant")]
    ends_at: DateTime<Utc>,
    #[serde(rename = "generatorURL", default)]
    generator_url: String,
    #[serde(default)]
    fingerprint: Option<String>,
    #[serde(rename = "silenceURL", default)]
    silence_url: Option<String>,
    #[serde(rename = "dashboardURL", default)]
    dashboard_url: Option<String>,
    #[serde(rename = "panelURL", default)]
    panel_url: Option<String>,
    #[serde(rename = "valueString", default)]
    value_string: Option<String>,
    #[serde(default)]
    values: Option<HashMap<String, Value>>,
    #[serde(rename = "merged_entities", default)]
    merged_entities: Vec<String>,
}

/// RFC-3339 instant; missing or empty strings map to the open sentinel.
fn lenient_instant<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw.as_deref() {
        None | Some("") => Ok(open_sentinel()),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom),
    }
}

/// Normalize a decoded webhook payload into canonical alerts.
///
/// A malformed per-alert entry is logged and skipped; the envelope as a whole
/// fails only when no alert survives.
pub fn normalize(payload: &Value) -> Result<Vec<Alert>, NormalizeError> {
    let alerts = match identify(payload) {
        PayloadKind::Prometheus => parse_prometheus(payload),
        PayloadKind::Grafana => parse_grafana(payload),
        PayloadKind::Single => parse_single(payload),
        PayloadKind::Unknown => return Err(NormalizeError::UnrecognizedPayload),
    };

    if alerts.is_empty() {
        return Err(NormalizeError::EmptyEnvelope);
    }

    Ok(merge_entities(alerts))
}

fn parse_prometheus(payload: &Value) -> Vec<Alert> {
    let Ok(envelope) = serde_json::from_value::<PrometheusEnvelope>(payload.clone()) else {
        warn!("prometheus envelope has an unexpected shape");
        return Vec::new();
    };

    collect_alerts(
        &envelope.alerts,
        envelope.status.as_deref(),
        &envelope.receiver,
        &envelope.common_labels,
        &envelope.common_annotations,
        &envelope.external_url,
        SOURCE_PROMETHEUS,
    )
}

fn parse_grafana(payload: &Value) -> Vec<Alert> {
    let Ok(envelope) = serde_json::from_value::<GrafanaEnvelope>(payload.clone()) else {
        warn!("grafana envelope has an unexpected shape");
        return Vec::new();
    };

    collect_alerts(
        &envelope.alerts,
        envelope.status.as_deref(),
        &envelope.receiver,
        &envelope.common_labels,
        &envelope.common_annotations,
        &envelope.external_url,
        SOURCE_GRAFANA,
    )
}

fn collect_alerts(
    entries: &[Value],
    envelope_status: Option<&str>,
    receiver: &str,
    common_labels: &BTreeMap<String, String>,
    common_annotations: &BTreeMap<String, String>,
    external_url: &str,
    source: &str,
) -> Vec<Alert> {
    let mut alerts = Vec::with_capacity(entries.len());

    for entry in entries {
        let wire: WireAlert = match serde_json::from_value(entry.clone()) {
            Ok(wire) => wire,
            Err(err) => {
                warn!(error = %err, "skipping malformed alert entry");
                continue;
            }
        };
        alerts.push(promote(
            wire,
            envelope_status,
            receiver,
            common_labels,
            common_annotations,
            external_url,
            source,
        ));
    }

    alerts
}

/// Turn one wire entry into a canonical alert: merge envelope-level labels
/// and annotations under the per-alert values, apply envelope fallbacks for
/// status and generator URL, and stamp the internal metadata labels.
fn promote(
    wire: WireAlert,
    envelope_status: Option<&str>,
    receiver: &str,
    common_labels: &BTreeMap<String, String>,
    common_annotations: &BTreeMap<String, String>,
    external_url: &str,
    source: &str,
) -> Alert {
    let mut labels = common_labels.clone();
    labels.extend(wire.labels);
    // keys beginning with `_` are reserved for internal metadata
    labels.retain(|k, _| !k.starts_with('_'));
    labels.insert("_source".to_owned(), source.to_owned());
    if !receiver.is_empty() {
        labels.insert("_receiver".to_owned(), receiver.to_owned());
    }

    let mut annotations = common_annotations.clone();
    annotations.extend(wire.annotations);

    let status = AlertStatus::from_wire(wire.status.as_deref().or(envelope_status));

    let generator_url = if wire.generator_url.is_empty() {
        external_url.to_owned()
    } else {
        wire.generator_url
    };

    // resolved alerts always carry an end time
    let ends_at = if status == AlertStatus::Resolved && wire.ends_at == open_sentinel() {
        wire.starts_at
    } else {
        wire.ends_at
    };

    Alert {
        status,
        labels,
        annotations,
        starts_at: wire.starts_at,
        ends_at,
        generator_url,
        fingerprint: wire.fingerprint.filter(|f| !f.is_empty()),
        silence_url: wire.silence_url.filter(|u| !u.is_empty()),
        dashboard_url: wire.dashboard_url.filter(|u| !u.is_empty()),
        panel_url: wire.panel_url.filter(|u| !u.is_empty()),
        value_string: wire.value_string.filter(|v| !v.is_empty()),
        values: wire.values,
        merged_entities: wire.merged_entities,
    }
}

/// Compatibility shape: the payload is itself one alert. The producer's own
/// `_source` is honored when it names a known producer, otherwise the alert
/// is tagged `unknown` and never activates the image pipeline.
fn parse_single(payload: &Value) -> Vec<Alert> {
    let wire: WireAlert = match serde_json::from_value(payload.clone()) {
        Ok(wire) => wire,
        Err(err) => {
            warn!(error = %err, "single-alert payload is malformed");
            return Vec::new();
        }
    };

    let source = match wire.labels.get("_source").map(String::as_str) {
        Some(SOURCE_PROMETHEUS) => SOURCE_PROMETHEUS,
        Some(SOURCE_GRAFANA) => SOURCE_GRAFANA,
        _ => SOURCE_UNKNOWN,
    };

    vec![promote(
        wire,
        None,
        "",
        &BTreeMap::new(),
        &BTreeMap::new(),
        "",
        source,
    )]
}

/// Collapse alerts that differ only in one entity label into a single record
/// listing the per-entity values in first-seen order. The collapsed record
/// keeps the labels of the first alert of the run, so routing still sees the
/// first entity's value.
fn merge_entities(alerts: Vec<Alert>) -> Vec<Alert> {
    let mut out: Vec<Alert> = Vec::with_capacity(alerts.len());
    let mut groups: HashMap<String, usize> = HashMap::new();

    for alert in alerts {
        let signatures: Vec<(&'static str, String)> = ENTITY_LABELS
            .iter()
            .filter(|key| alert.labels.contains_key(**key))
            .map(|key| (*key, merge_signature(&alert, key)))
            .collect();

        let hit = signatures
            .iter()
            .find_map(|(key, sig)| groups.get(sig).map(|idx| (*key, *idx)));

        match hit {
            Some((key, idx)) => {
                let target = &mut out[idx];
                if target.merged_entities.is_empty() {
                    if let Some(own) = target.labels.get(key) {
                        target.merged_entities.push(own.clone());
                    }
                }
                if let Some(value) = alert.labels.get(key) {
                    if !target.merged_entities.contains(value) {
                        target.merged_entities.push(value.clone());
                    }
                }
            }
            None => {
                let idx = out.len();
                for (_, sig) in signatures {
                    groups.insert(sig, idx);
                }
                out.push(alert);
            }
        }
    }

    out
}

/// Signature of an alert with one entity label masked out. Two alerts with
/// equal signatures differ at most in that entity's value.
fn merge_signature(alert: &Alert, masked: &str) -> String {
    let mut sig = String::new();
    sig.push_str(alert.status.as_str());
    sig.push('\u{1}');
    sig.push_str(masked);
    for (k, v) in &alert.labels {
        if k == masked {
            continue;
        }
        sig.push('\u{1}');
        sig.push_str(k);
        sig.push('\u{2}');
        sig.push_str(v);
    }
    sig
}
