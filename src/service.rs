//! The per-request orchestration: normalize the envelope, then for each
//! alert run dedup, routing, the image pipeline, channel policy, template
//! rendering and the channel senders. Failures stay local to one alert and
//! one channel; the envelope response aggregates every outcome.

use futures::future::join_all;
use once_cell::sync::Lazy;
use prometheus::{opts, register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::alert::{self, Alert, NormalizeError};
use crate::dedup::{Admission, DedupCache};
use crate::filter;
use crate::plotter::{ImageError, ImagePipeline};
use crate::renderer::Renderer;
use crate::routing::RuleSet;
use crate::senders::{self, ClientPool};
use crate::settings::{ChannelKind, ChannelSettings, Settings};

struct Metrics {
    alerts: IntCounterVec,
    sends: IntCounterVec,
    dedup_hits: IntCounter,
}

static METRICS: Lazy<Metrics> = Lazy::new(|| Metrics {
    alerts: register_int_counter_vec!(
        opts!("alerts", "normalized alerts by producer").namespace("foghorn"),
        &["source"]
    )
    .unwrap(),
    sends: register_int_counter_vec!(
        opts!("sends", "per-channel delivery outcomes").namespace("foghorn"),
        &["channel", "outcome"]
    )
    .unwrap(),
    dedup_hits: register_int_counter!(
        opts!("dedup_hits", "alerts suppressed by the dedup window").namespace("foghorn")
    )
    .unwrap(),
});

/// One `{alert, channel}` outcome in the webhook response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendRecord {
    pub alert: String,
    pub channel: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl SendRecord {
    fn sent(alert: &Alert, channel: &str, note: Option<&'static str>) -> Self {
        Self {
            alert: alert.alertname().to_owned(),
            channel: channel.to_owned(),
            ok: true,
            reason: None,
            note: note.map(str::to_owned),
        }
    }

    fn skipped(alert: &Alert, channel: &str, reason: impl Into<String>) -> Self {
        Self {
            alert: alert.alertname().to_owned(),
            channel: channel.to_owned(),
            ok: false,
            reason: Some(reason.into()),
            note: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WebhookResult {
    pub ok: bool,
    pub sent: Vec<SendRecord>,
}

pub struct AlertService {
    settings: &'static Settings,
    rules: RuleSet,
    dedup: DedupCache,
    images: ImagePipeline,
    renderer: Renderer,
    clients: ClientPool,
}

impl AlertService {
    pub fn new(settings: &'static Settings) -> anyhow::Result<Self> {
        let rules = RuleSet::compile(&settings.routing)?;
        let dedup = DedupCache::new(&settings.jenkins_dedup)?;
        let image_proxy = if settings.proxy_enabled {
            settings.proxy.as_deref()
        } else {
            None
        };
        let images = ImagePipeline::new(
            settings.prometheus_image.clone(),
            settings.grafana_image.clone(),
            image_proxy,
        )?;
        let renderer = Renderer::new(&settings.templates_dir, &settings.defaults.title_prefix);
        let clients = ClientPool::build(
            &settings.channels,
            settings.proxy.as_deref(),
            settings.proxy_enabled,
        )?;

        Ok(Self {
            settings,
            rules,
            dedup,
            images,
            renderer,
            clients,
        })
    }

    /// Process one decoded envelope. `Err` only when the envelope itself is
    /// unusable; per-channel failures are reported in the result records.
    pub async fn process(&self, payload: &Value) -> Result<WebhookResult, NormalizeError> {
        let alerts = alert::normalize(payload)?;

        let names: Vec<&str> = alerts.iter().map(Alert::alertname).collect();
        info!(count = alerts.len(), alerts = %names.join(", "), "normalized webhook envelope");

        let mut sent = Vec::new();
        for alert in &alerts {
            METRICS.alerts.with_label_values(&[alert.source()]).inc();
            sent.extend(self.process_alert(alert).await);
        }

        Ok(WebhookResult { ok: true, sent })
    }

    async fn process_alert(&self, alert: &Alert) -> Vec<SendRecord> {
        let alertname = alert.alertname();

        if self.dedup.check(alert) == Admission::Suppressed {
            info!(alertname, dedup_hit = true, "duplicate firing inside the dedup window");
            METRICS.dedup_hits.inc();
            return vec![SendRecord::skipped(
                alert,
                "-",
                "duplicate firing within dedup window",
            )];
        }

        let targets = self.rules.route(&alert.labels);
        if targets.is_empty() {
            info!(alertname, "unrouted: no rule matched");
            return Vec::new();
        }
        info!(alertname, channels = %targets.join(", "), "alert routed");

        let (deliverable, skipped) =
            filter::split_deliverable(&self.settings.channels, &targets, alert.status);

        let mut records: Vec<SendRecord> = skipped
            .into_iter()
            .map(|(channel, reason)| {
                info!(alertname, channel = channel.as_str(), reason, "suppressed by channel policy");
                SendRecord::skipped(alert, &channel, reason)
            })
            .collect();

        // computed at most once per alert and shared across channels
        let image = if filter::wants_image(&deliverable) && self.images.activatable(alert) {
            match self.images.render_trend(alert).await {
                Ok(bytes) => {
                    info!(alertname, bytes = bytes.len(), "trend chart attached");
                    Some(bytes)
                }
                Err(err @ (ImageError::NoQuery | ImageError::EmptySeries)) => {
                    info!(alertname, error = %err, "no trend chart, delivering text only");
                    None
                }
                Err(err) => {
                    warn!(alertname, error = %err, "trend chart failed, delivering text only");
                    None
                }
            }
        } else {
            None
        };

        let sends = deliverable
            .iter()
            .map(|(name, channel)| self.deliver(alert, name, channel, image.as_deref()));
        records.extend(join_all(sends).await);

        records
    }

    async fn deliver(
        &self,
        alert: &Alert,
        name: &str,
        channel: &ChannelSettings,
        image: Option<&[u8]>,
    ) -> SendRecord {
        let alertname = alert.alertname();
        let image = if channel.image_enabled { image } else { None };

        let body = match self
            .renderer
            .render(&channel.template, alert, image.is_some())
        {
            Ok(body) => body,
            Err(err) => {
                error!(alertname, channel = name, error = %err, "template rendering failed");
                METRICS
                    .sends
                    .with_label_values(&[name, "template_error"])
                    .inc();
                return SendRecord::skipped(alert, name, format!("template: {err}"));
            }
        };

        let client = self.clients.for_channel(name);
        let outcome = match channel.kind {
            ChannelKind::Chat => senders::send_chat(client, name, channel, &body, image).await,
            ChannelKind::Webhook => senders::send_webhook(client, name, channel, &body)
                .await
                .map(|_| None),
        };

        match outcome {
            Ok(note) => {
                info!(
                    alertname,
                    channel = name,
                    status = alert.status.as_str(),
                    note = note.unwrap_or(""),
                    "alert delivered"
                );
                METRICS.sends.with_label_values(&[name, "ok"]).inc();
                SendRecord::sent(alert, name, note)
            }
            Err(err) if err.is_config_problem() => {
                warn!(
                    alertname,
                    channel = name,
                    error = %err,
                    "delivery failed, check the channel's receiver url"
                );
                METRICS.sends.with_label_values(&[name, "failed"]).inc();
                SendRecord::skipped(alert, name, err.to_string())
            }
            Err(err) => {
                error!(alertname, channel = name, error = %err, "delivery failed");
                METRICS.sends.with_label_values(&[name, "failed"]).inc();
                SendRecord::skipped(alert, name, err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service(mut config: Value) -> AlertService {
        // tests never hit the network: alerts either route nowhere or into
        // channels the policy filter drops before any send
        if config.get("server").is_none() {
            config["server"] = json!({"bind_address": "127.0.0.1", "port": 0});
        }
        let settings: Settings = serde_json::from_value(config).unwrap();
        settings.validate().unwrap();
        AlertService::new(Box::leak(Box::new(settings))).unwrap()
    }

    fn base_config() -> Value {
        json!({
            "channels": {
                "chat_muted": {
                    "type": "chat",
                    "bot_token": "t",
                    "chat_id": "-1",
                    "template": "chat.html.j2",
                    "enabled": false
                },
                "hook_quiet": {
                    "type": "webhook",
                    "url": "https://ops.invalid/hook",
                    "template": "hook.json.j2",
                    "send_resolved": false
                }
            },
            "routing": [
                {"match": {"alertname": ".*[Jj]enkins.*"}, "send_to": ["chat_muted"]},
                {"match": {"severity": "critical"}, "send_to": ["hook_quiet"]}
            ]
        })
    }

    #[tokio::test]
    async fn unrecognized_envelope_is_an_error() {
        let service = service(base_config());
        assert!(matches!(
            service.process(&json!({"hello": "world"})).await,
            Err(NormalizeError::UnrecognizedPayload)
        ));
    }

    #[tokio::test]
    async fn unrouted_alert_yields_no_records() {
        let service = service(base_config());
        let result = service
            .process(&json!({
                "version": "4",
                "groupKey": "k",
                "alerts": [{"labels": {"alertname": "HighCPU"}, "startsAt": "2024-01-15T10:30:00Z"}]
            }))
            .await
            .unwrap();
        assert!(result.ok);
        assert!(result.sent.is_empty());
    }

    #[tokio::test]
    async fn resolved_alert_is_suppressed_by_channel_policy() {
        let service = service(base_config());
        let result = service
            .process(&json!({
                "version": "4",
                "groupKey": "k",
                "status": "resolved",
                "alerts": [{
                    "status": "resolved",
                    "labels": {"alertname": "DiskFull", "severity": "critical"},
                    "startsAt": "2024-01-15T10:30:00Z",
                    "endsAt": "2024-01-15T10:35:00Z"
                }]
            }))
            .await
            .unwrap();

        assert_eq!(result.sent.len(), 1);
        let record = &result.sent[0];
        assert_eq!(record.channel, "hook_quiet");
        assert!(!record.ok);
        assert_eq!(record.reason.as_deref(), Some("send_resolved=false"));
    }

    #[tokio::test]
    async fn duplicate_build_alert_is_deduplicated() {
        let service = service(base_config());
        let envelope = json!({
            "version": "4",
            "groupKey": "k",
            "receiver": "prod_ebpay_jenkins_alarm",
            "alerts": [{
                "labels": {"alertname": "JenkinsBuildFailed", "instance": "ci-1"},
                "startsAt": "2024-01-15T10:30:00Z"
            }]
        });

        let first = service.process(&envelope).await.unwrap();
        // the first pass reaches the (disabled) channel and is skipped there
        assert_eq!(first.sent[0].reason.as_deref(), Some("channel disabled"));

        let second = service.process(&envelope).await.unwrap();
        assert_eq!(second.sent.len(), 1);
        assert_eq!(second.sent[0].channel, "-");
        assert_eq!(
            second.sent[0].reason.as_deref(),
            Some("duplicate firing within dedup window")
        );
    }

    #[tokio::test]
    async fn disabled_channel_never_receives() {
        let service = service(base_config());
        let result = service
            .process(&json!({
                "version": "4",
                "groupKey": "k",
                "alerts": [{
                    "labels": {"alertname": "nightly-jenkins-job", "pod": "x"},
                    "startsAt": "2024-01-15T10:30:00Z"
                }]
            }))
            .await
            .unwrap();
        assert_eq!(result.sent.len(), 1);
        assert_eq!(result.sent[0].reason.as_deref(), Some("channel disabled"));
    }
}
