//! Per-channel message rendering.
//!
//! Templates are jinja files resolved in a flat directory; the context is the
//! canonical alert plus presentation helpers (status text, CST timestamps,
//! merged entities). Unknown keys render as empty strings, so a template can
//! reference labels that only some producers send.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use minijinja::{path_loader, Environment};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::json;
use thiserror::Error;

use crate::alert::{open_sentinel, Alert, AlertStatus};

/// Presentation zone for all rendered timestamps (UTC+08:00).
fn cst() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).unwrap()
}

#[derive(Debug, Error)]
#[error(transparent)]
pub struct RenderError(#[from] minijinja::Error);

pub struct Renderer {
    env: Environment<'static>,
    title_prefix: String,
}

impl Renderer {
    pub fn new(templates_dir: &str, title_prefix: &str) -> Self {
        let mut env = Environment::new();
        env.set_loader(path_loader(templates_dir));
        env.add_filter("url_to_link", url_to_link);
        Self {
            env,
            title_prefix: title_prefix.to_owned(),
        }
    }

    #[cfg(test)]
    fn with_templates(templates: &[(&str, &str)]) -> Self {
        let mut env = Environment::new();
        env.add_filter("url_to_link", url_to_link);
        for (name, source) in templates {
            env.add_template_owned(name.to_string(), source.to_string())
                .unwrap();
        }
        Self {
            env,
            title_prefix: "[ALERT]".to_owned(),
        }
    }

    pub fn render(
        &self,
        template: &str,
        alert: &Alert,
        image_attached: bool,
    ) -> Result<String, RenderError> {
        let context = self.build_context(alert, image_attached, is_json_template(template));
        let tmpl = self.env.get_template(template)?;
        Ok(tmpl.render(&context)?)
    }

    fn build_context(
        &self,
        alert: &Alert,
        image_attached: bool,
        json_template: bool,
    ) -> serde_json::Value {
        let mut annotations = alert.annotations.clone();
        if json_template {
            // slack-style json templates show the producer's description
            // verbatim; only the embedded timestamps get converted
            if let Some(description) = annotations.get("description") {
                let rewritten = rewrite_description_times(description);
                annotations.insert("description".to_owned(), rewritten);
            }
        }

        json!({
            "title": format!("{} {}", self.title_prefix, alert.alertname()).trim(),
            "status": alert.status.as_str(),
            "status_text": status_text(alert.status),
            "labels": alert.labels,
            "annotations": annotations,
            "startsAt": instant_string(&alert.starts_at),
            "endsAt": instant_string(&alert.ends_at),
            "startsAt_cst": to_cst(&alert.starts_at),
            "endsAt_cst": to_cst(&alert.ends_at),
            "generatorURL": alert.generator_url,
            "source": alert.source(),
            "merged_entities": alert.merged_entities,
            "values": alert.values,
            "valueString": alert.value_string,
            "silenceURL": alert.silence_url,
            "dashboardURL": alert.dashboard_url,
            "panelURL": alert.panel_url,
            "image_attached": image_attached,
        })
    }
}

pub fn status_text(status: AlertStatus) -> &'static str {
    match status {
        AlertStatus::Firing => "告警",
        AlertStatus::Resolved => "恢复",
    }
}

fn instant_string(instant: &DateTime<Utc>) -> String {
    if *instant == open_sentinel() {
        String::new()
    } else {
        instant.to_rfc3339()
    }
}

/// Format an instant in the presentation zone; the open sentinel renders as
/// the empty string.
pub fn to_cst(instant: &DateTime<Utc>) -> String {
    if *instant == open_sentinel() {
        return String::new();
    }
    instant
        .with_timezone(&cst())
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

static ISO_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?").unwrap()
});

/// Rewrite ISO timestamps inside a producer description to the CST form.
/// Substrings that fail to parse are left byte-exact.
pub fn rewrite_description_times(description: &str) -> String {
    ISO_TIME
        .replace_all(description, |caps: &Captures| {
            let raw = &caps[0];
            match parse_flexible(raw) {
                Some(instant) => to_cst(&instant),
                None => raw.to_owned(),
            }
        })
        .into_owned()
}

/// RFC-3339, RFC-3339 with a colonless offset, or a bare local time taken as
/// UTC.
fn parse_flexible(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }

    // +0800 -> +08:00
    if raw.len() > 5 {
        let (head, tail) = raw.split_at(raw.len() - 5);
        if (tail.starts_with('+') || tail.starts_with('-'))
            && tail[1..].chars().all(|c| c.is_ascii_digit())
        {
            let fixed = format!("{head}{}:{}", &tail[..3], &tail[3..]);
            if let Ok(parsed) = DateTime::parse_from_rfc3339(&fixed) {
                return Some(parsed.with_timezone(&Utc));
            }
        }
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

static URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s\)]+").unwrap());

/// Wrap bare URLs as chat-client links, trimming trailing punctuation that
/// the surrounding prose dragged into the match.
fn url_to_link(text: String) -> String {
    URL.replace_all(&text, |caps: &Captures| {
        let url = caps[0].trim_end_matches(&['.', ',', ';', ':', '!', '?', ')'][..]);
        format!("<a href=\"{url}\">{url}</a>")
    })
    .into_owned()
}

fn is_json_template(name: &str) -> bool {
    name.ends_with(".json") || name.ends_with(".json.j2")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn alert() -> Alert {
        crate::alert::normalize(&json!({
            "version": "4",
            "groupKey": "k",
            "receiver": "prod_webhook",
            "alerts": [{
                "status": "firing",
                "labels": {"alertname": "HighCPU", "severity": "critical"},
                "annotations": {
                    "summary": "cpu is high",
                    "description": "went bad at 2024-01-15T10:30:00Z, see http://wiki.local/cpu."
                },
                "startsAt": "2024-01-15T10:30:00Z",
                "generatorURL": "http://p:9090/graph?g0.expr=cpu"
            }]
        }))
        .unwrap()
        .remove(0)
    }

    #[test]
    fn cst_conversion_shifts_eight_hours() {
        let utc = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        assert_eq!(to_cst(&utc), "2024-01-15 18:30:00");
        assert_eq!(to_cst(&open_sentinel()), "");
    }

    #[test]
    fn status_text_is_chinese() {
        assert_eq!(status_text(AlertStatus::Firing), "告警");
        assert_eq!(status_text(AlertStatus::Resolved), "恢复");
    }

    #[test]
    fn renders_alert_context() {
        let renderer = Renderer::with_templates(&[(
            "chat.html.j2",
            "{{ title }} {{ status_text }} {{ labels.severity }} {{ startsAt_cst }}",
        )]);
        let out = renderer.render("chat.html.j2", &alert(), false).unwrap();
        assert_eq!(out, "[ALERT] HighCPU 告警 critical 2024-01-15 18:30:00");
    }

    #[test]
    fn unknown_keys_render_empty() {
        let renderer = Renderer::with_templates(&[(
            "t.html.j2",
            "[{{ labels.not_a_label }}|{{ not_a_key }}|{{ labels.severity | default('-') }}]",
        )]);
        let out = renderer.render("t.html.j2", &alert(), false).unwrap();
        assert_eq!(out, "[||critical]");
    }

    #[test]
    fn default_filter_fills_missing_values() {
        let renderer = Renderer::with_templates(&[(
            "t.html.j2",
            "{{ labels.owner | default('-') }}",
        )]);
        assert_eq!(renderer.render("t.html.j2", &alert(), false).unwrap(), "-");
    }

    #[test]
    fn merged_entities_iterate_in_order() {
        let renderer = Renderer::with_templates(&[(
            "t.html.j2",
            "{% for e in merged_entities %}{{ e }};{% endfor %}",
        )]);
        let mut alert = alert();
        alert.merged_entities = vec!["a".into(), "b".into(), "c".into()];
        assert_eq!(renderer.render("t.html.j2", &alert, false).unwrap(), "a;b;c;");
    }

    #[test]
    fn url_filter_wraps_links_and_trims_punctuation() {
        let out = url_to_link("see http://wiki.local/cpu. now".to_owned());
        assert_eq!(
            out,
            "see <a href=\"http://wiki.local/cpu\">http://wiki.local/cpu</a> now"
        );
    }

    #[test]
    fn json_templates_get_cst_descriptions() {
        let renderer = Renderer::with_templates(&[
            ("hook.json.j2", "{{ annotations.description }}"),
            ("chat.html.j2", "{{ annotations.description }}"),
        ]);
        let alert = alert();

        let json_out = renderer.render("hook.json.j2", &alert, false).unwrap();
        assert!(json_out.contains("2024-01-15 18:30:00"), "{json_out}");

        // non-json templates keep the producer text untouched
        let html_out = renderer.render("chat.html.j2", &alert, false).unwrap();
        assert!(html_out.contains("2024-01-15T10:30:00Z"), "{html_out}");
    }

    #[test]
    fn description_rewrite_handles_offsets_and_garbage() {
        assert_eq!(
            rewrite_description_times("at 2026-02-10T01:47:51.122980105+08:00 it broke"),
            "at 2026-02-10 01:47:51 it broke"
        );
        assert_eq!(
            rewrite_description_times("at 2024-01-15T10:30:00+0800 it broke"),
            "at 2024-01-15 10:30:00 it broke"
        );
        // bare timestamps are taken as UTC
        assert_eq!(
            rewrite_description_times("at 2024-01-15T10:30:00 it broke"),
            "at 2024-01-15 18:30:00 it broke"
        );
        assert_eq!(rewrite_description_times("no times here"), "no times here");
    }

    #[test]
    fn missing_template_is_an_error() {
        let renderer = Renderer::with_templates(&[]);
        assert!(renderer.render("nope.html.j2", &alert(), false).is_err());
    }

    #[test]
    fn image_flag_reaches_templates() {
        let renderer = Renderer::with_templates(&[(
            "t.html.j2",
            "{% if image_attached %}photo{% else %}text{% endif %}",
        )]);
        assert_eq!(renderer.render("t.html.j2", &alert(), true).unwrap(), "photo");
        assert_eq!(renderer.render("t.html.j2", &alert(), false).unwrap(), "text");
    }
}
