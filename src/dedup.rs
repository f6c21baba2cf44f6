//! Time-windowed suppression of build-system alerts.
//!
//! CI pipelines re-fire the same failure on every poll; within one window
//! only the first firing occurrence is forwarded. The cache is process-local
//! and lost on restart, which matches the gateway's no-persistence contract.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::alert::{Alert, ENTITY_LABELS};

/// `jenkins_dedup` configuration block.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct DedupSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(rename = "ttl_seconds", default = "default_ttl")]
    pub ttl: Duration,
    #[serde(default = "default_true")]
    pub clear_on_resolved: bool,
    /// substring looked for in the `_receiver` label
    #[serde(default = "default_receiver_contains")]
    pub receiver_contains: String,
    /// pattern matched against `alertname`
    #[serde(default = "default_alertname_pattern")]
    pub alertname_pattern: String,
}

fn default_true() -> bool {
    true
}

fn default_ttl() -> Duration {
    Duration::from_secs(900)
}

fn default_receiver_contains() -> String {
    "jenkins".to_owned()
}

fn default_alertname_pattern() -> String {
    ".*[Jj]enkins.*".to_owned()
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: default_ttl(),
            clear_on_resolved: true,
            receiver_contains: default_receiver_contains(),
            alertname_pattern: default_alertname_pattern(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Suppressed,
}

/// The dedup cache. All map access happens under one lock with pure map
/// operations only, so concurrent firing events with the same fingerprint
/// admit exactly one.
pub struct DedupCache {
    enabled: bool,
    ttl: Duration,
    clear_on_resolved: bool,
    receiver_contains: String,
    alertname_pattern: Regex,
    entries: Mutex<HashMap<String, Instant>>,
}

impl DedupCache {
    pub fn new(settings: &DedupSettings) -> Result<Self> {
        let alertname_pattern = Regex::new(&settings.alertname_pattern)
            .context("invalid jenkins_dedup.alertname_pattern")?;

        Ok(Self {
            enabled: settings.enabled,
            ttl: settings.ttl.max(Duration::from_secs(1)),
            clear_on_resolved: settings.clear_on_resolved,
            receiver_contains: settings.receiver_contains.clone(),
            alertname_pattern,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Whether the alert comes from the build system at all.
    pub fn applies(&self, alert: &Alert) -> bool {
        if !self.enabled {
            return false;
        }
        let by_receiver = alert
            .labels
            .get("_receiver")
            .map_or(false, |r| r.contains(&self.receiver_contains));
        by_receiver || self.alertname_pattern.is_match(alert.alertname())
    }

    /// Admission decision for one alert. Resolved alerts always pass and
    /// optionally clear their window so the next failure fires again.
    pub fn check(&self, alert: &Alert) -> Admission {
        self.check_at(alert, Instant::now())
    }

    fn check_at(&self, alert: &Alert, now: Instant) -> Admission {
        if !self.applies(alert) {
            return Admission::Admitted;
        }

        let key = self.fingerprint(alert);
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // lazy purge keeps the map from growing without bound
        entries.retain(|_, first_seen| now.duration_since(*first_seen) < self.ttl);

        if alert.is_resolved() {
            if self.clear_on_resolved {
                entries.remove(&key);
                debug!(key = %key, "dedup window cleared by resolved alert");
            }
            return Admission::Admitted;
        }

        if let Some(first_seen) = entries.get(&key) {
            if now.duration_since(*first_seen) < self.ttl {
                return Admission::Suppressed;
            }
        }

        entries.insert(key, now);
        Admission::Admitted
    }

    /// Drop one key, regardless of its window.
    pub fn forget(&self, key: &str) {
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.remove(key);
    }

    /// Deterministic suppression key. The producer fingerprint wins when
    /// present; otherwise a SHA-1 over the identifying labels in a fixed
    /// order, so serialization order of the label map cannot change the key.
    pub fn fingerprint(&self, alert: &Alert) -> String {
        if let Some(fingerprint) = &alert.fingerprint {
            return fingerprint.clone();
        }

        let entity = ENTITY_LABELS
            .iter()
            .find_map(|key| alert.labels.get(*key))
            .map(String::as_str)
            .unwrap_or("");
        let job = alert.labels.get("job").map(String::as_str).unwrap_or("");
        let instance = alert
            .labels
            .get("instance")
            .map(String::as_str)
            .unwrap_or("");

        let mut hasher = Sha1::new();
        hasher.update(format!("{}|{entity}|{job}|{instance}", alert.alertname()).as_bytes());
        hex::encode(hasher.finalize())
    }
}
