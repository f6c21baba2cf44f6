use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use clap::{App, Arg};
use config::Config;
use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::{
    dedup::{DedupCache, DedupSettings},
    log::LogSettings,
    plotter::ImageSettings,
    routing::{Rule, RuleSet},
    telemetry_endpoint::TelemetryEndpointSettings,
    webhook_receiver::ServerSettings,
};

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    #[serde(rename = "logging", default)]
    pub log: LogSettings,
    pub channels: BTreeMap<String, ChannelSettings>,
    pub routing: Vec<Rule>,
    #[serde(default)]
    pub prometheus_image: ImageSettings,
    #[serde(default)]
    pub grafana_image: ImageSettings,
    #[serde(default)]
    pub jenkins_dedup: DedupSettings,
    /// global outbound proxy url (http, https or socks5)
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_true")]
    pub proxy_enabled: bool,
    #[serde(default = "default_templates_dir")]
    pub templates_dir: String,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub telemetry_endpoint: Option<TelemetryEndpointSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_title_prefix")]
    pub title_prefix: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            title_prefix: default_title_prefix(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Chat,
    Webhook,
}

/// One delivery endpoint. Loaded at startup and read-only afterwards;
/// configuration reload is a process restart.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelSettings {
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    /// chat API base url; defaults to the telegram bot endpoint for `bot_token`
    #[serde(default)]
    pub api_base: Option<String>,
    /// receiver url for webhook channels
    #[serde(default)]
    pub url: Option<String>,
    pub template: String,
    #[serde(default)]
    pub image_enabled: bool,
    #[serde(default = "default_true")]
    pub send_resolved: bool,
    /// per-channel proxy override
    #[serde(default)]
    pub proxy: Option<String>,
    /// per-channel proxy switch; falls back to the global `proxy_enabled`
    #[serde(default)]
    pub proxy_enabled: Option<bool>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl ChannelSettings {
    /// The proxy this channel's requests go through, if any: the channel
    /// override when set, else the global proxy, both gated by the relevant
    /// `proxy_enabled` switch.
    pub fn effective_proxy<'a>(
        &'a self,
        global_proxy: Option<&'a str>,
        global_enabled: bool,
    ) -> Option<&'a str> {
        if !self.proxy_enabled.unwrap_or(global_enabled) {
            return None;
        }
        self.proxy.as_deref().or(global_proxy)
    }
}

fn default_true() -> bool {
    true
}

fn default_templates_dir() -> String {
    "templates".to_owned()
}

fn default_title_prefix() -> String {
    "[ALERT]".to_owned()
}

impl Settings {
    pub fn global() -> &'static Self {
        SETTINGS.get_or_init(|| {
            match Self::load().context("failed to load config and command line arguments") {
                Ok(settings) => settings,
                Err(err) => {
                    // tracing wasn't setup yet
                    panic!("{:#?}", err);
                }
            }
        })
    }

    fn load() -> Result<Self> {
        let opts = App::new(clap::crate_name!())
            .version(clap::crate_version!())
            .about(clap::crate_description!())
            .author(clap::crate_authors!())
            .args(&[
                Arg::with_name("config")
                    .help("path of config file")
                    .takes_value(true)
                    .short("c")
                    .long("config")
                    .default_value("./config.yaml"),
                Arg::with_name("level")
                    .help("log level")
                    .possible_values(&["Error", "Warn", "Info", "Debug", "Trace"])
                    .case_insensitive(true)
                    .takes_value(true)
                    .long("log"),
            ])
            .get_matches();

        // explicit -c wins, then the CONFIG_FILE environment variable,
        // then ./config.yaml
        let config_path = if opts.occurrences_of("config") > 0 {
            opts.value_of("config").unwrap().to_owned()
        } else {
            std::env::var("CONFIG_FILE")
                .unwrap_or_else(|_| opts.value_of("config").unwrap().to_owned())
        };

        let mut conf = Config::new();
        conf.merge(config::File::with_name(&config_path))
            .context("can't load config")?;

        let mut settings: Settings = conf.try_into().context("can't load config")?;

        if let Some(level) = opts.value_of("level") {
            settings.log.level = level.to_string();
        }

        settings.validate()?;

        Ok(settings)
    }

    /// Everything that must fail at startup instead of on a request: rule
    /// patterns compile, rules point at declared channels, channels carry
    /// the credentials their type needs.
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            bail!("no channels configured");
        }
        if self.routing.is_empty() {
            bail!("routing table is empty, alerts would never be delivered");
        }

        RuleSet::compile(&self.routing)?;
        DedupCache::new(&self.jenkins_dedup)?;

        for (position, rule) in self.routing.iter().enumerate() {
            for channel in &rule.send_to {
                if !self.channels.contains_key(channel) {
                    bail!(
                        "routing rule #{} sends to undeclared channel {channel:?}",
                        position + 1
                    );
                }
            }
        }

        for (name, channel) in &self.channels {
            if channel.template.is_empty() {
                bail!("channel {name:?} has no template");
            }
            match channel.kind {
                ChannelKind::Chat => {
                    if channel.chat_id.is_none() {
                        bail!("chat channel {name:?} has no chat_id");
                    }
                    if channel.bot_token.is_none() && channel.api_base.is_none() {
                        bail!("chat channel {name:?} needs bot_token or api_base");
                    }
                }
                ChannelKind::Webhook => {
                    if channel.url.is_none() {
                        bail!("webhook channel {name:?} has no url");
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(value: serde_json::Value) -> Settings {
        serde_json::from_value(value).unwrap()
    }

    fn base_config() -> serde_json::Value {
        json!({
            "server": {"bind_address": "0.0.0.0", "port": 8080},
            "channels": {
                "chat_default": {
                    "type": "chat",
                    "bot_token": "123:abc",
                    "chat_id": "-100",
                    "template": "chat.html.j2",
                    "image_enabled": true
                },
                "ops_hook": {
                    "type": "webhook",
                    "url": "https://ops.example.com/hook",
                    "template": "hook.json.j2"
                }
            },
            "routing": [
                {"match": {"_source": "prometheus"}, "send_to": ["chat_default"]},
                {"default": true, "send_to": ["ops_hook"]}
            ]
        })
    }

    #[test]
    fn minimal_config_deserializes_with_defaults() {
        let settings = settings(base_config());
        settings.validate().unwrap();
        assert!(settings.proxy_enabled);
        assert_eq!(settings.templates_dir, "templates");
        assert_eq!(settings.defaults.title_prefix, "[ALERT]");
        assert!(settings.prometheus_image.enabled);
        assert_eq!(settings.jenkins_dedup.ttl.as_secs(), 900);
        let chat = &settings.channels["chat_default"];
        assert!(chat.enabled);
        assert!(chat.send_resolved);
    }

    #[test]
    fn rule_referencing_unknown_channel_fails() {
        let mut config = base_config();
        config["routing"][0]["send_to"] = json!(["nope"]);
        assert!(settings(config).validate().is_err());
    }

    #[test]
    fn invalid_rule_pattern_fails() {
        let mut config = base_config();
        config["routing"][0]["match"]["alertname"] = json!("(unclosed");
        assert!(settings(config).validate().is_err());
    }

    #[test]
    fn chat_channel_without_credentials_fails() {
        let mut config = base_config();
        config["channels"]["chat_default"]
            .as_object_mut()
            .unwrap()
            .remove("bot_token");
        assert!(settings(config).validate().is_err());
    }

    #[test]
    fn webhook_channel_without_url_fails() {
        let mut config = base_config();
        config["channels"]["ops_hook"]
            .as_object_mut()
            .unwrap()
            .remove("url");
        assert!(settings(config).validate().is_err());
    }

    #[test]
    fn proxy_resolution_prefers_channel_override() {
        let mut config = base_config();
        config["proxy"] = json!("socks5://global:1080");
        config["channels"]["chat_default"]["proxy"] = json!("http://local:3128");
        let settings = settings(config);

        let chat = &settings.channels["chat_default"];
        let hook = &settings.channels["ops_hook"];
        assert_eq!(
            chat.effective_proxy(settings.proxy.as_deref(), settings.proxy_enabled),
            Some("http://local:3128")
        );
        assert_eq!(
            hook.effective_proxy(settings.proxy.as_deref(), settings.proxy_enabled),
            Some("socks5://global:1080")
        );
    }

    #[test]
    fn proxy_switch_disables_both_levels() {
        let mut config = base_config();
        config["proxy"] = json!("socks5://global:1080");
        config["proxy_enabled"] = json!(false);
        config["channels"]["chat_default"]["proxy"] = json!("http://local:3128");
        config["channels"]["ops_hook"]["proxy_enabled"] = json!(true);
        let settings = settings(config);

        // channel inherits the global off switch
        assert_eq!(
            settings.channels["chat_default"]
                .effective_proxy(settings.proxy.as_deref(), settings.proxy_enabled),
            None
        );
        // explicit per-channel switch overrides it
        assert_eq!(
            settings.channels["ops_hook"]
                .effective_proxy(settings.proxy.as_deref(), settings.proxy_enabled),
            Some("socks5://global:1080")
        );
    }
}
