//! Per-channel delivery policy applied to the routed channel set.

use std::collections::BTreeMap;

use crate::alert::AlertStatus;
use crate::settings::{ChannelKind, ChannelSettings};

/// Splits the routed channel ids into those that receive the alert and those
/// skipped by policy, with the reason the response reports back.
pub fn split_deliverable<'a>(
    channels: &'a BTreeMap<String, ChannelSettings>,
    targets: &[String],
    status: AlertStatus,
) -> (
    Vec<(&'a str, &'a ChannelSettings)>,
    Vec<(String, &'static str)>,
) {
    let mut deliverable = Vec::new();
    let mut skipped = Vec::new();

    for target in targets {
        let Some((name, channel)) = channels.get_key_value(target) else {
            skipped.push((target.clone(), "unknown channel"));
            continue;
        };
        if !channel.enabled {
            skipped.push((target.clone(), "channel disabled"));
            continue;
        }
        if status == AlertStatus::Resolved && !channel.send_resolved {
            skipped.push((target.clone(), "send_resolved=false"));
            continue;
        }
        deliverable.push((name.as_str(), channel));
    }

    (deliverable, skipped)
}

/// Whether any deliverable channel can actually show an image. Text fallback
/// is always allowed, so this never drops a channel, it only decides whether
/// the image pipeline runs at all.
pub fn wants_image(deliverable: &[(&str, &ChannelSettings)]) -> bool {
    deliverable
        .iter()
        .any(|(_, channel)| channel.kind == ChannelKind::Chat && channel.image_enabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channels() -> BTreeMap<String, ChannelSettings> {
        serde_json::from_value(json!({
            "chat_default": {
                "type": "chat",
                "bot_token": "t",
                "chat_id": "-1",
                "template": "chat.html.j2",
                "image_enabled": true
            },
            "chat_muted": {
                "type": "chat",
                "bot_token": "t",
                "chat_id": "-2",
                "template": "chat.html.j2",
                "enabled": false
            },
            "ops_hook": {
                "type": "webhook",
                "url": "https://ops/hook",
                "template": "hook.json.j2",
                "send_resolved": false
            }
        }))
        .unwrap()
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn disabled_channels_are_skipped() {
        let channels = channels();
        let (deliverable, skipped) = split_deliverable(
            &channels,
            &ids(&["chat_default", "chat_muted"]),
            AlertStatus::Firing,
        );
        assert_eq!(deliverable.len(), 1);
        assert_eq!(deliverable[0].0, "chat_default");
        assert_eq!(skipped, vec![("chat_muted".to_string(), "channel disabled")]);
    }

    #[test]
    fn resolved_suppression_honors_send_resolved() {
        let channels = channels();
        let (deliverable, skipped) = split_deliverable(
            &channels,
            &ids(&["chat_default", "ops_hook"]),
            AlertStatus::Resolved,
        );
        assert_eq!(deliverable.len(), 1);
        assert_eq!(skipped, vec![("ops_hook".to_string(), "send_resolved=false")]);

        // firing alerts still reach the webhook
        let (deliverable, skipped) =
            split_deliverable(&channels, &ids(&["ops_hook"]), AlertStatus::Firing);
        assert_eq!(deliverable.len(), 1);
        assert!(skipped.is_empty());
    }

    #[test]
    fn unknown_channels_are_reported() {
        let channels = channels();
        let (deliverable, skipped) =
            split_deliverable(&channels, &ids(&["ghost"]), AlertStatus::Firing);
        assert!(deliverable.is_empty());
        assert_eq!(skipped, vec![("ghost".to_string(), "unknown channel")]);
    }

    #[test]
    fn image_demand_comes_from_chat_channels_only() {
        let channels = channels();
        let (deliverable, _) = split_deliverable(
            &channels,
            &ids(&["chat_default", "ops_hook"]),
            AlertStatus::Firing,
        );
        assert!(wants_image(&deliverable));

        let (hook_only, _) = split_deliverable(&channels, &ids(&["ops_hook"]), AlertStatus::Firing);
        assert!(!wants_image(&hook_only));
    }
}
