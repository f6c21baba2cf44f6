//! Delivery of rendered messages to chat and webhook endpoints.
//!
//! One pooled HTTP client exists per distinct proxy configuration; the pool
//! is built once from the immutable channel set. The chat sender speaks a
//! telegram-style bot API (`sendPhoto` / `sendMessage`) and performs exactly
//! one fallback attempt when the platform rejects HTML entities or the
//! photo; the webhook sender posts the rendered body as JSON with no
//! retries.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{opts, register_int_counter_vec, IntCounterVec};
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::settings::ChannelSettings;

const PHOTO_TIMEOUT: Duration = Duration::from_secs(15);
const TEXT_TIMEOUT: Duration = Duration::from_secs(10);
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// chat platform hard limits
const MAX_MESSAGE_LEN: usize = 4096;
const MAX_CAPTION_LEN: usize = 1024;
const TRUNCATION_MARKER: &str = "…";

static HTTP_SENDS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("outbound_requests", "total number of delivery requests")
            .namespace("foghorn")
            .subsystem("senders"),
        &["channel", "method"]
    )
    .unwrap()
});

#[derive(Debug, Error)]
pub enum SendError {
    #[error("chat api returned {status}: {description}")]
    Chat { status: u16, description: String },
    #[error("webhook returned {status}")]
    Webhook { status: u16 },
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("channel is missing its {0}")]
    Misconfigured(&'static str),
}

impl SendError {
    /// A dead or unauthorized receiver url is a configuration problem, not a
    /// code path worth an error-level log.
    pub fn is_config_problem(&self) -> bool {
        matches!(
            self,
            SendError::Webhook {
                status: 401 | 404 | 410
            }
        )
    }
}

/// Pooled clients keyed by effective proxy. Channels sharing a proxy share a
/// connection pool.
pub struct ClientPool {
    assignments: HashMap<String, String>,
    clients: HashMap<String, Client>,
}

impl ClientPool {
    pub fn build(
        channels: &BTreeMap<String, ChannelSettings>,
        global_proxy: Option<&str>,
        global_proxy_enabled: bool,
    ) -> anyhow::Result<Self> {
        let mut clients = HashMap::new();
        clients.insert(String::new(), build_client(None)?);

        let mut assignments = HashMap::new();
        for (name, channel) in channels {
            let key = channel
                .effective_proxy(global_proxy, global_proxy_enabled)
                .unwrap_or("")
                .to_owned();
            if !clients.contains_key(&key) {
                clients.insert(key.clone(), build_client(Some(&key))?);
            }
            assignments.insert(name.clone(), key);
        }

        Ok(Self {
            assignments,
            clients,
        })
    }

    pub fn for_channel(&self, name: &str) -> &Client {
        self.assignments
            .get(name)
            .and_then(|key| self.clients.get(key))
            .unwrap_or_else(|| &self.clients[""])
    }

    #[cfg(test)]
    fn client_count(&self) -> usize {
        self.clients.len()
    }
}

fn build_client(proxy: Option<&str>) -> anyhow::Result<Client> {
    let mut builder = Client::builder().pool_max_idle_per_host(20);
    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    Ok(builder.build()?)
}

/// What a chat 400 body is complaining about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BadRequest {
    ParseEntities,
    PhotoInvalid,
    Other,
}

fn classify_bad_request(description: &str) -> BadRequest {
    if description.contains("can't parse entities") {
        return BadRequest::ParseEntities;
    }
    const PHOTO_MARKERS: &[&str] = &[
        "PHOTO_INVALID",
        "IMAGE_PROCESS_FAILED",
        "PHOTO_CROP_SIZE_SMALL",
        "wrong file identifier",
        "wrong type of the web page content",
    ];
    if PHOTO_MARKERS.iter().any(|m| description.contains(m)) {
        return BadRequest::PhotoInvalid;
    }
    BadRequest::Other
}

/// Send a rendered message to a chat channel, with the photo when one was
/// produced. Returns the fallback note (`html-fallback` / `photo-fallback`)
/// when the single retry was taken.
pub async fn send_chat(
    client: &Client,
    name: &str,
    channel: &ChannelSettings,
    text: &str,
    image: Option<&[u8]>,
) -> Result<Option<&'static str>, SendError> {
    let base = chat_api_base(channel)?;
    let chat_id = channel
        .chat_id
        .as_deref()
        .ok_or(SendError::Misconfigured("chat_id"))?;

    let message = truncate_with_marker(text, MAX_MESSAGE_LEN);
    let caption = truncate_with_marker(text, MAX_CAPTION_LEN);

    if let Some(image) = image {
        HTTP_SENDS.with_label_values(&[name, "sendPhoto"]).inc();
        let response = post_photo(client, &base, chat_id, &caption, image).await?;
        if response.status().is_success() {
            return Ok(None);
        }

        let status = response.status();
        let description = describe(response).await;
        if status == StatusCode::BAD_REQUEST {
            match classify_bad_request(&description) {
                BadRequest::ParseEntities => {
                    warn!(
                        channel = name,
                        "chat api rejected message entities, retrying as plain text"
                    );
                    HTTP_SENDS.with_label_values(&[name, "sendMessage"]).inc();
                    let retry =
                        post_message(client, &base, chat_id, &html_to_plain(&caption), None)
                            .await?;
                    return settle(retry, "html-fallback").await;
                }
                BadRequest::PhotoInvalid => {
                    warn!(
                        channel = name,
                        description = description.as_str(),
                        "chat api rejected the photo, downgrading to text"
                    );
                    HTTP_SENDS.with_label_values(&[name, "sendMessage"]).inc();
                    let retry =
                        post_message(client, &base, chat_id, &message, Some("HTML")).await?;
                    return settle(retry, "photo-fallback").await;
                }
                BadRequest::Other => {}
            }
        }
        return Err(SendError::Chat {
            status: status.as_u16(),
            description,
        });
    }

    HTTP_SENDS.with_label_values(&[name, "sendMessage"]).inc();
    let response = post_message(client, &base, chat_id, &message, Some("HTML")).await?;
    if response.status().is_success() {
        return Ok(None);
    }

    let status = response.status();
    let description = describe(response).await;
    if status == StatusCode::BAD_REQUEST
        && classify_bad_request(&description) == BadRequest::ParseEntities
    {
        warn!(
            channel = name,
            "chat api rejected message entities, retrying as plain text"
        );
        HTTP_SENDS.with_label_values(&[name, "sendMessage"]).inc();
        let retry = post_message(client, &base, chat_id, &html_to_plain(&message), None).await?;
        return settle(retry, "html-fallback").await;
    }

    Err(SendError::Chat {
        status: status.as_u16(),
        description,
    })
}

/// A second rejection after the single fallback is terminal.
async fn settle(
    response: Response,
    note: &'static str,
) -> Result<Option<&'static str>, SendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(Some(note));
    }
    Err(SendError::Chat {
        status: status.as_u16(),
        description: describe(response).await,
    })
}

async fn post_message(
    client: &Client,
    base: &str,
    chat_id: &str,
    text: &str,
    parse_mode: Option<&str>,
) -> Result<Response, SendError> {
    let mut payload = json!({
        "chat_id": chat_id,
        "text": text,
        "disable_web_page_preview": true,
    });
    if let Some(mode) = parse_mode {
        payload["parse_mode"] = json!(mode);
    }
    debug!(payload = %payload, "posting chat message");

    Ok(client
        .post(format!("{base}/sendMessage"))
        .json(&payload)
        .timeout(TEXT_TIMEOUT)
        .send()
        .await?)
}

async fn post_photo(
    client: &Client,
    base: &str,
    chat_id: &str,
    caption: &str,
    image: &[u8],
) -> Result<Response, SendError> {
    let photo = Part::bytes(image.to_vec())
        .file_name("alert.png")
        .mime_str("image/png")?;
    let form = Form::new()
        .text("chat_id", chat_id.to_owned())
        .text("caption", caption.to_owned())
        .text("parse_mode", "HTML")
        .part("photo", photo);

    Ok(client
        .post(format!("{base}/sendPhoto"))
        .multipart(form)
        .timeout(PHOTO_TIMEOUT)
        .send()
        .await?)
}

/// POST the rendered body to the receiver url. The template is trusted to
/// emit JSON; a body that fails to parse still goes out as-is so a broken
/// template shows up at the receiver rather than vanishing here.
pub async fn send_webhook(
    client: &Client,
    name: &str,
    channel: &ChannelSettings,
    body: &str,
) -> Result<(), SendError> {
    let url = channel
        .url
        .as_deref()
        .ok_or(SendError::Misconfigured("url"))?;

    if serde_json::from_str::<Value>(body).is_err() {
        debug!(channel = name, "webhook body is not valid json, sending as-is");
    }

    HTTP_SENDS.with_label_values(&[name, "webhook"]).inc();
    let response = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .body(body.to_owned())
        .timeout(webhook_timeout(channel))
        .send()
        .await?;

    let status = response.status();
    if status.is_success() {
        info!(channel = name, status = status.as_u16(), "webhook delivered");
        return Ok(());
    }
    Err(SendError::Webhook {
        status: status.as_u16(),
    })
}

fn webhook_timeout(channel: &ChannelSettings) -> Duration {
    channel
        .timeout_seconds
        .map(Duration::from_secs)
        .unwrap_or(WEBHOOK_TIMEOUT)
}

/// The chat API base: an explicit `api_base`, else the telegram bot endpoint
/// for the channel's token.
fn chat_api_base(channel: &ChannelSettings) -> Result<String, SendError> {
    if let Some(base) = &channel.api_base {
        return Ok(base.trim_end_matches('/').to_owned());
    }
    let token = channel
        .bot_token
        .as_deref()
        .ok_or(SendError::Misconfigured("bot_token"))?;
    Ok(format!("https://api.telegram.org/bot{token}"))
}

/// The chat platform's `description` field, or the raw body when the error
/// response is not json.
async fn describe(response: Response) -> String {
    let body = response.text().await.unwrap_or_default();
    if let Ok(parsed) = serde_json::from_str::<Value>(&body) {
        if let Some(description) = parsed.get("description").and_then(Value::as_str) {
            return description.to_owned();
        }
    }
    let mut body = body;
    body.truncate(500);
    body
}

/// Plain-text downgrade keeps line breaks the HTML expressed as `<br>`.
fn html_to_plain(text: &str) -> String {
    text.replace("<br />", "\n")
        .replace("<br/>", "\n")
        .replace("<br>", "\n")
}

/// Byte-bounded truncation on a char boundary with a trailing marker.
pub fn truncate_with_marker(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_owned();
    }
    let budget = max_bytes.saturating_sub(TRUNCATION_MARKER.len());
    let mut cut = budget;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &text[..cut])
}
