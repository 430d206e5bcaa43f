use crate::meta::{GRAPH_API_BASE, timestamp_secs};
use crate::traits::ChannelAdapter;
use crate::types::{
    Channel, ChannelCredentials, InboundMessage, InboundMessageKind, ProviderMessageId,
    split_message,
};
use anyhow::{Result, anyhow};
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;

const WHATSAPP_OBJECT: &str = "whatsapp_business_account";
const WHATSAPP_MAX_CHARS: usize = 4096;

/// WhatsApp Cloud API. The receiving phone-number id routes inbound traffic to
/// a workspace; the same id addresses the send endpoint.
#[derive(Clone)]
pub struct WhatsAppCloudAdapter {
    http: reqwest::Client,
    api_base: String,
}

impl WhatsAppCloudAdapter {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_base: GRAPH_API_BASE.to_string(),
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim().trim_end_matches('/').to_string();
        self
    }

    fn messages_url(&self, phone_number_id: &str) -> Result<Url> {
        Url::parse(&format!("{}/{}/messages", self.api_base, phone_number_id))
            .map_err(|e| anyhow!("invalid whatsapp graph API URL: {e}"))
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WhatsAppCloudAdapter {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    fn normalize(&self, payload: &[u8]) -> Vec<InboundMessage> {
        let parsed: WhatsAppWebhook = match serde_json::from_slice(payload) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed whatsapp webhook payload");
                return Vec::new();
            }
        };
        if !parsed.object.is_empty() && parsed.object != WHATSAPP_OBJECT {
            tracing::warn!(object = %parsed.object, "dropping non-whatsapp webhook payload");
            return Vec::new();
        }
        parsed
            .entry
            .into_iter()
            .flat_map(|entry| entry.changes)
            .filter(|change| change.field.is_empty() || change.field == "messages")
            .flat_map(|change| build_inbound_messages(change.value))
            .collect()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn send(
        &self,
        recipient_id: &str,
        text: &str,
        credentials: &ChannelCredentials,
    ) -> Result<ProviderMessageId> {
        let to = recipient_id.trim();
        if to.is_empty() {
            return Err(anyhow!("recipient_id (wa_id) is required"));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }
        let access_token = credentials.access_token()?;
        let url = self.messages_url(credentials.phone_number_id()?)?;

        let mut first_id: Option<ProviderMessageId> = None;
        for chunk in split_message(text, self.max_message_chars()) {
            let payload = serde_json::json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "text",
                "text": {
                    "preview_url": false,
                    "body": chunk,
                }
            });
            let response = self
                .http
                .post(url.clone())
                .bearer_auth(access_token)
                .json(&payload)
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(anyhow!("whatsapp send failed: status={status} body={body}"));
            }
            let parsed: WhatsAppSendResponse = serde_json::from_str(&body)
                .map_err(|e| anyhow!("whatsapp send response parse failed: {e} body={body}"))?;
            let id = parsed
                .messages
                .into_iter()
                .next()
                .map(|m| m.id)
                .ok_or_else(|| anyhow!("whatsapp send response missing message id"))?;
            if first_id.is_none() {
                first_id = Some(id.into());
            }
        }
        first_id.ok_or_else(|| anyhow!("whatsapp send produced no message id"))
    }

    fn max_message_chars(&self) -> usize {
        WHATSAPP_MAX_CHARS
    }
}

fn build_inbound_messages(value: WhatsAppValue) -> Vec<InboundMessage> {
    let Some(metadata) = value.metadata else {
        return Vec::new();
    };
    let own_number = metadata.display_phone_number.unwrap_or_default();
    let mut out = Vec::new();
    for message in value.messages {
        if message.from.trim().is_empty() || message.id.trim().is_empty() {
            continue;
        }
        if !own_number.is_empty() && digits(&message.from) == digits(&own_number) {
            tracing::debug!(id = %message.id, "dropping whatsapp message sent by business number");
            continue;
        }
        let Some((kind, content)) = extract_message_content(&message) else {
            continue;
        };
        let sender_name = value
            .contacts
            .iter()
            .find(|c| c.wa_id == message.from)
            .or_else(|| value.contacts.first())
            .and_then(|c| c.profile.as_ref())
            .map(|p| p.name.trim().to_string())
            .filter(|n| !n.is_empty());
        let sent_at = timestamp_secs(message.timestamp.trim().parse::<i64>().ok());
        out.push(InboundMessage {
            channel: Channel::Whatsapp,
            kind,
            account_id: Some(metadata.phone_number_id.as_str().into()),
            customer_id: message.from.as_str().into(),
            sender_id: message.from.as_str().into(),
            sender_name,
            from_business: false,
            provider_message_id: message.id.as_str().into(),
            content,
            sent_at,
        });
    }
    out
}

fn digits(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

fn extract_message_content(message: &WhatsAppMessage) -> Option<(InboundMessageKind, String)> {
    if let Some(body) = message.text.as_ref().map(|t| t.body.trim()) {
        if !body.is_empty() {
            return Some((InboundMessageKind::Text, body.to_string()));
        }
    }
    if let Some(text) = message.button.as_ref().map(|b| b.text.trim()) {
        if !text.is_empty() {
            return Some((InboundMessageKind::Text, text.to_string()));
        }
    }
    if let Some(interactive) = &message.interactive {
        let title = interactive
            .button_reply
            .as_ref()
            .or(interactive.list_reply.as_ref())
            .map(|r| r.title.trim())
            .filter(|t| !t.is_empty());
        if let Some(title) = title {
            return Some((InboundMessageKind::Text, title.to_string()));
        }
    }
    let media = [
        ("image", message.image.as_ref()),
        ("video", message.video.as_ref()),
        ("document", message.document.as_ref()),
        ("audio", message.audio.as_ref()),
        ("sticker", message.sticker.as_ref()),
    ];
    let (label, media) = media.into_iter().find_map(|(l, m)| m.map(|m| (l, m)))?;
    let caption = media.caption.as_deref().map(str::trim).unwrap_or_default();
    let content = if caption.is_empty() {
        format!("[{label}]")
    } else {
        format!("[{label}] {caption}")
    };
    Some((InboundMessageKind::Media, content))
}

#[derive(Debug, Deserialize)]
struct WhatsAppWebhook {
    #[serde(default)]
    object: String,
    #[serde(default)]
    entry: Vec<WhatsAppEntry>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppEntry {
    #[serde(default)]
    changes: Vec<WhatsAppChange>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppChange {
    #[serde(default)]
    field: String,
    value: WhatsAppValue,
}

#[derive(Debug, Deserialize)]
struct WhatsAppValue {
    #[serde(default)]
    metadata: Option<WhatsAppMetadata>,
    #[serde(default)]
    contacts: Vec<WhatsAppContact>,
    #[serde(default)]
    messages: Vec<WhatsAppMessage>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppMetadata {
    #[serde(default)]
    display_phone_number: Option<String>,
    phone_number_id: String,
}

#[derive(Debug, Deserialize)]
struct WhatsAppContact {
    #[serde(default)]
    wa_id: String,
    #[serde(default)]
    profile: Option<WhatsAppProfile>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppProfile {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct WhatsAppMessage {
    #[serde(default)]
    from: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    text: Option<WhatsAppText>,
    #[serde(default)]
    button: Option<WhatsAppButton>,
    #[serde(default)]
    interactive: Option<WhatsAppInteractive>,
    #[serde(default)]
    image: Option<WhatsAppMedia>,
    #[serde(default)]
    video: Option<WhatsAppMedia>,
    #[serde(default)]
    document: Option<WhatsAppMedia>,
    #[serde(default)]
    audio: Option<WhatsAppMedia>,
    #[serde(default)]
    sticker: Option<WhatsAppMedia>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppText {
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct WhatsAppButton {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct WhatsAppInteractive {
    #[serde(default)]
    button_reply: Option<WhatsAppReply>,
    #[serde(default)]
    list_reply: Option<WhatsAppReply>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppReply {
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct WhatsAppMedia {
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppSendResponse {
    #[serde(default)]
    messages: Vec<WhatsAppSentMessage>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppSentMessage {
    id: String,
}
