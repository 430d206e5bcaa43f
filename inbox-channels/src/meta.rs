//! Shared Meta platform plumbing: Graph API client, Messenger-platform webhook
//! parsing (Facebook Pages and Instagram use the same `entry[].messaging[]`
//! shape), subscription handshake, and payload signatures.

use crate::types::{
    Channel, CustomerProfile, ExternalId, InboundMessage, InboundMessageKind, ProviderMessageId,
    split_message,
};
use anyhow::{Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;

pub const GRAPH_API_BASE: &str = "https://graph.facebook.com/v20.0";
const GRAPH_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const HISTORY_MESSAGES_PER_THREAD: u32 = 25;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub(crate) struct GraphApi {
    http: reqwest::Client,
    api_base: String,
}

impl GraphApi {
    pub(crate) fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(GRAPH_HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api_base: GRAPH_API_BASE.to_string(),
        })
    }

    pub(crate) fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim().trim_end_matches('/').to_string();
        self
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    /// Send API for Pages and Instagram messaging. Returns the first message id.
    pub(crate) async fn send_messenger_text(
        &self,
        recipient_id: &str,
        text: &str,
        access_token: &str,
        max_chars: usize,
    ) -> Result<ProviderMessageId> {
        let recipient_id = recipient_id.trim();
        if recipient_id.is_empty() {
            return Err(anyhow!("recipient_id is required"));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }

        let mut first_id: Option<ProviderMessageId> = None;
        for chunk in split_message(text, max_chars) {
            let payload = serde_json::json!({
                "recipient": { "id": recipient_id },
                "messaging_type": "RESPONSE",
                "message": { "text": chunk },
            });
            let response = self
                .http
                .post(self.url("me/messages"))
                .query(&[("access_token", access_token)])
                .json(&payload)
                .send()
                .await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(anyhow!("graph send failed: status={status} body={body}"));
            }
            let parsed: SendApiResponse = serde_json::from_str(&body)
                .map_err(|e| anyhow!("graph send response parse failed: {e} body={body}"))?;
            if first_id.is_none() {
                first_id = Some(parsed.message_id.into());
            }
        }
        first_id.ok_or_else(|| anyhow!("graph send produced no message id"))
    }

    pub(crate) async fn fetch_profile(
        &self,
        user_id: &str,
        fields: &str,
        access_token: &str,
    ) -> Result<Option<CustomerProfile>> {
        let response = self
            .http
            .get(self.url(user_id))
            .query(&[("fields", fields), ("access_token", access_token)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("graph profile lookup failed: status={status} body={body}"));
        }
        let profile: GraphProfile = response.json().await?;
        Ok(profile.display_name().map(|display_name| CustomerProfile { display_name }))
    }

    pub(crate) async fn fetch_conversations(
        &self,
        channel: Channel,
        account_id: &str,
        access_token: &str,
    ) -> Result<Vec<InboundMessage>> {
        let fields = format!(
            "participants,messages.limit({HISTORY_MESSAGES_PER_THREAD}){{id,message,from,created_time}}"
        );
        let mut query = vec![("fields", fields.as_str()), ("access_token", access_token)];
        if channel == Channel::Instagram {
            query.push(("platform", "instagram"));
        }
        let response = self
            .http
            .get(self.url(&format!("{account_id}/conversations")))
            .query(&query)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("graph conversations failed: status={status} body={body}"));
        }
        let parsed: GraphConversations = serde_json::from_str(&body)
            .map_err(|e| anyhow!("graph conversations parse failed: {e}"))?;
        Ok(history_to_inbound(channel, account_id, parsed))
    }
}

#[derive(Debug, Deserialize)]
struct SendApiResponse {
    message_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct GraphProfile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl GraphProfile {
    fn display_name(&self) -> Option<String> {
        let full = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        [self.name.clone(), Some(full), self.username.clone()]
            .into_iter()
            .flatten()
            .map(|s| s.trim().to_string())
            .find(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct GraphConversations {
    #[serde(default)]
    data: Vec<GraphConversation>,
}

#[derive(Debug, Deserialize)]
struct GraphConversation {
    #[serde(default)]
    participants: Option<GraphList<GraphParticipant>>,
    #[serde(default)]
    messages: Option<GraphList<GraphHistoryMessage>>,
}

#[derive(Debug, Deserialize)]
struct GraphList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct GraphParticipant {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphHistoryMessage {
    id: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    from: Option<GraphParticipant>,
    #[serde(default)]
    created_time: Option<String>,
}

fn history_to_inbound(
    channel: Channel,
    account_id: &str,
    parsed: GraphConversations,
) -> Vec<InboundMessage> {
    let mut out = Vec::new();
    for conversation in parsed.data {
        let participants = conversation.participants.map(|p| p.data).unwrap_or_default();
        let Some(customer) = participants.iter().find(|p| p.id != account_id) else {
            continue;
        };
        let customer_name = customer
            .name
            .clone()
            .or_else(|| customer.username.clone())
            .filter(|n| !n.trim().is_empty());
        for message in conversation.messages.map(|m| m.data).unwrap_or_default() {
            let content = message.message.trim();
            if content.is_empty() {
                continue;
            }
            let sender_id = message
                .from
                .as_ref()
                .map(|f| f.id.clone())
                .unwrap_or_else(|| customer.id.clone());
            let from_business = sender_id == account_id;
            out.push(InboundMessage {
                channel,
                kind: InboundMessageKind::Text,
                account_id: Some(account_id.into()),
                customer_id: customer.id.as_str().into(),
                sender_id: sender_id.into(),
                sender_name: if from_business {
                    None
                } else {
                    customer_name.clone()
                },
                from_business,
                provider_message_id: message.id.into(),
                content: content.to_string(),
                sent_at: message
                    .created_time
                    .as_deref()
                    .and_then(parse_graph_time)
                    .unwrap_or_else(Utc::now),
            });
        }
    }
    out
}

/// Graph timestamps look like `2024-05-01T10:00:00+0000`.
fn parse_graph_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn timestamp_millis(ms: Option<i64>) -> DateTime<Utc> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

pub(crate) fn timestamp_secs(secs: Option<i64>) -> DateTime<Utc> {
    secs.and_then(|s| Utc.timestamp_opt(s, 0).single())
        .unwrap_or_else(Utc::now)
}

#[derive(Debug, Deserialize)]
struct MessengerWebhook {
    #[serde(default)]
    object: String,
    #[serde(default)]
    entry: Vec<MessengerEntry>,
}

#[derive(Debug, Deserialize)]
struct MessengerEntry {
    #[serde(default)]
    id: String,
    #[serde(default)]
    messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Deserialize)]
struct MessagingEvent {
    #[serde(default)]
    sender: Option<MessengerParty>,
    #[serde(default)]
    recipient: Option<MessengerParty>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    message: Option<MessengerMessage>,
}

#[derive(Debug, Deserialize)]
struct MessengerParty {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
struct MessengerMessage {
    #[serde(default)]
    mid: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    is_echo: bool,
    #[serde(default)]
    is_deleted: bool,
    #[serde(default)]
    attachments: Vec<MessengerAttachment>,
}

#[derive(Debug, Deserialize)]
struct MessengerAttachment {
    #[serde(rename = "type", default)]
    kind: String,
}

/// Normalize a Pages (`object = "page"`) or Instagram (`object = "instagram"`)
/// webhook body.
pub(crate) fn normalize_messenger(
    channel: Channel,
    expected_object: &str,
    payload: &[u8],
) -> Vec<InboundMessage> {
    let parsed: MessengerWebhook = match serde_json::from_slice(payload) {
        Ok(parsed) => parsed,
        Err(error) => {
            tracing::warn!(%channel, %error, "dropping malformed webhook payload");
            return Vec::new();
        }
    };
    if !parsed.object.is_empty() && parsed.object != expected_object {
        tracing::warn!(
            %channel,
            object = %parsed.object,
            expected_object,
            "dropping webhook payload for unexpected object type"
        );
        return Vec::new();
    }

    let mut out = Vec::new();
    for entry in parsed.entry {
        for event in entry.messaging {
            // Delivery, read, reaction and postback events carry no message.
            let Some(message) = event.message else {
                continue;
            };
            let Some(sender) = event.sender.filter(|s| !s.id.trim().is_empty()) else {
                continue;
            };
            if message.is_echo || sender.id == entry.id {
                tracing::debug!(%channel, mid = %message.mid, "dropping echo of own message");
                continue;
            }
            if message.is_deleted {
                continue;
            }
            let Some((kind, content)) = messenger_content(&message) else {
                continue;
            };
            let account_id = event
                .recipient
                .map(|r| r.id)
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| entry.id.clone());
            let provider_message_id = if message.mid.trim().is_empty() {
                format!("{}:{}", sender.id, event.timestamp.unwrap_or_default())
            } else {
                message.mid.clone()
            };
            out.push(InboundMessage {
                channel,
                kind,
                account_id: Some(ExternalId::new(account_id)),
                customer_id: sender.id.as_str().into(),
                sender_id: sender.id.into(),
                sender_name: None,
                from_business: false,
                provider_message_id: provider_message_id.into(),
                content,
                sent_at: timestamp_millis(event.timestamp),
            });
        }
    }
    out
}

fn messenger_content(message: &MessengerMessage) -> Option<(InboundMessageKind, String)> {
    if let Some(text) = message.text.as_deref().map(str::trim) {
        if !text.is_empty() {
            return Some((InboundMessageKind::Text, text.to_string()));
        }
    }
    let attachment = message.attachments.first()?;
    let label = if attachment.kind.trim().is_empty() {
        "attachment"
    } else {
        attachment.kind.trim()
    };
    Some((InboundMessageKind::Media, format!("[{label}]")))
}

/// Query parameters of the `GET` subscription handshake.
#[derive(Debug, Default, Deserialize)]
pub struct SubscriptionQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Returns the challenge to echo when the handshake is valid.
pub fn verify_subscription(query: &SubscriptionQuery, expected_token: &str) -> Option<String> {
    let expected_token = expected_token.trim();
    if expected_token.is_empty() {
        return None;
    }
    let mode = query.mode.as_deref().map(str::trim).unwrap_or_default();
    let token = query
        .verify_token
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    if mode.eq_ignore_ascii_case("subscribe") && constant_time_eq(token, expected_token) {
        return Some(query.challenge.clone().unwrap_or_default());
    }
    None
}

/// Checks `X-Hub-Signature-256: sha256=<hex>` against HMAC-SHA256(app_secret, body).
pub fn verify_meta_signature(signature_header: Option<&str>, body: &[u8], app_secret: &str) -> bool {
    let Some(signature) = signature_header
        .map(str::trim)
        .and_then(|h| h.strip_prefix("sha256="))
    else {
        return false;
    };
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub(crate) fn constant_time_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let mut diff = left_bytes.len() ^ right_bytes.len();
    let max_len = left_bytes.len().max(right_bytes.len());
    for index in 0..max_len {
        let l = left_bytes.get(index).copied().unwrap_or(0);
        let r = right_bytes.get(index).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn hmac_matches_known_sha256_vector() {
        let header = sign("key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            header,
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn signature_verification_rejects_wrong_secret_and_missing_header() {
        let body = br#"{"object":"page"}"#;
        let header = sign("secret", body);
        assert!(verify_meta_signature(Some(&header), body, "secret"));
        assert!(!verify_meta_signature(Some(&header), body, "wrong"));
        assert!(!verify_meta_signature(None, body, "secret"));
        assert!(!verify_meta_signature(Some("sha256=zz"), body, "secret"));
    }

    #[test]
    fn subscription_handshake_requires_matching_token() {
        let query = SubscriptionQuery {
            mode: Some("subscribe".to_string()),
            verify_token: Some("s3cret".to_string()),
            challenge: Some("1158201444".to_string()),
        };
        assert_eq!(
            verify_subscription(&query, "s3cret").as_deref(),
            Some("1158201444")
        );
        assert_eq!(verify_subscription(&query, "other"), None);
        assert_eq!(verify_subscription(&query, ""), None);
        let unsubscribe = SubscriptionQuery {
            mode: Some("unsubscribe".to_string()),
            ..query
        };
        assert_eq!(verify_subscription(&unsubscribe, "s3cret"), None);
    }

    #[test]
    fn messenger_payload_skips_echoes_receipts_and_keeps_text_and_media() {
        let payload = json!({
            "object": "page",
            "entry": [{
                "id": "PAGE1",
                "time": 1_700_000_000_000_i64,
                "messaging": [
                    {
                        "sender": { "id": "PSID9" },
                        "recipient": { "id": "PAGE1" },
                        "timestamp": 1_700_000_000_000_i64,
                        "message": { "mid": "m_1", "text": " hello " }
                    },
                    {
                        "sender": { "id": "PAGE1" },
                        "recipient": { "id": "PSID9" },
                        "timestamp": 1_700_000_001_000_i64,
                        "message": { "mid": "m_2", "text": "our reply", "is_echo": true }
                    },
                    {
                        "sender": { "id": "PSID9" },
                        "recipient": { "id": "PAGE1" },
                        "timestamp": 1_700_000_002_000_i64,
                        "delivery": { "mids": ["m_2"] }
                    },
                    {
                        "sender": { "id": "PSID9" },
                        "recipient": { "id": "PAGE1" },
                        "timestamp": 1_700_000_003_000_i64,
                        "message": { "mid": "m_3", "attachments": [{ "type": "image" }] }
                    }
                ]
            }]
        });
        let body = serde_json::to_vec(&payload).expect("encode");
        let inbound = normalize_messenger(Channel::Facebook, "page", &body);
        assert_eq!(inbound.len(), 2);
        assert_eq!(inbound[0].content, "hello");
        assert_eq!(inbound[0].customer_id.as_str(), "PSID9");
        assert_eq!(inbound[0].account_id.as_deref(), Some("PAGE1"));
        assert_eq!(inbound[0].provider_message_id.as_str(), "m_1");
        assert_eq!(inbound[0].sent_at.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(inbound[1].kind, InboundMessageKind::Media);
        assert_eq!(inbound[1].content, "[image]");
    }

    #[test]
    fn messenger_payload_for_other_object_or_garbage_is_empty() {
        assert!(normalize_messenger(Channel::Facebook, "page", b"not json").is_empty());
        let ig = br#"{"object":"instagram","entry":[]}"#;
        assert!(normalize_messenger(Channel::Facebook, "page", ig).is_empty());
        assert!(normalize_messenger(Channel::Facebook, "page", b"{}").is_empty());
    }

    #[test]
    fn history_marks_business_messages_and_names_customer() {
        let parsed: GraphConversations = serde_json::from_value(json!({
            "data": [{
                "participants": { "data": [
                    { "id": "PAGE1", "name": "Shop" },
                    { "id": "PSID9", "name": "Osama Abdo" }
                ]},
                "messages": { "data": [
                    { "id": "m_b", "message": "Welcome!", "from": { "id": "PAGE1" },
                      "created_time": "2024-05-01T10:00:05+0000" },
                    { "id": "m_a", "message": "Hi", "from": { "id": "PSID9" },
                      "created_time": "2024-05-01T10:00:00+0000" }
                ]}
            }]
        }))
        .expect("parse history");
        let inbound = history_to_inbound(Channel::Facebook, "PAGE1", parsed);
        assert_eq!(inbound.len(), 2);
        assert!(inbound[0].from_business);
        assert_eq!(inbound[0].customer_id.as_str(), "PSID9");
        assert!(!inbound[1].from_business);
        assert_eq!(inbound[1].sender_name.as_deref(), Some("Osama Abdo"));
        assert_eq!(
            inbound[1].sent_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().expect("time")
        );
    }

    #[test]
    fn profile_prefers_full_name_then_first_last_then_username() {
        let profile = GraphProfile {
            first_name: Some("Osama".to_string()),
            last_name: Some("Abdo".to_string()),
            ..GraphProfile::default()
        };
        assert_eq!(profile.display_name().as_deref(), Some("Osama Abdo"));
        let ig = GraphProfile {
            username: Some("osama.shop".to_string()),
            ..GraphProfile::default()
        };
        assert_eq!(ig.display_name().as_deref(), Some("osama.shop"));
        assert_eq!(GraphProfile::default().display_name(), None);
    }
}
