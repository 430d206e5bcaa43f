use crate::meta::{constant_time_eq, timestamp_secs};
use crate::traits::ChannelAdapter;
use crate::types::{
    Channel, ChannelCredentials, CustomerProfile, InboundMessage, InboundMessageKind,
    ProviderMessageId, split_message,
};
use anyhow::{Result, anyhow};
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_MAX_CHARS: usize = 4096;
pub const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Telegram Bot API over webhooks. The bot token is per workspace and
/// arrives with each call, so one adapter serves every tenant.
#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    api_base: String,
}

impl TelegramAdapter {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            api_base: TELEGRAM_API_BASE.to_string(),
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, bot_token: &str, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "{}/bot{}/{}",
            self.api_base, bot_token, method
        ))?)
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel(&self) -> Channel {
        Channel::Telegram
    }

    fn normalize(&self, payload: &[u8]) -> Vec<InboundMessage> {
        let update: TelegramUpdate = match serde_json::from_slice(payload) {
            Ok(update) => update,
            Err(error) => {
                tracing::warn!(%error, "dropping malformed telegram update");
                return Vec::new();
            }
        };
        build_message_inbound(update.update_id, update.message.as_ref())
            .into_iter()
            .collect()
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn send(
        &self,
        recipient_id: &str,
        text: &str,
        credentials: &ChannelCredentials,
    ) -> Result<ProviderMessageId> {
        let chat_id = recipient_id.trim();
        if chat_id.is_empty() {
            return Err(anyhow!("recipient_id (chat id) is required"));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(anyhow!("message content is empty"));
        }
        let url = self.api_url(credentials.bot_token()?, "sendMessage")?;

        let mut first_id: Option<ProviderMessageId> = None;
        for chunk in split_message(text, self.max_message_chars()) {
            let body = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
            });
            let resp = self.http.post(url.clone()).json(&body).send().await?;
            let status = resp.status();
            let text = resp.text().await?;
            if !status.is_success() {
                return Err(anyhow!("telegram send failed: status={status} body={text}"));
            }
            let parsed: TelegramResponse<TelegramSentMessage> = serde_json::from_str(&text)
                .map_err(|e| anyhow!("telegram send response parse failed: {e} body={text}"))?;
            let sent = parsed
                .into_result()
                .map_err(|description| anyhow!("telegram send rejected: {description}"))?;
            if first_id.is_none() {
                first_id = Some(sent.message_id.to_string().into());
            }
        }
        first_id.ok_or_else(|| anyhow!("telegram send produced no message id"))
    }

    async fn fetch_profile(
        &self,
        customer_id: &str,
        credentials: &ChannelCredentials,
    ) -> Result<Option<CustomerProfile>> {
        let url = self.api_url(credentials.bot_token()?, "getChat")?;
        let resp = self
            .http
            .get(url)
            .query(&[("chat_id", customer_id)])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("telegram getChat failed: status={status}"));
        }
        let parsed: TelegramResponse<TelegramChat> = resp.json().await?;
        let chat = parsed
            .into_result()
            .map_err(|description| anyhow!("telegram getChat rejected: {description}"))?;
        Ok(chat.display_name().map(|display_name| CustomerProfile { display_name }))
    }

    fn max_message_chars(&self) -> usize {
        TELEGRAM_MAX_CHARS
    }
}

/// The numeric prefix of a bot token (`123456:ABC...`) is the bot's user id.
pub fn bot_id_from_token(bot_token: &str) -> Option<String> {
    let (id, _) = bot_token.trim().split_once(':')?;
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
}

/// Checks the `X-Telegram-Bot-Api-Secret-Token` header. With no configured
/// secret every request passes.
pub fn verify_telegram_secret(header: Option<&str>, expected: Option<&str>) -> bool {
    let Some(expected) = expected.map(str::trim).filter(|s| !s.is_empty()) else {
        return true;
    };
    header.is_some_and(|h| constant_time_eq(h.trim(), expected))
}

fn build_message_inbound(
    update_id: i64,
    message: Option<&TelegramMessage>,
) -> Option<InboundMessage> {
    let message = message?;
    let chat = message.chat.as_ref()?;
    if chat.r#type != "private" {
        tracing::debug!(chat_id = chat.id, chat_type = %chat.r#type, "ignoring non-private telegram chat");
        return None;
    }
    if message.from.as_ref().is_some_and(|user| user.is_bot) {
        return None;
    }
    let (kind, content) = extract_message_content(message)?;
    let sender_id = message
        .from
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| chat.id.to_string());
    let message_id = message
        .message_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| format!("update:{update_id}"));
    let sender_name = message
        .from
        .as_ref()
        .and_then(TelegramUser::display_name)
        .or_else(|| chat.display_name());

    Some(InboundMessage {
        channel: Channel::Telegram,
        kind,
        account_id: None,
        customer_id: chat.id.to_string().into(),
        sender_id: sender_id.into(),
        sender_name,
        from_business: false,
        provider_message_id: message_id.into(),
        content,
        sent_at: timestamp_secs(message.date),
    })
}

fn extract_message_content(message: &TelegramMessage) -> Option<(InboundMessageKind, String)> {
    if let Some(text) = message.text.as_deref().map(str::trim) {
        if !text.is_empty() {
            return Some((InboundMessageKind::Text, text.to_string()));
        }
    }
    let label = message.media_label()?;
    let caption = message.caption.as_deref().map(str::trim).unwrap_or_default();
    let content = if caption.is_empty() {
        format!("[{label}]")
    } else {
        format!("[{label}] {caption}")
    };
    Some((InboundMessageKind::Media, content))
}

fn join_name(first: Option<&str>, last: Option<&str>) -> Option<String> {
    let name = [first, last]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!name.is_empty()).then_some(name)
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    #[serde(default)]
    ok: bool,
    #[serde(default = "Option::default")]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

impl<T> TelegramResponse<T> {
    fn into_result(self) -> std::result::Result<T, String> {
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(self
                .description
                .unwrap_or_else(|| "missing result".to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TelegramSentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    #[serde(default)]
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    date: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Vec<serde_json::Value>,
    #[serde(default)]
    sticker: Option<serde_json::Value>,
    #[serde(default)]
    animation: Option<serde_json::Value>,
    #[serde(default)]
    audio: Option<serde_json::Value>,
    #[serde(default)]
    document: Option<serde_json::Value>,
    #[serde(default)]
    video: Option<serde_json::Value>,
    #[serde(default)]
    voice: Option<serde_json::Value>,
    #[serde(default)]
    video_note: Option<serde_json::Value>,
    #[serde(default)]
    location: Option<serde_json::Value>,
    #[serde(default)]
    contact: Option<serde_json::Value>,
}

impl TelegramMessage {
    fn media_label(&self) -> Option<&'static str> {
        if !self.photo.is_empty() {
            return Some("photo");
        }
        [
            ("sticker", &self.sticker),
            ("animation", &self.animation),
            ("audio", &self.audio),
            ("document", &self.document),
            ("video", &self.video),
            ("voice", &self.voice),
            ("video note", &self.video_note),
            ("location", &self.location),
            ("contact", &self.contact),
        ]
        .into_iter()
        .find_map(|(label, value)| value.is_some().then_some(label))
    }
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl TelegramUser {
    fn display_name(&self) -> Option<String> {
        join_name(self.first_name.as_deref(), self.last_name.as_deref())
            .or_else(|| self.username.clone().filter(|u| !u.trim().is_empty()))
    }
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type", default)]
    r#type: String,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

impl TelegramChat {
    fn display_name(&self) -> Option<String> {
        join_name(self.first_name.as_deref(), self.last_name.as_deref())
            .or_else(|| self.username.clone().filter(|u| !u.trim().is_empty()))
    }
}
