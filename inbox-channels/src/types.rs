use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(ProviderMessageId);
id_newtype!(ExternalId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Facebook,
    Instagram,
    Whatsapp,
    Telegram,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Facebook,
        Channel::Instagram,
        Channel::Whatsapp,
        Channel::Telegram,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Facebook => "facebook",
            Self::Instagram => "instagram",
            Self::Whatsapp => "whatsapp",
            Self::Telegram => "telegram",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Facebook => "Facebook",
            Self::Instagram => "Instagram",
            Self::Whatsapp => "WhatsApp",
            Self::Telegram => "Telegram",
        }
    }

    /// Meta channels share the `hub.challenge` subscription handshake and
    /// `X-Hub-Signature-256` payload signing.
    pub fn is_meta(self) -> bool {
        !matches!(self, Self::Telegram)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "facebook" | "messenger" => Ok(Self::Facebook),
            "instagram" => Ok(Self::Instagram),
            "whatsapp" => Ok(Self::Whatsapp),
            "telegram" => Ok(Self::Telegram),
            other => Err(anyhow::anyhow!("unsupported channel: {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundMessageKind {
    Text,
    /// Image, audio, sticker, document... `content` holds a short placeholder
    /// (plus caption when the provider sends one).
    Media,
}

/// Canonical form of one provider message, independent of channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: Channel,
    pub kind: InboundMessageKind,
    /// Receiving business account (page id, IG account id, phone-number id).
    /// Absent for Telegram, which is routed by workspace instead.
    pub account_id: Option<ExternalId>,
    /// The external customer this thread belongs to.
    pub customer_id: ExternalId,
    pub sender_id: ExternalId,
    pub sender_name: Option<String>,
    /// True when the business account authored the message (echoes, history).
    pub from_business: bool,
    pub provider_message_id: ProviderMessageId,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

/// Opaque per-integration credentials, written by the connect flow.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ChannelCredentials {
    /// Page access token (Facebook/Instagram) or system-user token (WhatsApp).
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub phone_number_id: Option<String>,
    /// Page id or IG business account id, needed for history import.
    #[serde(default)]
    pub account_id: Option<String>,
}

impl ChannelCredentials {
    pub fn access_token(&self) -> anyhow::Result<&str> {
        non_empty(self.access_token.as_deref())
            .ok_or_else(|| anyhow::anyhow!("credentials missing access_token"))
    }

    pub fn bot_token(&self) -> anyhow::Result<&str> {
        non_empty(self.bot_token.as_deref())
            .ok_or_else(|| anyhow::anyhow!("credentials missing bot_token"))
    }

    pub fn phone_number_id(&self) -> anyhow::Result<&str> {
        non_empty(self.phone_number_id.as_deref())
            .ok_or_else(|| anyhow::anyhow!("credentials missing phone_number_id"))
    }

    pub fn account_id(&self) -> anyhow::Result<&str> {
        non_empty(self.account_id.as_deref())
            .ok_or_else(|| anyhow::anyhow!("credentials missing account_id"))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl fmt::Debug for ChannelCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("ChannelCredentials")
            .field("access_token", &redact(&self.access_token))
            .field("bot_token", &redact(&self.bot_token))
            .field("phone_number_id", &self.phone_number_id)
            .field("account_id", &self.account_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub display_name: String,
}

const PLACEHOLDER_SUFFIX_LEN: usize = 5;
const GENERIC_NAMES: [&str; 4] = ["unknown", "customer", "user", "guest"];

/// "Telegram User 45678" style name used until a real one is known.
pub fn placeholder_display_name(channel: Channel, customer_id: &str) -> String {
    let chars: Vec<char> = customer_id.trim().chars().collect();
    let start = chars.len().saturating_sub(PLACEHOLDER_SUFFIX_LEN);
    let suffix: String = chars[start..].iter().collect();
    if suffix.is_empty() {
        return format!("{} User", channel.display_name());
    }
    format!("{} User {}", channel.display_name(), suffix)
}

pub fn is_placeholder_display_name(name: &str, customer_id: &str) -> bool {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == customer_id.trim() {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    if GENERIC_NAMES.contains(&lowered.as_str()) {
        return true;
    }
    Channel::ALL.iter().any(|channel| {
        let prefix = format!("{} user", channel.display_name().to_lowercase());
        match lowered.strip_prefix(&prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with(' '),
            None => false,
        }
    })
}

/// Split on char boundaries so each chunk fits the provider's length limit.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return vec![text.to_string()];
    }
    chars
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}
