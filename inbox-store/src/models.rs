use crate::error::StoreError;
use chrono::{DateTime, TimeZone, Utc};
use inbox_channels::{Channel, ChannelCredentials};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0.to_string()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let raw = value.as_str()?;
                Uuid::parse_str(raw)
                    .map(Self)
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

uuid_id!(WorkspaceId);
uuid_id!(ConversationId);
uuid_id!(MessageId);
uuid_id!(ProductId);
uuid_id!(OrderId);

/// Text-backed enums stored by their `as_str` form.
macro_rules! sql_text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(StoreError::Corrupt(format!(
                        "unknown {} {other:?}",
                        stringify!($name)
                    ))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: StoreError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    Customer,
    Agent,
    Ai,
    System,
}

sql_text_enum!(SenderType {
    Customer => "customer",
    Agent => "agent",
    Ai => "ai",
    System => "system",
});

impl SenderType {
    pub fn is_outbound(self) -> bool {
        matches!(self, Self::Agent | Self::Ai)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

sql_text_enum!(DeliveryStatus {
    Pending => "pending",
    Delivered => "delivered",
    Failed => "failed",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Cancelled,
}

sql_text_enum!(OrderStatus {
    Pending => "pending",
    Confirmed => "confirmed",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderCreatedBy {
    Agent,
    Ai,
    CustomerSelfServe,
}

sql_text_enum!(OrderCreatedBy {
    Agent => "agent",
    Ai => "ai",
    CustomerSelfServe => "customer_self_serve",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub name: String,
    pub default_ai_enabled: bool,
    pub ai_agent_id: Option<String>,
    /// Per-workspace override of the reply lookback window.
    pub reply_lookback_seconds: Option<i64>,
    /// Per-workspace override of the debounce settle threshold.
    pub settle_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    pub fn new(name: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: WorkspaceId::new(),
            name: name.into(),
            default_ai_enabled: false,
            ai_agent_id: None,
            reply_lookback_seconds: None,
            settle_seconds: None,
            created_at,
        }
    }

    pub fn with_id(mut self, id: WorkspaceId) -> Self {
        self.id = id;
        self
    }

    pub fn with_default_ai(mut self, enabled: bool, ai_agent_id: Option<String>) -> Self {
        self.default_ai_enabled = enabled;
        self.ai_agent_id = ai_agent_id;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelIntegration {
    pub workspace_id: WorkspaceId,
    pub channel: Channel,
    pub is_connected: bool,
    /// Page id, IG account id, WhatsApp phone-number id or Telegram bot id.
    pub external_account_id: Option<String>,
    pub credentials: ChannelCredentials,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub description: String,
    pub price: Decimal,
    pub stock: Option<i64>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub workspace_id: WorkspaceId,
    pub channel: Channel,
    pub external_customer_id: String,
    pub customer_display_name: String,
    pub display_name_is_placeholder: bool,
    pub ai_enabled: bool,
    pub assigned_agent_id: Option<String>,
    pub last_message_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub sender_type: SenderType,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_backfilled: bool,
    pub reply_sent: bool,
    pub delivery_status: Option<DeliveryStatus>,
    pub delivery_error: Option<String>,
}

/// Insert payload for [`Message`]; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub content: String,
    pub sender_type: SenderType,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_backfilled: bool,
    pub reply_sent: bool,
    pub delivery_status: Option<DeliveryStatus>,
}

impl NewMessage {
    pub fn customer(
        content: impl Into<String>,
        provider_message_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            content: content.into(),
            sender_type: SenderType::Customer,
            provider_message_id: Some(provider_message_id.into()),
            created_at,
            is_backfilled: false,
            reply_sent: false,
            delivery_status: None,
        }
    }

    /// Outbound rows are born `reply_sent` with a pending delivery.
    pub fn outbound(
        content: impl Into<String>,
        sender_type: SenderType,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            content: content.into(),
            sender_type,
            provider_message_id: None,
            created_at,
            is_backfilled: false,
            reply_sent: true,
            delivery_status: Some(DeliveryStatus::Pending),
        }
    }
}

/// Proof of a held processing lock. Only the holder token can release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub conversation_id: ConversationId,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub order_number: String,
    pub workspace_id: WorkspaceId,
    pub conversation_id: ConversationId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_address: String,
    pub unit_price: Decimal,
    pub price: Decimal,
    pub status: OrderStatus,
    pub created_by: OrderCreatedBy,
    pub turn_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub order_number: String,
    pub workspace_id: WorkspaceId,
    pub conversation_id: ConversationId,
    pub product_id: ProductId,
    pub quantity: i64,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_address: String,
    pub unit_price: Decimal,
    pub created_by: OrderCreatedBy,
    pub turn_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderInsert {
    Created(Order),
    Existing(Order),
}

impl OrderInsert {
    pub fn order(&self) -> &Order {
        match self {
            Self::Created(order) | Self::Existing(order) => order,
        }
    }

    pub fn into_order(self) -> Order {
        match self {
            Self::Created(order) | Self::Existing(order) => order,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Integer,
            format!("timestamp out of range: {ms}").into(),
        )
    })
}

pub(crate) fn parse_channel(raw: &str) -> rusqlite::Result<Channel> {
    raw.parse::<Channel>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}

pub(crate) fn parse_decimal(raw: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_enums_round_trip_and_reject_unknown() {
        for sender in [
            SenderType::Customer,
            SenderType::Agent,
            SenderType::Ai,
            SenderType::System,
        ] {
            assert_eq!(sender.as_str().parse::<SenderType>().expect("parse"), sender);
        }
        assert!("bot".parse::<SenderType>().is_err());
        assert_eq!(
            "customer_self_serve".parse::<OrderCreatedBy>().expect("parse"),
            OrderCreatedBy::CustomerSelfServe
        );
        assert!(SenderType::Ai.is_outbound());
        assert!(!SenderType::System.is_outbound());
    }

    #[test]
    fn outbound_messages_start_pending_and_replied() {
        let message = NewMessage::outbound("hi", SenderType::Agent, Utc::now());
        assert!(message.reply_sent);
        assert_eq!(message.delivery_status, Some(DeliveryStatus::Pending));
        assert_eq!(message.provider_message_id, None);
    }
}
