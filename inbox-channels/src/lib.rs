//! Channel adapters for the unified inbox.
//!
//! Adapters are pure I/O: they turn provider webhook payloads into canonical
//! `InboundMessage`s and push text replies back out with per-workspace
//! credentials. They never touch storage.

mod facebook;
mod instagram;
mod meta;
mod registry;
mod telegram;
mod traits;
mod types;
mod whatsapp;

pub use facebook::FacebookAdapter;
pub use instagram::InstagramAdapter;
pub use meta::{GRAPH_API_BASE, SubscriptionQuery, verify_meta_signature, verify_subscription};
pub use registry::{ChannelRegistry, suppress_echoes};
pub use telegram::{
    TELEGRAM_SECRET_HEADER, TelegramAdapter, bot_id_from_token, verify_telegram_secret,
};
pub use traits::ChannelAdapter;
pub use types::{
    Channel, ChannelCredentials, CustomerProfile, ExternalId, InboundMessage, InboundMessageKind,
    ProviderMessageId, is_placeholder_display_name, placeholder_display_name, split_message,
};
pub use whatsapp::WhatsAppCloudAdapter;
