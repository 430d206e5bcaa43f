use crate::facebook::FacebookAdapter;
use crate::instagram::InstagramAdapter;
use crate::telegram::TelegramAdapter;
use crate::traits::ChannelAdapter;
use crate::types::{Channel, InboundMessage};
use crate::whatsapp::WhatsAppCloudAdapter;
use anyhow::{Result, anyhow};
use std::collections::HashMap;
use std::sync::Arc;

/// Channel -> adapter lookup shared by ingest and dispatch.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Production adapters for all four channels.
    pub fn with_default_adapters() -> Result<Self> {
        Ok(Self::new()
            .with_adapter(Arc::new(FacebookAdapter::new()?))
            .with_adapter(Arc::new(InstagramAdapter::new()?))
            .with_adapter(Arc::new(WhatsAppCloudAdapter::new()?))
            .with_adapter(Arc::new(TelegramAdapter::new()?)))
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.insert(adapter.channel(), adapter);
        self
    }

    pub fn get(&self, channel: Channel) -> Result<Arc<dyn ChannelAdapter>> {
        self.adapters
            .get(&channel)
            .cloned()
            .ok_or_else(|| anyhow!("no adapter registered for channel {channel}"))
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.adapters.keys().copied().collect();
        channels.sort();
        channels
    }
}

/// Second echo pass, run once the receiving integration is known: drop
/// anything the business account itself authored.
pub fn suppress_echoes(
    messages: Vec<InboundMessage>,
    own_account_id: Option<&str>,
) -> Vec<InboundMessage> {
    let own = own_account_id.map(str::trim).filter(|id| !id.is_empty());
    messages
        .into_iter()
        .filter(|message| {
            if message.from_business {
                return false;
            }
            match own {
                Some(own) => message.sender_id.as_str() != own && message.customer_id.as_str() != own,
                None => true,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InboundMessageKind;
    use chrono::Utc;

    fn inbound(sender: &str, from_business: bool) -> InboundMessage {
        InboundMessage {
            channel: Channel::Facebook,
            kind: InboundMessageKind::Text,
            account_id: Some("PAGE1".into()),
            customer_id: sender.into(),
            sender_id: sender.into(),
            sender_name: None,
            from_business,
            provider_message_id: format!("m-{sender}").into(),
            content: "hi".to_string(),
            sent_at: Utc::now(),
        }
    }

    #[test]
    fn echoes_from_own_account_are_suppressed() {
        let messages = vec![
            inbound("PSID1", false),
            inbound("PAGE1", false),
            inbound("PSID2", true),
        ];
        let kept = suppress_echoes(messages.clone(), Some("PAGE1"));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].sender_id.as_str(), "PSID1");

        let without_account = suppress_echoes(messages, None);
        assert_eq!(without_account.len(), 2);
    }

    #[test]
    fn default_registry_covers_every_channel() {
        let registry = ChannelRegistry::with_default_adapters().expect("registry");
        assert_eq!(registry.channels(), Channel::ALL.to_vec());
        for channel in Channel::ALL {
            assert_eq!(registry.get(channel).expect("adapter").channel(), channel);
        }
        assert!(ChannelRegistry::new().get(Channel::Telegram).is_err());
    }
}
