use crate::types::{Channel, ChannelCredentials, CustomerProfile, InboundMessage, ProviderMessageId};
use anyhow::Result;
use async_trait::async_trait;

/// One implementation per provider. Adapters are stateless with respect to
/// tenants: credentials arrive per call, scoped to the acting workspace.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    /// Parse a raw webhook body. Receipts, echoes and malformed payloads yield
    /// an empty vec; this never fails.
    fn normalize(&self, payload: &[u8]) -> Vec<InboundMessage>;

    /// Deliver `text` to the external customer and return the provider's id
    /// for the (first) sent message.
    async fn send(
        &self,
        recipient_id: &str,
        text: &str,
        credentials: &ChannelCredentials,
    ) -> Result<ProviderMessageId>;

    /// Best-effort display-name lookup.
    async fn fetch_profile(
        &self,
        _customer_id: &str,
        _credentials: &ChannelCredentials,
    ) -> Result<Option<CustomerProfile>> {
        Ok(None)
    }

    /// Recent history for first-connection import.
    async fn fetch_history(&self, _credentials: &ChannelCredentials) -> Result<Vec<InboundMessage>> {
        Ok(Vec::new())
    }

    fn max_message_chars(&self) -> usize {
        4096
    }
}
