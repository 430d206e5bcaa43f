use crate::meta::{GraphApi, normalize_messenger};
use crate::traits::ChannelAdapter;
use crate::types::{Channel, ChannelCredentials, CustomerProfile, InboundMessage, ProviderMessageId};
use anyhow::Result;

const INSTAGRAM_MAX_CHARS: usize = 1000;
const INSTAGRAM_OBJECT: &str = "instagram";

/// Instagram professional-account DMs. Same wire shape as Messenger with a
/// different `object` and tighter text limit.
#[derive(Clone)]
pub struct InstagramAdapter {
    graph: GraphApi,
}

impl InstagramAdapter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            graph: GraphApi::new()?,
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.graph = self.graph.with_api_base(api_base);
        self
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for InstagramAdapter {
    fn channel(&self) -> Channel {
        Channel::Instagram
    }

    fn normalize(&self, payload: &[u8]) -> Vec<InboundMessage> {
        normalize_messenger(Channel::Instagram, INSTAGRAM_OBJECT, payload)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn send(
        &self,
        recipient_id: &str,
        text: &str,
        credentials: &ChannelCredentials,
    ) -> Result<ProviderMessageId> {
        self.graph
            .send_messenger_text(
                recipient_id,
                text,
                credentials.access_token()?,
                self.max_message_chars(),
            )
            .await
    }

    async fn fetch_profile(
        &self,
        customer_id: &str,
        credentials: &ChannelCredentials,
    ) -> Result<Option<CustomerProfile>> {
        self.graph
            .fetch_profile(customer_id, "name,username", credentials.access_token()?)
            .await
    }

    async fn fetch_history(&self, credentials: &ChannelCredentials) -> Result<Vec<InboundMessage>> {
        self.graph
            .fetch_conversations(
                Channel::Instagram,
                credentials.account_id()?,
                credentials.access_token()?,
            )
            .await
    }

    fn max_message_chars(&self) -> usize {
        INSTAGRAM_MAX_CHARS
    }
}
