//! Shared fakes for pipeline tests: a scripted chat model, a recording
//! channel adapter and an in-memory store fixture.

use crate::config::InboxConfig;
use crate::dispatch::Dispatcher;
use crate::server::{self, AppState};
use crate::turn::{TurnEngine, TurnSettings};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use inbox_channels::{
    Channel, ChannelAdapter, ChannelCredentials, ChannelRegistry, CustomerProfile,
    FacebookAdapter, InboundMessage, InstagramAdapter, ProviderMessageId, TelegramAdapter,
    WhatsAppCloudAdapter,
};
use inbox_llm::{ChatMessage, ChatModel, ChatResponse, LlmError, ToolCall, Usage};
use inbox_store::{
    ChannelIntegration, Conversation, NewMessage, Product, ProductId, Store, Workspace,
    WorkspaceId,
};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Page id / phone-number id / bot id of the fixture's business account.
pub(crate) const ACCOUNT_ID: &str = "BIZ-1";

pub(crate) enum ScriptedReply {
    Response { content: String, tool_calls: Vec<ToolCall> },
    Error,
    /// Provider answers 503.
    Unavailable,
    Hang,
    Delayed { delay: Duration, content: String },
}

impl ScriptedReply {
    pub(crate) fn text(content: &str) -> Self {
        Self::Response {
            content: content.to_string(),
            tool_calls: Vec::new(),
        }
    }

    pub(crate) fn tool_call(content: &str, arguments: serde_json::Value) -> Self {
        Self::Response {
            content: content.to_string(),
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: crate::orders::CREATE_ORDER_TOOL.to_string(),
                arguments: arguments.to_string(),
            }],
        }
    }
}

pub(crate) struct ScriptedModel {
    replies: Mutex<VecDeque<ScriptedReply>>,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub(crate) fn new(replies: Vec<ScriptedReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn prompts(&self) -> Vec<Vec<ChatMessage>> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        _tools: &[inbox_llm::ToolDefinition],
    ) -> inbox_llm::Result<ChatResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(messages.to_vec());
        let next = self.replies.lock().expect("replies lock").pop_front();
        match next {
            Some(ScriptedReply::Response {
                content,
                tool_calls,
            }) => {
                let mut message = ChatMessage::assistant(content);
                message.tool_calls = tool_calls;
                Ok(ChatResponse {
                    message,
                    usage: Usage::default(),
                    finish_reason: "stop".to_string(),
                })
            }
            Some(ScriptedReply::Hang) => std::future::pending().await,
            Some(ScriptedReply::Delayed { delay, content }) => {
                tokio::time::sleep(delay).await;
                Ok(ChatResponse {
                    message: ChatMessage::assistant(content),
                    usage: Usage::default(),
                    finish_reason: "stop".to_string(),
                })
            }
            Some(ScriptedReply::Unavailable) => Err(LlmError::Status {
                status: 503,
                body: "upstream overloaded".to_string(),
            }),
            Some(ScriptedReply::Error) | None => Err(LlmError::InvalidInput(
                "scripted model has no reply".to_string(),
            )),
        }
    }
}

/// Records outbound sends; parses webhooks with the real adapter.
#[derive(Clone)]
pub(crate) struct RecordingAdapter {
    channel: Channel,
    parser: Arc<dyn ChannelAdapter>,
    sent: Arc<Mutex<Vec<(String, String)>>>,
    fail_sends: bool,
    send_delay: Option<Duration>,
    profile: Option<String>,
    profile_delay: Option<Duration>,
    history: Vec<InboundMessage>,
}

impl RecordingAdapter {
    pub(crate) fn new(channel: Channel) -> Self {
        let parser: Arc<dyn ChannelAdapter> = match channel {
            Channel::Facebook => Arc::new(FacebookAdapter::new().expect("facebook adapter")),
            Channel::Instagram => Arc::new(InstagramAdapter::new().expect("instagram adapter")),
            Channel::Whatsapp => Arc::new(WhatsAppCloudAdapter::new().expect("whatsapp adapter")),
            Channel::Telegram => Arc::new(TelegramAdapter::new().expect("telegram adapter")),
        };
        Self {
            channel,
            parser,
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_sends: false,
            send_delay: None,
            profile: None,
            profile_delay: None,
            history: Vec::new(),
        }
    }

    pub(crate) fn failing_sends(mut self) -> Self {
        self.fail_sends = true;
        self
    }

    pub(crate) fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    pub(crate) fn with_profile(mut self, name: &str) -> Self {
        self.profile = Some(name.to_string());
        self
    }

    pub(crate) fn with_profile_delay(mut self, delay: Duration) -> Self {
        self.profile_delay = Some(delay);
        self
    }

    pub(crate) fn with_history(mut self, history: Vec<InboundMessage>) -> Self {
        self.history = history;
        self
    }

    pub(crate) fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("sent lock").clone()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    fn normalize(&self, payload: &[u8]) -> Vec<InboundMessage> {
        self.parser.normalize(payload)
    }

    async fn send(
        &self,
        recipient_id: &str,
        text: &str,
        _credentials: &ChannelCredentials,
    ) -> Result<ProviderMessageId> {
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sends {
            return Err(anyhow!("provider rejected message: recipient unavailable"));
        }
        let mut sent = self.sent.lock().expect("sent lock");
        sent.push((recipient_id.to_string(), text.to_string()));
        Ok(format!("out-{}", sent.len()).into())
    }

    async fn fetch_profile(
        &self,
        _customer_id: &str,
        _credentials: &ChannelCredentials,
    ) -> Result<Option<CustomerProfile>> {
        if let Some(delay) = self.profile_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.profile.clone().map(|display_name| CustomerProfile { display_name }))
    }

    async fn fetch_history(&self, _credentials: &ChannelCredentials) -> Result<Vec<InboundMessage>> {
        Ok(self.history.clone())
    }
}

pub(crate) struct Fixture {
    pub(crate) store: Store,
    pub(crate) workspace: Workspace,
    pub(crate) channels: ChannelRegistry,
    pub(crate) adapter: RecordingAdapter,
}

impl Fixture {
    pub(crate) async fn new(channel: Channel) -> Self {
        Self::with_adapter(RecordingAdapter::new(channel), true).await
    }

    /// AI-enabled workspace with a two-product catalog.
    pub(crate) async fn with_adapter(adapter: RecordingAdapter, connected: bool) -> Self {
        let store = Store::open_in_memory().expect("store");
        let workspace =
            Workspace::new("shop", Utc::now()).with_default_ai(true, Some("ai-agent".to_string()));
        store.upsert_workspace(&workspace).await.expect("workspace");
        for (name, price) in [("كريم مرطب", 50), ("صابون طبيعي", 20)] {
            store
                .upsert_product(&Product {
                    id: ProductId::new(),
                    workspace_id: workspace.id,
                    name: name.to_string(),
                    description: String::new(),
                    price: Decimal::from(price),
                    stock: None,
                    is_active: true,
                })
                .await
                .expect("product");
        }
        let channels = ChannelRegistry::new().with_adapter(Arc::new(adapter.clone()));
        let fixture = Self {
            store,
            workspace,
            channels,
            adapter,
        };
        if connected {
            fixture.connect().await;
        }
        fixture
    }

    pub(crate) async fn connect(&self) {
        self.connect_workspace(self.workspace.id).await;
    }

    pub(crate) async fn connect_workspace(&self, workspace_id: WorkspaceId) {
        self.store
            .upsert_integration(&ChannelIntegration {
                workspace_id,
                channel: self.adapter.channel,
                is_connected: true,
                external_account_id: Some(ACCOUNT_ID.to_string()),
                credentials: ChannelCredentials {
                    access_token: Some("token".to_string()),
                    bot_token: Some("123:abc".to_string()),
                    phone_number_id: Some(ACCOUNT_ID.to_string()),
                    account_id: Some(ACCOUNT_ID.to_string()),
                },
                updated_at: Utc::now(),
            })
            .await
            .expect("integration");
    }

    pub(crate) async fn conversation(&self, external_customer_id: &str) -> Conversation {
        self.store
            .resolve_conversation(
                self.workspace.id,
                self.adapter.channel,
                external_customer_id,
                None,
                Utc::now(),
            )
            .await
            .expect("conversation")
    }

    pub(crate) async fn customer_message(
        &self,
        conversation: &Conversation,
        content: &str,
        at: DateTime<Utc>,
    ) {
        let stored = self
            .store
            .insert_message(
                conversation.id,
                NewMessage::customer(content, uuid::Uuid::new_v4().to_string(), at),
            )
            .await
            .expect("insert");
        assert!(stored);
    }

    pub(crate) fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.store.clone(), self.channels.clone())
    }

    pub(crate) fn engine(&self, model: Arc<ScriptedModel>, model_timeout: Duration) -> TurnEngine {
        TurnEngine::new(
            self.store.clone(),
            model,
            self.dispatcher(),
            TurnSettings {
                system_prompt: "You are a helpful shop assistant.".to_string(),
                history_limit: 15,
                model_timeout,
            },
        )
    }

    /// Full HTTP stack over this fixture's store and adapters.
    pub(crate) fn app(&self, model: Option<Arc<ScriptedModel>>, config: InboxConfig) -> axum::Router {
        let model = model.map(|m| m as Arc<dyn ChatModel>);
        let state = AppState::new(config, self.store.clone(), self.channels.clone(), model);
        server::app(Arc::new(state))
    }
}
