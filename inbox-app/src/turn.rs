//! AI turn engine: one model call per settled burst of customer messages,
//! producing one reply and at most one order.

use crate::dispatch::{Delivery, Dispatcher};
use crate::orders::{self, CREATE_ORDER_TOOL, OrderIntent};
use anyhow::{Result, anyhow};
use chrono::Utc;
use inbox_llm::{ChatMessage, ChatModel, LlmError, ToolCall, ToolDefinition};
use inbox_store::{
    Conversation, ConversationId, Message, MessageId, NewMessage, Order, Product, SenderType,
    Store, WorkspaceId,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const GENERIC_FALLBACK_REPLY: &str =
    "Thanks for your message! A member of our team will get back to you shortly.";

#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub system_prompt: String,
    pub history_limit: usize,
    pub model_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Replied,
    OrderCreated,
    /// The reply was committed but the provider rejected it.
    DeliveryFailed,
    /// Abandoned before commit; the batch stays unreplied for the next sweep.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub conversation_id: ConversationId,
    pub workspace_id: WorkspaceId,
    pub batch_size: usize,
    pub outcome: TurnOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_message_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The failure was a timeout or a retryable provider error.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub transient: bool,
}

pub struct TurnEngine {
    store: Store,
    model: Arc<dyn ChatModel>,
    dispatcher: Dispatcher,
    settings: TurnSettings,
}

impl TurnEngine {
    pub fn new(
        store: Store,
        model: Arc<dyn ChatModel>,
        dispatcher: Dispatcher,
        settings: TurnSettings,
    ) -> Self {
        Self {
            store,
            model,
            dispatcher,
            settings,
        }
    }

    /// Run one turn over `batch` (oldest first). The caller holds the
    /// conversation's processing lock.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(
            workspace_id = %conversation.workspace_id,
            conversation_id = %conversation.id,
            batch_size = batch.len(),
            model = %self.model.model(),
        )
    )]
    pub async fn run_turn(&self, conversation: &Conversation, batch: &[Message]) -> TurnReport {
        let mut report = TurnReport {
            conversation_id: conversation.id,
            workspace_id: conversation.workspace_id,
            batch_size: batch.len(),
            outcome: TurnOutcome::Failed,
            reply_message_id: None,
            order_number: None,
            error: None,
            transient: false,
        };
        match self.execute(conversation, batch).await {
            Ok(done) => {
                report.reply_message_id = Some(done.reply.id);
                report.order_number = done.order.as_ref().map(|o| o.order_number.clone());
                report.outcome = match (&done.delivery, done.order_created) {
                    (Delivery::Failed { error }, _) => {
                        report.error = Some(error.clone());
                        TurnOutcome::DeliveryFailed
                    }
                    (Delivery::Delivered { .. }, true) => TurnOutcome::OrderCreated,
                    (Delivery::Delivered { .. }, false) => TurnOutcome::Replied,
                };
                tracing::info!(
                    outcome = ?report.outcome,
                    order_number = ?report.order_number,
                    message_ids = ?batch.iter().map(|m| m.id.to_string()).collect::<Vec<_>>(),
                    "turn completed"
                );
            }
            Err(error) => {
                report.transient = is_transient(&error);
                let error = format!("{error:#}");
                if report.transient {
                    tracing::warn!(%error, "turn abandoned; batch left unreplied for the next sweep");
                } else {
                    tracing::error!(%error, "turn abandoned; batch left unreplied");
                }
                report.error = Some(error);
            }
        }
        report
    }

    async fn execute(&self, conversation: &Conversation, batch: &[Message]) -> Result<CommittedTurn> {
        let oldest = batch
            .first()
            .ok_or_else(|| anyhow!("turn started with an empty batch"))?;
        let backlog = self.store.unreplied_backlog(conversation.id).await?;
        let anchor = backlog.first().map_or(oldest.id, |m| m.id);
        // Unreplied messages older than the batch are answered by this reply
        // too, which moves the next turn's anchor forward.
        let stale: Vec<MessageId> = backlog
            .iter()
            .take_while(|m| m.id != oldest.id && m.created_at <= oldest.created_at)
            .map(|m| m.id)
            .collect();
        let history = self
            .store
            .recent_history(conversation.id, self.settings.history_limit)
            .await?;
        let catalog = self
            .store
            .get_active_products(conversation.workspace_id)
            .await?;
        let prompt = build_prompt(&self.settings.system_prompt, &history, &catalog);
        let tools = [create_order_tool()];

        let response = tokio::time::timeout(
            self.settings.model_timeout,
            self.model.chat(&prompt, &tools),
        )
        .await
        .map_err(|elapsed| {
            anyhow::Error::new(elapsed).context(format!(
                "model call timed out after {}s",
                self.settings.model_timeout.as_secs_f64()
            ))
        })??;

        let mut order = None;
        let mut order_created = false;
        if let Some(intent) = extract_order_intent(&response.message.tool_calls) {
            if let Some(inserted) =
                orders::materialize(&self.store, conversation, anchor, &intent, &catalog).await?
            {
                order_created = inserted.was_created();
                order = Some(inserted.into_order());
            }
        }

        let reply_text = compose_reply(&response.message.content, order.as_ref(), &catalog);
        let answered = stale.into_iter().chain(batch.iter().map(|m| m.id)).collect();
        let reply = self
            .store
            .record_outbound(
                conversation.id,
                NewMessage::outbound(reply_text, SenderType::Ai, Utc::now()),
                answered,
            )
            .await?;
        let delivery = self.dispatcher.deliver(conversation, &reply).await?;
        Ok(CommittedTurn {
            reply,
            order,
            order_created,
            delivery,
        })
    }
}

fn is_transient(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause.is::<tokio::time::error::Elapsed>()
            || cause
                .downcast_ref::<LlmError>()
                .is_some_and(LlmError::is_transient)
    })
}

struct CommittedTurn {
    reply: Message,
    order: Option<Order>,
    order_created: bool,
    delivery: Delivery,
}

pub fn create_order_tool() -> ToolDefinition {
    ToolDefinition {
        name: CREATE_ORDER_TOOL.to_string(),
        description: "Place an order for one catalog product once the customer has provided \
                      their full name, phone number and delivery address."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "product_name": {
                    "type": "string",
                    "description": "Product name exactly as listed in the catalog."
                },
                "quantity": {
                    "type": "integer",
                    "minimum": 1,
                    "description": "Number of units, 1 when not stated."
                },
                "customer_name": { "type": "string" },
                "customer_phone": { "type": "string" },
                "customer_address": { "type": "string" }
            },
            "required": ["product_name", "customer_name", "customer_phone", "customer_address"]
        }),
    }
}

/// First complete `create_order` call wins; anything else is ignored.
fn extract_order_intent(tool_calls: &[ToolCall]) -> Option<OrderIntent> {
    tool_calls
        .iter()
        .filter(|call| call.name == CREATE_ORDER_TOOL)
        .find_map(|call| OrderIntent::from_tool_arguments(&call.arguments))
}

fn build_prompt(system_prompt: &str, history: &[Message], catalog: &[Product]) -> Vec<ChatMessage> {
    let mut system = system_prompt.trim().to_string();
    system.push_str("\n\nCatalog:\n");
    if catalog.is_empty() {
        system.push_str("(no products available)\n");
    }
    for product in catalog {
        system.push_str(&catalog_line(product));
        system.push('\n');
    }

    let notes: Vec<&str> = history
        .iter()
        .filter(|m| m.sender_type == SenderType::System)
        .map(|m| m.content.trim())
        .filter(|c| !c.is_empty())
        .collect();
    if !notes.is_empty() {
        system.push_str("\nConversation notes:\n");
        for note in notes {
            system.push_str("- ");
            system.push_str(note);
            system.push('\n');
        }
    }

    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(ChatMessage::system(system.trim_end()));
    for message in history {
        match message.sender_type {
            SenderType::Customer => messages.push(ChatMessage::user(message.content.clone())),
            SenderType::Agent | SenderType::Ai => {
                messages.push(ChatMessage::assistant(message.content.clone()))
            }
            SenderType::System => {}
        }
    }
    messages
}

fn catalog_line(product: &Product) -> String {
    let description = product.description.trim();
    if description.is_empty() {
        format!("- {} — {}", product.name.trim(), product.price)
    } else {
        format!("- {} — {} — {}", product.name.trim(), description, product.price)
    }
}

fn compose_reply(model_text: &str, order: Option<&Order>, catalog: &[Product]) -> String {
    let text = model_text.trim();
    if !text.is_empty() {
        return text.to_string();
    }
    if let Some(order) = order {
        let product = catalog
            .iter()
            .find(|p| p.id == order.product_id)
            .map(|p| p.name.trim())
            .unwrap_or("your item");
        return format!(
            "Thank you {}! Your order {} is confirmed: {} x {}, total {}.",
            order.customer_name, order.order_number, order.quantity, product, order.price
        );
    }
    GENERIC_FALLBACK_REPLY.to_string()
}
