//! Order materializer: turns a `create_order` tool call into at most one
//! persisted order per customer turn.

use anyhow::Result;
use chrono::Utc;
use inbox_store::{
    Conversation, ConversationId, MessageId, NewOrder, OrderCreatedBy, OrderInsert, Product, Store,
};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const CREATE_ORDER_TOOL: &str = "create_order";

const ORDER_NUMBER_HEX_LEN: usize = 10;

/// A complete purchase request extracted from one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderIntent {
    pub product_name: String,
    pub quantity: i64,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_address: String,
}

#[derive(Debug, Default, Deserialize)]
struct CreateOrderArgs {
    #[serde(default)]
    product_name: Option<String>,
    #[serde(default)]
    quantity: Option<Value>,
    #[serde(default)]
    customer_name: Option<String>,
    #[serde(default)]
    customer_phone: Option<String>,
    #[serde(default)]
    customer_address: Option<String>,
}

impl OrderIntent {
    /// `None` unless product, name, phone and address are all present.
    pub fn from_tool_arguments(raw: &str) -> Option<Self> {
        let args: CreateOrderArgs = match serde_json::from_str(raw) {
            Ok(args) => args,
            Err(error) => {
                tracing::warn!(%error, "ignoring unparseable create_order arguments");
                return None;
            }
        };
        Some(Self {
            product_name: non_blank(args.product_name)?,
            quantity: parse_quantity(args.quantity.as_ref()),
            customer_name: non_blank(args.customer_name)?,
            customer_phone: non_blank(args.customer_phone)?,
            customer_address: non_blank(args.customer_address)?,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_quantity(value: Option<&Value>) -> i64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.filter(|q| *q >= 1).unwrap_or(1)
}

/// Exact (case-insensitive) name first, then the longest catalog name that
/// contains or is contained in the request.
pub fn match_product<'a>(catalog: &'a [Product], requested: &str) -> Option<&'a Product> {
    let wanted = requested.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }
    if let Some(exact) = catalog
        .iter()
        .find(|p| p.name.trim().to_lowercase() == wanted)
    {
        return Some(exact);
    }
    catalog
        .iter()
        .filter(|p| {
            let name = p.name.trim().to_lowercase();
            !name.is_empty() && (wanted.contains(&name) || name.contains(&wanted))
        })
        .max_by_key(|p| p.name.trim().chars().count())
}

/// Idempotency key of a turn, anchored on the oldest message still awaiting
/// a reply. The anchor ignores the lookback window, so a retried turn derives
/// the same key even after that message has aged out of the batch.
pub fn turn_key(conversation_id: ConversationId, oldest_message_id: MessageId) -> String {
    format!("{conversation_id}:{oldest_message_id}")
}

pub fn order_number(turn_key: &str) -> String {
    let digest = hex::encode_upper(Sha256::digest(turn_key.as_bytes()));
    format!("ORD-{}", &digest[..ORDER_NUMBER_HEX_LEN])
}

/// `Ok(None)` when the requested product is not in the active catalog.
#[tracing::instrument(
    level = "info",
    skip_all,
    fields(
        workspace_id = %conversation.workspace_id,
        conversation_id = %conversation.id,
        %oldest_message_id,
    )
)]
pub async fn materialize(
    store: &Store,
    conversation: &Conversation,
    oldest_message_id: MessageId,
    intent: &OrderIntent,
    catalog: &[Product],
) -> Result<Option<OrderInsert>> {
    let Some(product) = match_product(catalog, &intent.product_name) else {
        tracing::info!(
            product_name = %intent.product_name,
            catalog_size = catalog.len(),
            "order intent discarded: product not in catalog"
        );
        return Ok(None);
    };
    let turn_key = turn_key(conversation.id, oldest_message_id);
    let inserted = store
        .insert_order_once(NewOrder {
            order_number: order_number(&turn_key),
            workspace_id: conversation.workspace_id,
            conversation_id: conversation.id,
            product_id: product.id,
            quantity: intent.quantity,
            customer_name: intent.customer_name.clone(),
            customer_phone: intent.customer_phone.clone(),
            customer_address: intent.customer_address.clone(),
            unit_price: product.price,
            created_by: OrderCreatedBy::Ai,
            turn_key,
            created_at: Utc::now(),
        })
        .await?;
    tracing::info!(
        order_number = %inserted.order().order_number,
        product_id = %product.id,
        created = inserted.was_created(),
        "order materialized"
    );
    Ok(Some(inserted))
}
