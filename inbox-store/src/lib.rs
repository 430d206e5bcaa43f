//! SQLite-backed shared state for the inbox pipeline.
//!
//! Conversation creation, message dedup-insert, lock acquisition and order
//! insertion are each one conditional statement, so overlapping webhook
//! requests and sweeps cannot race each other into duplicates.

mod catalog;
mod conversations;
mod db;
mod error;
mod locks;
mod messages;
mod models;
mod orders;
mod workspaces;

pub use conversations::ReplyCandidate;
pub use db::Store;
pub use error::{Result, StoreError};
pub use messages::{INTERRUPTED_DELIVERY, ImportSummary};
pub use models::{
    ChannelIntegration, Conversation, ConversationId, DeliveryStatus, Lease, Message, MessageId,
    NewMessage, NewOrder, Order, OrderCreatedBy, OrderId, OrderInsert, OrderStatus, Product,
    ProductId, SenderType, Workspace, WorkspaceId,
};
