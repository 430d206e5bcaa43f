use crate::db::Store;
use crate::error::{Result, StoreError};
use crate::models::{
    ConversationId, NewOrder, Order, OrderId, OrderInsert, OrderStatus, from_millis, parse_decimal,
    to_millis,
};
use rust_decimal::Decimal;
use rusqlite::{Connection, OptionalExtension, Row, params};

const ORDER_COLUMNS: &str = "id, order_number, workspace_id, conversation_id, product_id, \
     quantity, customer_name, customer_phone, customer_address, unit_price, price, status, \
     created_by, turn_key, created_at";

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    let unit_price: String = row.get(9)?;
    let price: String = row.get(10)?;
    Ok(Order {
        id: row.get(0)?,
        order_number: row.get(1)?,
        workspace_id: row.get(2)?,
        conversation_id: row.get(3)?,
        product_id: row.get(4)?,
        quantity: row.get(5)?,
        customer_name: row.get(6)?,
        customer_phone: row.get(7)?,
        customer_address: row.get(8)?,
        unit_price: parse_decimal(&unit_price)?,
        price: parse_decimal(&price)?,
        status: row.get(11)?,
        created_by: row.get(12)?,
        turn_key: row.get(13)?,
        created_at: from_millis(row.get(14)?)?,
    })
}

fn order_by_turn_key(conn: &Connection, turn_key: &str) -> Result<Option<Order>> {
    Ok(conn
        .query_row(
            &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE turn_key = ?1"),
            params![turn_key],
            order_from_row,
        )
        .optional()?)
}

impl Store {
    /// Insert-once keyed on `turn_key`. A replayed turn reads back the order
    /// it created the first time instead of writing a second one.
    pub async fn insert_order_once(&self, order: NewOrder) -> Result<OrderInsert> {
        if order.quantity < 1 {
            return Err(StoreError::InvalidInput(format!(
                "order quantity must be positive, got {}",
                order.quantity
            )));
        }
        let price = order
            .unit_price
            .checked_mul(Decimal::from(order.quantity))
            .ok_or_else(|| StoreError::InvalidInput("order price overflow".to_string()))?;
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "INSERT INTO orders (id, order_number, workspace_id, conversation_id, product_id,
                     quantity, customer_name, customer_phone, customer_address, unit_price, price,
                     status, created_by, turn_key, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(turn_key) DO NOTHING",
                params![
                    OrderId::new(),
                    order.order_number,
                    order.workspace_id,
                    order.conversation_id,
                    order.product_id,
                    order.quantity,
                    order.customer_name,
                    order.customer_phone,
                    order.customer_address,
                    order.unit_price.to_string(),
                    price.to_string(),
                    OrderStatus::Pending,
                    order.created_by,
                    order.turn_key,
                    to_millis(order.created_at),
                ],
            )?;
            let stored = order_by_turn_key(&tx, &order.turn_key)?
                .ok_or_else(|| StoreError::not_found("order", &order.turn_key))?;
            tx.commit()?;
            Ok(if changed == 1 {
                OrderInsert::Created(stored)
            } else {
                OrderInsert::Existing(stored)
            })
        })
        .await
    }

    pub async fn get_order_by_turn_key(&self, turn_key: &str) -> Result<Option<Order>> {
        let turn_key = turn_key.to_string();
        self.call(move |conn| order_by_turn_key(conn, &turn_key)).await
    }

    pub async fn list_orders_for_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<Order>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC"
            ))?;
            let rows = stmt.query_map(params![conversation_id], order_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderCreatedBy, Product, ProductId, Workspace};
    use chrono::Utc;
    use inbox_channels::Channel;

    async fn setup() -> (Store, NewOrder) {
        let store = Store::open_in_memory().expect("store");
        let ws = Workspace::new("shop", Utc::now());
        store.upsert_workspace(&ws).await.expect("workspace");
        let conversation = store
            .resolve_conversation(ws.id, Channel::Whatsapp, "970567900601", None, Utc::now())
            .await
            .expect("conversation");
        let product = Product {
            id: ProductId::new(),
            workspace_id: ws.id,
            name: "كريم مرطب".to_string(),
            description: String::new(),
            price: Decimal::from(50),
            stock: None,
            is_active: true,
        };
        store.upsert_product(&product).await.expect("product");
        let order = NewOrder {
            order_number: "ORD-0000000001".to_string(),
            workspace_id: ws.id,
            conversation_id: conversation.id,
            product_id: product.id,
            quantity: 2,
            customer_name: "أسامة عبدو".to_string(),
            customer_phone: "0567900601".to_string(),
            customer_address: "طولكرم".to_string(),
            unit_price: product.price,
            created_by: OrderCreatedBy::Ai,
            turn_key: format!("{}:first", conversation.id),
            created_at: Utc::now(),
        };
        (store, order)
    }

    #[tokio::test]
    async fn replayed_turn_returns_existing_order() {
        let (store, order) = setup().await;
        let first = store.insert_order_once(order.clone()).await.expect("first");
        assert!(first.was_created());
        assert_eq!(first.order().price, Decimal::from(100));
        assert_eq!(first.order().status, OrderStatus::Pending);

        let replay = NewOrder {
            quantity: 5,
            ..order.clone()
        };
        let second = store.insert_order_once(replay).await.expect("replay");
        assert!(!second.was_created());
        assert_eq!(second.order(), first.order());

        let orders = store
            .list_orders_for_conversation(order.conversation_id)
            .await
            .expect("list");
        assert_eq!(orders.len(), 1);
    }

    #[tokio::test]
    async fn non_positive_quantity_is_rejected() {
        let (store, order) = setup().await;
        let err = store
            .insert_order_once(NewOrder { quantity: 0, ..order })
            .await
            .expect_err("zero quantity");
        assert!(matches!(err, StoreError::InvalidInput(_)));
    }
}
