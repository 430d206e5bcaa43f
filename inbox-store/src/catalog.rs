use crate::db::Store;
use crate::error::Result;
use crate::models::{Product, WorkspaceId, parse_decimal};
use rusqlite::{Row, params};

fn product_from_row(row: &Row<'_>) -> rusqlite::Result<Product> {
    let price: String = row.get(4)?;
    Ok(Product {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        price: parse_decimal(&price)?,
        stock: row.get(5)?,
        is_active: row.get(6)?,
    })
}

impl Store {
    pub async fn upsert_product(&self, product: &Product) -> Result<()> {
        let product = product.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO products (id, workspace_id, name, description, price, stock, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     description = excluded.description,
                     price = excluded.price,
                     stock = excluded.stock,
                     is_active = excluded.is_active",
                params![
                    product.id,
                    product.workspace_id,
                    product.name,
                    product.description,
                    product.price.to_string(),
                    product.stock,
                    product.is_active,
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Active catalog for one workspace, sorted by name.
    pub async fn get_active_products(&self, workspace_id: WorkspaceId) -> Result<Vec<Product>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, workspace_id, name, description, price, stock, is_active
                 FROM products
                 WHERE workspace_id = ?1 AND is_active = 1
                 ORDER BY name ASC",
            )?;
            let rows = stmt.query_map(params![workspace_id], product_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}
