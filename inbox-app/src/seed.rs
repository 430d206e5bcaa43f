//! Development fixtures: workspaces, channel integrations and catalog
//! products loaded from TOML, standing in for the onboarding and catalog
//! services that own this data in production.

use anyhow::{Context, Result};
use chrono::Utc;
use inbox_channels::{Channel, ChannelCredentials};
use inbox_store::{ChannelIntegration, Product, ProductId, Store, Workspace, WorkspaceId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct SeedFile {
    #[serde(default)]
    pub workspaces: Vec<SeedWorkspace>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedWorkspace {
    pub id: WorkspaceId,
    pub name: String,
    #[serde(default)]
    pub default_ai_enabled: bool,
    #[serde(default)]
    pub ai_agent_id: Option<String>,
    #[serde(default)]
    pub reply_lookback_seconds: Option<i64>,
    #[serde(default)]
    pub settle_seconds: Option<i64>,
    #[serde(default)]
    pub integrations: Vec<SeedIntegration>,
    #[serde(default)]
    pub products: Vec<SeedProduct>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedIntegration {
    pub channel: String,
    #[serde(default = "default_true")]
    pub connected: bool,
    #[serde(default)]
    pub external_account_id: Option<String>,
    #[serde(default)]
    pub credentials: ChannelCredentials,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedProduct {
    pub id: ProductId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Decimal string, e.g. `"49.90"`.
    pub price: String,
    #[serde(default)]
    pub stock: Option<i64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub workspaces: usize,
    pub integrations: usize,
    pub products: usize,
}

impl SeedFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read seed file {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse seed file {}", path.display()))
    }
}

/// Upsert everything in `seed`. Re-running the same file is a no-op apart
/// from refreshed timestamps.
pub async fn apply(store: &Store, seed: &SeedFile) -> Result<SeedReport> {
    let mut report = SeedReport::default();
    for ws in &seed.workspaces {
        let mut workspace = Workspace::new(ws.name.trim(), Utc::now())
            .with_id(ws.id)
            .with_default_ai(ws.default_ai_enabled, ws.ai_agent_id.clone());
        workspace.reply_lookback_seconds = ws.reply_lookback_seconds;
        workspace.settle_seconds = ws.settle_seconds;
        store.upsert_workspace(&workspace).await?;
        report.workspaces += 1;

        for integration in &ws.integrations {
            let channel: Channel = integration
                .channel
                .parse()
                .with_context(|| format!("workspace {}", ws.id))?;
            store
                .upsert_integration(&ChannelIntegration {
                    workspace_id: ws.id,
                    channel,
                    is_connected: integration.connected,
                    external_account_id: integration
                        .external_account_id
                        .as_deref()
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string),
                    credentials: integration.credentials.clone(),
                    updated_at: Utc::now(),
                })
                .await?;
            report.integrations += 1;
        }

        for product in &ws.products {
            let price: Decimal = product
                .price
                .trim()
                .parse()
                .with_context(|| format!("product {:?} has invalid price", product.name))?;
            store
                .upsert_product(&Product {
                    id: product.id,
                    workspace_id: ws.id,
                    name: product.name.trim().to_string(),
                    description: product.description.trim().to_string(),
                    price,
                    stock: product.stock,
                    is_active: product.is_active,
                })
                .await?;
            report.products += 1;
        }
    }
    tracing::info!(
        workspaces = report.workspaces,
        integrations = report.integrations,
        products = report.products,
        "seed applied"
    );
    Ok(report)
}
