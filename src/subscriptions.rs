//! Subscription management: validated subscribe, unsubscribe, and JSON
//! import/export of subscription settings.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetcher::{FetchRequest, MediaFetcher};
use crate::model::{Millis, Subscription, TimeRange, new_id, now_millis};
use crate::store::subscriptions::{self, SubscriptionUpdate};
use crate::store::tasks;
use crate::sync::cleanup::{self, CleanupReport};

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub account_id: String,
    pub time_range: TimeRange,
    pub min_engagement: Option<i64>,
    pub auto_download: bool,
}

fn validate_threshold(min_engagement: Option<i64>) -> Result<()> {
    match min_engagement {
        Some(min) if min < 0 => Err(Error::Validation(format!(
            "min_engagement must not be negative (got {min})"
        ))),
        _ => Ok(()),
    }
}

/// Subscribe to an account after checking the media API knows it.
///
/// The probe asks for a single post; the account's display name and avatar
/// come from it.
pub async fn subscribe(
    pool: &SqlitePool,
    fetcher: &dyn MediaFetcher,
    cfg: &Config,
    new: &NewSubscription,
) -> Result<Subscription> {
    let account_id = new.account_id.trim();
    if account_id.is_empty() {
        return Err(Error::Validation("account id must not be empty".into()));
    }
    validate_threshold(new.min_engagement)?;
    if subscriptions::get_by_account(pool, account_id).await?.is_some() {
        return Err(Error::Validation(format!(
            "account {account_id} is already subscribed"
        )));
    }

    let probe = fetcher
        .fetch(&FetchRequest {
            account_id: account_id.to_string(),
            range: None,
            limit: Some(1),
        })
        .await?;
    if !probe.is_success(&cfg.api.success_marker) {
        return Err(Error::Validation(format!(
            "media API rejected account {account_id}: {}",
            probe.message
        )));
    }
    let Some(first) = probe.items.first() else {
        return Err(Error::Validation(format!(
            "account {account_id} has no posts, cannot verify it"
        )));
    };

    let now = now_millis();
    let subscription = Subscription {
        id: new_id(),
        account_id: account_id.to_string(),
        display_name: if first.nickname.is_empty() {
            account_id.to_string()
        } else {
            first.nickname.clone()
        },
        avatar_url: Some(first.cover_url.clone()).filter(|u| !u.is_empty()),
        enabled: true,
        time_range: new.time_range,
        min_engagement: new.min_engagement,
        auto_download: new.auto_download,
        last_sync_time: None,
        last_seen_media_id: None,
        total_media_count: 0,
        downloaded_count: 0,
        created_at: now,
        updated_at: now,
    };
    subscriptions::insert(pool, &subscription).await?;
    tracing::info!(
        subscription_id = %subscription.id,
        account_id,
        name = %subscription.display_name,
        "subscribed"
    );
    Ok(subscription)
}

pub async fn update(pool: &SqlitePool, id: &str, update: &SubscriptionUpdate) -> Result<Subscription> {
    if let Some(threshold) = update.min_engagement {
        validate_threshold(threshold)?;
    }
    let updated = subscriptions::update(pool, id, update).await?;
    tracing::info!(subscription_id = id, "subscription updated");
    Ok(updated)
}

/// Remove a subscription. History goes with it; tasks and files stay unless
/// asked for.
pub async fn unsubscribe(
    pool: &SqlitePool,
    cfg: &Config,
    id: &str,
    delete_tasks: bool,
    delete_files: bool,
) -> Result<CleanupReport> {
    let subscription = subscriptions::require(pool, id).await?;
    let report = if delete_tasks || delete_files {
        cleanup::clear_subscription(pool, cfg, id, delete_files).await?
    } else {
        CleanupReport::default()
    };
    subscriptions::delete(pool, id).await?;
    tracing::info!(
        subscription_id = id,
        account_id = %subscription.account_id,
        tasks_deleted = report.tasks_deleted,
        "unsubscribed"
    );
    Ok(report)
}

/// Portable subscription settings, without ids or runtime counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedSubscription {
    pub account_id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub time_range: TimeRange,
    #[serde(default)]
    pub min_engagement: Option<i64>,
    #[serde(default = "default_true")]
    pub auto_download: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExportDocument {
    pub version: u32,
    pub exported_at: Millis,
    pub subscriptions: Vec<ExportedSubscription>,
}

impl From<&Subscription> for ExportedSubscription {
    fn from(s: &Subscription) -> Self {
        Self {
            account_id: s.account_id.clone(),
            display_name: s.display_name.clone(),
            avatar_url: s.avatar_url.clone(),
            enabled: s.enabled,
            time_range: s.time_range,
            min_engagement: s.min_engagement,
            auto_download: s.auto_download,
        }
    }
}

impl ExportedSubscription {
    fn into_subscription(self) -> Subscription {
        let now = now_millis();
        Subscription {
            id: new_id(),
            account_id: self.account_id,
            display_name: self.display_name,
            avatar_url: self.avatar_url,
            enabled: self.enabled,
            time_range: self.time_range,
            min_engagement: self.min_engagement,
            auto_download: self.auto_download,
            last_sync_time: None,
            last_seen_media_id: None,
            total_media_count: 0,
            downloaded_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

pub async fn export_subscriptions(pool: &SqlitePool, path: &Path) -> Result<usize> {
    let doc = ExportDocument {
        version: 1,
        exported_at: now_millis(),
        subscriptions: subscriptions::list(pool)
            .await?
            .iter()
            .map(ExportedSubscription::from)
            .collect(),
    };
    let json = serde_json::to_string_pretty(&doc)
        .map_err(|e| Error::Validation(format!("failed to encode export: {e}")))?;
    tokio::fs::write(path, json).await?;
    tracing::info!(path = %path.display(), count = doc.subscriptions.len(), "subscriptions exported");
    Ok(doc.subscriptions.len())
}

/// What to do with an imported record whose account is already subscribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ImportMode {
    #[default]
    Skip,
    Overwrite,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
}

pub async fn import_subscriptions(
    pool: &SqlitePool,
    path: &Path,
    mode: ImportMode,
) -> Result<ImportReport> {
    let content = tokio::fs::read_to_string(path).await?;
    let doc: ExportDocument = serde_json::from_str(&content)
        .map_err(|e| Error::Validation(format!("invalid import file {}: {e}", path.display())))?;

    let mut report = ImportReport::default();
    for record in doc.subscriptions {
        if record.account_id.trim().is_empty() {
            tracing::warn!("import record without account id, skipped");
            report.skipped += 1;
            continue;
        }
        validate_threshold(record.min_engagement)?;

        let exists = subscriptions::get_by_account(pool, &record.account_id)
            .await?
            .is_some();
        match (exists, mode) {
            (false, _) => {
                subscriptions::insert(pool, &record.into_subscription()).await?;
                report.added += 1;
            }
            (true, ImportMode::Overwrite) => {
                subscriptions::overwrite_settings(pool, &record.into_subscription()).await?;
                report.updated += 1;
            }
            (true, ImportMode::Skip) => {
                tracing::debug!(account_id = %record.account_id, "already subscribed, skipped");
                report.skipped += 1;
            }
        }
    }
    tracing::info!(
        path = %path.display(),
        added = report.added,
        updated = report.updated,
        skipped = report.skipped,
        "subscriptions imported"
    );
    Ok(report)
}

/// Subscription plus how many of its tasks exist, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionOverview {
    #[serde(flatten)]
    pub subscription: Subscription,
    pub task_count: usize,
}

pub async fn overview(pool: &SqlitePool) -> Result<Vec<SubscriptionOverview>> {
    let mut out = Vec::new();
    for subscription in subscriptions::list(pool).await? {
        let task_count = tasks::list_for_account(pool, &subscription.account_id)
            .await?
            .len();
        out.push(SubscriptionOverview {
            subscription,
            task_count,
        });
    }
    Ok(out)
}
