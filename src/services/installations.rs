//! 安装记录与冷启动对账
//!
//! 运行时的实例表只存在于内存中，进程重启后为空。宿主在开始服务之前，
//! 用持久化的安装记录重放 `load`（必要时再 `deactivate`）恢复实例。

use crate::plugins::lifecycle::PluginRuntime;
use crate::types::{InstanceKey, PluginConfig, PluginId, TenantId};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// 租户的一条安装记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationRecord {
    #[serde(default = "Uuid::new_v4")]
    pub installation_id: Uuid,
    pub tenant_id: TenantId,
    pub plugin_id: PluginId,
    pub installed_version: Version,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub trial_ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub settings: PluginConfig,
}

fn default_active() -> bool {
    true
}

impl InstallationRecord {
    pub fn new(tenant_id: TenantId, plugin_id: impl Into<PluginId>, installed_version: Version) -> Self {
        Self {
            installation_id: Uuid::new_v4(),
            tenant_id,
            plugin_id: plugin_id.into(),
            installed_version,
            active: true,
            trial_ends_at: None,
            settings: PluginConfig::new(),
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.plugin_id.clone(), self.tenant_id)
    }

    /// 试用期是否仍未结束
    pub fn in_trial(&self, now: DateTime<Utc>) -> bool {
        self.trial_ends_at.map_or(false, |ends_at| now < ends_at)
    }
}

/// 安装记录来源，由持有持久化数据的外部协作者实现
#[async_trait]
pub trait InstallationSource: Send + Sync {
    async fn installations(&self) -> Result<Vec<InstallationRecord>>;
}

/// 固定列表的记录来源，通常来自配置文件
#[derive(Debug, Clone, Default)]
pub struct StaticInstallationSource {
    records: Vec<InstallationRecord>,
}

impl StaticInstallationSource {
    pub fn new(records: Vec<InstallationRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl InstallationSource for StaticInstallationSource {
    async fn installations(&self) -> Result<Vec<InstallationRecord>> {
        Ok(self.records.clone())
    }
}

/// 单条记录的对账失败
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileFailure {
    pub installation_id: Uuid,
    pub key: InstanceKey,
    pub error: String,
}

/// 对账结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub loaded: Vec<InstanceKey>,
    pub deactivated: Vec<InstanceKey>,
    pub failed: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// 按安装记录恢复实例
///
/// 单条记录失败（插件未注册、配置无效、加载失败）只记入报告，不影响其余记录。
pub async fn reconcile(
    runtime: &PluginRuntime,
    source: &dyn InstallationSource,
) -> Result<ReconcileReport> {
    let records = source.installations().await?;
    info!("Reconciling {} installation record(s)", records.len());

    let mut report = ReconcileReport::default();
    for record in records {
        let key = record.key();

        if let Ok(metadata) = runtime.registry().get(&record.plugin_id) {
            if metadata.version != record.installed_version {
                warn!(
                    "Installation {} of '{}' records v{} but v{} is registered",
                    record.installation_id, key, record.installed_version, metadata.version
                );
            }
        }

        if let Err(e) = runtime
            .load(&record.plugin_id, record.tenant_id, record.settings.clone())
            .await
        {
            warn!("Failed to restore installation {} ({}): {}", record.installation_id, key, e);
            report.failed.push(ReconcileFailure {
                installation_id: record.installation_id,
                key,
                error: e.to_string(),
            });
            continue;
        }
        report.loaded.push(key.clone());

        if !record.active {
            match runtime.deactivate(&record.plugin_id, record.tenant_id).await {
                Ok(_) => report.deactivated.push(key),
                Err(e) => report.failed.push(ReconcileFailure {
                    installation_id: record.installation_id,
                    key,
                    error: e.to_string(),
                }),
            }
        }
    }

    info!(
        "Reconciliation finished: {} loaded, {} deactivated, {} failed",
        report.loaded.len(),
        report.deactivated.len(),
        report.failed.len()
    );
    Ok(report)
}
