//! 模块管理门面
//!
//! 组织维度的模块安装管理：安装记录与运行时实例保持一致。
//! 安装ID属于其他租户时一律视为不存在。
//! 同一 (租户, 插件) 上的安装和卸载串行执行，每个键最多一条安装记录。

use super::installations::{InstallationRecord, InstallationSource};
use crate::plugins::lifecycle::{PluginRuntime, TransitionOutcome};
use crate::types::{InstanceKey, PluginConfig, TenantId};
use crate::{Result, RuntimeError};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// 默认试用天数
pub const DEFAULT_TRIAL_DAYS: i64 = 14;

/// 模块管理器
pub struct ModuleManager {
    runtime: Arc<PluginRuntime>,
    installations: DashMap<Uuid, InstallationRecord>,
    key_locks: DashMap<InstanceKey, Arc<Mutex<()>>>,
    trial_days: i64,
}

impl ModuleManager {
    pub fn new(runtime: Arc<PluginRuntime>, trial_days: i64) -> Self {
        Self {
            runtime,
            installations: DashMap::new(),
            key_locks: DashMap::new(),
            trial_days,
        }
    }

    pub fn runtime(&self) -> &Arc<PluginRuntime> {
        &self.runtime
    }

    /// 安装模块并加载实例，同一租户重复安装返回已有记录
    pub async fn install(
        &self,
        tenant_id: TenantId,
        plugin_id: &str,
        settings: PluginConfig,
        start_trial: bool,
    ) -> Result<InstallationRecord> {
        let lock = self.key_lock(InstanceKey::new(plugin_id, tenant_id));
        let _guard = lock.lock().await;

        if let Some(existing) = self.find(tenant_id, plugin_id) {
            return Ok(existing);
        }

        let instance = self.runtime.load(plugin_id, tenant_id, settings).await?;

        let mut record = InstallationRecord::new(tenant_id, plugin_id, instance.plugin_version);
        // 实例可能早已驻留，记录以实例的实际配置为准
        record.settings = instance.config;
        if start_trial {
            record.trial_ends_at = Some(Utc::now() + chrono::Duration::days(self.trial_days));
        }
        self.installations.insert(record.installation_id, record.clone());

        info!(
            "Module '{}' installed for tenant {} as {}",
            plugin_id, tenant_id, record.installation_id
        );
        Ok(record)
    }

    /// 启用模块；实例不在内存中（例如重启后）时按记录重新加载
    pub async fn activate(&self, tenant_id: TenantId, installation_id: Uuid) -> Result<InstallationRecord> {
        let record = self.get(tenant_id, installation_id)?;
        let outcome = self.runtime.activate(&record.plugin_id, tenant_id).await?;
        if outcome == TransitionOutcome::NotLoaded {
            self.runtime
                .load(&record.plugin_id, tenant_id, record.settings.clone())
                .await?;
        }
        self.update(installation_id, |record| record.active = true)
    }

    pub async fn deactivate(&self, tenant_id: TenantId, installation_id: Uuid) -> Result<InstallationRecord> {
        let record = self.get(tenant_id, installation_id)?;
        self.runtime.deactivate(&record.plugin_id, tenant_id).await?;
        self.update(installation_id, |record| record.active = false)
    }

    /// 更新模块配置；实例不在内存中时先按记录恢复
    pub async fn update_config(
        &self,
        tenant_id: TenantId,
        installation_id: Uuid,
        settings: PluginConfig,
    ) -> Result<InstallationRecord> {
        let record = self.get(tenant_id, installation_id)?;
        self.ensure_loaded(&record).await?;
        self.runtime
            .reconfigure(&record.plugin_id, tenant_id, settings.clone())
            .await?;

        let applied = self
            .runtime
            .get(&record.plugin_id, tenant_id)
            .map_or(settings, |instance| instance.config);
        self.update(installation_id, move |record| record.settings = applied)
    }

    /// 卸载模块并删除记录
    pub async fn uninstall(&self, tenant_id: TenantId, installation_id: Uuid) -> Result<InstallationRecord> {
        let record = self.get(tenant_id, installation_id)?;
        let lock = self.key_lock(record.key());
        let _guard = lock.lock().await;

        self.runtime.unload(&record.plugin_id, tenant_id).await?;
        self.installations.remove(&installation_id);
        info!(
            "Module '{}' uninstalled for tenant {}",
            record.plugin_id, tenant_id
        );
        Ok(record)
    }

    pub async fn execute_method(
        &self,
        tenant_id: TenantId,
        plugin_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.runtime
            .execute_method(plugin_id, tenant_id, method, args)
            .await
    }

    /// 按租户查询安装记录
    pub fn get(&self, tenant_id: TenantId, installation_id: Uuid) -> Result<InstallationRecord> {
        self.installations
            .get(&installation_id)
            .filter(|record| record.tenant_id == tenant_id)
            .map(|record| record.value().clone())
            .ok_or_else(|| RuntimeError::InstallationNotFound {
                installation_id: installation_id.to_string(),
            })
    }

    /// 租户的全部安装记录，按插件ID排序
    pub fn list(&self, tenant_id: TenantId) -> Vec<InstallationRecord> {
        let mut records: Vec<InstallationRecord> = self
            .installations
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        records
    }

    /// 导入已有记录（例如启动时从配置文件读入），不加载实例
    pub fn import(&self, records: impl IntoIterator<Item = InstallationRecord>) -> usize {
        let mut imported = 0;
        for record in records {
            self.installations.insert(record.installation_id, record);
            imported += 1;
        }
        imported
    }

    fn key_lock(&self, key: InstanceKey) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 按记录恢复实例，保持记录中的启用状态
    async fn ensure_loaded(&self, record: &InstallationRecord) -> Result<()> {
        if self.runtime.is_loaded(&record.plugin_id, record.tenant_id) {
            return Ok(());
        }
        self.runtime
            .load(&record.plugin_id, record.tenant_id, record.settings.clone())
            .await?;
        if !record.active {
            self.runtime
                .deactivate(&record.plugin_id, record.tenant_id)
                .await?;
        }
        info!(
            "Restored module '{}' for tenant {} from installation {}",
            record.plugin_id, record.tenant_id, record.installation_id
        );
        Ok(())
    }

    fn find(&self, tenant_id: TenantId, plugin_id: &str) -> Option<InstallationRecord> {
        self.installations
            .iter()
            .find(|entry| entry.tenant_id == tenant_id && entry.plugin_id == plugin_id)
            .map(|entry| entry.value().clone())
    }

    fn update<F>(&self, installation_id: Uuid, apply: F) -> Result<InstallationRecord>
    where
        F: FnOnce(&mut InstallationRecord),
    {
        let mut record = self
            .installations
            .get_mut(&installation_id)
            .ok_or_else(|| RuntimeError::InstallationNotFound {
                installation_id: installation_id.to_string(),
            })?;
        apply(record.value_mut());
        Ok(record.value().clone())
    }
}

#[async_trait]
impl InstallationSource for ModuleManager {
    async fn installations(&self) -> Result<Vec<InstallationRecord>> {
        let mut records: Vec<InstallationRecord> = self
            .installations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| (record.tenant_id, record.plugin_id.clone()));
        Ok(records)
    }
}
