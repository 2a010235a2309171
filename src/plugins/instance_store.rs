//! 插件实例存储
//!
//! 以 (插件ID, 租户ID) 为键的并发实例表。每个键对应一个槽位：
//! - 槽位通过 `entry().or_insert_with` 原子地创建，同一键的所有操作都先锁住槽位；
//! - 槽位只有在仍被表引用时才有效，移除槽位必须在持有槽位锁时进行，
//!   拿到锁后发现槽位已失效的任务会重试；
//! - 查询只读槽位上的快照，不等待正在进行的插件调用。
//!
//! 因此不同键之间互不竞争，同一键上的操作是线性一致的。

use super::core::{InstanceStatus, Plugin, PluginContext};
use super::metadata::PluginMetadata;
use crate::types::{InstanceKey, PluginConfig, PluginId, TenantId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// 驻留的插件实例
pub struct PluginInstance {
    /// 插件对象，只有运行时通过槽位锁访问
    pub(crate) plugin: Box<dyn Plugin>,
    pub(crate) metadata: Arc<PluginMetadata>,
    /// 随实例一起释放
    pub(crate) context: PluginContext,
    pub(crate) status: InstanceStatus,
    pub(crate) loaded_at: DateTime<Utc>,
    pub(crate) last_used_at: Option<DateTime<Utc>>,
    pub(crate) usage_count: u64,
    pub(crate) failure_count: u64,
    pub(crate) last_error: Option<String>,
}

impl PluginInstance {
    pub(crate) fn new(plugin: Box<dyn Plugin>, metadata: Arc<PluginMetadata>, context: PluginContext) -> Self {
        Self {
            plugin,
            metadata,
            context,
            status: InstanceStatus::Active,
            loaded_at: Utc::now(),
            last_used_at: None,
            usage_count: 0,
            failure_count: 0,
            last_error: None,
        }
    }

    /// 更新状态，同时写入上下文，插件总是看到权威状态
    pub(crate) fn set_status(&mut self, status: InstanceStatus) {
        self.status = status;
        self.context.set_status(status);
    }

    pub(crate) fn record_failure(&mut self, message: String) {
        self.failure_count += 1;
        self.last_error = Some(message);
    }

    pub(crate) fn record_use(&mut self) {
        self.usage_count += 1;
        self.last_used_at = Some(Utc::now());
    }

    pub(crate) fn info(&self, key: &InstanceKey) -> PluginInstanceInfo {
        PluginInstanceInfo {
            plugin_id: key.plugin_id.clone(),
            tenant_id: key.tenant_id,
            plugin_name: self.metadata.name.clone(),
            plugin_version: self.metadata.version.clone(),
            status: self.status,
            loaded_at: self.loaded_at,
            last_used_at: self.last_used_at,
            usage_count: self.usage_count,
            failure_count: self.failure_count,
            last_error: self.last_error.clone(),
            config: self.context.config().clone(),
        }
    }
}

/// 实例的只读快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInstanceInfo {
    pub plugin_id: PluginId,
    pub tenant_id: TenantId,
    pub plugin_name: String,
    pub plugin_version: Version,
    pub status: InstanceStatus,
    pub loaded_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub failure_count: u64,
    pub last_error: Option<String>,
    pub config: PluginConfig,
}

impl PluginInstanceInfo {
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.plugin_id.clone(), self.tenant_id)
    }

    pub fn is_active(&self) -> bool {
        self.status == InstanceStatus::Active
    }
}

struct Slot {
    instance: Arc<Mutex<Option<PluginInstance>>>,
    snapshot: RwLock<Option<PluginInstanceInfo>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            instance: Arc::new(Mutex::new(None)),
            snapshot: RwLock::new(None),
        }
    }
}

/// 实例存储
#[derive(Default)]
pub struct InstanceStore {
    slots: DashMap<InstanceKey, Arc<Slot>>,
}

impl InstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 锁住键对应的槽位，不存在则原子地创建一个空槽位
    pub(crate) async fn lock_or_create(&self, key: &InstanceKey) -> SlotGuard<'_> {
        loop {
            let slot = self
                .slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::new()))
                .clone();
            let guard = slot.instance.clone().lock_owned().await;
            if self.is_current(key, &slot) {
                return SlotGuard {
                    store: self,
                    key: key.clone(),
                    slot,
                    guard,
                };
            }
        }
    }

    /// 锁住已驻留的实例，不存在时返回None
    pub(crate) async fn lock_existing(&self, key: &InstanceKey) -> Option<SlotGuard<'_>> {
        loop {
            let slot = self.slots.get(key)?.value().clone();
            let guard = slot.instance.clone().lock_owned().await;
            if !self.is_current(key, &slot) {
                continue;
            }
            let slot_guard = SlotGuard {
                store: self,
                key: key.clone(),
                slot,
                guard,
            };
            return if slot_guard.instance().is_some() {
                Some(slot_guard)
            } else {
                None
            };
        }
    }

    fn is_current(&self, key: &InstanceKey, slot: &Arc<Slot>) -> bool {
        self.slots
            .get(key)
            .map_or(false, |current| Arc::ptr_eq(current.value(), slot))
    }

    /// 实例快照
    pub fn get(&self, key: &InstanceKey) -> Option<PluginInstanceInfo> {
        let slot = self.slots.get(key)?.value().clone();
        let snapshot = slot.snapshot.read().clone();
        snapshot
    }

    pub fn contains(&self, key: &InstanceKey) -> bool {
        self.get(key).is_some()
    }

    /// 某租户的全部实例，按插件ID排序
    pub fn list_for_tenant(&self, tenant_id: TenantId) -> Vec<PluginInstanceInfo> {
        let slots: Vec<Arc<Slot>> = self
            .slots
            .iter()
            .filter(|entry| entry.key().tenant_id == tenant_id)
            .map(|entry| entry.value().clone())
            .collect();

        let mut infos: Vec<PluginInstanceInfo> = slots
            .iter()
            .filter_map(|slot| slot.snapshot.read().clone())
            .collect();
        infos.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        infos
    }

    /// 全部驻留实例的键
    pub fn keys(&self) -> Vec<InstanceKey> {
        let slots: Vec<(InstanceKey, Arc<Slot>)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut keys: Vec<InstanceKey> = slots
            .into_iter()
            .filter(|(_, slot)| slot.snapshot.read().is_some())
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 持有槽位锁期间对实例的独占访问
///
/// 释放时刷新快照；若槽位为空则把它从表中移除（仍持有锁）。
pub(crate) struct SlotGuard<'a> {
    store: &'a InstanceStore,
    key: InstanceKey,
    slot: Arc<Slot>,
    guard: OwnedMutexGuard<Option<PluginInstance>>,
}

impl<'a> SlotGuard<'a> {
    pub(crate) fn key(&self) -> &InstanceKey {
        &self.key
    }

    pub(crate) fn instance(&self) -> Option<&PluginInstance> {
        self.guard.as_ref()
    }

    pub(crate) fn instance_mut(&mut self) -> Option<&mut PluginInstance> {
        self.guard.as_mut()
    }

    pub(crate) fn insert(&mut self, instance: PluginInstance) {
        *self.guard = Some(instance);
    }

    pub(crate) fn take(&mut self) -> Option<PluginInstance> {
        self.guard.take()
    }

    /// 立即刷新快照，供持锁期间的长调用之前使用
    pub(crate) fn publish(&self) {
        let info = self.guard.as_ref().map(|instance| instance.info(&self.key));
        *self.slot.snapshot.write() = info;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.publish();
        if self.guard.is_none() {
            let slot = &self.slot;
            self.store
                .slots
                .remove_if(&self.key, |_, current| Arc::ptr_eq(current, slot));
        }
    }
}
