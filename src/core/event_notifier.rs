//! 生命周期事件通知器
//!
//! 按注册顺序在调用方任务上同步分发事件。每个监听器独立失败：
//! 错误和panic都只记录日志，不中断触发事件的生命周期操作，也不影响后续监听器。
//! 慢监听器会直接增加触发操作的延迟。
//!
//! 事件在实例锁释放之后才分发，并发操作的事件到达监听器的顺序可能与状态变化的顺序不同。
//! 运行时在持锁期间为每个事件分配单调递增的 `sequence`：同一实例键上，
//! `sequence` 的大小顺序就是状态变化的真实顺序。

use super::fault::contain;
use crate::types::{InstanceKey, PluginId, TenantId};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginEventType {
    Loaded,
    Activated,
    Deactivated,
    Reconfigured,
    Unloaded,
    /// 一次被隔离的执行故障
    ExecutionFailed,
}

impl fmt::Display for PluginEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginEventType::Loaded => "LOADED",
            PluginEventType::Activated => "ACTIVATED",
            PluginEventType::Deactivated => "DEACTIVATED",
            PluginEventType::Reconfigured => "RECONFIGURED",
            PluginEventType::Unloaded => "UNLOADED",
            PluginEventType::ExecutionFailed => "EXECUTION_FAILED",
        };
        f.write_str(name)
    }
}

/// 生命周期事件，仅在内存中传递，不持久化也不重试
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEvent {
    pub event_type: PluginEventType,
    pub plugin_id: PluginId,
    pub tenant_id: TenantId,
    pub timestamp: DateTime<Utc>,
    /// 运行时内单调递增的序号，0表示未编号
    #[serde(default)]
    pub sequence: u64,
    pub payload: HashMap<String, serde_json::Value>,
}

impl PluginEvent {
    pub fn new(event_type: PluginEventType, key: &InstanceKey) -> Self {
        Self {
            event_type,
            plugin_id: key.plugin_id.clone(),
            tenant_id: key.tenant_id,
            timestamp: Utc::now(),
            sequence: 0,
            payload: HashMap::new(),
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_payload(mut self, key: &str, value: serde_json::Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.plugin_id.clone(), self.tenant_id)
    }
}

/// 事件监听器
#[async_trait]
pub trait PluginEventListener: Send + Sync {
    /// 监听器名称，用于日志
    fn name(&self) -> &str;

    /// 处理事件
    async fn on_event(&self, event: &PluginEvent) -> Result<()>;
}

/// 监听器句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    filter: Option<HashSet<PluginEventType>>,
    listener: Arc<dyn PluginEventListener>,
}

impl Registration {
    fn accepts(&self, event_type: PluginEventType) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |types| types.contains(&event_type))
    }
}

/// 事件通知器
pub struct EventNotifier {
    listeners: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 订阅全部事件
    pub fn subscribe(&self, listener: Arc<dyn PluginEventListener>) -> ListenerId {
        self.register(None, listener)
    }

    /// 只订阅指定类型的事件
    pub fn subscribe_to<I>(&self, event_types: I, listener: Arc<dyn PluginEventListener>) -> ListenerId
    where
        I: IntoIterator<Item = PluginEventType>,
    {
        self.register(Some(event_types.into_iter().collect()), listener)
    }

    fn register(
        &self,
        filter: Option<HashSet<PluginEventType>>,
        listener: Arc<dyn PluginEventListener>,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!("Registered lifecycle listener '{}'", listener.name());
        self.listeners.write().push(Registration {
            id,
            filter,
            listener,
        });
        id
    }

    /// 取消订阅
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|registration| registration.id != id);
        before != listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// 分发事件，返回成功处理的监听器数量
    pub async fn notify(&self, event: &PluginEvent) -> usize {
        // 锁不跨await持有
        let targets: Vec<Arc<dyn PluginEventListener>> = self
            .listeners
            .read()
            .iter()
            .filter(|registration| registration.accepts(event.event_type))
            .map(|registration| registration.listener.clone())
            .collect();

        let mut delivered = 0;
        for listener in targets {
            match contain(listener.name(), None, listener.on_event(event)).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "Listener '{}' failed on {} for {}@{}: {}",
                    listener.name(),
                    event.event_type,
                    event.plugin_id,
                    event.tenant_id,
                    e
                ),
            }
        }

        debug!(
            "Event {} for {}@{} delivered to {} listener(s)",
            event.event_type, event.plugin_id, event.tenant_id, delivered
        );
        delivered
    }
}

impl Default for EventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNotifier")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// 记录收到的全部事件
#[derive(Debug, Default)]
pub struct RecordingListener {
    name: String,
    events: Mutex<Vec<PluginEvent>>,
}

impl RecordingListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<PluginEvent> {
        self.events.lock().clone()
    }

    pub fn event_types(&self) -> Vec<PluginEventType> {
        self.events.lock().iter().map(|e| e.event_type).collect()
    }

    /// 按序号排序后的事件，即状态变化的真实顺序
    pub fn events_in_order(&self) -> Vec<PluginEvent> {
        let mut events = self.events();
        events.sort_by_key(|e| e.sequence);
        events
    }

    pub fn count_of(&self, event_type: PluginEventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl PluginEventListener for RecordingListener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_event(&self, event: &PluginEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// 审计日志监听器
#[derive(Debug, Default)]
pub struct LoggingListener;

#[async_trait]
impl PluginEventListener for LoggingListener {
    fn name(&self) -> &str {
        "audit-log"
    }

    async fn on_event(&self, event: &PluginEvent) -> Result<()> {
        info!(
            target: "plugin_audit",
            "{} {}@{} {:?}",
            event.event_type, event.plugin_id, event.tenant_id, event.payload
        );
        Ok(())
    }
}
