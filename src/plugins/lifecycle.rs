//! 插件生命周期控制器
//!
//! 驱动每个 (插件, 租户) 实例的状态机：
//!
//! ```text
//! (absent) --load--> ACTIVE --deactivate--> INACTIVE
//!                      ^                       |
//!                      +-------activate--------+
//! ACTIVE / INACTIVE --unload--> (absent)
//! ```
//!
//! 扩展代码的每次调用都经过故障隔离；生命周期事件在释放实例锁之后分发，
//! 监听器可以安全地回调运行时。事件在持锁期间创建并编号，
//! 同一实例键上 `PluginEvent::sequence` 的顺序与状态变化的顺序一致。

use super::core::{InstanceStatus, PluginCapabilities, PluginCommand, PluginContext, PluginHealth};
use super::instance_store::{InstanceStore, PluginInstance, PluginInstanceInfo, SlotGuard};
use super::registry::PluginRegistry;
use crate::core::event_notifier::{EventNotifier, PluginEvent, PluginEventType};
use crate::core::fault::{contain, contain_sync};
use crate::error::{LifecyclePhase, NotActiveReason};
use crate::services::HostServices;
use crate::types::{InstanceKey, PluginConfig, TenantId};
use crate::{Result, RuntimeError};
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 运行时配置
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// 单次扩展调用的超时时间，None表示不限制
    pub call_timeout: Option<Duration>,
}

/// 激活/停用的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// 状态已改变，钩子已调用
    Transitioned,
    /// 已处于目标状态，未调用钩子
    Unchanged,
    /// 实例不存在
    NotLoaded,
}

/// 插件运行时
pub struct PluginRuntime {
    registry: Arc<PluginRegistry>,
    store: InstanceStore,
    notifier: Arc<EventNotifier>,
    services: HostServices,
    config: RuntimeConfig,
    event_sequence: AtomicU64,
}

impl PluginRuntime {
    /// 创建运行时
    pub fn new(
        registry: Arc<PluginRegistry>,
        notifier: Arc<EventNotifier>,
        services: HostServices,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            store: InstanceStore::new(),
            notifier,
            services,
            config,
            event_sequence: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn notifier(&self) -> &Arc<EventNotifier> {
        &self.notifier
    }

    pub fn services(&self) -> &HostServices {
        &self.services
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// 加载实例
    ///
    /// 幂等：实例已存在时直接返回其快照，工厂和 `initialize` 都不会再次调用。
    /// 任何失败都不会留下实例。
    pub async fn load(
        &self,
        plugin_id: &str,
        tenant_id: TenantId,
        config: PluginConfig,
    ) -> Result<PluginInstanceInfo> {
        let key = InstanceKey::new(plugin_id, tenant_id);
        let mut slot = self.store.lock_or_create(&key).await;

        if let Some(existing) = slot.instance() {
            debug!("Plugin '{}' already loaded for tenant {}", plugin_id, tenant_id);
            return Ok(existing.info(&key));
        }

        let metadata = self.registry.get(plugin_id)?;
        let config = metadata.merged_config(config);
        metadata.validate_config(&config)?;

        let load_failure = |cause: RuntimeError| {
            error!(
                "Failed to load plugin '{}' for tenant {}: {}",
                plugin_id, tenant_id, cause
            );
            RuntimeError::LoadFailure {
                plugin_id: plugin_id.to_string(),
                tenant_id,
                cause: cause.to_string(),
            }
        };

        let mut plugin = contain_sync("factory", || metadata.create_plugin()).map_err(load_failure)?;
        let context = PluginContext::new(
            tenant_id,
            plugin_id,
            metadata.version.clone(),
            config,
            self.services.clone(),
        );

        if let Err(e) = contain("initialize", self.config.call_timeout, plugin.initialize(&context)).await {
            return Err(load_failure(e));
        }

        let instance = PluginInstance::new(plugin, metadata.clone(), context);
        let info = instance.info(&key);
        slot.insert(instance);
        let event = self
            .event(PluginEventType::Loaded, &key)
            .with_payload("version", json!(metadata.version.to_string()));
        drop(slot);

        info!(
            "Plugin '{}' v{} loaded for tenant {}",
            plugin_id, metadata.version, tenant_id
        );
        self.emit(event).await;

        Ok(info)
    }

    /// 激活实例
    pub async fn activate(&self, plugin_id: &str, tenant_id: TenantId) -> Result<TransitionOutcome> {
        self.transition(plugin_id, tenant_id, InstanceStatus::Active).await
    }

    /// 停用实例，资源和上下文保持驻留
    pub async fn deactivate(&self, plugin_id: &str, tenant_id: TenantId) -> Result<TransitionOutcome> {
        self.transition(plugin_id, tenant_id, InstanceStatus::Inactive).await
    }

    async fn transition(
        &self,
        plugin_id: &str,
        tenant_id: TenantId,
        target: InstanceStatus,
    ) -> Result<TransitionOutcome> {
        let key = InstanceKey::new(plugin_id, tenant_id);
        let (phase, event_type) = match target {
            InstanceStatus::Active => (LifecyclePhase::Activate, PluginEventType::Activated),
            InstanceStatus::Inactive => (LifecyclePhase::Deactivate, PluginEventType::Deactivated),
        };

        let Some(mut slot) = self.store.lock_existing(&key).await else {
            warn!(
                "Cannot {} plugin '{}' for tenant {}: not loaded",
                phase, plugin_id, tenant_id
            );
            return Ok(TransitionOutcome::NotLoaded);
        };
        let Some(instance) = slot.instance_mut() else {
            return Ok(TransitionOutcome::NotLoaded);
        };

        if instance.status == target {
            debug!(
                "Plugin '{}' for tenant {} is already {}",
                plugin_id, tenant_id, target
            );
            return Ok(TransitionOutcome::Unchanged);
        }

        let timeout = self.config.call_timeout;
        let result = match target {
            InstanceStatus::Active => {
                contain("activate", timeout, instance.plugin.activate(&instance.context)).await
            }
            InstanceStatus::Inactive => {
                contain("deactivate", timeout, instance.plugin.deactivate(&instance.context)).await
            }
        };

        if let Err(e) = result {
            let cause = e.to_string();
            instance.record_failure(cause.clone());
            drop(slot);
            error!(
                "Plugin '{}' failed to {} for tenant {}: {}",
                plugin_id, phase, tenant_id, cause
            );
            return Err(RuntimeError::LifecycleFailure {
                plugin_id: plugin_id.to_string(),
                tenant_id,
                phase,
                cause,
            });
        }

        instance.set_status(target);
        let event = self.event(event_type, &key);
        drop(slot);

        info!("Plugin '{}' for tenant {} is now {}", plugin_id, tenant_id, target);
        self.emit(event).await;
        Ok(TransitionOutcome::Transitioned)
    }

    /// 卸载实例，返回实例是否存在
    ///
    /// `destroy` 失败只记录日志，实例仍会被移除。
    pub async fn unload(&self, plugin_id: &str, tenant_id: TenantId) -> Result<bool> {
        let key = InstanceKey::new(plugin_id, tenant_id);
        let Some(mut slot) = self.store.lock_existing(&key).await else {
            debug!("Plugin '{}' not loaded for tenant {}, nothing to unload", plugin_id, tenant_id);
            return Ok(false);
        };
        let Some(mut instance) = slot.take() else {
            return Ok(false);
        };

        // 持锁销毁，同一键上的新加载必须等旧实例释放完资源
        let destroyed = contain(
            "destroy",
            self.config.call_timeout,
            instance.plugin.destroy(&instance.context),
        )
        .await;
        let event = self
            .event(PluginEventType::Unloaded, &key)
            .with_payload("usage_count", json!(instance.usage_count));
        drop(slot);

        if let Err(e) = destroyed {
            warn!(
                "Plugin '{}' failed to {} for tenant {}: {}",
                plugin_id,
                LifecyclePhase::Destroy,
                tenant_id,
                e
            );
        }
        drop(instance);

        info!("Plugin '{}' unloaded for tenant {}", plugin_id, tenant_id);
        self.emit(event).await;
        Ok(true)
    }

    /// 执行插件方法
    ///
    /// 实例必须已加载且处于ACTIVE。插件返回的错误、panic都被隔离为 `ExecutionFailure`，
    /// 状态保持不变；未知方法和参数错误作为调用方错误原样返回。
    pub async fn execute(
        &self,
        plugin_id: &str,
        tenant_id: TenantId,
        command: PluginCommand,
    ) -> Result<Value> {
        let key = InstanceKey::new(plugin_id, tenant_id);
        let not_active = |reason| RuntimeError::NotActive {
            plugin_id: plugin_id.to_string(),
            tenant_id,
            reason,
        };

        let Some(mut slot) = self.store.lock_existing(&key).await else {
            return Err(not_active(NotActiveReason::NotLoaded));
        };
        let Some(instance) = slot.instance_mut() else {
            return Err(not_active(NotActiveReason::NotLoaded));
        };
        if instance.status != InstanceStatus::Active {
            return Err(not_active(NotActiveReason::Inactive));
        }

        let method = command.method.clone();
        let result = contain(
            &method,
            self.config.call_timeout,
            instance.plugin.execute(&instance.context, command),
        )
        .await;
        instance.record_use();

        let fault = match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_caller_error() => return Err(e),
            Err(e) => e,
        };

        let cause = fault.to_string();
        instance.record_failure(cause.clone());
        let event = self
            .event(PluginEventType::ExecutionFailed, &key)
            .with_payload("method", json!(method))
            .with_payload("error", json!(cause));
        drop(slot);

        error!(
            "Plugin '{}' failed executing '{}' for tenant {}: {}",
            plugin_id, method, tenant_id, cause
        );
        self.emit(event).await;

        Err(match fault {
            RuntimeError::Timeout { .. } => fault,
            _ => RuntimeError::ExecutionFailure {
                plugin_id: plugin_id.to_string(),
                tenant_id,
                method,
                cause,
            },
        })
    }

    /// `execute` 的便捷形式
    pub async fn execute_method(
        &self,
        plugin_id: &str,
        tenant_id: TenantId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.execute(plugin_id, tenant_id, PluginCommand::new(method, args))
            .await
    }

    /// 整体替换实例配置并通知插件
    ///
    /// 校验失败时什么都不改变；钩子失败时新配置保留，不回滚。
    pub async fn reconfigure(
        &self,
        plugin_id: &str,
        tenant_id: TenantId,
        new_config: PluginConfig,
    ) -> Result<()> {
        let key = InstanceKey::new(plugin_id, tenant_id);
        let not_loaded = || RuntimeError::NotActive {
            plugin_id: plugin_id.to_string(),
            tenant_id,
            reason: NotActiveReason::NotLoaded,
        };

        let Some(mut slot) = self.store.lock_existing(&key).await else {
            return Err(not_loaded());
        };
        let Some(instance) = slot.instance_mut() else {
            return Err(not_loaded());
        };

        let config = instance.metadata.merged_config(new_config);
        instance.metadata.validate_config(&config)?;
        let keys: Vec<String> = {
            let mut keys: Vec<String> = config.keys().cloned().collect();
            keys.sort();
            keys
        };
        instance.context.replace_config(config);

        let result = contain(
            "on_configuration_change",
            self.config.call_timeout,
            instance.plugin.on_configuration_change(&instance.context),
        )
        .await;

        if let Err(e) = result {
            let cause = e.to_string();
            instance.record_failure(cause.clone());
            drop(slot);
            error!(
                "Plugin '{}' failed to {} for tenant {}: {}",
                plugin_id,
                LifecyclePhase::Reconfigure,
                tenant_id,
                cause
            );
            return Err(RuntimeError::LifecycleFailure {
                plugin_id: plugin_id.to_string(),
                tenant_id,
                phase: LifecyclePhase::Reconfigure,
                cause,
            });
        }
        let event = self
            .event(PluginEventType::Reconfigured, &key)
            .with_payload("keys", json!(keys));
        drop(slot);

        info!("Plugin '{}' reconfigured for tenant {}", plugin_id, tenant_id);
        self.emit(event).await;
        Ok(())
    }

    pub fn is_loaded(&self, plugin_id: &str, tenant_id: TenantId) -> bool {
        self.store.contains(&InstanceKey::new(plugin_id, tenant_id))
    }

    /// 实例快照，不等待进行中的插件调用
    pub fn get(&self, plugin_id: &str, tenant_id: TenantId) -> Option<PluginInstanceInfo> {
        self.store.get(&InstanceKey::new(plugin_id, tenant_id))
    }

    pub fn status(&self, plugin_id: &str, tenant_id: TenantId) -> Option<InstanceStatus> {
        self.get(plugin_id, tenant_id).map(|info| info.status)
    }

    /// 租户的全部实例，按插件ID排序
    pub fn list_for_tenant(&self, tenant_id: TenantId) -> Vec<PluginInstanceInfo> {
        self.store.list_for_tenant(tenant_id)
    }

    pub fn instance_count(&self) -> usize {
        self.store.len()
    }

    /// 调用插件的健康检查
    pub async fn health(&self, plugin_id: &str, tenant_id: TenantId) -> Result<PluginHealth> {
        let key = InstanceKey::new(plugin_id, tenant_id);
        let slot = self.loaded_slot(&key).await?;
        let Some(instance) = slot.instance() else {
            return Err(self.not_loaded(&key));
        };
        contain_sync("health", || Ok(instance.plugin.health(&instance.context)))
    }

    /// 插件自报的能力与元数据声明的能力合并
    pub async fn capabilities(
        &self,
        plugin_id: &str,
        tenant_id: TenantId,
    ) -> Result<PluginCapabilities> {
        let key = InstanceKey::new(plugin_id, tenant_id);
        let slot = self.loaded_slot(&key).await?;
        let Some(instance) = slot.instance() else {
            return Err(self.not_loaded(&key));
        };

        let mut capabilities = contain_sync("capabilities", || Ok(instance.plugin.capabilities()))?;
        let declared = instance.metadata.declared_capabilities();
        extend_unique(&mut capabilities.permissions, declared.permissions);
        extend_unique(&mut capabilities.endpoints, declared.endpoints);
        extend_unique(&mut capabilities.event_subscriptions, declared.event_subscriptions);
        Ok(capabilities)
    }

    /// 卸载租户的全部实例
    pub async fn unload_tenant(&self, tenant_id: TenantId) -> Result<usize> {
        let mut unloaded = 0;
        for info in self.store.list_for_tenant(tenant_id) {
            if self.unload(&info.plugin_id, tenant_id).await? {
                unloaded += 1;
            }
        }
        info!("Unloaded {} plugin instance(s) for tenant {}", unloaded, tenant_id);
        Ok(unloaded)
    }

    /// 卸载全部实例
    pub async fn shutdown(&self) -> Result<usize> {
        let mut unloaded = 0;
        for key in self.store.keys() {
            if self.unload(&key.plugin_id, key.tenant_id).await? {
                unloaded += 1;
            }
        }
        info!("Plugin runtime shut down, {} instance(s) unloaded", unloaded);
        Ok(unloaded)
    }

    async fn loaded_slot(&self, key: &InstanceKey) -> Result<SlotGuard<'_>> {
        self.store
            .lock_existing(key)
            .await
            .ok_or_else(|| self.not_loaded(key))
    }

    fn not_loaded(&self, key: &InstanceKey) -> RuntimeError {
        RuntimeError::NotActive {
            plugin_id: key.plugin_id.clone(),
            tenant_id: key.tenant_id,
            reason: NotActiveReason::NotLoaded,
        }
    }

    /// 创建带序号的事件，调用方必须仍持有实例键的槽位锁
    fn event(&self, event_type: PluginEventType, key: &InstanceKey) -> PluginEvent {
        let sequence = self.event_sequence.fetch_add(1, Ordering::SeqCst);
        PluginEvent::new(event_type, key).with_sequence(sequence)
    }

    async fn emit(&self, event: PluginEvent) {
        self.notifier.notify(&event).await;
    }
}

impl fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("registered", &self.registry.len())
            .field("instances", &self.store.len())
            .field("config", &self.config)
            .finish()
    }
}

fn extend_unique(target: &mut Vec<String>, extra: Vec<String>) {
    for item in extra {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event_notifier::{PluginEventListener, RecordingListener};
    use crate::plugins::builtin::currency_rates;
    use crate::plugins::builtin::PluginCounters;
    use crate::plugins::core::Plugin;
    use crate::plugins::metadata::PluginMetadata;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use semver::Version;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 按配置在指定钩子上失败或panic的插件
    #[derive(Default)]
    struct FaultyPlugin {
        fail_on: Option<String>,
        panic_on: Option<String>,
    }

    impl FaultyPlugin {
        fn read_config(&mut self, ctx: &PluginContext) -> Result<()> {
            self.fail_on = ctx.get_config_or("fail_on", None)?;
            self.panic_on = ctx.get_config_or("panic_on", None)?;
            Ok(())
        }

        fn trip(&self, hook: &str) -> Result<()> {
            if self.panic_on.as_deref() == Some(hook) {
                panic!("{} exploded", hook);
            }
            if self.fail_on.as_deref() == Some(hook) {
                return Err(RuntimeError::plugin(format!("{} failed", hook)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Plugin for FaultyPlugin {
        async fn initialize(&mut self, ctx: &PluginContext) -> Result<()> {
            self.read_config(ctx)?;
            let delay_ms: u64 = ctx.get_config_or("delay_ms", 0)?;
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
            self.trip("initialize")
        }

        async fn activate(&mut self, _ctx: &PluginContext) -> Result<()> {
            self.trip("activate")
        }

        async fn deactivate(&mut self, _ctx: &PluginContext) -> Result<()> {
            self.trip("deactivate")
        }

        async fn destroy(&mut self, _ctx: &PluginContext) -> Result<()> {
            self.trip("destroy")
        }

        async fn execute(&mut self, ctx: &PluginContext, command: PluginCommand) -> Result<Value> {
            match command.method.as_str() {
                "echo" => Ok(json!(ctx.config())),
                "boom" => Err(RuntimeError::plugin("boom")),
                "panic" => panic!("execute exploded"),
                "sleep" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Value::Null)
                }
                other => Err(RuntimeError::UnknownMethod {
                    method: other.to_string(),
                }),
            }
        }

        async fn on_configuration_change(&mut self, ctx: &PluginContext) -> Result<()> {
            self.read_config(ctx)?;
            self.trip("on_configuration_change")
        }

        fn health(&self, _ctx: &PluginContext) -> PluginHealth {
            PluginHealth::healthy("ok")
        }

        fn capabilities(&self) -> PluginCapabilities {
            PluginCapabilities {
                methods: vec!["echo".to_string(), "boom".to_string()],
                ..PluginCapabilities::default()
            }
        }
    }

    struct ThrowingListener;

    #[async_trait]
    impl PluginEventListener for ThrowingListener {
        fn name(&self) -> &str {
            "throwing"
        }

        async fn on_event(&self, _event: &PluginEvent) -> Result<()> {
            Err(RuntimeError::plugin("listener rejected event"))
        }
    }

    /// 在Loaded事件上停顿的监听器
    struct SlowLoadListener;

    #[async_trait]
    impl PluginEventListener for SlowLoadListener {
        fn name(&self) -> &str {
            "slow-load"
        }

        async fn on_event(&self, event: &PluginEvent) -> Result<()> {
            if event.event_type == PluginEventType::Loaded {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(())
        }
    }

    struct Harness {
        runtime: Arc<PluginRuntime>,
        counters: Arc<PluginCounters>,
        recorder: Arc<RecordingListener>,
    }

    fn faulty_metadata(id: &str) -> PluginMetadata {
        PluginMetadata::builder(id, "Faulty", Version::new(0, 1, 0))
            .permission("data:read")
            .factory(|| Ok(Box::new(FaultyPlugin::default()) as Box<dyn Plugin>))
            .build()
            .unwrap()
    }

    fn harness_with(config: RuntimeConfig, listeners: Vec<Arc<dyn PluginEventListener>>) -> Harness {
        let registry = Arc::new(PluginRegistry::default());
        let counters = Arc::new(PluginCounters::default());
        registry
            .register(currency_rates::metadata(counters.clone()).unwrap())
            .unwrap();
        registry.register(faulty_metadata("faulty")).unwrap();
        registry
            .register(
                PluginMetadata::builder("broken", "Broken", Version::new(0, 1, 0))
                    .factory(|| Err(RuntimeError::plugin("factory refused")))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                PluginMetadata::builder("exploding", "Exploding", Version::new(0, 1, 0))
                    .factory(|| panic!("factory exploded"))
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let notifier = Arc::new(EventNotifier::new());
        for listener in listeners {
            notifier.subscribe(listener);
        }
        let recorder = Arc::new(RecordingListener::new("recorder"));
        notifier.subscribe(recorder.clone());

        let runtime = Arc::new(PluginRuntime::new(
            registry,
            notifier,
            HostServices::in_memory(),
            config,
        ));
        Harness {
            runtime,
            counters,
            recorder,
        }
    }

    fn harness() -> Harness {
        harness_with(RuntimeConfig::default(), Vec::new())
    }

    fn convert() -> PluginCommand {
        PluginCommand::with_args("convert", ("USD", "EUR", 100)).unwrap()
    }

    fn config(pairs: &[(&str, Value)]) -> PluginConfig {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    fn decimal(value: Value) -> Decimal {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_load_marks_instance_active() {
        let h = harness();

        let info = h.runtime.load("rates", 42, PluginConfig::new()).await.unwrap();

        assert_eq!(info.status, InstanceStatus::Active);
        assert!(h.runtime.is_loaded("rates", 42));
        assert!(!h.runtime.is_loaded("rates", 43));
        assert_eq!(h.runtime.status("rates", 42), Some(InstanceStatus::Active));
        assert_eq!(h.recorder.event_types(), vec![PluginEventType::Loaded]);
        // load 不调用 activate 钩子
        assert_eq!(h.counters.activated(), 0);
    }

    #[tokio::test]
    async fn test_load_is_idempotent() {
        let h = harness();

        let first = h.runtime.load("rates", 42, PluginConfig::new()).await.unwrap();
        let second = h
            .runtime
            .load("rates", 42, config(&[("precision", json!(4))]))
            .await
            .unwrap();

        assert_eq!(h.counters.initialized(), 1);
        assert_eq!(first.loaded_at, second.loaded_at);
        assert_eq!(second.config["precision"], json!(2));
        assert_eq!(h.recorder.count_of(PluginEventType::Loaded), 1);
        assert_eq!(h.runtime.instance_count(), 1);
    }

    #[tokio::test]
    async fn test_execute_requires_active_instance() {
        let h = harness();
        h.runtime.load("rates", 42, PluginConfig::new()).await.unwrap();

        let converted = h.runtime.execute("rates", 42, convert()).await.unwrap();
        assert_eq!(decimal(converted), Decimal::from_str("92").unwrap());

        assert_eq!(
            h.runtime.deactivate("rates", 42).await.unwrap(),
            TransitionOutcome::Transitioned
        );
        let err = h.runtime.execute("rates", 42, convert()).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::NotActive {
                reason: NotActiveReason::Inactive,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unload_makes_key_absent() {
        let h = harness();
        h.runtime.load("rates", 42, PluginConfig::new()).await.unwrap();

        assert!(h.runtime.unload("rates", 42).await.unwrap());

        let err = h.runtime.execute("rates", 42, convert()).await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::NotActive {
                reason: NotActiveReason::NotLoaded,
                ..
            }
        ));
        assert!(!h.runtime.is_loaded("rates", 42));
        assert!(h.runtime.get("rates", 42).is_none());
        assert!(!h.runtime.unload("rates", 42).await.unwrap());
        assert_eq!(h.recorder.count_of(PluginEventType::Unloaded), 1);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_load() {
        let h = harness_with(RuntimeConfig::default(), vec![Arc::new(ThrowingListener)]);

        let info = h.runtime.load("rates", 42, PluginConfig::new()).await;

        assert!(info.is_ok());
        assert_eq!(h.recorder.event_types(), vec![PluginEventType::Loaded]);
    }

    #[tokio::test]
    async fn test_execute_on_never_loaded_key() {
        let h = harness();
        let err = h.runtime.execute("rates", 7, convert()).await.unwrap_err();
        assert!(err.is_not_active());
        assert_eq!(h.runtime.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_unload_load_cycles_reinitialize() {
        let h = harness();

        for cycle in 1..=3 {
            h.runtime.load("rates", 42, PluginConfig::new()).await.unwrap();
            assert_eq!(h.counters.initialized(), cycle);
            h.runtime.unload("rates", 42).await.unwrap();
            assert_eq!(h.counters.destroyed(), cycle);
        }
    }

    #[tokio::test]
    async fn test_activate_on_active_is_noop() {
        let h = harness();
        h.runtime.load("rates", 42, PluginConfig::new()).await.unwrap();

        let outcome = h.runtime.activate("rates", 42).await.unwrap();

        assert_eq!(outcome, TransitionOutcome::Unchanged);
        assert_eq!(h.counters.activated(), 0);
        assert_eq!(h.runtime.status("rates", 42), Some(InstanceStatus::Active));
        assert_eq!(h.recorder.count_of(PluginEventType::Activated), 0);
    }

    #[tokio::test]
    async fn test_deactivate_then_activate_keeps_instance() {
        let h = harness();
        h.runtime.load("rates", 42, PluginConfig::new()).await.unwrap();

        h.runtime.deactivate("rates", 42).await.unwrap();
        assert_eq!(
            h.runtime.deactivate("rates", 42).await.unwrap(),
            TransitionOutcome::Unchanged
        );
        assert_eq!(h.runtime.status("rates", 42), Some(InstanceStatus::Inactive));

        h.runtime.activate("rates", 42).await.unwrap();

        assert_eq!(h.runtime.status("rates", 42), Some(InstanceStatus::Active));
        assert_eq!(h.counters.initialized(), 1);
        assert_eq!(h.counters.deactivated(), 1);
        assert_eq!(h.counters.activated(), 1);
        assert_eq!(
            h.recorder.event_types(),
            vec![
                PluginEventType::Loaded,
                PluginEventType::Deactivated,
                PluginEventType::Activated
            ]
        );
        assert!(h.runtime.execute("rates", 42, convert()).await.is_ok());
    }

    #[tokio::test]
    async fn test_transitions_on_absent_key() {
        let h = harness();
        assert_eq!(
            h.runtime.activate("rates", 42).await.unwrap(),
            TransitionOutcome::NotLoaded
        );
        assert_eq!(
            h.runtime.deactivate("rates", 42).await.unwrap(),
            TransitionOutcome::NotLoaded
        );
        assert!(h.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_reconfigure_visible_to_next_execute() {
        let h = harness();
        h.runtime.load("rates", 42, PluginConfig::new()).await.unwrap();

        h.runtime
            .reconfigure("rates", 42, config(&[("rates", json!({"EUR": "0.5"}))]))
            .await
            .unwrap();

        let converted = h.runtime.execute("rates", 42, convert()).await.unwrap();
        assert_eq!(decimal(converted), Decimal::from_str("50").unwrap());
        assert_eq!(h.counters.reconfigured(), 1);
        assert_eq!(h.recorder.count_of(PluginEventType::Reconfigured), 1);
    }

    #[tokio::test]
    async fn test_reconfigure_inactive_instance_applies_after_activate() {
        let h = harness();
        h.runtime.load("rates", 42, PluginConfig::new()).await.unwrap();
        h.runtime.deactivate("rates", 42).await.unwrap();

        h.runtime
            .reconfigure("rates", 42, config(&[("rates", json!({"EUR": "0.5"}))]))
            .await
            .unwrap();
        assert_eq!(h.runtime.status("rates", 42), Some(InstanceStatus::Inactive));
        assert_eq!(h.counters.reconfigured(), 1);
        assert!(h.runtime.execute("rates", 42, convert()).await.is_err());

        assert_eq!(
            h.runtime.activate("rates", 42).await.unwrap(),
            TransitionOutcome::Transitioned
        );
        let converted = h.runtime.execute("rates", 42, convert()).await.unwrap();
        assert_eq!(decimal(converted), Decimal::from_str("50").unwrap());
        assert_eq!(h.counters.initialized(), 1);
        assert_eq!(
            h.recorder.event_types(),
            vec![
                PluginEventType::Loaded,
                PluginEventType::Deactivated,
                PluginEventType::Reconfigured,
                PluginEventType::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_reconfigure_rejects_invalid_config() {
        let h = harness();
        h.runtime.load("rates", 42, PluginConfig::new()).await.unwrap();

        let err = h
            .runtime
            .reconfigure("rates", 42, config(&[("precision", json!(42))]))
            .await
            .unwrap_err();

        assert!(matches!(err, RuntimeError::InvalidConfiguration { .. }));
        assert_eq!(h.runtime.get("rates", 42).unwrap().config["precision"], json!(2));
        assert_eq!(h.counters.reconfigured(), 0);

        let err = h
            .runtime
            .reconfigure("rates", 99, PluginConfig::new())
            .await
            .unwrap_err();
        assert!(err.is_not_active());
    }

    #[tokio::test]
    async fn test_reconfigure_hook_failure_keeps_new_config() {
        let h = harness();
        h.runtime.load("faulty", 1, PluginConfig::new()).await.unwrap();

        let err = h
            .runtime
            .reconfigure("faulty", 1, config(&[("fail_on", json!("on_configuration_change"))]))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RuntimeError::LifecycleFailure {
                phase: LifecyclePhase::Reconfigure,
                ..
            }
        ));
        let info = h.runtime.get("faulty", 1).unwrap();
        assert_eq!(info.config["fail_on"], json!("on_configuration_change"));
        assert_eq!(info.failure_count, 1);
    }

    #[tokio::test]
    async fn test_load_unknown_plugin_stores_nothing() {
        let h = harness();
        let err = h.runtime.load("weather", 42, PluginConfig::new()).await.unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownPlugin { .. }));
        assert!(!h.runtime.is_loaded("weather", 42));
        assert_eq!(h.runtime.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_config() {
        let h = harness();
        let err = h
            .runtime
            .load("rates", 42, config(&[("base_currency", json!("usd"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidConfiguration { .. }));
        assert!(!h.runtime.is_loaded("rates", 42));
        assert_eq!(h.counters.initialized(), 0);
    }

    #[tokio::test]
    async fn test_initialize_failure_is_atomic() {
        let h = harness();

        let err = h
            .runtime
            .load("faulty", 1, config(&[("fail_on", json!("initialize"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::LoadFailure { .. }));
        assert!(!h.runtime.is_loaded("faulty", 1));

        let err = h
            .runtime
            .load("faulty", 1, config(&[("panic_on", json!("initialize"))]))
            .await
            .unwrap_err();
        match err {
            RuntimeError::LoadFailure { cause, .. } => assert!(cause.contains("initialize exploded")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!h.runtime.is_loaded("faulty", 1));
        assert!(h.recorder.events().is_empty());

        h.runtime.load("faulty", 1, PluginConfig::new()).await.unwrap();
        assert!(h.runtime.is_loaded("faulty", 1));
    }

    #[tokio::test]
    async fn test_factory_failures_are_load_failures() {
        let h = harness();

        for plugin_id in ["broken", "exploding"] {
            let err = h.runtime.load(plugin_id, 1, PluginConfig::new()).await.unwrap_err();
            assert!(matches!(err, RuntimeError::LoadFailure { .. }));
            assert!(!h.runtime.is_loaded(plugin_id, 1));
        }
    }

    #[tokio::test]
    async fn test_execution_faults_are_contained() {
        let h = harness();
        h.runtime.load("faulty", 1, PluginConfig::new()).await.unwrap();

        let err = h.runtime.execute_method("faulty", 1, "boom", vec![]).await.unwrap_err();
        assert!(matches!(err, RuntimeError::ExecutionFailure { ref method, .. } if method == "boom"));

        let err = h.runtime.execute_method("faulty", 1, "panic", vec![]).await.unwrap_err();
        match err {
            RuntimeError::ExecutionFailure { cause, .. } => assert!(cause.contains("execute exploded")),
            other => panic!("unexpected error: {:?}", other),
        }

        let info = h.runtime.get("faulty", 1).unwrap();
        assert_eq!(info.status, InstanceStatus::Active);
        assert_eq!(info.failure_count, 2);
        assert!(info.last_error.is_some());
        assert_eq!(h.recorder.count_of(PluginEventType::ExecutionFailed), 2);

        assert!(h.runtime.execute_method("faulty", 1, "echo", vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn test_caller_errors_pass_through() {
        let h = harness();
        h.runtime.load("rates", 42, PluginConfig::new()).await.unwrap();

        let err = h
            .runtime
            .execute_method("rates", 42, "refund", vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownMethod { .. }));

        let err = h
            .runtime
            .execute_method("rates", 42, "convert", vec![json!("USD")])
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArguments { .. }));

        let info = h.runtime.get("rates", 42).unwrap();
        assert_eq!(info.failure_count, 0);
        assert_eq!(info.usage_count, 2);
        assert_eq!(h.recorder.count_of(PluginEventType::ExecutionFailed), 0);
    }

    #[tokio::test]
    async fn test_transition_hook_failure_keeps_status() {
        let h = harness();
        h.runtime
            .load("faulty", 1, config(&[("fail_on", json!("deactivate"))]))
            .await
            .unwrap();

        let err = h.runtime.deactivate("faulty", 1).await.unwrap_err();

        assert!(matches!(
            err,
            RuntimeError::LifecycleFailure {
                phase: LifecyclePhase::Deactivate,
                ..
            }
        ));
        let info = h.runtime.get("faulty", 1).unwrap();
        assert_eq!(info.status, InstanceStatus::Active);
        assert_eq!(info.last_error.as_deref(), Some("Plugin error: deactivate failed"));
        assert_eq!(h.recorder.count_of(PluginEventType::Deactivated), 0);
    }

    #[tokio::test]
    async fn test_destroy_failure_still_unloads() {
        let h = harness();
        h.runtime
            .load("faulty", 1, config(&[("panic_on", json!("destroy"))]))
            .await
            .unwrap();

        assert!(h.runtime.unload("faulty", 1).await.unwrap());
        assert!(!h.runtime.is_loaded("faulty", 1));
        assert_eq!(h.recorder.count_of(PluginEventType::Unloaded), 1);
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let h = harness_with(
            RuntimeConfig {
                call_timeout: Some(Duration::from_millis(50)),
            },
            Vec::new(),
        );
        h.runtime.load("faulty", 1, PluginConfig::new()).await.unwrap();

        let err = h.runtime.execute_method("faulty", 1, "sleep", vec![]).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { .. }));
        assert_eq!(h.runtime.status("faulty", 1), Some(InstanceStatus::Active));

        let err = h
            .runtime
            .load("faulty", 2, config(&[("delay_ms", json!(2_000))]))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::LoadFailure { .. }));
        assert!(!h.runtime.is_loaded("faulty", 2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_loads_create_one_instance() {
        let h = harness();
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        h.runtime
            .registry()
            .register(
                PluginMetadata::builder("counted", "Counted", Version::new(1, 0, 0))
                    .default_config("delay_ms", json!(20))
                    .factory(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(Box::new(FaultyPlugin::default()) as Box<dyn Plugin>)
                    })
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let runtime = h.runtime.clone();
                tokio::spawn(async move { runtime.load("counted", 5, PluginConfig::new()).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(h.runtime.instance_count(), 1);
        assert_eq!(h.recorder.count_of(PluginEventType::Loaded), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_load_and_unload_stay_consistent() {
        let h = harness();

        let tasks: Vec<_> = (0..40)
            .map(|i| {
                let runtime = h.runtime.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        runtime.load("rates", 42, PluginConfig::new()).await.map(|_| ())
                    } else {
                        runtime.unload("rates", 42).await.map(|_| ())
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let loaded = usize::from(h.runtime.is_loaded("rates", 42));
        assert_eq!(h.counters.initialized(), h.counters.destroyed() + loaded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_event_sequence_follows_transition_order() {
        let h = harness_with(RuntimeConfig::default(), vec![Arc::new(SlowLoadListener)]);

        let runtime = h.runtime.clone();
        let loading =
            tokio::spawn(async move { runtime.load("rates", 42, PluginConfig::new()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.runtime.unload("rates", 42).await.unwrap());
        loading.await.unwrap().unwrap();

        assert!(!h.runtime.is_loaded("rates", 42));
        // Loaded 的分发被慢监听器拖住，晚于 Unloaded 到达
        assert_eq!(
            h.recorder.event_types(),
            vec![PluginEventType::Unloaded, PluginEventType::Loaded]
        );

        let ordered = h.recorder.events_in_order();
        let types: Vec<PluginEventType> = ordered.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![PluginEventType::Loaded, PluginEventType::Unloaded]);
        assert!(ordered[0].sequence > 0);
        assert!(ordered[0].sequence < ordered[1].sequence);
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let h = harness();
        h.runtime.load("rates", 42, PluginConfig::new()).await.unwrap();
        h.runtime
            .load("rates", 43, config(&[("rates", json!({"EUR": "0.5"}))]))
            .await
            .unwrap();
        h.runtime.load("faulty", 42, PluginConfig::new()).await.unwrap();

        h.runtime.deactivate("rates", 42).await.unwrap();

        let converted = h.runtime.execute("rates", 43, convert()).await.unwrap();
        assert_eq!(decimal(converted), Decimal::from_str("50").unwrap());

        let tenant: Vec<String> = h
            .runtime
            .list_for_tenant(42)
            .into_iter()
            .map(|info| info.plugin_id)
            .collect();
        assert_eq!(tenant, vec!["faulty", "rates"]);

        // 每个实例的缓存写入落在各自租户的命名空间下
        let cache = h.runtime.services().cache();
        let own = cache.get("tenant:43:plugin:rates:rates").await.unwrap().unwrap();
        assert_eq!(own["rates"]["EUR"], json!("0.5"));
        assert!(cache.get("tenant:42:plugin:rates:rates").await.unwrap().is_some());
        assert!(cache.get("plugin:rates:rates").await.unwrap().is_none());

        assert_eq!(h.runtime.unload_tenant(42).await.unwrap(), 2);
        assert!(h.runtime.is_loaded("rates", 43));
        assert_eq!(h.runtime.instance_count(), 1);
    }

    #[tokio::test]
    async fn test_health_and_capabilities() {
        let h = harness();
        h.runtime.load("rates", 42, PluginConfig::new()).await.unwrap();

        let health = h.runtime.health("rates", 42).await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.details["status"], json!("ACTIVE"));

        let capabilities = h.runtime.capabilities("rates", 42).await.unwrap();
        assert_eq!(capabilities.methods, vec!["convert", "rates", "supported"]);
        assert_eq!(capabilities.permissions, vec!["cache:write"]);
        assert_eq!(capabilities.endpoints, vec!["/api/plugins/rates/convert"]);

        assert!(h.runtime.health("rates", 43).await.unwrap_err().is_not_active());
    }

    #[tokio::test]
    async fn test_shutdown_unloads_everything() {
        let h = harness();
        h.runtime.load("rates", 1, PluginConfig::new()).await.unwrap();
        h.runtime.load("rates", 2, PluginConfig::new()).await.unwrap();
        h.runtime.load("faulty", 2, PluginConfig::new()).await.unwrap();

        assert_eq!(h.runtime.shutdown().await.unwrap(), 3);
        assert_eq!(h.runtime.instance_count(), 0);
        assert_eq!(h.counters.destroyed(), 2);
    }
}
