//! LMS 多租户插件运行时
//!
//! 为市场中可安装的模块提供隔离的按组织实例、显式的生命周期和故障隔离。
//!
//! # 架构分层
//!
//! - **插件实现层**: 内置插件（汇率换算）以及宿主注册的其他扩展
//! - **可插拔接口层**: Plugin契约、命令处理表、元数据注册表、实例存储和生命周期控制器
//! - **宿主服务层**: 数据、缓存、事件、HTTP、通知门面，安装记录对账与模块管理
//! - **核心基础层**: 生命周期事件通知和故障隔离
//!
//! 运行时没有全局状态：宿主显式构建 `PluginRuntime` 并注入到需要的地方。

pub mod config;
pub mod core;
pub mod error;
pub mod plugins;
pub mod services;
pub mod types;

// 重新导出核心类型
pub use crate::core::event_notifier::{
    EventNotifier, ListenerId, LoggingListener, PluginEvent, PluginEventListener, PluginEventType,
    RecordingListener,
};
pub use crate::error::{LifecyclePhase, NotActiveReason, Result, RuntimeError};
pub use crate::plugins::builtin::register_builtin_plugins;
pub use crate::plugins::command::{CommandTable, NoArgs};
pub use crate::plugins::core::{
    InstanceStatus, Plugin, PluginCapabilities, PluginCommand, PluginContext, PluginHealth,
};
pub use crate::plugins::instance_store::PluginInstanceInfo;
pub use crate::plugins::lifecycle::{PluginRuntime, RuntimeConfig, TransitionOutcome};
pub use crate::plugins::metadata::{MetadataBuilder, PluginDescriptor, PluginFactory, PluginMetadata};
pub use crate::plugins::registry::{PluginRegistry, RegistryConfig};
pub use crate::services::host::HostServices;
pub use crate::services::installations::{
    reconcile, InstallationRecord, InstallationSource, ReconcileReport, StaticInstallationSource,
};
pub use crate::services::module_manager::ModuleManager;
pub use crate::types::{InstanceKey, PluginConfig, PluginId, TenantId};

/// 运行时信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const RUNTIME_NAME: &str = "LMS Plugin Runtime";

/// 初始化日志系统
///
/// 全局subscriber已存在时保留原有的，不视为错误。
pub fn initialize(logging: &config::LoggingConfig) -> Result<()> {
    let installed = tracing_subscriber::fmt()
        .with_max_level(logging.level.as_tracing())
        .with_ansi(logging.ansi)
        .with_target(logging.with_target)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("Initializing {} v{}", RUNTIME_NAME, VERSION);
    } else {
        tracing::debug!("Global tracing subscriber already installed");
    }
    Ok(())
}
