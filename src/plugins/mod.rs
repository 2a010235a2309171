//! 可插拔接口层模块
//!
//! 插件契约、元数据注册表、实例存储与生命周期控制

pub mod builtin;
pub mod command;
pub mod core;
pub mod instance_store;
pub mod lifecycle;
pub mod metadata;
pub mod registry;

// 重新导出核心组件
pub use self::core::*;
pub use command::{CommandTable, NoArgs};
pub use instance_store::{InstanceStore, PluginInstanceInfo};
pub use lifecycle::*;
pub use metadata::*;
pub use registry::*;
