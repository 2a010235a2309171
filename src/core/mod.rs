//! 核心基础层模块
//!
//! 生命周期事件通知与扩展代码的故障隔离

pub mod event_notifier;
pub mod fault;

// 重新导出核心组件
pub use event_notifier::*;
pub use fault::{contain, contain_sync, panic_message};
