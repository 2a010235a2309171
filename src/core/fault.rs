//! 故障隔离工具
//!
//! 扩展代码返回的错误、panic以及超时都在这里被收敛为 `RuntimeError`，不会传播到宿主任务。

use crate::{Result, RuntimeError};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

/// 从panic负载中提取可读消息
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

/// 运行一次扩展调用：捕获panic，可选超时
pub async fn contain<T, F>(operation: &str, timeout: Option<Duration>, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let guarded = AssertUnwindSafe(future).catch_unwind();

    let outcome = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(RuntimeError::Timeout {
                    operation: operation.to_string(),
                    timeout: limit,
                })
            }
        },
        None => guarded.await,
    };

    match outcome {
        Ok(result) => result,
        Err(payload) => Err(RuntimeError::plugin(format!(
            "panic in `{}`: {}",
            operation,
            panic_message(payload)
        ))),
    }
}

/// 同步版本，用于工厂和健康检查等非异步的扩展调用
pub fn contain_sync<T, F>(operation: &str, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(RuntimeError::plugin(format!(
            "panic in `{}`: {}",
            operation,
            panic_message(payload)
        ))),
    }
}
