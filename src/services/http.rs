//! 基于reqwest的HTTP门面实现

use super::host::HttpService;
use crate::{Result, RuntimeError};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// reqwest HTTP服务
#[derive(Debug, Clone)]
pub struct ReqwestHttpService {
    client: reqwest::Client,
}

impl ReqwestHttpService {
    /// 使用给定的请求超时创建客户端
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RuntimeError::Http {
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }

    async fn into_json(url: &str, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            return Err(RuntimeError::Http {
                message: format!("{} returned {}", url, status),
            });
        }
        response.json::<Value>().await.map_err(|e| RuntimeError::Http {
            message: format!("Invalid JSON from {}: {}", url, e),
        })
    }
}

impl Default for ReqwestHttpService {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HttpService for ReqwestHttpService {
    async fn get_json(&self, url: &str) -> Result<Value> {
        debug!("HTTP GET {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RuntimeError::Http {
                message: format!("GET {} failed: {}", url, e),
            })?;
        Self::into_json(url, response).await
    }

    async fn post_json(&self, url: &str, body: Value) -> Result<Value> {
        debug!("HTTP POST {}", url);
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RuntimeError::Http {
                message: format!("POST {} failed: {}", url, e),
            })?;
        Self::into_json(url, response).await
    }
}
