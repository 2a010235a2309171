//! 宿主服务门面
//!
//! 通过PluginContext暴露给插件的能力接口。具体实现由宿主注入，插件只依赖这些特征。
//!
//! 插件拿到的数据、缓存和事件门面都按租户加前缀，实例看不到其他租户的键。

use super::http::ReqwestHttpService;
use super::memory::{InMemoryCache, InMemoryDataService, InMemoryEventService, LoggingNotificationService};
use crate::types::TenantId;
use crate::{Result, RuntimeError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// 用户标识符
pub type UserId = i64;

/// 数据访问门面
#[async_trait]
pub trait DataService: Send + Sync {
    /// 保存实体
    async fn save(&self, entity_type: &str, id: &str, value: Value) -> Result<()>;

    /// 按ID查找实体
    async fn find(&self, entity_type: &str, id: &str) -> Result<Option<Value>>;

    /// 列出某类实体
    async fn find_all(&self, entity_type: &str) -> Result<Vec<Value>>;

    /// 删除实体，返回是否存在
    async fn delete(&self, entity_type: &str, id: &str) -> Result<bool>;
}

/// 缓存门面
#[async_trait]
pub trait CacheService: Send + Sync {
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn evict(&self, key: &str) -> Result<bool>;
}

/// 事件门面
#[async_trait]
pub trait EventService: Send + Sync {
    /// 发布事件，返回收到事件的订阅者数量
    async fn publish(&self, event_type: &str, payload: Value) -> Result<usize>;

    /// 订阅事件类型
    fn subscribe(&self, event_type: &str) -> broadcast::Receiver<Value>;
}

/// HTTP门面
#[async_trait]
pub trait HttpService: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<Value>;

    async fn post_json(&self, url: &str, body: Value) -> Result<Value>;
}

/// 通知门面
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn send_email(&self, user_id: UserId, subject: &str, body: &str) -> Result<()>;

    async fn send_push(&self, user_id: UserId, title: &str, body: &str) -> Result<()>;
}

/// 租户命名空间前缀
#[derive(Debug, Clone)]
struct TenantScope {
    prefix: String,
}

impl TenantScope {
    fn new(tenant_id: TenantId) -> Self {
        Self {
            prefix: format!("tenant:{}:", tenant_id),
        }
    }

    fn apply(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }
}

/// 按租户隔离的数据门面
struct TenantDataService {
    scope: TenantScope,
    inner: Arc<dyn DataService>,
}

#[async_trait]
impl DataService for TenantDataService {
    async fn save(&self, entity_type: &str, id: &str, value: Value) -> Result<()> {
        self.inner.save(&self.scope.apply(entity_type), id, value).await
    }

    async fn find(&self, entity_type: &str, id: &str) -> Result<Option<Value>> {
        self.inner.find(&self.scope.apply(entity_type), id).await
    }

    async fn find_all(&self, entity_type: &str) -> Result<Vec<Value>> {
        self.inner.find_all(&self.scope.apply(entity_type)).await
    }

    async fn delete(&self, entity_type: &str, id: &str) -> Result<bool> {
        self.inner.delete(&self.scope.apply(entity_type), id).await
    }
}

/// 按租户隔离的缓存门面
struct TenantCacheService {
    scope: TenantScope,
    inner: Arc<dyn CacheService>,
}

#[async_trait]
impl CacheService for TenantCacheService {
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.inner.put(&self.scope.apply(key), value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.get(&self.scope.apply(key)).await
    }

    async fn evict(&self, key: &str) -> Result<bool> {
        self.inner.evict(&self.scope.apply(key)).await
    }
}

/// 按租户隔离的事件门面
struct TenantEventService {
    scope: TenantScope,
    inner: Arc<dyn EventService>,
}

#[async_trait]
impl EventService for TenantEventService {
    async fn publish(&self, event_type: &str, payload: Value) -> Result<usize> {
        self.inner.publish(&self.scope.apply(event_type), payload).await
    }

    fn subscribe(&self, event_type: &str) -> broadcast::Receiver<Value> {
        self.inner.subscribe(&self.scope.apply(event_type))
    }
}

/// 类型化GET
pub async fn get_typed<T>(http: &dyn HttpService, url: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    let value = http.get_json(url).await?;
    serde_json::from_value(value).map_err(|e| RuntimeError::Http {
        message: format!("Unexpected response shape from {}: {}", url, e),
    })
}

/// 类型化POST
pub async fn post_typed<B, T>(http: &dyn HttpService, url: &str, body: &B) -> Result<T>
where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
{
    let value = http.post_json(url, serde_json::to_value(body)?).await?;
    serde_json::from_value(value).map_err(|e| RuntimeError::Http {
        message: format!("Unexpected response shape from {}: {}", url, e),
    })
}

/// 宿主服务集合，克隆开销为若干Arc
#[derive(Clone)]
pub struct HostServices {
    tenant_id: Option<TenantId>,
    data: Arc<dyn DataService>,
    cache: Arc<dyn CacheService>,
    events: Arc<dyn EventService>,
    http: Arc<dyn HttpService>,
    notifications: Arc<dyn NotificationService>,
}

impl HostServices {
    pub fn new(
        data: Arc<dyn DataService>,
        cache: Arc<dyn CacheService>,
        events: Arc<dyn EventService>,
        http: Arc<dyn HttpService>,
        notifications: Arc<dyn NotificationService>,
    ) -> Self {
        Self {
            tenant_id: None,
            data,
            cache,
            events,
            http,
            notifications,
        }
    }

    /// 进程内实现，HTTP使用reqwest客户端
    pub fn in_memory() -> Self {
        Self {
            tenant_id: None,
            data: Arc::new(InMemoryDataService::new()),
            cache: Arc::new(InMemoryCache::new()),
            events: Arc::new(InMemoryEventService::default()),
            http: Arc::new(ReqwestHttpService::default()),
            notifications: Arc::new(LoggingNotificationService::new()),
        }
    }

    /// 租户视图：数据、缓存和事件加上租户前缀，HTTP和通知共用
    ///
    /// 对同一租户重复调用返回等价视图；对另一租户调用会嵌套前缀，仍在原租户的命名空间内。
    pub fn for_tenant(&self, tenant_id: TenantId) -> Self {
        if self.tenant_id == Some(tenant_id) {
            return self.clone();
        }
        let scope = TenantScope::new(tenant_id);
        Self {
            tenant_id: Some(tenant_id),
            data: Arc::new(TenantDataService {
                scope: scope.clone(),
                inner: self.data.clone(),
            }),
            cache: Arc::new(TenantCacheService {
                scope: scope.clone(),
                inner: self.cache.clone(),
            }),
            events: Arc::new(TenantEventService {
                scope,
                inner: self.events.clone(),
            }),
            http: self.http.clone(),
            notifications: self.notifications.clone(),
        }
    }

    /// 视图所属租户，宿主持有的原始集合为None
    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn with_data(mut self, data: Arc<dyn DataService>) -> Self {
        self.data = data;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheService>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventService>) -> Self {
        self.events = events;
        self
    }

    pub fn with_http(mut self, http: Arc<dyn HttpService>) -> Self {
        self.http = http;
        self
    }

    pub fn with_notifications(mut self, notifications: Arc<dyn NotificationService>) -> Self {
        self.notifications = notifications;
        self
    }

    pub fn data(&self) -> &dyn DataService {
        self.data.as_ref()
    }

    pub fn cache(&self) -> &dyn CacheService {
        self.cache.as_ref()
    }

    pub fn events(&self) -> &dyn EventService {
        self.events.as_ref()
    }

    pub fn http(&self) -> &dyn HttpService {
        self.http.as_ref()
    }

    pub fn notifications(&self) -> &dyn NotificationService {
        self.notifications.as_ref()
    }
}

impl Default for HostServices {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl fmt::Debug for HostServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostServices")
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}
