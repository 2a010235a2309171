//! 进程内宿主服务实现
//!
//! 供测试和单机部署使用，外部持久化实现替换它们时无需改动插件。

use super::host::{CacheService, DataService, EventService, NotificationService, UserId};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// 内存数据存储，按 (实体类型, ID) 索引
#[derive(Debug, Default)]
pub struct InMemoryDataService {
    entities: DashMap<(String, String), Value>,
}

impl InMemoryDataService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

#[async_trait]
impl DataService for InMemoryDataService {
    async fn save(&self, entity_type: &str, id: &str, value: Value) -> Result<()> {
        self.entities
            .insert((entity_type.to_string(), id.to_string()), value);
        Ok(())
    }

    async fn find(&self, entity_type: &str, id: &str) -> Result<Option<Value>> {
        Ok(self
            .entities
            .get(&(entity_type.to_string(), id.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn find_all(&self, entity_type: &str) -> Result<Vec<Value>> {
        let mut items: Vec<(String, Value)> = self
            .entities
            .iter()
            .filter(|entry| entry.key().0 == entity_type)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(items.into_iter().map(|(_, value)| value).collect())
    }

    async fn delete(&self, entity_type: &str, id: &str) -> Result<bool> {
        Ok(self
            .entities
            .remove(&(entity_type.to_string(), id.to_string()))
            .is_some())
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

/// 带可选TTL的内存缓存
///
/// 过期条目在读取时淘汰，每次写入时也会清扫一遍全部过期条目。
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 清除全部已过期条目，返回清除数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.expires_at.map_or(true, |deadline| deadline > now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!("Purged {} expired cache entries", purged);
        }
        purged
    }

    /// 当前条目数，包括尚未清扫的过期条目
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheService for InMemoryCache {
    async fn put(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.purge_expired();
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), CacheEntry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) => match entry.expires_at {
                Some(deadline) if deadline <= now => true,
                _ => return Ok(Some(entry.value.clone())),
            },
            None => return Ok(None),
        };

        if expired {
            self.entries
                .remove_if(key, |_, entry| entry.expires_at.map_or(false, |d| d <= now));
            debug!("Cache entry '{}' expired", key);
        }
        Ok(None)
    }

    async fn evict(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}

/// 基于broadcast通道的事件服务
pub struct InMemoryEventService {
    channels: DashMap<String, broadcast::Sender<Value>>,
    capacity: usize,
}

impl InMemoryEventService {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, event_type: &str) -> broadcast::Sender<Value> {
        self.channels
            .entry(event_type.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryEventService {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EventService for InMemoryEventService {
    async fn publish(&self, event_type: &str, payload: Value) -> Result<usize> {
        // 没有订阅者时send返回错误，视为投递给0个订阅者
        Ok(self.sender(event_type).send(payload).unwrap_or(0))
    }

    fn subscribe(&self, event_type: &str) -> broadcast::Receiver<Value> {
        self.sender(event_type).subscribe()
    }
}

/// 已发送的通知记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentNotification {
    pub channel: NotificationChannel,
    pub user_id: UserId,
    pub title: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationChannel {
    Email,
    Push,
}

/// 只写日志的通知服务，同时保留发送记录
#[derive(Debug, Default)]
pub struct LoggingNotificationService {
    sent: Mutex<Vec<SentNotification>>,
}

impl LoggingNotificationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().clone()
    }

    fn record(&self, channel: NotificationChannel, user_id: UserId, title: &str, body: &str) {
        info!("Notification {:?} -> user {}: {}", channel, user_id, title);
        self.sent.lock().push(SentNotification {
            channel,
            user_id,
            title: title.to_string(),
            body: body.to_string(),
            sent_at: Utc::now(),
        });
    }
}

#[async_trait]
impl NotificationService for LoggingNotificationService {
    async fn send_email(&self, user_id: UserId, subject: &str, body: &str) -> Result<()> {
        self.record(NotificationChannel::Email, user_id, subject, body);
        Ok(())
    }

    async fn send_push(&self, user_id: UserId, title: &str, body: &str) -> Result<()> {
        self.record(NotificationChannel::Push, user_id, title, body);
        Ok(())
    }
}
