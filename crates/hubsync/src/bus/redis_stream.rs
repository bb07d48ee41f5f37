//! Redis Streams 后端
//!
//! 每个 (消费组, topic) 对应一个 Redis 消费组。nak 的消息留在 PEL 中，
//! 空闲超过 ack_wait 后由 XCLAIM 重新认领；投递次数取自 XPENDING。
//! XPENDING 分页扫描，PEL 前部被其他消费者长期持有的消息不会挡住后面的超时消息。
//! 不支持整流清空。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingId, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::topics::{self, durable_name, subject_matches};
use super::{dispatch, resolve_streams, AckAction, EventBus, MessageHandler, MessageMeta, SubscribeOptions, SubscriptionHandle};
use crate::config::BusConfig;
use crate::error::{HubSyncError, Result};

const READ_COUNT: usize = 10;
const BLOCK_MS: usize = 1000;
const RANGE_PAGE: usize = 100;
const PENDING_PAGE: usize = 100;

#[derive(Clone)]
pub struct RedisStreamBus {
    client: redis::Client,
    conn: ConnectionManager,
    consumer: String,
    ack_wait: Duration,
}

impl std::fmt::Debug for RedisStreamBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamBus")
            .field("consumer", &self.consumer)
            .field("ack_wait", &self.ack_wait)
            .finish()
    }
}

struct Entry {
    id: String,
    topic: String,
    payload: Bytes,
    delivered: u64,
}

fn parse_entry(sid: &StreamId, delivered: u64) -> Entry {
    let topic: String = sid.get("topic").unwrap_or_default();
    let payload: Vec<u8> = sid.get("payload").unwrap_or_default();
    Entry {
        id: sid.id.clone(),
        topic,
        payload: Bytes::from(payload),
        delivered,
    }
}

/// 从一页 XPENDING 结果中挑出空闲超过 min_idle 的条目，最多 limit 条
fn select_stale(page: Vec<StreamPendingId>, min_idle: usize, limit: usize) -> Vec<StreamPendingId> {
    page.into_iter()
        .filter(|p| p.last_delivered_ms >= min_idle)
        .take(limit)
        .collect()
}

/// 流 ID `ms-seq` 中的毫秒部分作为序号展示
fn sequence_of(id: &str) -> u64 {
    id.split('-').next().and_then(|s| s.parse().ok()).unwrap_or(0)
}

impl RedisStreamBus {
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| HubSyncError::Config(format!("无效的 Redis 地址 {}: {}", config.redis_url, e)))?;
        let conn = tokio::time::timeout(
            Duration::from_secs(config.connect_timeout_secs),
            ConnectionManager::new(client.clone()),
        )
        .await
        .map_err(|_| HubSyncError::Timeout(format!("连接 Redis {} 超时", config.redis_url)))??;

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let bus = Self {
            client,
            conn,
            consumer: format!("{}-{}", host, uuid::Uuid::new_v4().simple()),
            ack_wait: Duration::from_secs(config.ack_wait_secs),
        };
        info!("✅ Redis Streams 总线已连接: consumer={}", bus.consumer);
        Ok(bus)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let res: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// 认领空闲超过 ack_wait 的待确认消息
    async fn claim_stale(&self, conn: &mut MultiplexedConnection, stream: &str, group: &str) -> Result<Vec<Entry>> {
        let min_idle = self.ack_wait.as_millis() as usize;
        let mut stale: Vec<StreamPendingId> = Vec::new();
        let mut start = "-".to_string();
        while stale.len() < READ_COUNT {
            let page: StreamPendingCountReply = conn.xpending_count(stream, group, &start, "+", PENDING_PAGE).await?;
            let Some(last) = page.ids.last() else { break };
            start = format!("({}", last.id);
            let full = page.ids.len() == PENDING_PAGE;
            stale.extend(select_stale(page.ids, min_idle, READ_COUNT - stale.len()));
            if !full {
                break;
            }
        }
        if stale.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<&str> = stale.iter().map(|p| p.id.as_str()).collect();
        let claimed: StreamClaimReply = conn.xclaim(stream, group, &self.consumer, min_idle, &ids).await?;
        Ok(claimed
            .ids
            .iter()
            .map(|sid| {
                let times = stale
                    .iter()
                    .find(|p| p.id == sid.id)
                    .map(|p| p.times_delivered as u64)
                    .unwrap_or(1);
                parse_entry(sid, times + 1)
            })
            .collect())
    }

    async fn read_new(&self, conn: &mut MultiplexedConnection, stream: &str, group: &str) -> Result<Vec<Entry>> {
        let opts = StreamReadOptions::default()
            .group(group, &self.consumer)
            .count(READ_COUNT)
            .block(BLOCK_MS);
        let reply: Option<StreamReadReply> = conn.xread_options(&[stream], &[">"], &opts).await?;
        Ok(reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .map(|sid| parse_entry(&sid, 1))
            .collect())
    }

    async fn consume(
        self,
        stream: &'static str,
        group: String,
        pattern: String,
        opts: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) {
        let mut conn = match self.client.get_multiplexed_async_connection().await {
            Ok(c) => c,
            Err(e) => {
                error!(stream, "创建 Redis 消费连接失败: {}", e);
                return;
            }
        };

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let batch = async {
                let stale = self.claim_stale(&mut conn, stream, &group).await?;
                if !stale.is_empty() {
                    return Ok::<_, HubSyncError>(stale);
                }
                self.read_new(&mut conn, stream, &group).await
            };
            let entries = tokio::select! {
                _ = cancel.cancelled() => break,
                res = batch => match res {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(stream, "读取 Redis 流失败: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };

            for entry in entries {
                if !subject_matches(&pattern, &entry.topic) {
                    let _: redis::RedisResult<i64> = conn.xack(stream, &group, &[&entry.id]).await;
                    continue;
                }
                let meta = MessageMeta {
                    topic: entry.topic,
                    stream: stream.to_string(),
                    sequence: sequence_of(&entry.id),
                    delivered: entry.delivered,
                    message_id: entry.id.clone(),
                };
                if !opts.auto_ack {
                    if let Err(e) = conn.xack::<_, _, _, i64>(stream, &group, &[&entry.id]).await {
                        warn!(stream, id = %entry.id, "ack 失败: {}", e);
                    }
                }
                let action = dispatch(&self, &opts, &handler, entry.payload, meta).await;
                if opts.auto_ack && action == AckAction::Ack {
                    if let Err(e) = conn.xack::<_, _, _, i64>(stream, &group, &[&entry.id]).await {
                        warn!(stream, id = %entry.id, "ack 失败: {}", e);
                    }
                }
            }
        }
        debug!(stream, group = %group, "Redis 订阅已停止");
    }
}

#[async_trait]
impl EventBus for RedisStreamBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let spec = topics::stream_for_topic(topic)
            .ok_or_else(|| HubSyncError::NotFound(format!("topic {} 不属于任何流", topic)))?;
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(spec.name)
            .arg("*")
            .arg("topic")
            .arg(topic)
            .arg("payload")
            .arg(&payload[..])
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, opts: SubscribeOptions, handler: Arc<dyn MessageHandler>) -> Result<SubscriptionHandle> {
        let resolved = resolve_streams(&opts)?;
        let single = resolved.len() == 1;
        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(resolved.len());
        for (spec, topic) in resolved {
            let group = durable_name(&opts.group, &topic, single);
            self.ensure_group(spec.name, &group).await?;
            let fut = self.clone().consume(
                spec.name,
                group,
                topic,
                opts.clone(),
                handler.clone(),
                cancel.child_token(),
            );
            tasks.push(tokio::spawn(fut));
        }
        info!(group = %opts.group, topics = ?opts.topics, "✅ Redis 订阅已启动");
        Ok(SubscriptionHandle::new(cancel, tasks))
    }

    async fn purge_stream(&self, stream: &str) -> Result<()> {
        Err(HubSyncError::NotSupported(format!("Redis Streams 后端不支持清空流 {}", stream)))
    }

    async fn delete_messages_by_filter(
        &self,
        stream: &str,
        filter: &(dyn for<'f> Fn(&'f [u8]) -> bool + Send + Sync),
    ) -> Result<u64> {
        if topics::stream_by_name(stream).is_none() {
            return Err(HubSyncError::NotFound(format!("流 {} 不存在", stream)));
        }
        let mut conn = self.conn.clone();
        let mut start = "-".to_string();
        let mut deleted = 0u64;
        loop {
            let page: StreamRangeReply = conn.xrange_count(stream, &start, "+", RANGE_PAGE).await?;
            let Some(last) = page.ids.last() else { break };
            start = format!("({}", last.id);

            let doomed: Vec<&str> = page
                .ids
                .iter()
                .filter(|sid| {
                    let payload: Vec<u8> = sid.get("payload").unwrap_or_default();
                    filter(&payload)
                })
                .map(|sid| sid.id.as_str())
                .collect();
            if !doomed.is_empty() {
                let n: i64 = conn.xdel(stream, &doomed).await?;
                deleted += n.max(0) as u64;
            }
            if page.ids.len() < RANGE_PAGE {
                break;
            }
        }
        info!("流 {} 按条件删除 {} 条消息", stream, deleted);
        Ok(deleted)
    }
}
