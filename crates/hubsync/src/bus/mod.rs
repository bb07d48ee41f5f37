//! 消息总线
//!
//! 至少一次投递、持久消费组、死信队列。三种后端：
//! - `NatsBus`：NATS JetStream
//! - `RedisStreamBus`：Redis Streams
//! - `MemoryBus`：进程内实现，语义一致，测试与单机使用
//!
//! `MessageBus` 枚举分发到具体后端，启动时构造一次后注入到各组件。

pub mod memory;
pub mod nats;
pub mod redis_stream;
pub mod topics;

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::config::{BusBackend, BusConfig};
use crate::error::{HubSyncError, Result};

pub use self::memory::MemoryBus;
pub use self::nats::NatsBus;
pub use self::redis_stream::RedisStreamBus;

/// 投递给回调的消息元信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMeta {
    pub topic: String,
    pub stream: String,
    pub sequence: u64,
    /// 第几次投递，从 1 开始
    pub delivered: u64,
    pub message_id: String,
}

/// 消息回调
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: Bytes, meta: MessageMeta) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Bytes, MessageMeta) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, payload: Bytes, meta: MessageMeta) -> Result<()> {
        (self.0)(payload, meta).await
    }
}

/// 用闭包构造回调
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Bytes, MessageMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// 持久消费组；同组订阅者竞争消费
    pub group: String,
    pub topics: Vec<String>,
    /// true：根据回调结果 ack/nak；false：收到即 ack
    pub auto_ack: bool,
    /// 回调失败时是否重新投递
    pub redeliver_on_failure: bool,
    /// 最大投递次数，超过后进入死信
    pub max_deliver: u32,
}

impl SubscribeOptions {
    pub fn new(group: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            group: group.into(),
            topics,
            auto_ack: true,
            redeliver_on_failure: true,
            max_deliver: 2,
        }
    }
}

/// 订阅句柄；stop() 取消并等待消费循环退出，drop 时只取消
pub struct SubscriptionHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub(crate) fn new(cancel: CancellationToken, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { cancel, tasks }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("订阅消费循环异常退出: {}", e);
                }
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    async fn subscribe(&self, opts: SubscribeOptions, handler: Arc<dyn MessageHandler>) -> Result<SubscriptionHandle>;

    /// 清空整条流
    async fn purge_stream(&self, stream: &str) -> Result<()>;

    /// 删除 filter 返回 true 的消息，返回删除条数
    async fn delete_messages_by_filter(
        &self,
        stream: &str,
        filter: &(dyn for<'f> Fn(&'f [u8]) -> bool + Send + Sync),
    ) -> Result<u64>;
}

/// 死信内容
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub stream: String,
    pub topic: String,
    pub sequence: u64,
    pub delivered: u64,
    pub error: String,
    pub payload: String,
}

/// 回调完成后对消息的处理
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckAction {
    Ack,
    Nak,
}

/// 调用回调并决定 ack/nak；超过最大投递次数的失败消息转入死信后 ack
///
/// auto_ack 为 false 时调用方已在收到时 ack，这里只执行回调并记录错误。
pub(crate) async fn dispatch<B>(
    bus: &B,
    opts: &SubscribeOptions,
    handler: &Arc<dyn MessageHandler>,
    payload: Bytes,
    meta: MessageMeta,
) -> AckAction
where
    B: EventBus + ?Sized,
{
    let result = handler.handle(payload.clone(), meta.clone()).await;
    let err = match result {
        Ok(()) => return AckAction::Ack,
        Err(e) => e,
    };

    if !opts.auto_ack || !opts.redeliver_on_failure {
        warn!(
            topic = %meta.topic,
            sequence = meta.sequence,
            "消息处理失败，不重新投递: {}",
            err
        );
        return AckAction::Ack;
    }

    if meta.delivered < opts.max_deliver as u64 {
        warn!(
            topic = %meta.topic,
            sequence = meta.sequence,
            delivered = meta.delivered,
            "消息处理失败，等待重新投递: {}",
            err
        );
        return AckAction::Nak;
    }

    if meta.stream == topics::DEAD_LETTER_STREAM {
        error!(sequence = meta.sequence, "死信消息处理失败，丢弃: {}", err);
        return AckAction::Ack;
    }

    let letter = DeadLetter {
        stream: meta.stream.clone(),
        topic: meta.topic.clone(),
        sequence: meta.sequence,
        delivered: meta.delivered,
        error: err.to_string(),
        payload: String::from_utf8_lossy(&payload).into_owned(),
    };
    let body = match serde_json::to_vec(&letter) {
        Ok(b) => Bytes::from(b),
        Err(e) => {
            error!("序列化死信失败: {}", e);
            return AckAction::Nak;
        }
    };
    match bus.publish(&topics::dlq_topic(&meta.stream), body).await {
        Ok(()) => {
            warn!(
                topic = %meta.topic,
                sequence = meta.sequence,
                delivered = meta.delivered,
                "消息超过最大投递次数，已转入死信: {}",
                err
            );
            AckAction::Ack
        }
        Err(e) => {
            error!("写入死信失败，保留原消息: {}", e);
            AckAction::Nak
        }
    }
}

/// 具体后端的枚举分发
#[derive(Debug, Clone)]
pub enum MessageBus {
    Nats(NatsBus),
    RedisStream(RedisStreamBus),
    Memory(MemoryBus),
}

impl MessageBus {
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        match config.backend {
            BusBackend::Nats => Ok(MessageBus::Nats(NatsBus::connect(config).await?)),
            BusBackend::RedisStream => Ok(MessageBus::RedisStream(RedisStreamBus::connect(config).await?)),
            BusBackend::Memory => Ok(MessageBus::Memory(MemoryBus::new())),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            MessageBus::Nats(_) => "nats",
            MessageBus::RedisStream(_) => "redis_stream",
            MessageBus::Memory(_) => "memory",
        }
    }

    pub async fn publish_json<T: Serialize + Sync>(&self, topic: &str, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)
            .map_err(|e| HubSyncError::Serialization(format!("序列化消息失败: {}", e)))?;
        self.publish(topic, Bytes::from(body)).await
    }
}

#[async_trait]
impl EventBus for MessageBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        match self {
            MessageBus::Nats(b) => b.publish(topic, payload).await,
            MessageBus::RedisStream(b) => b.publish(topic, payload).await,
            MessageBus::Memory(b) => b.publish(topic, payload).await,
        }
    }

    async fn subscribe(&self, opts: SubscribeOptions, handler: Arc<dyn MessageHandler>) -> Result<SubscriptionHandle> {
        match self {
            MessageBus::Nats(b) => b.subscribe(opts, handler).await,
            MessageBus::RedisStream(b) => b.subscribe(opts, handler).await,
            MessageBus::Memory(b) => b.subscribe(opts, handler).await,
        }
    }

    async fn purge_stream(&self, stream: &str) -> Result<()> {
        match self {
            MessageBus::Nats(b) => b.purge_stream(stream).await,
            MessageBus::RedisStream(b) => b.purge_stream(stream).await,
            MessageBus::Memory(b) => b.purge_stream(stream).await,
        }
    }

    async fn delete_messages_by_filter(
        &self,
        stream: &str,
        filter: &(dyn for<'f> Fn(&'f [u8]) -> bool + Send + Sync),
    ) -> Result<u64> {
        match self {
            MessageBus::Nats(b) => b.delete_messages_by_filter(stream, filter).await,
            MessageBus::RedisStream(b) => b.delete_messages_by_filter(stream, filter).await,
            MessageBus::Memory(b) => b.delete_messages_by_filter(stream, filter).await,
        }
    }
}

/// 订阅的每个 topic 都必须属于目录中的某条流
pub(crate) fn resolve_streams(opts: &SubscribeOptions) -> Result<Vec<(&'static topics::StreamSpec, String)>> {
    if opts.topics.is_empty() {
        return Err(HubSyncError::InvalidArgument("订阅至少需要一个 topic".to_string()));
    }
    opts.topics
        .iter()
        .map(|t| {
            topics::stream_for_topic(t)
                .map(|s| (s, t.clone()))
                .ok_or_else(|| HubSyncError::NotFound(format!("topic {} 不属于任何流", t)))
        })
        .collect()
}
