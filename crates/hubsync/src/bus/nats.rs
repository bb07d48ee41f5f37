//! NATS JetStream 后端
//!
//! 拉取连续出错（如连接断开）时按指数退避等待，拉取成功后退避清零。

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer, AckKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::topics::{self, durable_name, StreamSpec, STREAMS};
use super::{dispatch, resolve_streams, AckAction, EventBus, MessageHandler, MessageMeta, SubscribeOptions, SubscriptionHandle};
use crate::config::BusConfig;
use crate::error::{HubSyncError, Result};

const PULL_BACKOFF_MIN: Duration = Duration::from_millis(100);
const PULL_BACKOFF_MAX: Duration = Duration::from_secs(30);

fn bus_err(op: &str, e: impl std::fmt::Display) -> HubSyncError {
    HubSyncError::Bus(format!("nats {}: {}", op, e))
}

/// 下一次拉取失败后的等待时间；`None` 表示上一次拉取成功
fn next_backoff(prev: Option<Duration>) -> Duration {
    match prev {
        None => PULL_BACKOFF_MIN,
        Some(d) => (d * 2).min(PULL_BACKOFF_MAX),
    }
}

/// 持久拉取消费者配置。服务端 max_deliver 多留一次，
/// 让第 max_deliver 次失败仍能被本端接住并写入死信。
fn consumer_config(durable: &str, topic: &str, opts: &SubscribeOptions, ack_wait: Duration) -> consumer::pull::Config {
    consumer::pull::Config {
        durable_name: Some(durable.to_string()),
        filter_subject: topic.to_string(),
        ack_policy: consumer::AckPolicy::Explicit,
        deliver_policy: consumer::DeliverPolicy::All,
        max_deliver: opts.max_deliver as i64 + 1,
        ack_wait,
        ..Default::default()
    }
}

#[derive(Clone)]
pub struct NatsBus {
    js: jetstream::Context,
    request_timeout: Duration,
    ack_wait: Duration,
}

impl std::fmt::Debug for NatsBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBus")
            .field("request_timeout", &self.request_timeout)
            .field("ack_wait", &self.ack_wait)
            .finish()
    }
}

impl NatsBus {
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        let reconnect_wait = Duration::from_secs(config.reconnect_wait_secs);
        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
            .reconnect_delay_callback(move |_| reconnect_wait)
            .request_timeout(Some(request_timeout))
            .connect(config.nats_url.as_str())
            .await
            .map_err(|e| bus_err("connect", e))?;

        let bus = Self {
            js: jetstream::new(client),
            request_timeout,
            ack_wait: Duration::from_secs(config.ack_wait_secs),
        };
        for spec in STREAMS {
            bus.ensure_stream(spec).await?;
        }
        info!("✅ NATS JetStream 已连接: {}", config.nats_url);
        Ok(bus)
    }

    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<jetstream::stream::Stream> {
        self.js
            .get_or_create_stream(jetstream::stream::Config {
                name: spec.name.to_string(),
                subjects: spec.subjects.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            })
            .await
            .map_err(|e| bus_err("create stream", e))
    }

    async fn consume(
        self,
        consumer: consumer::Consumer<consumer::pull::Config>,
        stream: &'static str,
        opts: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) {
        let mut messages = match consumer.messages().await {
            Ok(m) => m,
            Err(e) => {
                error!(stream, "打开 JetStream 消息流失败: {}", e);
                return;
            }
        };

        let mut backoff: Option<Duration> = None;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = messages.next() => next,
            };
            let msg = match next {
                None => break,
                Some(Err(e)) => {
                    let wait = next_backoff(backoff);
                    backoff = Some(wait);
                    warn!(stream, backoff_ms = wait.as_millis() as u64, "拉取消息失败: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    continue;
                }
                Some(Ok(msg)) => msg,
            };
            backoff = None;

            let (sequence, delivered) = match msg.info() {
                Ok(info) => (info.stream_sequence, info.delivered.max(1) as u64),
                Err(e) => {
                    warn!(stream, "解析消息元信息失败: {}", e);
                    (0, 1)
                }
            };
            let meta = MessageMeta {
                topic: msg.message.subject.to_string(),
                stream: stream.to_string(),
                sequence,
                delivered,
                message_id: sequence.to_string(),
            };
            let payload = msg.message.payload.clone();

            if !opts.auto_ack {
                if let Err(e) = msg.ack().await {
                    warn!(stream, sequence, "ack 失败: {}", e);
                }
            }
            let action = dispatch(&self, &opts, &handler, payload, meta).await;
            if opts.auto_ack {
                let res = match action {
                    AckAction::Ack => msg.ack().await,
                    AckAction::Nak => msg.ack_with(AckKind::Nak(None)).await,
                };
                if let Err(e) = res {
                    warn!(stream, sequence, "确认消息失败: {}", e);
                }
            }
        }
        debug!(stream, group = %opts.group, "NATS 订阅已停止");
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let fut = async {
            self.js
                .publish(topic.to_string(), payload)
                .await
                .map_err(|e| bus_err("publish", e))?
                .await
                .map_err(|e| bus_err("publish ack", e))
        };
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| HubSyncError::Timeout(format!("发布到 {} 超时", topic)))??;
        Ok(())
    }

    async fn subscribe(&self, opts: SubscribeOptions, handler: Arc<dyn MessageHandler>) -> Result<SubscriptionHandle> {
        let resolved = resolve_streams(&opts)?;
        let single = resolved.len() == 1;
        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(resolved.len());

        for (spec, topic) in resolved {
            let stream = self.ensure_stream(spec).await?;
            let durable = durable_name(&opts.group, &topic, single);
            let consumer = stream
                .get_or_create_consumer(&durable, consumer_config(&durable, &topic, &opts, self.ack_wait))
                .await
                .map_err(|e| bus_err("create consumer", e))?;
            debug!(stream = spec.name, durable = %durable, "JetStream 消费者就绪");
            let fut = self
                .clone()
                .consume(consumer, spec.name, opts.clone(), handler.clone(), cancel.child_token());
            tasks.push(tokio::spawn(fut));
        }
        info!(group = %opts.group, topics = ?opts.topics, "✅ NATS 订阅已启动");
        Ok(SubscriptionHandle::new(cancel, tasks))
    }

    async fn purge_stream(&self, stream: &str) -> Result<()> {
        let s = self.js.get_stream(stream).await.map_err(|e| bus_err("get stream", e))?;
        s.purge().await.map_err(|e| bus_err("purge", e))?;
        info!("已清空流 {}", stream);
        Ok(())
    }

    async fn delete_messages_by_filter(
        &self,
        stream: &str,
        filter: &(dyn for<'f> Fn(&'f [u8]) -> bool + Send + Sync),
    ) -> Result<u64> {
        if topics::stream_by_name(stream).is_none() {
            return Err(HubSyncError::NotFound(format!("流 {} 不存在", stream)));
        }
        let mut s = self.js.get_stream(stream).await.map_err(|e| bus_err("get stream", e))?;
        let state = s.info().await.map_err(|e| bus_err("stream info", e))?.state.clone();
        if state.messages == 0 {
            return Ok(0);
        }

        let mut deleted = 0u64;
        for seq in state.first_sequence..=state.last_sequence {
            // 已删除的序号会返回 not found
            let msg = match s.get_raw_message(seq).await {
                Ok(m) => m,
                Err(e) => {
                    debug!(stream, seq, "跳过消息: {}", e);
                    continue;
                }
            };
            if filter(&msg.payload) {
                match s.delete_message(seq).await {
                    Ok(true) => deleted += 1,
                    Ok(false) => {}
                    Err(e) => warn!(stream, seq, "删除消息失败: {}", e),
                }
            }
        }
        info!("流 {} 按条件删除 {} 条消息", stream, deleted);
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pull_backoff_doubles_and_caps() {
        let mut wait = next_backoff(None);
        assert_eq!(wait, PULL_BACKOFF_MIN);
        wait = next_backoff(Some(wait));
        assert_eq!(wait, Duration::from_millis(200));
        for _ in 0..20 {
            wait = next_backoff(Some(wait));
        }
        assert_eq!(wait, PULL_BACKOFF_MAX);
        // 成功一次后从最小值重新开始
        assert_eq!(next_backoff(None), PULL_BACKOFF_MIN);
    }

    #[test]
    fn test_consumer_config_leaves_room_for_dead_letter() {
        let mut opts = SubscribeOptions::new("mirrorTaskEventConsumer", vec![topics::MIRROR_TASK_FINISHED.into()]);
        opts.max_deliver = 3;
        let durable = durable_name(&opts.group, topics::MIRROR_TASK_FINISHED, true);
        let config = consumer_config(&durable, topics::MIRROR_TASK_FINISHED, &opts, Duration::from_secs(30));

        assert_eq!(config.max_deliver, 4);
        assert_eq!(config.durable_name.as_deref(), Some(durable.as_str()));
        assert_eq!(config.filter_subject, topics::MIRROR_TASK_FINISHED);
        assert_eq!(config.ack_wait, Duration::from_secs(30));
        assert!(matches!(config.ack_policy, consumer::AckPolicy::Explicit));
        assert!(matches!(config.deliver_policy, consumer::DeliverPolicy::All));
    }
}
