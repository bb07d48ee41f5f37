//! 进程内消息总线
//!
//! 每条流保存全部消息；每个 `{group}|{topic}` 维护读游标、待确认集合和重投队列。
//! 重新订阅时，投递给已退出消费者的未确认消息会再次投递；
//! 同组仍在运行的消费者手上的消息不受影响。

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::topics::{self, subject_matches};
use super::{
    dispatch, resolve_streams, AckAction, EventBus, MessageHandler, MessageMeta, SubscribeOptions, SubscriptionHandle,
};
use crate::error::{HubSyncError, Result};

const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct GroupState {
    cursor: u64,
    /// seq -> 已投递次数
    pending: HashMap<u64, u64>,
    /// seq -> 正在处理它的消费者
    owners: HashMap<u64, u64>,
    live: HashSet<u64>,
    redeliver: VecDeque<u64>,
}

#[derive(Debug)]
struct StreamState {
    messages: BTreeMap<u64, (String, Bytes)>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            messages: BTreeMap::new(),
            next_seq: 1,
            groups: HashMap::new(),
        }
    }
}

struct Delivery {
    sequence: u64,
    topic: String,
    payload: Bytes,
    delivered: u64,
}

impl StreamState {
    fn next_delivery(&mut self, key: &str, pattern: &str, consumer: u64) -> Option<Delivery> {
        let group = self.groups.entry(key.to_string()).or_default();

        while let Some(seq) = group.redeliver.pop_front() {
            let Some((topic, payload)) = self.messages.get(&seq) else {
                group.pending.remove(&seq);
                continue;
            };
            group.owners.insert(seq, consumer);
            let delivered = group.pending.entry(seq).or_insert(0);
            *delivered += 1;
            return Some(Delivery {
                sequence: seq,
                topic: topic.clone(),
                payload: payload.clone(),
                delivered: *delivered,
            });
        }

        let start = group.cursor + 1;
        for (seq, (topic, payload)) in self.messages.range(start..) {
            group.cursor = *seq;
            if subject_matches(pattern, topic) {
                group.pending.insert(*seq, 1);
                group.owners.insert(*seq, consumer);
                return Some(Delivery {
                    sequence: *seq,
                    topic: topic.clone(),
                    payload: payload.clone(),
                    delivered: 1,
                });
            }
        }
        None
    }
}

#[derive(Default)]
struct Inner {
    streams: Mutex<HashMap<String, StreamState>>,
    notify: Notify,
    next_consumer: AtomicU64,
}

/// clone 后共享同一份数据
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus").finish_non_exhaustive()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前流中的消息 (topic, payload)，按序号排列
    pub fn stream_messages(&self, stream: &str) -> Vec<(String, Bytes)> {
        self.inner
            .streams
            .lock()
            .get(stream)
            .map(|s| s.messages.values().cloned().collect())
            .unwrap_or_default()
    }

    fn group_key(group: &str, topic: &str) -> String {
        format!("{}|{}", group, topic)
    }

    /// 把已退出消费者名下的未确认消息放回重投队列，并登记新消费者
    fn join_group(&self, stream: &str, key: &str, consumer: u64) {
        let mut streams = self.inner.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        let group = state.groups.entry(key.to_string()).or_default();
        let mut seqs: Vec<u64> = group
            .pending
            .keys()
            .copied()
            .filter(|seq| !group.owners.get(seq).is_some_and(|owner| group.live.contains(owner)))
            .collect();
        seqs.sort_unstable();
        for seq in seqs {
            if !group.redeliver.contains(&seq) {
                group.owners.remove(&seq);
                group.redeliver.push_back(seq);
            }
        }
        group.live.insert(consumer);
    }

    fn leave_group(&self, stream: &str, key: &str, consumer: u64) {
        let mut streams = self.inner.streams.lock();
        if let Some(group) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(key)) {
            group.live.remove(&consumer);
        }
    }

    fn take(&self, stream: &str, key: &str, pattern: &str, consumer: u64) -> Option<Delivery> {
        let mut streams = self.inner.streams.lock();
        streams
            .entry(stream.to_string())
            .or_default()
            .next_delivery(key, pattern, consumer)
    }

    fn settle(&self, stream: &str, key: &str, seq: u64, action: AckAction) {
        let mut streams = self.inner.streams.lock();
        let Some(state) = streams.get_mut(stream) else { return };
        let Some(group) = state.groups.get_mut(key) else { return };
        group.owners.remove(&seq);
        match action {
            AckAction::Ack => {
                group.pending.remove(&seq);
            }
            AckAction::Nak => {
                if state.messages.contains_key(&seq) {
                    group.redeliver.push_back(seq);
                } else {
                    group.pending.remove(&seq);
                }
            }
        }
    }

    async fn consume(
        self,
        stream: &'static str,
        topic: String,
        consumer: u64,
        opts: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) {
        let key = Self::group_key(&opts.group, &topic);
        let _member = GroupMember {
            bus: self.clone(),
            stream,
            key: key.clone(),
            consumer,
        };
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let Some(d) = self.take(stream, &key, &topic, consumer) else {
                let notified = self.inner.notify.notified();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = notified => {}
                    _ = tokio::time::sleep(IDLE_POLL) => {}
                }
                continue;
            };

            let meta = MessageMeta {
                topic: d.topic,
                stream: stream.to_string(),
                sequence: d.sequence,
                delivered: d.delivered,
                message_id: d.sequence.to_string(),
            };
            if !opts.auto_ack {
                self.settle(stream, &key, d.sequence, AckAction::Ack);
            }
            let action = dispatch(&self, &opts, &handler, d.payload, meta).await;
            if opts.auto_ack {
                self.settle(stream, &key, d.sequence, action);
            }
        }
        debug!(stream, topic = %topic, group = %opts.group, "内存订阅已停止");
    }
}

/// 消费循环退出（含 panic）时注销消费者
struct GroupMember {
    bus: MemoryBus,
    stream: &'static str,
    key: String,
    consumer: u64,
}

impl Drop for GroupMember {
    fn drop(&mut self) {
        self.bus.leave_group(self.stream, &self.key, self.consumer);
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if topic.contains('*') || topic.contains('>') {
            return Err(HubSyncError::InvalidArgument(format!("发布的 topic 不能包含通配符: {}", topic)));
        }
        let spec = topics::stream_for_topic(topic)
            .ok_or_else(|| HubSyncError::NotFound(format!("topic {} 不属于任何流", topic)))?;
        {
            let mut streams = self.inner.streams.lock();
            let state = streams.entry(spec.name.to_string()).or_default();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.messages.insert(seq, (topic.to_string(), payload));
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, opts: SubscribeOptions, handler: Arc<dyn MessageHandler>) -> Result<SubscriptionHandle> {
        let resolved = resolve_streams(&opts)?;
        let cancel = CancellationToken::new();
        let mut tasks = Vec::with_capacity(resolved.len());
        for (spec, topic) in resolved {
            let consumer = self.inner.next_consumer.fetch_add(1, Ordering::Relaxed);
            self.join_group(spec.name, &Self::group_key(&opts.group, &topic), consumer);
            let fut = self.clone().consume(
                spec.name,
                topic,
                consumer,
                opts.clone(),
                handler.clone(),
                cancel.child_token(),
            );
            tasks.push(tokio::spawn(fut));
        }
        info!(group = %opts.group, topics = ?opts.topics, "✅ 内存订阅已启动");
        Ok(SubscriptionHandle::new(cancel, tasks))
    }

    async fn purge_stream(&self, stream: &str) -> Result<()> {
        if topics::stream_by_name(stream).is_none() {
            return Err(HubSyncError::NotFound(format!("流 {} 不存在", stream)));
        }
        let mut streams = self.inner.streams.lock();
        if let Some(state) = streams.get_mut(stream) {
            state.messages.clear();
            for group in state.groups.values_mut() {
                group.pending.clear();
                group.owners.clear();
                group.redeliver.clear();
            }
        }
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
        let mut streams = self.inner.streams.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let before = state.messages.len();
        state.messages.retain(|_, (_, payload)| !filter(payload));
        let deleted = (before - state.messages.len()) as u64;
        info!("流 {} 按条件删除 {} 条消息", stream, deleted);
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{handler_fn, DeadLetter};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    const STREAM: &str = "mirrorTaskEventStream";

    async fn recv(rx: &mut mpsc::UnboundedReceiver<(String, u64)>) -> (String, u64) {
        tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_delete_by_filter_counts_matches() {
        let bus = MemoryBus::new();
        for p in ["ok1", "bad", "ok2"] {
            bus.publish(topics::MIRROR_TASK_FINISHED, Bytes::from(p)).await.unwrap();
        }
        let deleted = bus.delete_messages_by_filter(STREAM, &|p| p == b"bad").await.unwrap();
        assert_eq!(deleted, 1);
        let left: Vec<Bytes> = bus.stream_messages(STREAM).into_iter().map(|(_, p)| p).collect();
        assert_eq!(left, vec![Bytes::from("ok1"), Bytes::from("ok2")]);

        assert_eq!(bus.delete_messages_by_filter(STREAM, &|_| false).await.unwrap(), 0);
        assert!(bus.delete_messages_by_filter("noSuchStream", &|_| true).await.is_err());
    }

    #[tokio::test]
    async fn test_publish_rejects_unknown_topic() {
        let bus = MemoryBus::new();
        assert!(matches!(
            bus.publish("foo.bar", Bytes::new()).await,
            Err(HubSyncError::NotFound(_))
        ));
        assert!(bus.publish("mirror.task.>", Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_message_redelivered_then_dead_lettered() {
        let bus = MemoryBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = handler_fn(move |payload, meta| {
            let tx = tx.clone();
            async move {
                let body = String::from_utf8_lossy(&payload).into_owned();
                let _ = tx.send((body.clone(), meta.delivered));
                if body == "bad" {
                    Err(HubSyncError::Other("boom".into()))
                } else {
                    Ok(())
                }
            }
        });
        let handle = bus
            .subscribe(SubscribeOptions::new("g", vec![topics::MIRROR_TASK_EVENTS.into()]), handler)
            .await
            .unwrap();

        bus.publish(topics::MIRROR_TASK_FAILED, Bytes::from("bad")).await.unwrap();
        assert_eq!(recv(&mut rx).await, ("bad".to_string(), 1));
        assert_eq!(recv(&mut rx).await, ("bad".to_string(), 2));

        bus.publish(topics::MIRROR_TASK_FINISHED, Bytes::from("good")).await.unwrap();
        assert_eq!(recv(&mut rx).await, ("good".to_string(), 1));
        handle.stop().await;

        let dead = bus.stream_messages(topics::DEAD_LETTER_STREAM);
        assert_eq!(dead.len(), 1);
        let letter: DeadLetter = serde_json::from_slice(&dead[0].1).unwrap();
        assert_eq!(letter.topic, topics::MIRROR_TASK_FAILED);
        assert_eq!(letter.error, HubSyncError::Other("boom".into()).to_string());
    }

    #[tokio::test]
    async fn test_group_resumes_after_resubscribe() {
        let bus = MemoryBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler = handler_fn(move |_, _| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let opts = SubscribeOptions::new("mirrorTaskEventConsumer", vec![topics::MIRROR_TASK_FINISHED.into()]);

        bus.publish(topics::MIRROR_TASK_FINISHED, Bytes::from("1")).await.unwrap();
        let handle = bus.subscribe(opts.clone(), handler.clone()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // 停止期间发布的消息在重新订阅后送达，已确认的不重复
        bus.publish(topics::MIRROR_TASK_FINISHED, Bytes::from("2")).await.unwrap();
        let handle = bus.subscribe(opts, handler).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.stop().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_subscriber_leaves_in_flight_message_alone() {
        let bus = MemoryBus::new();
        let gate = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let g = gate.clone();
        let handler = handler_fn(move |payload, meta| {
            let tx = tx.clone();
            let gate = g.clone();
            async move {
                let _ = tx.send((String::from_utf8_lossy(&payload).into_owned(), meta.delivered));
                gate.cancelled().await;
                Ok(())
            }
        });
        let opts = SubscribeOptions::new("g3", vec![topics::MIRROR_TASK_FINISHED.into()]);

        let first = bus.subscribe(opts.clone(), handler.clone()).await.unwrap();
        bus.publish(topics::MIRROR_TASK_FINISHED, Bytes::from("slow")).await.unwrap();
        assert_eq!(recv(&mut rx).await, ("slow".to_string(), 1));

        // 第一个消费者还在处理 slow，同组新消费者不能把它抢走
        let second = bus.subscribe(opts, handler).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(rx.try_recv().is_err());

        gate.cancel();
        first.stop().await;
        second.stop().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_manual_ack_does_not_redeliver() {
        let bus = MemoryBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler = handler_fn(move |_, _| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(HubSyncError::Other("ignored".into()))
            }
        });
        let mut opts = SubscribeOptions::new("g2", vec![topics::NOTIFICATION_HIGH.into()]);
        opts.auto_ack = false;
        let handle = bus.subscribe(opts, handler).await.unwrap();
        bus.publish(topics::NOTIFICATION_HIGH, Bytes::from("n")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        handle.stop().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(bus.stream_messages(topics::DEAD_LETTER_STREAM).is_empty());
    }

    #[tokio::test]
    async fn test_purge_stream() {
        let bus = MemoryBus::new();
        bus.publish(topics::DEPLOY_SERVICE_UPDATE, Bytes::from("x")).await.unwrap();
        bus.purge_stream("deployServiceUpdateStream").await.unwrap();
        assert!(bus.stream_messages("deployServiceUpdateStream").is_empty());
        assert!(bus.purge_stream("nope").await.is_err());
    }
}
