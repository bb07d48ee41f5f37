//! 镜像 worker pool
//!
//! 一个派发循环按优先级出队（受令牌桶限速），通过有界通道交给固定数量的 worker。
//! 外部通过 `shutdown()` 发出 Notify 信号；停止时取消所有循环，通道中尚未开始处理的任务退回到出队前的状态。
//! 处理中的任务定期刷新心跳，进程失联后由对账按租约退回。
//! 处理函数 panic 时 worker 继续运行，任务停止心跳，租约到期后同样由对账退回。

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex as SyncMutex;
use tokio::select;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MirrorConfig;
use crate::error::{HubSyncError, Result};
use crate::mirror::task::TaskEvent;
use crate::mirror::worker::TaskHandler;
use crate::storage::dao::MirrorTaskDao;
use crate::storage::entities::MirrorTask;
use crate::storage::Database;
use crate::throttle::RateLimiter;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// 每秒派发任务数，<= 0 不限速
    pub rate_limit: f64,
    pub bucket_capacity: f64,
    pub poll_interval: Duration,
    /// 处理中任务的心跳间隔
    pub heartbeat: Duration,
}

impl PoolConfig {
    pub fn repo(config: &MirrorConfig) -> Self {
        Self::with_workers(config, config.worker_number)
    }

    pub fn lfs(config: &MirrorConfig) -> Self {
        Self::with_workers(config, config.lfs_worker_number)
    }

    fn with_workers(config: &MirrorConfig, workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            rate_limit: config.rate_limit,
            bucket_capacity: config.rate_bucket_capacity,
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            heartbeat: Duration::from_secs((config.task_lease_secs / 3).max(1)),
        }
    }
}

/// pool 计数
#[derive(Debug, Default)]
pub struct PoolStats {
    pub dispatched: AtomicU64,
    pub handled: AtomicU64,
    pub errors: AtomicU64,
}

pub struct WorkerPool {
    db: Database,
    handler: Arc<dyn TaskHandler>,
    config: PoolConfig,
    stats: Arc<PoolStats>,
    shutdown_signal: Arc<Notify>,
    is_running: Arc<AtomicBool>,
    cancel: CancellationToken,
    handles: SyncMutex<Vec<JoinHandle<()>>>,
    receiver: SyncMutex<Option<Arc<Mutex<mpsc::Receiver<MirrorTask>>>>>,
}

impl WorkerPool {
    pub fn new(db: Database, handler: Arc<dyn TaskHandler>, config: PoolConfig) -> Self {
        Self {
            db,
            handler,
            config,
            stats: Arc::new(PoolStats::default()),
            shutdown_signal: Arc::new(Notify::new()),
            is_running: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            handles: SyncMutex::new(Vec::new()),
            receiver: SyncMutex::new(None),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        self.stats.clone()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// 启动派发循环与 worker
    pub fn start(&self) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(HubSyncError::Other(format!("{} pool 已在运行", self.handler.name())));
        }
        info!("启动 {} pool，worker 数 {}", self.handler.name(), self.config.workers);

        let (tx, rx) = mpsc::channel::<MirrorTask>(self.config.workers);
        let rx = Arc::new(Mutex::new(rx));
        *self.receiver.lock() = Some(rx.clone());

        let mut handles = self.handles.lock();
        handles.push(self.spawn_dispatcher(tx));
        for worker_id in 0..self.config.workers {
            handles.push(self.spawn_worker(worker_id, rx.clone()));
        }
        Ok(())
    }

    /// 通知退出并等待所有循环结束；未处理的任务退回队列
    pub async fn stop(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("停止 {} pool", self.handler.name());
        self.cancel.cancel();

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for h in handles {
            if let Err(e) = h.await {
                warn!("pool 循环异常退出: {}", e);
            }
        }

        let receiver = self.receiver.lock().take();
        if let Some(rx) = receiver {
            let mut rx = rx.lock().await;
            while let Ok(mut task) = rx.try_recv() {
                if let Err(e) = requeue(&self.db, &mut task).await {
                    warn!(task_id = task.id, "退回未处理任务失败: {}", e);
                }
            }
        }
        info!("{} pool 已停止", self.handler.name());
    }

    /// 请求 `run_until_shutdown` 退出
    pub fn shutdown(&self) {
        self.shutdown_signal.notify_one();
    }

    /// 阻塞直到 ctrl-c 或 `shutdown()`，然后停止
    pub async fn run_until_shutdown(&self) -> Result<()> {
        self.start()?;
        select! {
            r = tokio::signal::ctrl_c() => {
                r?;
                info!("收到退出信号");
            }
            _ = self.shutdown_signal.notified() => {}
        }
        self.stop().await;
        Ok(())
    }

    fn spawn_dispatcher(&self, tx: mpsc::Sender<MirrorTask>) -> JoinHandle<()> {
        let db = self.db.clone();
        let handler = self.handler.clone();
        let stats = self.stats.clone();
        let cancel = self.cancel.clone();
        let poll_interval = self.config.poll_interval;
        let limiter = RateLimiter::new("dispatch", self.config.rate_limit, self.config.bucket_capacity);

        tokio::spawn(async move {
            let statuses = handler.dequeue_statuses();
            while !cancel.is_cancelled() {
                select! {
                    _ = cancel.cancelled() => break,
                    _ = limiter.acquire(1.0) => {}
                }

                let dequeued = db
                    .with_conn(|conn| MirrorTaskDao::new(conn).dequeue_highest_priority(statuses, TaskEvent::Continue))
                    .await;
                match dequeued {
                    Ok(Some(mut task)) => {
                        debug!(task_id = task.id, priority = task.priority, "派发任务");
                        stats.dispatched.fetch_add(1, Ordering::Relaxed);
                        let permit = select! {
                            _ = cancel.cancelled() => None,
                            p = tx.reserve() => p.ok(),
                        };
                        match permit {
                            Some(permit) => permit.send(task),
                            None => {
                                if let Err(e) = requeue(&db, &mut task).await {
                                    warn!(task_id = task.id, "退回任务失败: {}", e);
                                }
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        select! {
                            _ = cancel.cancelled() => break,
                            _ = sleep(poll_interval) => {}
                        }
                    }
                    Err(e) => {
                        error!("{} 出队失败: {}", handler.name(), e);
                        select! {
                            _ = cancel.cancelled() => break,
                            _ = sleep(poll_interval) => {}
                        }
                    }
                }
            }
            debug!("{} 派发循环退出", handler.name());
        })
    }

    fn spawn_worker(&self, worker_id: usize, rx: Arc<Mutex<mpsc::Receiver<MirrorTask>>>) -> JoinHandle<()> {
        let db = self.db.clone();
        let handler = self.handler.clone();
        let stats = self.stats.clone();
        let cancel = self.cancel.clone();
        let heartbeat = self.config.heartbeat;

        tokio::spawn(async move {
            debug!("{} worker {} 启动", handler.name(), worker_id);
            while !cancel.is_cancelled() {
                let task = select! {
                    _ = cancel.cancelled() => None,
                    t = async { rx.lock().await.recv().await } => t,
                };
                let Some(task) = task else { break };

                let task_id = task.id;
                let work = AssertUnwindSafe(handler.handle_task(task, cancel.child_token()))
                    .catch_unwind()
                    .map(|r| {
                        r.unwrap_or_else(|_| Err(HubSyncError::Other(format!("处理任务 {} 时 panic", task_id))))
                    });
                if let Err(e) = with_heartbeat(&db, task_id, heartbeat, work).await {
                    stats.errors.fetch_add(1, Ordering::Relaxed);
                    error!(task_id, "{} worker {} 处理任务出错: {}", handler.name(), worker_id, e);
                }
                stats.handled.fetch_add(1, Ordering::Relaxed);
            }
            debug!("{} worker {} 退出", handler.name(), worker_id);
        })
    }
}

/// 执行 work 期间每隔 `every` 刷新一次任务心跳
async fn with_heartbeat<F>(db: &Database, task_id: i64, every: Duration, work: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::pin!(work);
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            r = &mut work => return r,
            _ = ticker.tick() => {
                match db.with_conn(|conn| MirrorTaskDao::new(conn).touch(task_id)).await {
                    Ok(true) => {}
                    Ok(false) => debug!(task_id, "任务已不在执行状态，跳过心跳"),
                    Err(e) => warn!(task_id, "刷新任务心跳失败: {}", e),
                }
            }
        }
    }
}

/// 把已出队但未开始处理的任务退回（retry 事件，不计入重试次数）
async fn requeue(db: &Database, task: &mut MirrorTask) -> Result<()> {
    task.started_at = None;
    db.with_conn(|conn| MirrorTaskDao::new(conn).transition(task, TaskEvent::Retry))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::git::UpstreamRepo;
    use crate::mirror::repo_worker::RepoSyncWorker;
    use crate::mirror::task::TaskStatus;
    use crate::mirror::worker::fixtures::*;
    use crate::mirror::worker::WorkerContext;

    use async_trait::async_trait;

    fn fast_config(workers: usize) -> PoolConfig {
        PoolConfig {
            workers,
            rate_limit: 0.0,
            bucket_capacity: 1.0,
            poll_interval: Duration::from_millis(20),
            heartbeat: Duration::from_secs(60),
        }
    }

    /// 拿到任务后一直等到进程退出，再按退出路径退回任务
    struct ParkingHandler {
        ctx: WorkerContext,
        started: Arc<Notify>,
    }

    #[async_trait]
    impl TaskHandler for ParkingHandler {
        fn name(&self) -> &'static str {
            "parking"
        }

        fn dequeue_statuses(&self) -> &'static [TaskStatus] {
            &[TaskStatus::Queued]
        }

        async fn handle_task(&self, mut task: MirrorTask, cancel: CancellationToken) -> Result<()> {
            self.started.notify_one();
            cancel.cancelled().await;
            let mirror_id = task.mirror_id;
            self.ctx.release_interrupted(&mut task, mirror_id).await
        }
    }

    struct PanicHandler;

    #[async_trait]
    impl TaskHandler for PanicHandler {
        fn name(&self) -> &'static str {
            "panic"
        }

        fn dequeue_statuses(&self) -> &'static [TaskStatus] {
            &[TaskStatus::Queued]
        }

        async fn handle_task(&self, task: MirrorTask, _cancel: CancellationToken) -> Result<()> {
            panic!("handler crashed on task {}", task.id);
        }
    }

    async fn wait_until<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check().await {
            assert!(tokio::time::Instant::now() < deadline, "条件未在期限内满足");
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let h = harness();
        let mut ids = Vec::new();
        for i in 0..4 {
            let (mirror, id) = mirror_with_task(&h.db, &format!("ns/m{}", i), false).await;
            h.git.set_upstream(
                &mirror.source_url,
                UpstreamRepo { default_branch: "main".into(), head: format!("c{}", i), lfs: vec![] },
            );
            ids.push(id);
        }

        let pool = WorkerPool::new(
            h.db.clone(),
            Arc::new(RepoSyncWorker::new(h.ctx.clone())),
            fast_config(2),
        );
        pool.start().unwrap();
        assert!(pool.start().is_err());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let mut finished = 0;
            for id in &ids {
                if crate::mirror::worker::fixtures::task(&h.db, *id).await.status == TaskStatus::Finished {
                    finished += 1;
                }
            }
            if finished == ids.len() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "任务未在期限内完成");
            sleep(Duration::from_millis(20)).await;
        }

        pool.stop().await;
        assert!(!pool.is_running());
        assert_eq!(pool.stats().dispatched.load(Ordering::Relaxed), 4);
        assert_eq!(pool.stats().errors.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_stop_returns_in_flight_and_buffered_tasks() {
        let h = harness();
        let (_, first) = mirror_with_task(&h.db, "ns/a", false).await;
        let (_, second) = mirror_with_task(&h.db, "ns/b", false).await;
        let started = Arc::new(Notify::new());
        let pool = WorkerPool::new(
            h.db.clone(),
            Arc::new(ParkingHandler { ctx: h.ctx.clone(), started: started.clone() }),
            fast_config(1),
        );
        pool.start().unwrap();
        started.notified().await;

        // 一个任务在处理中，另一个在通道里等待
        let db = h.db.clone();
        wait_until(|| {
            let db = db.clone();
            async move {
                let running = db
                    .with_conn(|conn| MirrorTaskDao::new(conn).list_by_status(&[TaskStatus::Running]))
                    .await
                    .unwrap();
                running.len() == 2
            }
        })
        .await;

        pool.stop().await;
        for id in [first, second] {
            let t = crate::mirror::worker::fixtures::task(&h.db, id).await;
            assert_eq!(t.status, TaskStatus::Queued);
            assert_eq!(t.retry_count, 0);
            assert!(t.next_retry_at.is_none());
        }
        assert_eq!(pool.stats().errors.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_handler() {
        let h = harness();
        let (_, first) = mirror_with_task(&h.db, "ns/a", false).await;
        let (_, second) = mirror_with_task(&h.db, "ns/b", false).await;
        let pool = WorkerPool::new(h.db.clone(), Arc::new(PanicHandler), fast_config(1));
        pool.start().unwrap();

        // 唯一的 worker 在第一次 panic 后仍然处理了第二个任务
        let stats = pool.stats();
        wait_until(|| {
            let stats = stats.clone();
            async move { stats.handled.load(Ordering::Relaxed) == 2 }
        })
        .await;
        pool.stop().await;
        assert_eq!(pool.stats().errors.load(Ordering::Relaxed), 2);

        // 任务留在 running 且不再有心跳，租约到期后对账会退回
        h.db.with_conn(|conn| {
            conn.execute("UPDATE mirror_tasks SET updated_at = '2000-01-01T00:00:00.000Z'", [])?;
            Ok(())
        })
        .await
        .unwrap();
        let released = h
            .db
            .with_conn(|conn| MirrorTaskDao::new(conn).release_expired(&crate::utils::time::before_secs(60)))
            .await
            .unwrap();
        let mut ids: Vec<i64> = released.iter().map(|t| t.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![first, second]);
        assert!(released.iter().all(|t| t.status == TaskStatus::Queued));
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_running_task() {
        let h = harness();
        let (_, id) = mirror_with_task(&h.db, "ns/a", false).await;
        dequeue(&h.db, &[TaskStatus::Queued]).await.unwrap();
        h.db.with_conn(|conn| {
            conn.execute(
                "UPDATE mirror_tasks SET updated_at = '2000-01-01T00:00:00.000Z' WHERE id = ?1",
                rusqlite::params![id],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let out = with_heartbeat(&h.db, id, Duration::from_millis(10), async {
            sleep(Duration::from_millis(60)).await;
            Ok(())
        })
        .await;
        assert!(out.is_ok());
        let t = crate::mirror::worker::fixtures::task(&h.db, id).await;
        assert!(t.updated_at.as_str() > "2000-01-01T00:00:00.000Z");

        let released = h
            .db
            .with_conn(|conn| MirrorTaskDao::new(conn).release_expired(&crate::utils::time::before_secs(60)))
            .await
            .unwrap();
        assert!(released.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_restores_queued_without_retry_cost() {
        let h = harness();
        let (_mirror, id) = mirror_with_task(&h.db, "ns/a", false).await;
        let mut task = dequeue(&h.db, &[TaskStatus::Queued]).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        requeue(&h.db, &mut task).await.unwrap();
        let stored = crate::mirror::worker::fixtures::task(&h.db, id).await;
        assert_eq!(stored.status, TaskStatus::Queued);
        assert_eq!(stored.retry_count, 0);
    }
}
