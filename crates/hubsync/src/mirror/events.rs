//! 镜像任务对外发布的通知与事件

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::bus::topics::{MIRROR_TASK_FAILED, MIRROR_TASK_FINISHED, NOTIFICATION_HIGH, NOTIFICATION_NORMAL};
use crate::bus::MessageBus;
use crate::storage::entities::{Mirror, MirrorTask};
use crate::utils::time::now_string;

pub const SCENARIO_REPO_SYNC_START: &str = "repo_sync_start";
pub const SCENARIO_REPO_SYNC_FINISHED: &str = "repo_sync_finished";
pub const SCENARIO_REPO_SYNC_FAILED: &str = "repo_sync_failed";
pub const SCENARIO_LFS_SYNC_FAILED: &str = "lfs_sync_failed";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationMessage {
    pub scenario: String,
    pub receiver: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub payload: Value,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MirrorTaskEvent {
    pub task_id: i64,
    pub mirror_id: i64,
    pub repo_path: String,
    pub status: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub after_last_commit_id: String,
    pub at: String,
}

impl MirrorTaskEvent {
    pub fn from_task(task: &MirrorTask, mirror: &Mirror) -> Self {
        Self {
            task_id: task.id,
            mirror_id: mirror.id,
            repo_path: mirror.local_repo_path.clone(),
            status: task.status.as_str().to_string(),
            error: task.error_message.clone(),
            after_last_commit_id: task.after_last_commit_id.clone(),
            at: now_string(),
        }
    }
}

/// 发布失败只记日志，不影响任务本身
#[derive(Debug, Clone)]
pub struct TaskNotifier {
    bus: Arc<MessageBus>,
}

impl TaskNotifier {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }

    pub async fn notify(&self, high: bool, scenario: &str, mirror: &Mirror, title: String, content: String) {
        let msg = NotificationMessage {
            scenario: scenario.to_string(),
            receiver: "admin".to_string(),
            title,
            content,
            payload: serde_json::json!({
                "mirror_id": mirror.id,
                "repo_path": mirror.local_repo_path,
                "source_url": mirror.source_url,
            }),
            created_at: now_string(),
        };
        let topic = if high { NOTIFICATION_HIGH } else { NOTIFICATION_NORMAL };
        if let Err(e) = self.bus.publish_json(topic, &msg).await {
            warn!(mirror_id = mirror.id, scenario, "发送通知失败: {}", e);
        }
    }

    pub async fn task_finished(&self, task: &MirrorTask, mirror: &Mirror) {
        self.publish_event(MIRROR_TASK_FINISHED, task, mirror).await;
    }

    pub async fn task_failed(&self, task: &MirrorTask, mirror: &Mirror) {
        self.publish_event(MIRROR_TASK_FAILED, task, mirror).await;
    }

    async fn publish_event(&self, topic: &str, task: &MirrorTask, mirror: &Mirror) {
        let event = MirrorTaskEvent::from_task(task, mirror);
        if let Err(e) = self.bus.publish_json(topic, &event).await {
            warn!(task_id = task.id, topic, "发布任务事件失败: {}", e);
        }
    }
}
