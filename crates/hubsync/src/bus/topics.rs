//! 流目录：stream / 持久消费者 / subject

/// 一条流的定义
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: &'static str,
    pub consumer: &'static str,
    pub subjects: &'static [&'static str],
}

pub const ACCOUNTING_FEE: &str = "accounting.fee.>";
pub const ACCOUNTING_METERING: &str = "accounting.metering.>";
pub const ACCOUNTING_DLQ: &str = "accounting.dlq.*";
pub const ACCOUNTING_DLQ_METER: &str = "accounting.dlq.meter";
pub const DEPLOY_SERVICE_UPDATE: &str = "deploy.service.update";
pub const NOTIFICATION_HIGH: &str = "notification.message.high";
pub const NOTIFICATION_NORMAL: &str = "notification.message.normal";
pub const MIRROR_TASK_EVENTS: &str = "mirror.task.>";
pub const MIRROR_TASK_FINISHED: &str = "mirror.task.finished";
pub const MIRROR_TASK_FAILED: &str = "mirror.task.failed";
pub const DEAD_LETTER: &str = "dlq.>";

pub const DEAD_LETTER_STREAM: &str = "deadLetterStream";

pub const STREAMS: &[StreamSpec] = &[
    StreamSpec {
        name: "accountingEventStream",
        consumer: "accountingServerDurableConsumer",
        subjects: &[ACCOUNTING_FEE],
    },
    StreamSpec {
        name: "meteringEventStream",
        consumer: "metertingServerDurableConsumer",
        subjects: &[ACCOUNTING_METERING],
    },
    StreamSpec {
        name: "accountingDlqStream",
        consumer: "accountingDlqDurableConsumer",
        subjects: &[ACCOUNTING_DLQ],
    },
    StreamSpec {
        name: "deployServiceUpdateStream",
        consumer: "deployServiceUpdateConsumer",
        subjects: &[DEPLOY_SERVICE_UPDATE],
    },
    StreamSpec {
        name: "highPriorityMsgStream",
        consumer: "highPriorityMsgConsumer",
        subjects: &[NOTIFICATION_HIGH],
    },
    StreamSpec {
        name: "normalPriorityMsgStream",
        consumer: "normalPriorityMsgConsumer",
        subjects: &[NOTIFICATION_NORMAL],
    },
    StreamSpec {
        name: "mirrorTaskEventStream",
        consumer: "mirrorTaskEventConsumer",
        subjects: &[MIRROR_TASK_EVENTS],
    },
    StreamSpec {
        name: DEAD_LETTER_STREAM,
        consumer: "deadLetterConsumer",
        subjects: &[DEAD_LETTER],
    },
];

/// NATS subject 匹配：`*` 匹配一个 token，`>` 匹配剩余一个或多个 token
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut p = pattern.split('.');
    let mut s = subject.split('.');
    loop {
        match (p.next(), s.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(a), Some(b)) if a == b => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// 两个 subject 模式是否可能有交集（订阅时 topic 可以带通配符）
fn patterns_overlap(a: &str, b: &str) -> bool {
    let mut x = a.split('.');
    let mut y = b.split('.');
    loop {
        match (x.next(), y.next()) {
            (Some(">"), Some(_)) | (Some(_), Some(">")) => return true,
            (Some("*"), Some(_)) | (Some(_), Some("*")) => continue,
            (Some(p), Some(q)) if p == q => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// 找到 subject 所属的流
pub fn stream_for_topic(topic: &str) -> Option<&'static StreamSpec> {
    STREAMS
        .iter()
        .find(|s| s.subjects.iter().any(|p| patterns_overlap(p, topic)))
}

pub fn stream_by_name(name: &str) -> Option<&'static StreamSpec> {
    STREAMS.iter().find(|s| s.name == name)
}

/// 某个流的死信 subject
pub fn dlq_topic(stream: &str) -> String {
    format!("dlq.{}", stream)
}

/// 持久消费者名：不能包含 `.`、`*`、`>`
pub fn durable_name(group: &str, topic: &str, single_topic: bool) -> String {
    if single_topic {
        return sanitize(group);
    }
    format!("{}_{}", sanitize(group), sanitize(topic))
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '.' | '*' | '>' | ' ' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_wildcards() {
        assert!(subject_matches("mirror.task.>", "mirror.task.finished"));
        assert!(subject_matches("mirror.task.>", "mirror.task.a.b"));
        assert!(!subject_matches("mirror.task.>", "mirror.task"));
        assert!(subject_matches("accounting.dlq.*", "accounting.dlq.meter"));
        assert!(!subject_matches("accounting.dlq.*", "accounting.dlq.meter.x"));
        assert!(subject_matches("deploy.service.update", "deploy.service.update"));
        assert!(!subject_matches("deploy.service.update", "deploy.service"));
    }

    #[test]
    fn test_stream_lookup() {
        assert_eq!(stream_for_topic(MIRROR_TASK_FINISHED).unwrap().name, "mirrorTaskEventStream");
        assert_eq!(stream_for_topic(ACCOUNTING_DLQ_METER).unwrap().name, "accountingDlqStream");
        assert_eq!(stream_for_topic("accounting.fee.charge").unwrap().consumer, "accountingServerDurableConsumer");
        assert_eq!(stream_for_topic(&dlq_topic("mirrorTaskEventStream")).unwrap().name, DEAD_LETTER_STREAM);
        assert_eq!(stream_for_topic("mirror.task.>").unwrap().name, "mirrorTaskEventStream");
        assert!(stream_for_topic("unknown.topic").is_none());
    }

    #[test]
    fn test_durable_name_is_valid() {
        assert_eq!(durable_name("mirrorTaskEventConsumer", "mirror.task.>", true), "mirrorTaskEventConsumer");
        assert_eq!(durable_name("g", "mirror.task.>", false), "g_mirror_task__");
    }
}
