//! Schedulable units of work

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::priority::Priority;

/// Task identifier: text or integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskId {
    Number(i64),
    Text(String),
}

impl TaskId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        TaskId::Text(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Number(n) => write!(f, "{n}"),
            TaskId::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId::Text(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        TaskId::Text(s)
    }
}

impl From<i64> for TaskId {
    fn from(n: i64) -> Self {
        TaskId::Number(n)
    }
}

impl From<i32> for TaskId {
    fn from(n: i32) -> Self {
        TaskId::Number(n.into())
    }
}

impl From<&TaskId> for TaskId {
    fn from(id: &TaskId) -> Self {
        id.clone()
    }
}

/// A unit of work with its scheduling metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrioritizedTask<P = serde_json::Value> {
    pub id: TaskId,
    pub priority: Priority,
    pub payload: P,
    /// Ids that must be completed before this task is executable
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
}

impl<P> PrioritizedTask<P> {
    pub fn new(id: impl Into<TaskId>, priority: Priority, payload: P) -> Self {
        Self {
            id: id.into(),
            priority,
            payload,
            dependencies: Vec::new(),
            deadline: None,
            retry_count: 0,
        }
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_dependencies<I>(mut self, ids: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<TaskId>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Every dependency satisfies `is_done`.
    pub fn is_executable<F>(&self, is_done: F) -> bool
    where
        F: Fn(&TaskId) -> bool,
    {
        self.dependencies.iter().all(is_done)
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map_or(false, |d| d < now)
    }
}

/// Free-text task description awaiting classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    #[serde(default)]
    pub id: Option<TaskId>,
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskDraft {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: None,
            description: description.into(),
            dependencies: Vec::new(),
            deadline: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_id_accepts_text_and_numbers() {
        let ids: Vec<TaskId> = serde_json::from_value(json!(["plan", 7])).unwrap();
        assert_eq!(ids, vec![TaskId::from("plan"), TaskId::from(7)]);
        assert_eq!(ids[1].to_string(), "7");
        assert_ne!(TaskId::generate(), TaskId::generate());
    }

    #[test]
    fn task_deserializes_with_defaults() {
        let task: PrioritizedTask = serde_json::from_value(json!({
            "id": 3,
            "priority": "high",
            "payload": {"prompt": "summarize"}
        }))
        .unwrap();
        assert_eq!(task.priority, Priority::High);
        assert!(task.dependencies.is_empty());
        assert_eq!(task.retry_count, 0);
        assert!(task.is_executable(|_| false));
    }

    #[test]
    fn executable_once_dependencies_done() {
        let task = PrioritizedTask::new("b", Priority::Low, ()).with_dependencies(["a", "c"]);
        assert!(!task.is_executable(|id| *id == TaskId::from("a")));
        assert!(task.is_executable(|_| true));
    }
}
