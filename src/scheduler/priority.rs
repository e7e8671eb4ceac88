//! Priority levels, ranking, degradation and keyword classification

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::task::{PrioritizedTask, TaskDraft, TaskId};
use crate::error::ReliabilityError;

/// Urgency of a task. Ordered so that `Critical > High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Most urgent first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// 0 for critical up to 3 for low.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        other.rank().cmp(&self.rank())
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ReliabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(ReliabilityError::invalid_config(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}

/// Priority after a failure that brought the retry count to `retry_count`.
///
/// Three or more failures force `Low`, whatever the priority was. At exactly
/// two, anything above `Medium` except `Critical` drops to `Medium`; lower
/// priorities are never raised.
pub fn degrade(priority: Priority, retry_count: u32) -> Priority {
    if retry_count >= 3 {
        Priority::Low
    } else if retry_count == 2 && priority != Priority::Critical {
        priority.min(Priority::Medium)
    } else {
        priority
    }
}

/// Serving order: `Less` means `a` goes first.
///
/// Higher priority, then earlier deadline (any deadline before none), then
/// fewer dependencies.
pub fn rank_cmp<P>(a: &PrioritizedTask<P>, b: &PrioritizedTask<P>) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| match (a.deadline, b.deadline) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.dependencies.len().cmp(&b.dependencies.len()))
}

// English and Polish keyword families, matched as lowercase substrings.
const CRITICAL_KEYWORDS: &[&str] = &[
    "urgent",
    "critical",
    "emergency",
    "asap",
    "immediately",
    "blocker",
    "outage",
    "hotfix",
    "production down",
    "pilne",
    "pilny",
    "pilna",
    "krytyczn",
    "natychmiast",
    "awari",
    "niezwłocznie",
];

const HIGH_KEYWORDS: &[&str] = &[
    "important",
    "high priority",
    "essential",
    "significant",
    "required",
    "ważn",
    "istotn",
    "wysoki priorytet",
    "koniecznie",
    "wymagane",
];

const LOW_KEYWORDS: &[&str] = &[
    "later",
    "optional",
    "nice to have",
    "someday",
    "when possible",
    "low priority",
    "minor",
    "eventually",
    "później",
    "opcjonaln",
    "kiedyś",
    "w wolnej chwili",
    "niski priorytet",
    "drobn",
];

/// Classify a free-text description by keyword family, case-insensitively.
pub fn detect_priority(text: &str) -> Priority {
    let text = text.to_lowercase();
    let mentions = |words: &[&str]| words.iter().any(|w| text.contains(w));
    if mentions(CRITICAL_KEYWORDS) {
        Priority::Critical
    } else if mentions(HIGH_KEYWORDS) {
        Priority::High
    } else if mentions(LOW_KEYWORDS) {
        Priority::Low
    } else {
        Priority::Medium
    }
}

/// Classify a batch of drafts and return them in serving order.
///
/// The description becomes the payload; drafts without an id get a
/// generated one.
pub fn prioritize_tasks<I>(drafts: I) -> Vec<PrioritizedTask<String>>
where
    I: IntoIterator<Item = TaskDraft>,
{
    let mut tasks: Vec<PrioritizedTask<String>> = drafts
        .into_iter()
        .map(|draft| PrioritizedTask {
            id: draft.id.unwrap_or_else(TaskId::generate),
            priority: detect_priority(&draft.description),
            payload: draft.description,
            dependencies: draft.dependencies,
            deadline: draft.deadline,
            retry_count: 0,
        })
        .collect();
    tasks.sort_by(rank_cmp);
    tasks
}
