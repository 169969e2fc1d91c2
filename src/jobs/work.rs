//! Transient output of a worker's discovery phase. Never persisted.

use serde::{Deserialize, Serialize};

use crate::jobs::model::JsonMap;

/// How a worker's items should be turned into jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStrategy {
    /// One worker job per item, no ordering.
    #[default]
    Parallel,
    /// One worker job per item, order preserved by sequence number.
    Sequential,
    /// Work runs synchronously inside CreateJobs; nothing is enqueued.
    Inline,
}

impl std::fmt::Display for ProcessingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
            Self::Inline => "inline",
        };
        f.write_str(s)
    }
}

/// A single discovered unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub item_type: String,
    #[serde(default)]
    pub config: JsonMap,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            item_type: String::new(),
            config: JsonMap::new(),
        }
    }
}

/// What a worker's Init discovered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerInitResult {
    pub work_items: Vec<WorkItem>,
    pub total_count: usize,
    pub strategy: ProcessingStrategy,
    /// Hint for how many items to run at once. 0 means no preference.
    pub suggested_concurrency: usize,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl WorkerInitResult {
    pub fn new(work_items: Vec<WorkItem>, strategy: ProcessingStrategy) -> Self {
        let total_count = work_items.len();
        Self {
            work_items,
            total_count,
            strategy,
            suggested_concurrency: 0,
            metadata: JsonMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.work_items.is_empty()
    }
}
