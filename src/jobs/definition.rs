//! Job definitions: the ordered step plans a manager job executes.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::jobs::model::JsonMap;

/// Worker type a step is routed to (e.g. `crawler`, `agent`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepType(String);

impl StepType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// What to do when a step's Init or CreateJobs fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Record the error and move on to the next step.
    Continue,
    /// Fail the manager and stop dispatching.
    #[default]
    Fail,
    /// Retry the step with exponential backoff, then fail.
    Retry,
}

/// Action taken once a step's child failures reach the tolerance limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// Cancel every pending and running sibling.
    StopAll,
    #[default]
    Continue,
    /// Surface a warning on the job, keep going.
    MarkWarning,
}

/// Limit on failed children before `failure_action` kicks in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTolerance {
    /// 0 disables the check.
    pub max_child_failures: usize,
    #[serde(default)]
    pub failure_action: FailureAction,
}

impl ErrorTolerance {
    /// The action to take for `failed` children, if the limit is reached.
    pub fn evaluate(&self, failed: usize) -> Option<FailureAction> {
        if self.max_child_failures > 0 && failed >= self.max_child_failures {
            Some(self.failure_action)
        } else {
            None
        }
    }
}

/// One ordered stage of a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStep {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: JsonMap,
    #[serde(default)]
    pub on_error: ErrorStrategy,
    #[serde(default)]
    pub error_tolerance: Option<ErrorTolerance>,
}

impl JobStep {
    pub fn new(name: impl Into<String>, step_type: impl Into<StepType>) -> Self {
        Self {
            name: name.into(),
            step_type: step_type.into(),
            description: String::new(),
            config: JsonMap::new(),
            on_error: ErrorStrategy::default(),
            error_tolerance: None,
        }
    }

    pub fn with_config(mut self, config: JsonMap) -> Self {
        self.config = config;
        self
    }

    pub fn on_error(mut self, strategy: ErrorStrategy) -> Self {
        self.on_error = strategy;
        self
    }

    pub fn with_tolerance(mut self, tolerance: ErrorTolerance) -> Self {
        self.error_tolerance = Some(tolerance);
        self
    }
}

/// A named, optionally scheduled pipeline of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Cron expression; empty means on-demand only.
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub steps: Vec<JobStep>,
}

fn default_enabled() -> bool {
    true
}

impl JobDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<JobStep>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            schedule: String::new(),
            auto_start: false,
            enabled: true,
            tags: Vec::new(),
            steps,
        }
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = schedule.into();
        self
    }

    pub fn is_on_demand(&self) -> bool {
        self.schedule.trim().is_empty()
    }

    /// Structural checks that need no worker knowledge.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::Definition {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(invalid("at least one step is required"));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(invalid("step names must not be empty"));
            }
            if step.step_type.as_str().trim().is_empty() {
                return Err(invalid(&format!("step {} has no type", step.name)));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(invalid(&format!("duplicate step name {}", step.name)));
            }
        }
        Ok(())
    }
}
