//! Event bus and event payloads.

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventHandler, SubscriptionId};
pub use types::{
    CollectionTriggered, DocumentEvent, Event, EventType, JobCreated, JobIssue, ManagerProgress,
    StatusChanged, StepCompleted, StepLifecycle, StepProgress,
};
