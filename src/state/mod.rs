//! Job state management.

pub mod manager;

pub use manager::StateManager;
