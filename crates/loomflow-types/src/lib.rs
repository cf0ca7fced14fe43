//! Shared domain types for the Loomflow workflow engine.
//!
//! This crate contains the canonical workflow definition IR, execution
//! tracking types (`StepResult`, `ExecutionRecord`), the error-kind taxonomy,
//! and the event stream types consumed by the visual canvas.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod event;
pub mod workflow;
