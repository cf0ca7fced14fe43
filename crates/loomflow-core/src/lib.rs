//! Workflow execution engine for Loomflow.
//!
//! This crate contains the whole engine: definition parsing and validation,
//! variable resolution, the condition evaluator, DAG analysis, loop and
//! retry handling, the bounded-parallelism scheduler, the orchestrating
//! executor, the run history store, and the event bus.
//!
//! External collaborators -- the script sandbox, the AI provider client, the
//! approval UI, and durable workflow storage -- are reached through the port
//! traits in [`ports`]. This crate depends only on `loomflow-types`, never
//! on any IO or UI crate.

pub mod condition;
pub mod context;
pub mod dag;
pub mod definition;
pub mod error;
pub mod events;
pub mod executor;
pub mod history;
pub mod loops;
pub mod ports;
pub mod resolver;
pub mod retry;
pub mod scheduler;
