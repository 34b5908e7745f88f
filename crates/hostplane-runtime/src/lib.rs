//! Hostplane Runtime: durable task dispatch and the instance state machine.
//!
//! Intents become task records routed by category to a queue. Workers claim
//! one task at a time, run its body under the category's time limits and
//! record the resulting instance status. Every status change is the outcome
//! of a task holding its lease.

pub mod alerts;
pub mod context;
pub mod dispatcher;
pub mod executor;
pub mod policy;
pub mod routing;
pub mod scheduler;
pub mod state_machine;
pub mod worker;

pub use alerts::{Alert, AlertSink, AlertSeverity, LogAlertSink, MemoryAlertSink};
pub use context::Context;
pub use dispatcher::Dispatcher;
pub use executor::{Outcome, TaskExecutor};
pub use policy::{CategoryPolicy, PolicyTable, RetryPolicy, TimeLimits};
pub use routing::{queue_for, routing_table, ROUTING_VERSION};
pub use scheduler::Scheduler;
pub use state_machine::{plan_for, Gate, LifecyclePlan};
pub use worker::{ReadyHook, Settlement, Worker, WorkerPool};
