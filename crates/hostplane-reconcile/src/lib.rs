//! Hostplane Reconcile: detects containers destroyed behind the
//! platform's back and feeds them to the runtime as monitoring tasks.

pub mod events;
pub mod reconciler;

pub use events::{ChannelEventSource, ContainerEvent, DockerEventSource, EventSource, EventStream};
pub use reconciler::Reconciler;
