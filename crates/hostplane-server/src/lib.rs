//! Hostplane server: HTTP surface over the runtime, plus the worker
//! process entry point.

pub mod routes;
pub mod state;
pub mod worker;

pub use routes::build_router;
pub use state::AppState;
