//! Observability: logging setup, per-query traces and their history.

pub mod logger;
pub mod trace;
pub mod trace_store;

pub use logger::init_logging;
pub use trace::{QueryTrace, TraceRecorder};
pub use trace_store::TraceStore;
