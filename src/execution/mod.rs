//! Bounded execution of validated SQL.

pub mod executor;
pub mod result;

pub use executor::{ExecutionLimits, QueryExecutor};
pub use result::ExecutionOutcome;
