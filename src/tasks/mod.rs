//! Async analysis task subsystem.

pub mod engine;
pub mod queue;
pub mod runner;

pub use engine::TaskEngine;
pub use queue::{TaskDescriptor, TaskMode, TaskQueue};
pub use runner::{
    NoopQuota, OptionsAnalysisRunner, QuotaService, RunnerSet, StockAnalysisRunner,
};
