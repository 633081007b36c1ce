//! Datasets and the writers that persist them.

pub mod dataset;
pub mod storage;

pub use dataset::{Dataset, OptimizationResult, RunMode, RunStatus};
pub use storage::{save_dataset, writer_for, CsvWriter, DataWriter, JsonWriter};
