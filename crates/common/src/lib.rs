//! # lowprec-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`ExperimentConfig`]** — run description (serialised as JSON), resolved
//!   into a typed [`ModelConfig`] / [`OptimizerKind`].
//! * **[`ConfigError`]** — fatal configuration errors naming the bad value.
//! * **[`ImageDataset`]** / **[`batch_to_tensors`]** — image loading & batching.

pub mod config;
pub mod data;
pub mod error;

pub use config::{
    ActivationKind, DatasetKind, ExperimentConfig, ModelConfig, ModelKind, OptimizerConfig, OptimizerKind,
};
pub use data::{batch_to_tensors, ImageDataset};
pub use error::{ConfigError, ConfigResult};
