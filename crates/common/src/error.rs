//! Configuration errors.
//!
//! Everything that can be rejected before a single tensor is allocated lands
//! here. Each variant names the offending value so a failed run can be fixed
//! from the message alone.

use thiserror::Error;

/// Fatal configuration error raised while resolving an experiment.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Dataset name not in {mnist, cifar10, cifar100, svhn}.
    #[error("unknown dataset \"{0}\" (expected one of: mnist, cifar10, cifar100, svhn)")]
    UnknownDataset(String),

    /// Model name not in the assembly table.
    #[error(
        "unknown model \"{0}\" (expected one of: real, ttq, ttqresnet, ttqresnet32, bnn, ffbnn)"
    )]
    UnknownModel(String),

    /// Optimizer name not implemented.
    #[error("optimizer \"{0}\" not implemented (expected one of: sgd, nag, rmsprop, adam)")]
    UnknownOptimizer(String),

    /// Activation name not in {sign, pact, bipact}.
    #[error("unknown activation \"{0}\" (expected one of: sign, pact, bipact)")]
    UnknownActivation(String),

    /// A numeric setting outside its valid range.
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result alias for configuration resolution.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Helper for range violations.
pub fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
