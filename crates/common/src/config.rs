//! Experiment configuration.
//!
//! [`ExperimentConfig`] is serialised as JSON next to every checkpoint. Every
//! field has a default, so a minimal `{}` JSON describes a small MNIST run.
//! Dataset, model and optimizer names stay plain strings in the file and are
//! resolved into typed kinds by [`ExperimentConfig::model_config`] and
//! [`OptimizerConfig::kind`]; unknown names fail there, before any tensor is
//! allocated.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{invalid, ConfigError, ConfigResult};

// ── Dataset ─────────────────────────────────────────────────────────────────

/// Supported image-classification datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetKind {
    Mnist,
    Cifar10,
    Cifar100,
    Svhn,
}

impl DatasetKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mnist => "mnist",
            Self::Cifar10 => "cifar10",
            Self::Cifar100 => "cifar100",
            Self::Svhn => "svhn",
        }
    }

    /// Input channel count.
    pub fn channels(&self) -> usize {
        match self {
            Self::Mnist => 1,
            _ => 3,
        }
    }

    /// Square image side in pixels.
    pub fn image_size(&self) -> usize {
        match self {
            Self::Mnist => 28,
            _ => 32,
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            Self::Cifar100 => 100,
            _ => 10,
        }
    }

    /// Number of training samples held out (from the end) for validation.
    pub fn num_valid(&self) -> usize {
        10_000
    }

    /// Global average-pool window after two stride-2 stages (7 for MNIST, 8 otherwise).
    pub fn pool_window(&self) -> usize {
        self.image_size() / 4
    }

    /// `(C, H, W)` of one sample.
    pub fn image_shape(&self) -> (usize, usize, usize) {
        let s = self.image_size();
        (self.channels(), s, s)
    }
}

impl FromStr for DatasetKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "mnist" => Ok(Self::Mnist),
            "cifar10" => Ok(Self::Cifar10),
            "cifar100" => Ok(Self::Cifar100),
            "svhn" => Ok(Self::Svhn),
            other => Err(ConfigError::UnknownDataset(other.to_string())),
        }
    }
}

// ── Model ───────────────────────────────────────────────────────────────────

/// Fixed model topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    /// Full-precision baseline CNN.
    Real,
    /// Ten TTQ convolutions with ternary-activation batch norm.
    Ttq,
    /// TTQ CNN with two residual stages and a full-precision head.
    TtqResnet,
    /// ResNet-32 style stack of TTQ basic blocks.
    TtqResnet32,
    /// Courbariaux-style binarized network with squared hinge loss.
    Bnn,
    /// The BNN topology with full-precision weights and clipped activations.
    FfBnn,
}

impl ModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Ttq => "ttq",
            Self::TtqResnet => "ttqresnet",
            Self::TtqResnet32 => "ttqresnet32",
            Self::Bnn => "bnn",
            Self::FfBnn => "ffbnn",
        }
    }

    /// Base channel count used when the config leaves `width` unset.
    pub fn default_width(&self) -> usize {
        match self {
            Self::Real | Self::Ttq | Self::TtqResnet => 64,
            Self::TtqResnet32 => 16,
            Self::Bnn | Self::FfBnn => 128,
        }
    }
}

impl FromStr for ModelKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "real" => Ok(Self::Real),
            "ttq" => Ok(Self::Ttq),
            "ttqresnet" => Ok(Self::TtqResnet),
            "ttqresnet32" => Ok(Self::TtqResnet32),
            "bnn" => Ok(Self::Bnn),
            "ffbnn" => Ok(Self::FfBnn),
            other => Err(ConfigError::UnknownModel(other.to_string())),
        }
    }
}

// ── Activation ──────────────────────────────────────────────────────────────

/// Activation after each BN / hidden FC layer of the `bnn` and `ffbnn` models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    /// `sign(x)` with the saturating straight-through estimator.
    Sign,
    /// `clip(x, 0, α)` with a learned α.
    Pact,
    /// `clip(x, -α, α)` with a learned α.
    BiPact,
}

impl ActivationKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sign => "sign",
            Self::Pact => "pact",
            Self::BiPact => "bipact",
        }
    }
}

impl FromStr for ActivationKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "sign" => Ok(Self::Sign),
            "pact" => Ok(Self::Pact),
            "bipact" => Ok(Self::BiPact),
            other => Err(ConfigError::UnknownActivation(other.to_string())),
        }
    }
}

// ── Optimizer ───────────────────────────────────────────────────────────────

/// Gradient-descent flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    /// SGD with Nesterov momentum.
    Nag,
    RmsProp,
    Adam,
}

impl FromStr for OptimizerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "sgd" => Ok(Self::Sgd),
            "nag" => Ok(Self::Nag),
            "rmsprop" => Ok(Self::RmsProp),
            "adam" => Ok(Self::Adam),
            other => Err(ConfigError::UnknownOptimizer(other.to_string())),
        }
    }
}

/// Optimizer hyper-parameters. Fields irrelevant to the chosen optimizer are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_optimizer_name")]
    pub name: String,
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// Momentum (sgd / nag).
    #[serde(default = "default_mom")]
    pub mom: f64,
    /// Squared-gradient decay (rmsprop).
    #[serde(default = "default_rho")]
    pub rho: f64,
    #[serde(default = "default_eps")]
    pub eps: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            name: default_optimizer_name(),
            lr: default_lr(),
            mom: default_mom(),
            rho: default_rho(),
            eps: default_eps(),
            beta1: default_beta1(),
            beta2: default_beta2(),
        }
    }
}

impl OptimizerConfig {
    /// Resolve and validate.
    pub fn kind(&self) -> ConfigResult<OptimizerKind> {
        let kind = self.name.parse::<OptimizerKind>()?;
        if !(self.lr > 0.0) {
            return Err(invalid("optimizer.lr", format!("{} must be > 0", self.lr)));
        }
        if !(0.0..1.0).contains(&self.mom) {
            return Err(invalid("optimizer.mom", format!("{} not in [0, 1)", self.mom)));
        }
        Ok(kind)
    }
}

// ── Model config (resolved) ─────────────────────────────────────────────────

/// Typed, validated model description consumed by the assemblies.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub dataset: DatasetKind,
    pub model: ModelKind,
    /// Base channel count of the first stage.
    pub width: usize,
    /// TTQ threshold factor β in `t = β · mean(|W|)`.
    pub ttq_threshold: f64,
    /// Binary weight magnitude H.
    pub bnn_h: f64,
    pub bnn_stochastic: bool,
    /// Use the Glorot learning-rate scale for binary layers (else 1.0).
    pub bnn_glorot_lr: bool,
    pub bn_eps: f64,
    pub bn_momentum: f64,
    pub act: ActivationKind,
    /// Initial clip level α of PACT / BiPACT activations.
    pub pact_alpha: f64,
    /// Uniform levels `2^bits` over the clip range; `None` leaves it continuous.
    pub pact_bits: Option<u32>,
    /// Weight of `Σ α²` over every PACT activation, added to the `ffbnn` loss.
    pub l2: f64,
}

impl ModelConfig {
    /// Resolve names with default tunables.
    pub fn new(dataset: &str, model: &str) -> ConfigResult<Self> {
        ExperimentConfig {
            dataset: dataset.to_string(),
            model: model.to_string(),
            ..Default::default()
        }
        .model_config()
    }

    pub fn num_classes(&self) -> usize {
        self.dataset.num_classes()
    }
}

// ── Experiment config (on disk) ─────────────────────────────────────────────

/// Everything needed to reproduce one training run.
///
/// Backwards-compatible: missing fields fall back to their `#[serde(default)]`
/// values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    /// Seeds initialisation, stochastic binarization and shuffling.
    #[serde(default)]
    pub seed: u64,
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    // ── Quantisation tuning ─────────────────────────────────────────────────
    /// Base channel count; `None` uses the model's default.
    #[serde(default)]
    pub width: Option<usize>,
    #[serde(default = "default_ttq_threshold")]
    pub ttq_threshold: f64,
    #[serde(default = "default_bnn_h")]
    pub bnn_h: f64,
    #[serde(default)]
    pub bnn_stochastic: bool,
    #[serde(default = "default_true")]
    pub bnn_glorot_lr: bool,

    // ── Batch norm ──────────────────────────────────────────────────────────
    #[serde(default = "default_bn_eps")]
    pub bn_eps: f64,
    #[serde(default = "default_bn_momentum")]
    pub bn_momentum: f64,

    // ── Activations (bnn / ffbnn) ───────────────────────────────────────────
    /// One of `sign`, `pact`, `bipact`.
    #[serde(default = "default_act")]
    pub act: String,
    #[serde(default = "default_pact_alpha")]
    pub pact_alpha: f64,
    #[serde(default)]
    pub pact_bits: Option<u32>,
    /// L2 weight on the PACT clip levels.
    #[serde(default = "default_l2")]
    pub l2: f64,

    /// Log a training line every N steps (0 = never).
    #[serde(default = "default_log_every")]
    pub log_every: usize,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_dataset() -> String {
    "mnist".to_string()
}
fn default_model() -> String {
    "ttq".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_work_dir() -> PathBuf {
    PathBuf::from("runs")
}
fn default_batch_size() -> usize {
    100
}
fn default_num_epochs() -> usize {
    10
}
fn default_optimizer_name() -> String {
    "nag".to_string()
}
fn default_lr() -> f64 {
    1e-3
}
fn default_mom() -> f64 {
    0.9
}
fn default_rho() -> f64 {
    0.9
}
fn default_eps() -> f64 {
    1e-8
}
fn default_beta1() -> f64 {
    0.9
}
fn default_beta2() -> f64 {
    0.999
}
fn default_ttq_threshold() -> f64 {
    0.05
}
fn default_bnn_h() -> f64 {
    1.0
}
fn default_true() -> bool {
    true
}
fn default_bn_eps() -> f64 {
    1e-5
}
fn default_bn_momentum() -> f64 {
    0.1
}
fn default_act() -> String {
    "sign".to_string()
}
fn default_pact_alpha() -> f64 {
    3.0
}
fn default_l2() -> f64 {
    1e-4
}
fn default_log_every() -> usize {
    50
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            dataset: default_dataset(),
            model: default_model(),
            data_dir: default_data_dir(),
            work_dir: default_work_dir(),
            batch_size: default_batch_size(),
            num_epochs: default_num_epochs(),
            seed: 0,
            optimizer: OptimizerConfig::default(),
            width: None,
            ttq_threshold: default_ttq_threshold(),
            bnn_h: default_bnn_h(),
            bnn_stochastic: false,
            bnn_glorot_lr: true,
            bn_eps: default_bn_eps(),
            bn_momentum: default_bn_momentum(),
            act: default_act(),
            pact_alpha: default_pact_alpha(),
            pact_bits: None,
            l2: default_l2(),
            log_every: default_log_every(),
        }
    }
}

impl ExperimentConfig {
    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }

    pub fn dataset_kind(&self) -> ConfigResult<DatasetKind> {
        self.dataset.parse()
    }

    /// Resolve names and validate every model-side knob.
    pub fn model_config(&self) -> ConfigResult<ModelConfig> {
        let dataset = self.dataset_kind()?;
        let model = self.model.parse::<ModelKind>()?;

        if self.batch_size == 0 {
            return Err(invalid("batch_size", "must be > 0"));
        }
        let width = self.width.unwrap_or_else(|| model.default_width());
        if width == 0 {
            return Err(invalid("width", "must be > 0"));
        }
        if !(self.ttq_threshold >= 0.0) {
            return Err(invalid(
                "ttq_threshold",
                format!("{} must be >= 0", self.ttq_threshold),
            ));
        }
        if !(self.bnn_h > 0.0) {
            return Err(invalid("bnn_h", format!("{} must be > 0", self.bnn_h)));
        }
        if !(self.bn_eps > 0.0) {
            return Err(invalid("bn_eps", format!("{} must be > 0", self.bn_eps)));
        }
        let act = self.act.parse::<ActivationKind>()?;
        if !(self.pact_alpha > 0.0) {
            return Err(invalid("pact_alpha", format!("{} must be > 0", self.pact_alpha)));
        }
        if let Some(bits) = self.pact_bits {
            if !(1..=16).contains(&bits) {
                return Err(invalid("pact_bits", format!("{bits} not in 1..=16")));
            }
        }
        if !(self.l2 >= 0.0) {
            return Err(invalid("l2", format!("{} must be >= 0", self.l2)));
        }

        Ok(ModelConfig {
            dataset,
            model,
            width,
            ttq_threshold: self.ttq_threshold,
            bnn_h: self.bnn_h,
            bnn_stochastic: self.bnn_stochastic,
            bnn_glorot_lr: self.bnn_glorot_lr,
            bn_eps: self.bn_eps,
            bn_momentum: self.bn_momentum,
            act,
            pact_alpha: self.pact_alpha,
            pact_bits: self.pact_bits,
            l2: self.l2,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
