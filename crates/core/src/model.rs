//! Fixed-topology image classifiers.
//!
//! | Kind | Body | Head | Loss |
//! |------|------|------|------|
//! | `real` | 9 × (conv, BN, ReLU) | 1×1 conv + avg-pool | cross-entropy |
//! | `ttq` | 9 × (TTQ conv, BN, ternary act) | 1×1 TTQ conv + avg-pool | cross-entropy |
//! | `ttqresnet` | see [`crate::resnet`] | | cross-entropy |
//! | `ttqresnet32` | see [`crate::resnet`] | | cross-entropy |
//! | `bnn` | 6 × (binary conv, affine BN, sign or PACT), max-pool every 2 | 3 binary FC | squared hinge |
//! | `ffbnn` | 6 × (conv, BN, sign or PACT), max-pool every 2 | 3 FC | cross-entropy + `l2 · Σ α²` |
//!
//! Every assembly reconstrains all of its constrained layers at the top of
//! `forward_t`, so a forward after an optimiser step never sees stale weights.

use candle_core::{Result, Tensor};
use lowprec_common::{ModelConfig, ModelKind};
use rand::rngs::StdRng;

use crate::activation::{alpha_penalty, Activation};
use crate::constrain::{self, collect_param_groups, Node, ParamGroup, ParamScope, Precision};
use crate::conv::{Conv2dBnn, Conv2dTtq, ConvShape, RealConv2d};
use crate::linear::{LinearBnn, RealLinear};
use crate::loss::{cross_entropy_head, squared_hinge_head, ForwardOutput};
use crate::norm::{BatchNorm2d, BatchNormTz};
use crate::resnet::{TtqResnet32Model, TtqResnetModel};
use crate::weight::BinaryConfig;

/// Ternary activation thresholds: `sign(x)` with an exact-zero band at 0.
pub const TZ_LO: f64 = 0.0;
pub const TZ_HI: f64 = 0.0;

const BNN_BN_EPS: f64 = 1e-4;
const BNN_BN_MOMENTUM: f64 = 0.1;

/// Reshape a flat or NCHW batch to `(n, C, H, W)` for `config.dataset`.
pub(crate) fn input_images(xs: &Tensor, config: &ModelConfig) -> Result<Tensor> {
    let (c, h, w) = config.dataset.image_shape();
    xs.reshape((xs.dim(0)?, c, h, w))
}

/// The 9-conv body shared by the plain, TTQ and TTQ-residual CNNs.
fn cnn_body(c_in: usize, b: usize) -> [ConvShape; 9] {
    [
        ConvShape::same3(c_in, b),
        ConvShape::same3(b, b),
        ConvShape::same3(b, 2 * b).with_stride(2),
        ConvShape::same3(2 * b, 2 * b),
        ConvShape::same3(2 * b, 2 * b),
        ConvShape::same3(2 * b, 4 * b).with_stride(2),
        ConvShape::same3(4 * b, 4 * b),
        ConvShape::same3(4 * b, 4 * b),
        ConvShape::same3(4 * b, 4 * b),
    ]
}

// ── Stages ──────────────────────────────────────────────────────────────────

/// TTQ conv followed by BN + ternary activation.
pub struct TtqStage {
    conv: Conv2dTtq,
    norm: BatchNormTz,
}

impl TtqStage {
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.norm.forward_t(&self.conv.forward(x)?, train)
    }

    pub fn conv(&self) -> &Conv2dTtq {
        &self.conv
    }
}

impl Node for TtqStage {
    fn children(&self) -> Vec<&dyn Node> {
        vec![&self.conv as &dyn Node, &self.norm]
    }
}

/// The first `n` stages of the TTQ body, named `conv{i}` / `bntz{i}`.
pub(crate) fn ttq_stages(
    config: &ModelConfig,
    scope: &ParamScope,
    n: usize,
    rng: &mut StdRng,
) -> Result<Vec<TtqStage>> {
    cnn_body(config.dataset.channels(), config.width)
        .into_iter()
        .take(n)
        .enumerate()
        .map(|(i, shape)| {
            Ok(TtqStage {
                conv: Conv2dTtq::ttq(shape, config.ttq_threshold, scope.pp(format!("conv{i}")), rng)?,
                norm: BatchNormTz::new(
                    shape.out_channels,
                    config.bn_eps,
                    config.bn_momentum,
                    TZ_LO,
                    TZ_HI,
                    scope.pp(format!("bntz{i}")),
                )?,
            })
        })
        .collect()
}

// ── RealModel ───────────────────────────────────────────────────────────────

/// Full-precision baseline CNN.
pub struct RealModel {
    config: ModelConfig,
    stages: Vec<(RealConv2d, BatchNorm2d)>,
    head: RealConv2d,
}

impl RealModel {
    pub fn new(config: &ModelConfig, scope: ParamScope, rng: &mut StdRng) -> Result<Self> {
        let mut stages = Vec::with_capacity(9);
        for (i, shape) in cnn_body(config.dataset.channels(), config.width).into_iter().enumerate() {
            let conv = RealConv2d::new(shape, scope.pp(format!("conv{i}")), rng)?;
            let bn = BatchNorm2d::new(
                shape.out_channels,
                config.bn_eps,
                config.bn_momentum,
                scope.pp(format!("bn{i}")),
            )?;
            stages.push((conv, bn));
        }
        let head = RealConv2d::new(
            ConvShape::new(4 * config.width, config.num_classes(), 1),
            scope.pp("conv9"),
            rng,
        )?;
        Ok(Self {
            config: config.clone(),
            stages,
            head,
        })
    }

    pub fn logits(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut v = input_images(xs, &self.config)?;
        for (conv, bn) in &self.stages {
            v = bn.forward_t(&conv.forward(&v)?, train)?.relu()?;
        }
        self.head
            .forward(&v)?
            .avg_pool2d(self.config.dataset.pool_window())?
            .flatten_from(1)
    }

    pub fn forward_t(&self, xs: &Tensor, ys: &Tensor, train: bool) -> Result<ForwardOutput> {
        cross_entropy_head(&self.logits(xs, train)?, ys)
    }
}

impl Node for RealModel {
    fn children(&self) -> Vec<&dyn Node> {
        let mut out: Vec<&dyn Node> = Vec::with_capacity(2 * self.stages.len() + 1);
        for (conv, bn) in &self.stages {
            out.push(conv);
            out.push(bn);
        }
        out.push(&self.head);
        out
    }
}

// ── TtqModel ────────────────────────────────────────────────────────────────

/// Trained-ternary CNN: every conv, including the 1×1 head, is TTQ.
pub struct TtqModel {
    config: ModelConfig,
    stages: Vec<TtqStage>,
    head: Conv2dTtq,
}

impl TtqModel {
    pub fn new(config: &ModelConfig, scope: ParamScope, rng: &mut StdRng) -> Result<Self> {
        let stages = ttq_stages(config, &scope, 9, rng)?;
        let head = Conv2dTtq::ttq(
            ConvShape::new(4 * config.width, config.num_classes(), 1),
            config.ttq_threshold,
            scope.pp("conv9"),
            rng,
        )?;
        Ok(Self {
            config: config.clone(),
            stages,
            head,
        })
    }

    pub fn stages(&self) -> &[TtqStage] {
        &self.stages
    }

    pub fn head(&self) -> &Conv2dTtq {
        &self.head
    }

    pub fn logits(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut v = input_images(xs, &self.config)?;
        for stage in &self.stages {
            v = stage.forward_t(&v, train)?;
        }
        self.head
            .forward(&v)?
            .avg_pool2d(self.config.dataset.pool_window())?
            .flatten_from(1)
    }

    pub fn forward_t(&self, xs: &Tensor, ys: &Tensor, train: bool) -> Result<ForwardOutput> {
        constrain::constrain(self)?;
        cross_entropy_head(&self.logits(xs, train)?, ys)
    }
}

impl Node for TtqModel {
    fn children(&self) -> Vec<&dyn Node> {
        let mut out: Vec<&dyn Node> = self.stages.iter().map(|s| s as &dyn Node).collect();
        out.push(&self.head);
        out
    }
}

// ── BnnModel ────────────────────────────────────────────────────────────────

/// `(in, out)` channels of the six 3×3 convs shared by `bnn` and `ffbnn`.
fn vgg_channels(c_in: usize, b: usize) -> [(usize, usize); 6] {
    [(c_in, b), (b, b), (b, 2 * b), (2 * b, 2 * b), (2 * b, 4 * b), (4 * b, 4 * b)]
}

/// Widths of the three FC layers after the conv stack (three 2×2 max-pools).
fn vgg_fc_dims(config: &ModelConfig) -> [usize; 4] {
    let b = config.width;
    let side = config.dataset.image_size() / 8;
    [4 * b * side * side, 8 * b, 8 * b, config.num_classes()]
}

/// BinaryNet-style CNN: binary weights, affine BN, and sign (or PACT)
/// activations throughout.
pub struct BnnModel {
    config: ModelConfig,
    convs: Vec<(Conv2dBnn, BatchNorm2d, Activation)>,
    fcs: Vec<LinearBnn>,
    fc_acts: Vec<Activation>,
}

impl BnnModel {
    pub fn new(config: &ModelConfig, scope: ParamScope, rng: &mut StdRng) -> Result<Self> {
        let binary = BinaryConfig {
            h: config.bnn_h,
            stochastic: config.bnn_stochastic,
            glorot_lr: config.bnn_glorot_lr,
        };

        let mut convs = Vec::with_capacity(6);
        for (i, (cin, cout)) in vgg_channels(config.dataset.channels(), config.width).into_iter().enumerate() {
            let conv = Conv2dBnn::bnn(ConvShape::same3(cin, cout), binary, scope.pp(format!("conv{i}")), rng)?;
            let bn = BatchNorm2d::affine(cout, BNN_BN_EPS, BNN_BN_MOMENTUM, scope.pp(format!("bn{i}")))?;
            let act = Activation::new(config, scope.pp(format!("act{i}")))?;
            convs.push((conv, bn, act));
        }

        let dims = vgg_fc_dims(config);
        let mut fcs = Vec::with_capacity(3);
        let mut fc_acts = Vec::with_capacity(2);
        for (i, io) in dims.windows(2).enumerate() {
            fcs.push(LinearBnn::bnn(io[0], io[1], binary, scope.pp(format!("fc{i}")), rng)?);
            if i + 2 < dims.len() {
                fc_acts.push(Activation::new(config, scope.pp(format!("fc_act{i}")))?);
            }
        }
        Ok(Self {
            config: config.clone(),
            convs,
            fcs,
            fc_acts,
        })
    }

    pub fn logits(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut v = input_images(xs, &self.config)?.affine(2.0, -1.0)?;
        for (i, (conv, bn, act)) in self.convs.iter().enumerate() {
            v = conv.forward(&v)?;
            if i % 2 == 1 {
                v = v.max_pool2d(2)?;
            }
            v = act.forward(&bn.forward_t(&v, train)?)?;
        }
        let mut v = v.flatten_from(1)?;
        for (i, fc) in self.fcs.iter().enumerate() {
            v = fc.forward(&v)?;
            if let Some(act) = self.fc_acts.get(i) {
                v = act.forward(&v)?;
            }
        }
        Ok(v)
    }

    pub fn forward_t(&self, xs: &Tensor, ys: &Tensor, train: bool) -> Result<ForwardOutput> {
        constrain::constrain(self)?;
        squared_hinge_head(&self.logits(xs, train)?, ys)
    }
}

impl Node for BnnModel {
    fn children(&self) -> Vec<&dyn Node> {
        let mut out: Vec<&dyn Node> = Vec::new();
        for (conv, bn, act) in &self.convs {
            out.extend([conv as &dyn Node, bn, act]);
        }
        out.extend(self.fcs.iter().map(|f| f as &dyn Node));
        out.extend(self.fc_acts.iter().map(|a| a as &dyn Node));
        out
    }
}

// ── FfBnnModel ──────────────────────────────────────────────────────────────

/// The `bnn` topology with f32 convs / FCs, non-affine BN and the configured
/// activation. Cross-entropy plus `l2 · Σ α²` over its PACT clip levels.
pub struct FfBnnModel {
    config: ModelConfig,
    convs: Vec<(RealConv2d, BatchNorm2d, Activation)>,
    fcs: Vec<RealLinear>,
    fc_acts: Vec<Activation>,
}

impl FfBnnModel {
    pub fn new(config: &ModelConfig, scope: ParamScope, rng: &mut StdRng) -> Result<Self> {
        let mut convs = Vec::with_capacity(6);
        for (i, (cin, cout)) in vgg_channels(config.dataset.channels(), config.width).into_iter().enumerate() {
            let conv = RealConv2d::new(ConvShape::same3(cin, cout), scope.pp(format!("conv{i}")), rng)?;
            let bn = BatchNorm2d::new(cout, config.bn_eps, config.bn_momentum, scope.pp(format!("bn{i}")))?;
            let act = Activation::new(config, scope.pp(format!("act{i}")))?;
            convs.push((conv, bn, act));
        }

        let dims = vgg_fc_dims(config);
        let mut fcs = Vec::with_capacity(3);
        let mut fc_acts = Vec::with_capacity(2);
        for (i, io) in dims.windows(2).enumerate() {
            fcs.push(RealLinear::new(io[0], io[1], scope.pp(format!("fc{i}")), rng)?);
            if i + 2 < dims.len() {
                fc_acts.push(Activation::new(config, scope.pp(format!("fc_act{i}")))?);
            }
        }
        Ok(Self {
            config: config.clone(),
            convs,
            fcs,
            fc_acts,
        })
    }

    pub fn logits(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut v = input_images(xs, &self.config)?.affine(2.0, -1.0)?;
        for (i, (conv, bn, act)) in self.convs.iter().enumerate() {
            v = conv.forward(&v)?;
            if i % 2 == 1 {
                v = v.max_pool2d(2)?;
            }
            v = act.forward(&bn.forward_t(&v, train)?)?;
        }
        let mut v = v.flatten_from(1)?;
        for (i, fc) in self.fcs.iter().enumerate() {
            v = fc.forward(&v)?;
            if let Some(act) = self.fc_acts.get(i) {
                v = act.forward(&v)?;
            }
        }
        Ok(v)
    }

    /// `Σ α²` over every PACT activation, if any.
    pub fn alpha_penalty(&self) -> Result<Option<Tensor>> {
        alpha_penalty(self.convs.iter().map(|(_, _, act)| act).chain(&self.fc_acts))
    }

    pub fn forward_t(&self, xs: &Tensor, ys: &Tensor, train: bool) -> Result<ForwardOutput> {
        let mut out = cross_entropy_head(&self.logits(xs, train)?, ys)?;
        if let Some(penalty) = self.alpha_penalty()? {
            out.loss = (out.loss + penalty.affine(self.config.l2, 0.0)?)?;
        }
        Ok(out)
    }
}

impl Node for FfBnnModel {
    fn children(&self) -> Vec<&dyn Node> {
        let mut out: Vec<&dyn Node> = Vec::new();
        for (conv, bn, act) in &self.convs {
            out.extend([conv as &dyn Node, bn, act]);
        }
        out.extend(self.fcs.iter().map(|f| f as &dyn Node));
        out.extend(self.fc_acts.iter().map(|a| a as &dyn Node));
        out
    }
}

// ── Model ───────────────────────────────────────────────────────────────────

/// Any of the assemblies, chosen by [`ModelKind`].
pub enum Model {
    Real(RealModel),
    Ttq(TtqModel),
    TtqResnet(TtqResnetModel),
    TtqResnet32(TtqResnet32Model),
    Bnn(BnnModel),
    FfBnn(FfBnnModel),
}

impl Model {
    /// Build and initialise every layer from `rng`, registering parameters in `scope`.
    pub fn new(config: &ModelConfig, scope: ParamScope, rng: &mut StdRng) -> Result<Self> {
        if config.width == 0 {
            candle_core::bail!("model width must be positive");
        }
        Ok(match config.model {
            ModelKind::Real => Self::Real(RealModel::new(config, scope, rng)?),
            ModelKind::Ttq => Self::Ttq(TtqModel::new(config, scope, rng)?),
            ModelKind::TtqResnet => Self::TtqResnet(TtqResnetModel::new(config, scope, rng)?),
            ModelKind::TtqResnet32 => Self::TtqResnet32(TtqResnet32Model::new(config, scope, rng)?),
            ModelKind::Bnn => Self::Bnn(BnnModel::new(config, scope, rng)?),
            ModelKind::FfBnn => Self::FfBnn(FfBnnModel::new(config, scope, rng)?),
        })
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Real(_) => ModelKind::Real,
            Self::Ttq(_) => ModelKind::Ttq,
            Self::TtqResnet(_) => ModelKind::TtqResnet,
            Self::TtqResnet32(_) => ModelKind::TtqResnet32,
            Self::Bnn(_) => ModelKind::Bnn,
            Self::FfBnn(_) => ModelKind::FfBnn,
        }
    }

    /// Reconstrain, run the graph, and attach the loss head.
    ///
    /// `xs`: `(n, C, H, W)` or `(n, C·H·W)` f32; `ys`: `(n,)` u32 labels.
    pub fn forward_t(&self, xs: &Tensor, ys: &Tensor, train: bool) -> Result<ForwardOutput> {
        match self {
            Self::Real(m) => m.forward_t(xs, ys, train),
            Self::Ttq(m) => m.forward_t(xs, ys, train),
            Self::TtqResnet(m) => m.forward_t(xs, ys, train),
            Self::TtqResnet32(m) => m.forward_t(xs, ys, train),
            Self::Bnn(m) => m.forward_t(xs, ys, train),
            Self::FfBnn(m) => m.forward_t(xs, ys, train),
        }
    }

    /// Reconstrain every constrained layer; returns how many there are.
    pub fn constrain(&self) -> Result<usize> {
        constrain::constrain(self)
    }

    pub fn resample(&self, rng: &mut StdRng) -> Result<()> {
        constrain::resample(self, rng)
    }

    pub fn param_groups(&self) -> Vec<ParamGroup> {
        collect_param_groups(self)
    }
}

impl Node for Model {
    fn children(&self) -> Vec<&dyn Node> {
        let inner: &dyn Node = match self {
            Self::Real(m) => m,
            Self::Ttq(m) => m,
            Self::TtqResnet(m) => m,
            Self::TtqResnet32(m) => m,
            Self::Bnn(m) => m,
            Self::FfBnn(m) => m,
        };
        vec![inner]
    }
}

// ── Size summary ────────────────────────────────────────────────────────────

/// Trainable-parameter counts and storage cost at inference precision.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSummary {
    pub total_params: usize,
    pub ternary_params: usize,
    pub binary_params: usize,
    /// Average storage bits per trainable parameter.
    pub effective_bits_per_param: f64,
    pub compression_ratio_vs_f32: f64,
}

/// Summarise every parameter group under `root`.
pub fn model_summary(root: &dyn Node) -> ModelSummary {
    let mut total = 0;
    let mut ternary = 0;
    let mut binary = 0;
    let mut bits = 0.0;
    for group in collect_param_groups(root) {
        let n = group.num_params();
        total += n;
        match group.precision {
            Precision::Ternary => ternary += n,
            Precision::Binary => binary += n,
            Precision::Full => {}
        }
        bits += n as f64 * group.precision.bits();
    }
    let effective = bits / total.max(1) as f64;
    ModelSummary {
        total_params: total,
        ternary_params: ternary,
        binary_params: binary,
        effective_bits_per_param: effective,
        compression_ratio_vs_f32: if effective > 0.0 { 32.0 / effective } else { 0.0 },
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use lowprec_common::ActivationKind;
    use rand::SeedableRng;

    fn build(dataset: &str, model: &str, width: usize, varmap: &VarMap) -> Model {
        let mut config = ModelConfig::new(dataset, model).unwrap();
        config.width = width;
        let mut rng = StdRng::seed_from_u64(0);
        Model::new(&config, ParamScope::new(varmap, &Device::Cpu), &mut rng).unwrap()
    }

    fn batch(n: usize, c: usize, s: usize) -> (Tensor, Tensor) {
        let xs = Tensor::rand(0f32, 1.0, (n, c, s, s), &Device::Cpu).unwrap();
        let ys = Tensor::from_vec((0..n as u32).map(|i| i % 10).collect::<Vec<_>>(), n, &Device::Cpu).unwrap();
        (xs, ys)
    }

    #[test]
    fn every_kind_produces_class_logits() {
        for (dataset, c, s) in [("mnist", 1, 28), ("cifar10", 3, 32)] {
            for model in ["real", "ttq", "ttqresnet", "bnn", "ffbnn"] {
                let varmap = VarMap::new();
                let m = build(dataset, model, 2, &varmap);
                let (xs, ys) = batch(3, c, s);
                let out = m.forward_t(&xs, &ys, true).unwrap();
                assert_eq!(out.logits.dims(), &[3, 10], "{dataset}/{model}");
                assert!(out.loss.to_scalar::<f32>().unwrap().is_finite());
                assert!(out.batch_errors <= 3);
            }
        }
    }

    #[test]
    fn flat_inputs_are_reshaped() {
        let varmap = VarMap::new();
        let m = build("mnist", "ttq", 2, &varmap);
        let xs = Tensor::zeros((2, 784), DType::F32, &Device::Cpu).unwrap();
        let ys = Tensor::new(&[1u32, 2], &Device::Cpu).unwrap();
        assert_eq!(m.forward_t(&xs, &ys, false).unwrap().predictions.dims(), &[2]);
    }

    #[test]
    fn constrain_counts_per_kind() {
        for (model, expected) in [("real", 0), ("ttq", 10), ("ttqresnet", 8), ("bnn", 9), ("ffbnn", 0)] {
            let varmap = VarMap::new();
            let m = build("cifar10", model, 2, &varmap);
            assert_eq!(m.constrain().unwrap(), expected, "{model}");
        }
    }

    #[test]
    fn summary_reflects_precision() {
        let varmap = VarMap::new();
        let real = build("mnist", "real", 4, &varmap);
        let s = model_summary(&real);
        assert_eq!(s.ternary_params + s.binary_params, 0);
        assert_eq!(s.effective_bits_per_param, 32.0);

        let varmap = VarMap::new();
        let ttq = build("mnist", "ttq", 4, &varmap);
        let s = model_summary(&ttq);
        assert!(s.ternary_params > 0);
        assert!(s.effective_bits_per_param < 32.0);
        assert!(s.compression_ratio_vs_f32 > 1.0);
    }

    #[test]
    fn all_parameters_are_registered() {
        let varmap = VarMap::new();
        let m = build("cifar10", "bnn", 2, &varmap);
        let grouped: usize = m.param_groups().iter().map(|g| g.num_params()).sum();
        let data = varmap.data().lock().unwrap();
        let stored: usize = data
            .iter()
            .filter(|(name, _)| !name.contains("running_"))
            .map(|(_, v)| v.elem_count())
            .sum();
        assert_eq!(grouped, stored);
    }

    #[test]
    fn bnn_norms_are_affine_and_trained() {
        let varmap = VarMap::new();
        let m = build("mnist", "bnn", 2, &varmap);
        let groups = m.param_groups();
        let bn_groups: Vec<_> = groups.iter().filter(|g| g.name.starts_with("bn")).collect();
        assert_eq!(bn_groups.len(), 6);
        assert!(bn_groups.iter().all(|g| g.vars.len() == 2 && g.precision == Precision::Full));

        let (xs, ys) = batch(4, 1, 28);
        let grads = m.forward_t(&xs, &ys, true).unwrap().loss.backward().unwrap();
        for g in &bn_groups {
            assert!(grads.get(g.vars[1].as_tensor()).is_some(), "{}", g.name);
        }
    }

    fn build_with_act(model: &str, act: ActivationKind, l2: f64, varmap: &VarMap) -> Model {
        let mut config = ModelConfig::new("cifar10", model).unwrap();
        config.width = 2;
        config.act = act;
        config.l2 = l2;
        let mut rng = StdRng::seed_from_u64(0);
        Model::new(&config, ParamScope::new(varmap, &Device::Cpu), &mut rng).unwrap()
    }

    #[test]
    fn ffbnn_loss_adds_alpha_penalty() {
        let varmap = VarMap::new();
        let l2 = 0.01;
        let m = build_with_act("ffbnn", ActivationKind::Pact, l2, &varmap);
        assert_eq!(m.constrain().unwrap(), 0);
        let alphas: Vec<_> = m.param_groups().into_iter().filter(|g| g.name.contains("act")).collect();
        assert_eq!(alphas.len(), 8);

        let (xs, ys) = batch(3, 3, 32);
        let out = m.forward_t(&xs, &ys, true).unwrap();
        let ce = candle_nn::loss::cross_entropy(&out.logits, &ys)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let expected = ce + (l2 * 8.0 * 3.0 * 3.0) as f32;
        let loss = out.loss.to_scalar::<f32>().unwrap();
        assert!((loss - expected).abs() < 1e-4, "{loss} vs {expected}");

        let grads = out.loss.backward().unwrap();
        assert!(alphas.iter().all(|g| grads.get(g.vars[0].as_tensor()).is_some()));
    }

    #[test]
    fn sign_ffbnn_has_no_penalty_and_pact_bnn_runs() {
        let varmap = VarMap::new();
        let m = build_with_act("ffbnn", ActivationKind::Sign, 0.5, &varmap);
        let (xs, ys) = batch(2, 3, 32);
        let out = m.forward_t(&xs, &ys, false).unwrap();
        let ce = candle_nn::loss::cross_entropy(&out.logits, &ys).unwrap();
        assert_eq!(out.loss.to_scalar::<f32>().unwrap(), ce.to_scalar::<f32>().unwrap());

        let varmap = VarMap::new();
        let m = build_with_act("bnn", ActivationKind::BiPact, 0.0, &varmap);
        assert_eq!(m.kind(), ModelKind::Bnn);
        let out = m.forward_t(&xs, &ys, true).unwrap();
        assert!(out.loss.to_scalar::<f32>().unwrap().is_finite());
    }

    #[test]
    fn zero_width_is_rejected() {
        let varmap = VarMap::new();
        let mut config = ModelConfig::new("mnist", "ttq").unwrap();
        config.width = 0;
        let mut rng = StdRng::seed_from_u64(0);
        assert!(Model::new(&config, ParamScope::new(&varmap, &Device::Cpu), &mut rng).is_err());
    }
}
