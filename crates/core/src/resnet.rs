//! Residual TTQ assemblies.
//!
//! * [`TtqResnetModel`] — the 10-conv TTQ CNN with two identity shortcuts
//!   (around convs 3–4 and 6–7) and a full-precision tail.
//! * [`TtqResnet32Model`] — stem conv, fifteen [`BasicBlock`]s in three
//!   stages (`b`, `2b`, `4b`), average pool, full-precision 3×3 head.

use candle_core::{Result, Tensor};
use lowprec_common::ModelConfig;
use rand::rngs::StdRng;

use crate::constrain::{Node, ParamScope};
use crate::conv::{Conv2dTtq, ConvShape, RealConv2d};
use crate::loss::{cross_entropy_head, ForwardOutput};
use crate::model::{input_images, ttq_stages, TtqStage, TZ_HI, TZ_LO};
use crate::norm::BatchNormTz;

/// Elementwise `bypass + residual`; shapes must match exactly.
pub fn residual_add(bypass: &Tensor, residual: &Tensor) -> Result<Tensor> {
    if bypass.dims() != residual.dims() {
        candle_core::bail!(
            "residual shape mismatch: bypass {:?} vs residual {:?}",
            bypass.dims(),
            residual.dims()
        );
    }
    bypass + residual
}

fn bntz(channels: usize, config: &ModelConfig, scope: ParamScope) -> Result<BatchNormTz> {
    BatchNormTz::new(channels, config.bn_eps, config.bn_momentum, TZ_LO, TZ_HI, scope)
}

// ── TtqResnetModel ──────────────────────────────────────────────────────────

pub struct TtqResnetModel {
    config: ModelConfig,
    /// Convs 0–7 with their BN + ternary activations.
    stages: Vec<TtqStage>,
    conv8: RealConv2d,
    bntz8: BatchNormTz,
    head: RealConv2d,
}

impl TtqResnetModel {
    pub fn new(config: &ModelConfig, scope: ParamScope, rng: &mut StdRng) -> Result<Self> {
        let b = config.width;
        let stages = ttq_stages(config, &scope, 8, rng)?;
        let conv8 = RealConv2d::new(ConvShape::same3(4 * b, 4 * b), scope.pp("conv8"), rng)?;
        let bntz8 = bntz(4 * b, config, scope.pp("bntz8"))?;
        let head = RealConv2d::new(ConvShape::new(4 * b, config.num_classes(), 1), scope.pp("conv9"), rng)?;
        Ok(Self {
            config: config.clone(),
            stages,
            conv8,
            bntz8,
            head,
        })
    }

    pub fn logits(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let s = &self.stages;
        let mut v = input_images(xs, &self.config)?;
        for stage in &s[..3] {
            v = stage.forward_t(&v, train)?;
        }
        let r = s[4].forward_t(&s[3].forward_t(&v, train)?, train)?;
        v = residual_add(&v, &r)?;
        v = s[5].forward_t(&v, train)?;
        let r = s[7].forward_t(&s[6].forward_t(&v, train)?, train)?;
        v = residual_add(&v, &r)?;
        let v = self.bntz8.forward_t(&self.conv8.forward(&v)?, train)?;
        self.head
            .forward(&v)?
            .avg_pool2d(self.config.dataset.pool_window())?
            .flatten_from(1)
    }

    pub fn forward_t(&self, xs: &Tensor, ys: &Tensor, train: bool) -> Result<ForwardOutput> {
        crate::constrain::constrain(self)?;
        cross_entropy_head(&self.logits(xs, train)?, ys)
    }
}

impl Node for TtqResnetModel {
    fn children(&self) -> Vec<&dyn Node> {
        let mut out: Vec<&dyn Node> = self.stages.iter().map(|s| s as &dyn Node).collect();
        out.extend([&self.conv8 as &dyn Node, &self.bntz8, &self.head]);
        out
    }
}

// ── BasicBlock ──────────────────────────────────────────────────────────────

/// Two TTQ 3×3 convs with BN + ternary activation, plus a shortcut.
///
/// The shortcut is the identity unless the stride or channel count changes,
/// in which case it is its own TTQ 3×3 conv so shapes line up.
pub struct BasicBlock {
    conv0: Conv2dTtq,
    bntz0: BatchNormTz,
    conv1: Conv2dTtq,
    bntz1: BatchNormTz,
    bypass: Option<Conv2dTtq>,
}

impl BasicBlock {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        config: &ModelConfig,
        scope: ParamScope,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let beta = config.ttq_threshold;
        let conv0 = Conv2dTtq::ttq(ConvShape::same3(in_channels, in_channels), beta, scope.pp("conv0"), rng)?;
        let bntz0 = bntz(in_channels, config, scope.pp("bntz0"))?;
        let conv1 = Conv2dTtq::ttq(
            ConvShape::same3(in_channels, out_channels).with_stride(stride),
            beta,
            scope.pp("conv1"),
            rng,
        )?;
        let bntz1 = bntz(out_channels, config, scope.pp("bntz1"))?;
        let bypass = if stride != 1 || in_channels != out_channels {
            Some(Conv2dTtq::ttq(
                ConvShape::same3(in_channels, out_channels).with_stride(stride),
                beta,
                scope.pp("bypass"),
                rng,
            )?)
        } else {
            None
        };
        Ok(Self {
            conv0,
            bntz0,
            conv1,
            bntz1,
            bypass,
        })
    }

    /// `(bypass, residual)` activations before the add.
    pub fn paths(&self, x: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let bypass = match &self.bypass {
            Some(conv) => conv.forward(x)?,
            None => x.clone(),
        };
        let v = self.bntz0.forward_t(&self.conv0.forward(x)?, train)?;
        let v = self.bntz1.forward_t(&self.conv1.forward(&v)?, train)?;
        Ok((bypass, v))
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let (bypass, residual) = self.paths(x, train)?;
        residual_add(&bypass, &residual)
    }

    pub fn has_bypass_conv(&self) -> bool {
        self.bypass.is_some()
    }
}

impl Node for BasicBlock {
    fn children(&self) -> Vec<&dyn Node> {
        let mut out: Vec<&dyn Node> = vec![&self.conv0 as &dyn Node, &self.bntz0, &self.conv1, &self.bntz1];
        if let Some(bypass) = &self.bypass {
            out.push(bypass);
        }
        out
    }
}

// ── TtqResnet32Model ────────────────────────────────────────────────────────

const BLOCKS_PER_STAGE: usize = 5;

pub struct TtqResnet32Model {
    config: ModelConfig,
    conv0: Conv2dTtq,
    bntz0: BatchNormTz,
    blocks: Vec<BasicBlock>,
    head: RealConv2d,
}

impl TtqResnet32Model {
    pub fn new(config: &ModelConfig, scope: ParamScope, rng: &mut StdRng) -> Result<Self> {
        let b = config.width;
        let c_in = config.dataset.channels();
        let conv0 = Conv2dTtq::ttq(ConvShape::same3(c_in, b), config.ttq_threshold, scope.pp("conv0"), rng)?;
        let bntz0 = bntz(b, config, scope.pp("bntz0"))?;

        let mut blocks = Vec::with_capacity(3 * BLOCKS_PER_STAGE);
        let mut channels = b;
        for (stage, out_channels) in [b, 2 * b, 4 * b].into_iter().enumerate() {
            for i in 0..BLOCKS_PER_STAGE {
                let stride = if stage > 0 && i == 0 { 2 } else { 1 };
                let idx = stage * BLOCKS_PER_STAGE + i;
                blocks.push(BasicBlock::new(
                    channels,
                    out_channels,
                    stride,
                    config,
                    scope.pp("blocks").pp(idx),
                    rng,
                )?);
                channels = out_channels;
            }
        }

        let head = RealConv2d::new(ConvShape::same3(4 * b, config.num_classes()), scope.pp("head"), rng)?;
        Ok(Self {
            config: config.clone(),
            conv0,
            bntz0,
            blocks,
            head,
        })
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn logits(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let x = input_images(xs, &self.config)?;
        let mut v = self.bntz0.forward_t(&self.conv0.forward(&x)?, train)?;
        for block in &self.blocks {
            v = block.forward_t(&v, train)?;
        }
        let v = v.avg_pool2d(self.config.dataset.pool_window())?;
        self.head.forward(&v)?.flatten_from(1)
    }

    pub fn forward_t(&self, xs: &Tensor, ys: &Tensor, train: bool) -> Result<ForwardOutput> {
        crate::constrain::constrain(self)?;
        cross_entropy_head(&self.logits(xs, train)?, ys)
    }
}

impl Node for TtqResnet32Model {
    fn children(&self) -> Vec<&dyn Node> {
        let mut out: Vec<&dyn Node> = vec![&self.conv0 as &dyn Node, &self.bntz0];
        out.extend(self.blocks.iter().map(|b| b as &dyn Node));
        out.push(&self.head);
        out
    }
}
