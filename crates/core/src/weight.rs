//! Shadow-weight holders: the constrained layer base.
//!
//! A [`QuantizedWeight`] owns a full-precision shadow [`Var`] and a cached
//! operational tensor derived from it. Conv and linear layers
//! ([`crate::conv::ConstrainedConv2d`], [`crate::linear::ConstrainedLinear`])
//! only ever multiply with the operational tensor; gradients reach the shadow
//! through the STE baked into that tensor's graph.
//!
//! Life cycle per layer:
//!
//! ```text
//! Initialized ──reconstrain──▶ Synced ──optimiser step──▶ Stale ──reconstrain──▶ Synced
//! ```
//!
//! A forward in `Initialized` reconstrains lazily. A forward in `Stale`
//! silently reuses the cached tensor; the assemblies prevent this by
//! reconstraining at the top of every forward.

use candle_core::{Result, Tensor, Var};
use parking_lot::Mutex;
use rand::rngs::StdRng;

use crate::constrain::{glorot_bound, uniform_init, Constrained, ParamGroup, ParamScope, Precision};
use crate::quantize::{
    binarize_ste, binarize_stochastic_ste, level_counts, ternarize_ste, ternary_masks,
    ttq_threshold, uniform_noise,
};

/// Shadow weight with a cached quantised view.
pub trait QuantizedWeight: Constrained {
    /// The cached operational tensor, reconstraining once if never synced.
    fn operational(&self) -> Result<Tensor>;

    /// The full-precision shadow variable.
    fn shadow(&self) -> &Var;

    /// Parameter groups owned by this weight.
    fn param_groups(&self) -> Vec<ParamGroup>;
}

// ── TernaryWeight ───────────────────────────────────────────────────────────

#[derive(Clone)]
struct TernaryState {
    weight: Tensor,
    threshold: f64,
}

/// Trained-ternary (TTQ) weight: shadow `W` plus learned scales `α_pos`, `α_neg`.
///
/// `reconstrain()` recomputes `t = β · mean(|W|)` and the ternary tensor
/// `{-α_neg, 0, +α_pos}`.
pub struct TernaryWeight {
    name: String,
    weight: Var,
    alpha_pos: Var,
    alpha_neg: Var,
    beta: f64,
    cache: Mutex<Option<TernaryState>>,
}

impl TernaryWeight {
    /// Glorot-uniform shadow of shape `dims`; scales start at the mean
    /// magnitude of the initially active weights.
    pub fn new(
        dims: &[usize],
        fan_in: usize,
        fan_out: usize,
        beta: f64,
        scope: ParamScope,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let bound = glorot_bound(fan_in, fan_out);
        let w0 = uniform_init(dims, bound, rng, scope.device())?;
        let alpha0 = initial_scale(&w0, beta)?.unwrap_or(bound / 2.0);

        let weight = scope.var("weight", w0)?;
        let alpha_pos = scope.var("alpha_pos", Tensor::new(&[alpha0 as f32], scope.device())?)?;
        let alpha_neg = scope.var("alpha_neg", Tensor::new(&[alpha0 as f32], scope.device())?)?;
        Ok(Self {
            name: scope.prefix(),
            weight,
            alpha_pos,
            alpha_neg,
            beta,
            cache: Mutex::new(None),
        })
    }

    /// `(α_pos, α_neg)` variables.
    pub fn scales(&self) -> (&Var, &Var) {
        (&self.alpha_pos, &self.alpha_neg)
    }

    /// Threshold from the last `reconstrain()`, `None` before the first one.
    pub fn threshold(&self) -> Option<f64> {
        self.cache.lock().as_ref().map(|s| s.threshold)
    }

    /// Debug: count `(-α_neg, 0, +α_pos)` entries of the operational weight.
    pub fn distribution(&self) -> Result<(u64, u64, u64)> {
        level_counts(&self.operational()?)
    }
}

/// Mean `|w|` over entries beyond the initial threshold.
fn initial_scale(w: &Tensor, beta: f64) -> Result<Option<f64>> {
    let t = ttq_threshold(w, beta)?;
    let (pos, neg) = ternary_masks(w, t)?;
    let active = (pos + neg)?;
    let count = active.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Ok(None);
    }
    let total = (w.abs()? * &active)?.sum_all()?.to_scalar::<f32>()?;
    Ok(Some((total / count) as f64))
}

impl Constrained for TernaryWeight {
    fn reconstrain(&self) -> Result<()> {
        let w = self.weight.as_tensor();
        let threshold = ttq_threshold(w, self.beta)?;
        let weight = ternarize_ste(w, threshold, self.alpha_pos.as_tensor(), self.alpha_neg.as_tensor())?;
        self.cache.lock().replace(TernaryState { weight, threshold });
        Ok(())
    }
}

impl QuantizedWeight for TernaryWeight {
    fn operational(&self) -> Result<Tensor> {
        if let Some(state) = self.cache.lock().as_ref() {
            return Ok(state.weight.clone());
        }
        self.reconstrain()?;
        match self.cache.lock().as_ref() {
            Some(state) => Ok(state.weight.clone()),
            None => candle_core::bail!("{}: reconstrain left no operational weight", self.name),
        }
    }

    fn shadow(&self) -> &Var {
        &self.weight
    }

    fn param_groups(&self) -> Vec<ParamGroup> {
        vec![
            ParamGroup {
                name: format!("{}.weight", self.name),
                vars: vec![self.weight.clone()],
                lr_scale: 1.0,
                clip: None,
                precision: Precision::Ternary,
            },
            ParamGroup {
                name: format!("{}.alpha", self.name),
                vars: vec![self.alpha_pos.clone(), self.alpha_neg.clone()],
                lr_scale: 1.0,
                clip: Some((0.0, f64::INFINITY)),
                precision: Precision::Full,
            },
        ]
    }
}

// ── BinaryWeight ────────────────────────────────────────────────────────────

/// Binarisation settings for [`BinaryWeight`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinaryConfig {
    /// Binary magnitude H: weights map to `{-H, +H}` and are clipped to `[-H, H]`.
    pub h: f64,
    pub stochastic: bool,
    /// Scale this layer's step by `1 / sqrt(1.5 / (fan_in + fan_out))`.
    pub glorot_lr: bool,
}

impl Default for BinaryConfig {
    fn default() -> Self {
        Self {
            h: 1.0,
            stochastic: false,
            glorot_lr: true,
        }
    }
}

/// BinaryNet-style weight: shadow in `[-H, H]`, operational `{-H, +H}`.
///
/// The learning-rate scale is exported with the parameter group; the
/// optimiser applies it. Stochastic mode thresholds against a noise tensor
/// that only changes in [`Constrained::resample`], so `reconstrain()` stays
/// idempotent between optimiser steps.
pub struct BinaryWeight {
    name: String,
    weight: Var,
    config: BinaryConfig,
    lr_scale: f64,
    noise: Mutex<Option<Tensor>>,
    cache: Mutex<Option<Tensor>>,
}

impl BinaryWeight {
    pub fn new(
        dims: &[usize],
        fan_in: usize,
        fan_out: usize,
        config: BinaryConfig,
        scope: ParamScope,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let w0 = uniform_init(dims, config.h, rng, scope.device())?;
        let noise = if config.stochastic {
            Some(uniform_noise(dims, rng, scope.device())?)
        } else {
            None
        };
        let lr_scale = if config.glorot_lr {
            glorot_lr_scale(fan_in, fan_out)
        } else {
            1.0
        };
        let weight = scope.var("weight", w0)?;
        Ok(Self {
            name: scope.prefix(),
            weight,
            config,
            lr_scale,
            noise: Mutex::new(noise),
            cache: Mutex::new(None),
        })
    }

    pub fn lr_scale(&self) -> f64 {
        self.lr_scale
    }
}

/// BinaryNet's "Glorot" learning-rate scale `1 / sqrt(1.5 / (fan_in + fan_out))`.
pub fn glorot_lr_scale(fan_in: usize, fan_out: usize) -> f64 {
    1.0 / (1.5 / (fan_in + fan_out) as f64).sqrt()
}

impl Constrained for BinaryWeight {
    fn reconstrain(&self) -> Result<()> {
        let w = self.weight.as_tensor();
        let q = if self.config.stochastic {
            let noise = self.noise.lock().clone();
            match noise {
                Some(noise) => binarize_stochastic_ste(w, &noise, self.config.h)?,
                None => candle_core::bail!("{}: stochastic layer has no noise", self.name),
            }
        } else {
            binarize_ste(w, self.config.h)?
        };
        self.cache.lock().replace(q);
        Ok(())
    }

    fn resample(&self, rng: &mut StdRng) -> Result<()> {
        if self.config.stochastic {
            let w = self.weight.as_tensor();
            let noise = uniform_noise(w.dims(), rng, w.device())?;
            self.noise.lock().replace(noise);
        }
        Ok(())
    }
}

impl QuantizedWeight for BinaryWeight {
    fn operational(&self) -> Result<Tensor> {
        if let Some(q) = self.cache.lock().as_ref() {
            return Ok(q.clone());
        }
        self.reconstrain()?;
        match self.cache.lock().as_ref() {
            Some(q) => Ok(q.clone()),
            None => candle_core::bail!("{}: reconstrain left no operational weight", self.name),
        }
    }

    fn shadow(&self) -> &Var {
        &self.weight
    }

    fn param_groups(&self) -> Vec<ParamGroup> {
        vec![ParamGroup {
            name: format!("{}.weight", self.name),
            vars: vec![self.weight.clone()],
            lr_scale: self.lr_scale,
            clip: Some((-self.config.h, self.config.h)),
            precision: Precision::Binary,
        }]
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
