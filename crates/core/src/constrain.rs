//! The reconstrain protocol: capability trait, model tree, parameter groups.
//!
//! A model assembly is a tree of [`Node`]s. Leaves that hold a quantised
//! operational weight expose the [`Constrained`] capability through
//! [`Node::constrained`]; composites only report their children. The free
//! functions here walk that tree so that assemblies never list their layers
//! by hand:
//!
//! * [`constrain`] — reconstrain every constrained node exactly once.
//! * [`resample`] — redraw stochastic quantisation noise from an explicit RNG.
//! * [`collect_param_groups`] — `(vars, lr_scale, clip)` groups for the optimiser.
//!
//! # Staleness
//!
//! `reconstrain()` must run after every optimiser step and before the next
//! forward. Assemblies do it at the top of `forward_t`; a layer used directly
//! after an update keeps computing with its cached (stale) weight.

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::Rng;

// ── Capability ──────────────────────────────────────────────────────────────

/// A layer whose forward weight is derived from a full-precision shadow.
pub trait Constrained {
    /// Recompute the operational weight from the current shadow state.
    ///
    /// Idempotent; never writes the shadow weight.
    fn reconstrain(&self) -> Result<()>;

    /// Redraw stochastic quantisation noise. No-op for deterministic layers.
    fn resample(&self, _rng: &mut StdRng) -> Result<()> {
        Ok(())
    }
}

/// A node of a model tree.
pub trait Node {
    /// The constrained capability, if this node has one.
    fn constrained(&self) -> Option<&dyn Constrained> {
        None
    }

    /// Owned sub-nodes, each listed once.
    fn children(&self) -> Vec<&dyn Node> {
        Vec::new()
    }

    /// Trainable parameters owned directly by this node (not its children).
    fn param_groups(&self) -> Vec<ParamGroup> {
        Vec::new()
    }
}

/// Reconstrain every constrained node under `root`. Returns how many ran.
pub fn constrain(root: &dyn Node) -> Result<usize> {
    let mut count = 0;
    if let Some(c) = root.constrained() {
        c.reconstrain()?;
        count += 1;
    }
    for child in root.children() {
        count += constrain(child)?;
    }
    Ok(count)
}

/// Redraw stochastic noise everywhere under `root`, in tree order.
pub fn resample(root: &dyn Node, rng: &mut StdRng) -> Result<()> {
    if let Some(c) = root.constrained() {
        c.resample(rng)?;
    }
    for child in root.children() {
        resample(child, rng)?;
    }
    Ok(())
}

/// All parameter groups under `root`, in tree order.
pub fn collect_param_groups(root: &dyn Node) -> Vec<ParamGroup> {
    let mut out = root.param_groups();
    for child in root.children() {
        out.extend(collect_param_groups(child));
    }
    out
}

// ── Parameter groups ────────────────────────────────────────────────────────

/// How a parameter is stored at inference time (for size accounting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Full,
    Ternary,
    Binary,
}

impl Precision {
    pub fn bits(&self) -> f64 {
        match self {
            Self::Full => 32.0,
            Self::Ternary => 2.0,
            Self::Binary => 1.0,
        }
    }
}

/// A set of variables sharing optimiser treatment.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    /// Dotted path of the owning layer.
    pub name: String,
    pub vars: Vec<Var>,
    /// Multiplier on the optimiser's step size for these variables.
    pub lr_scale: f64,
    /// Interval the variables are projected onto after each step.
    pub clip: Option<(f64, f64)>,
    pub precision: Precision,
}

impl ParamGroup {
    /// Full-precision group with unit learning-rate scale and no clip.
    pub fn full(name: impl Into<String>, vars: Vec<Var>) -> Self {
        Self {
            name: name.into(),
            vars,
            lr_scale: 1.0,
            clip: None,
            precision: Precision::Full,
        }
    }

    pub fn num_params(&self) -> usize {
        self.vars.iter().map(|v| v.elem_count()).sum()
    }
}

// ── Parameter scope ─────────────────────────────────────────────────────────

/// Hierarchical naming over a [`VarMap`], with explicitly seeded initial values.
///
/// Layers draw their initial tensors from the caller's RNG and register them
/// here, so the whole model is reproducible from one seed while checkpoints
/// still go through `VarMap::save` / `VarMap::load`.
#[derive(Clone)]
pub struct ParamScope<'a> {
    varmap: &'a VarMap,
    path: Vec<String>,
    device: Device,
}

impl<'a> ParamScope<'a> {
    pub fn new(varmap: &'a VarMap, device: &Device) -> Self {
        Self {
            varmap,
            path: Vec::new(),
            device: device.clone(),
        }
    }

    /// Child scope, like `VarBuilder::pp`.
    pub fn pp(&self, name: impl ToString) -> Self {
        let mut path = self.path.clone();
        path.push(name.to_string());
        Self {
            varmap: self.varmap,
            path,
            device: self.device.clone(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Dotted path of this scope.
    pub fn prefix(&self) -> String {
        self.path.join(".")
    }

    fn full_name(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.prefix())
        }
    }

    /// Register `init` as a new trainable variable `<prefix>.<name>`.
    pub fn var(&self, name: &str, init: Tensor) -> Result<Var> {
        let full = self.full_name(name);
        let var = Var::from_tensor(&init.to_dtype(DType::F32)?)?;
        let mut data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("parameter store poisoned: {e}")))?;
        if data.contains_key(&full) {
            candle_core::bail!("duplicate parameter name {full}");
        }
        data.insert(full, var.clone());
        Ok(var)
    }

    /// The variable already registered as `<prefix>.<name>`.
    pub fn get(&self, name: &str) -> Result<Var> {
        let full = self.full_name(name);
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("parameter store poisoned: {e}")))?;
        match data.get(&full) {
            Some(var) => Ok(var.clone()),
            None => candle_core::bail!("no parameter named {full}"),
        }
    }

    /// A `VarBuilder` rooted at this scope, for candle-nn layers (batch norm buffers).
    pub fn var_builder(&self) -> VarBuilder<'a> {
        let vb = VarBuilder::from_varmap(self.varmap, DType::F32, &self.device);
        if self.path.is_empty() {
            vb
        } else {
            vb.pp(self.prefix())
        }
    }
}

// ── Initialisation ──────────────────────────────────────────────────────────

/// Uniform `[-bound, bound)` tensor from an explicit RNG.
pub fn uniform_init(dims: &[usize], bound: f64, rng: &mut StdRng, device: &Device) -> Result<Tensor> {
    let n: usize = dims.iter().product();
    let bound = bound as f32;
    let data: Vec<f32> = if bound > 0.0 {
        (0..n).map(|_| rng.gen_range(-bound..bound)).collect()
    } else {
        vec![0.0; n]
    };
    Tensor::from_vec(data, dims, device)
}

/// Glorot/Xavier uniform bound `sqrt(6 / (fan_in + fan_out))`.
pub fn glorot_bound(fan_in: usize, fan_out: usize) -> f64 {
    (6.0 / (fan_in + fan_out) as f64).sqrt()
}

// ── Tests ───────────────────────────────────────────────────────────────────
