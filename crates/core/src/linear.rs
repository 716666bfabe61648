//! Fully-connected layers.
//!
//! Same shadow/operational split as [`crate::conv`]; `y = x · Wᵀ + b` with `W`
//! the operational weight of shape `(out, in)`. [`RealLinear`] is the plain
//! f32 counterpart.

use candle_core::{Result, Tensor, Var};
use rand::rngs::StdRng;

use crate::constrain::{uniform_init, Constrained, Node, ParamGroup, ParamScope};
use crate::weight::{BinaryConfig, BinaryWeight, QuantizedWeight};

/// f32 linear layer, `U(±1/sqrt(in_dim))` init for weight and bias.
pub struct RealLinear {
    name: String,
    weight: Var,
    bias: Var,
}

impl RealLinear {
    pub fn new(in_dim: usize, out_dim: usize, scope: ParamScope, rng: &mut StdRng) -> Result<Self> {
        let bound = 1.0 / (in_dim as f64).sqrt();
        let weight = scope.var("weight", uniform_init(&[out_dim, in_dim], bound, rng, scope.device())?)?;
        let bias = scope.var("bias", uniform_init(&[out_dim], bound, rng, scope.device())?)?;
        Ok(Self {
            name: scope.prefix(),
            weight,
            bias,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        x.matmul(&self.weight.as_tensor().t()?)?
            .broadcast_add(&self.bias.as_tensor().unsqueeze(0)?)
    }
}

impl Node for RealLinear {
    fn param_groups(&self) -> Vec<ParamGroup> {
        vec![ParamGroup::full(
            self.name.clone(),
            vec![self.weight.clone(), self.bias.clone()],
        )]
    }
}

pub struct ConstrainedLinear<W> {
    name: String,
    weight: W,
    bias: Var,
    out_dim: usize,
}

/// Binary-weight linear layer with a full-precision bias.
pub type LinearBnn = ConstrainedLinear<BinaryWeight>;

impl LinearBnn {
    pub fn bnn(
        in_dim: usize,
        out_dim: usize,
        config: BinaryConfig,
        scope: ParamScope,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let weight = BinaryWeight::new(&[out_dim, in_dim], in_dim, out_dim, config, scope.clone(), rng)?;
        let bias = scope.var("bias", uniform_init(&[out_dim], 0.0, rng, scope.device())?)?;
        Ok(Self {
            name: scope.prefix(),
            weight,
            bias,
            out_dim,
        })
    }
}

impl<W: QuantizedWeight> ConstrainedLinear<W> {
    /// `x`: `(batch, in_dim)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.weight.operational()?;
        x.matmul(&w.t()?)?
            .broadcast_add(&self.bias.as_tensor().reshape((1, self.out_dim))?)
    }

    pub fn weight(&self) -> &W {
        &self.weight
    }
}

impl<W: QuantizedWeight> Node for ConstrainedLinear<W> {
    fn constrained(&self) -> Option<&dyn Constrained> {
        Some(&self.weight)
    }

    fn param_groups(&self) -> Vec<ParamGroup> {
        let mut groups = self.weight.param_groups();
        groups.push(ParamGroup::full(format!("{}.bias", self.name), vec![self.bias.clone()]));
        groups
    }
}
