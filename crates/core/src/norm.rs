//! Batch normalisation, plus the BN + ternary activation composite used
//! between TTQ convolutions.
//!
//! Running statistics live in the `VarMap` (so they are checkpointed) but are
//! not trainable. Only the affine variant reports a parameter group, holding
//! its per-channel `weight` (γ, init 1) and `bias` (β, init 0).

use candle_core::{Result, Tensor, Var};
use candle_nn::{batch_norm, BatchNorm, BatchNormConfig, ModuleT};

use crate::constrain::{Node, ParamGroup, ParamScope};
use crate::quantize::ternarize_activation_ste;

/// 2-d batch norm over `(n, C, H, W)`, with or without learned γ / β.
pub struct BatchNorm2d {
    inner: BatchNorm,
    name: String,
    affine: Option<(Var, Var)>,
}

impl BatchNorm2d {
    /// `affine = false`: pure standardisation.
    pub fn new(channels: usize, eps: f64, momentum: f64, scope: ParamScope) -> Result<Self> {
        Self::build(channels, eps, momentum, false, scope)
    }

    /// `affine = true`: standardise, then `γ · x + β` per channel.
    pub fn affine(channels: usize, eps: f64, momentum: f64, scope: ParamScope) -> Result<Self> {
        Self::build(channels, eps, momentum, true, scope)
    }

    fn build(channels: usize, eps: f64, momentum: f64, affine: bool, scope: ParamScope) -> Result<Self> {
        let config = BatchNormConfig {
            eps,
            remove_mean: true,
            affine,
            momentum,
        };
        let inner = batch_norm(channels, config, scope.var_builder())?;
        let affine = if affine {
            Some((scope.get("weight")?, scope.get("bias")?))
        } else {
            None
        };
        Ok(Self {
            inner,
            name: scope.prefix(),
            affine,
        })
    }

    pub fn is_affine(&self) -> bool {
        self.affine.is_some()
    }

    /// Batch statistics when `train`, running statistics otherwise.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        self.inner.forward_t(x, train)
    }
}

impl Node for BatchNorm2d {
    fn param_groups(&self) -> Vec<ParamGroup> {
        match &self.affine {
            Some((gamma, beta)) => vec![ParamGroup::full(
                self.name.clone(),
                vec![gamma.clone(), beta.clone()],
            )],
            None => Vec::new(),
        }
    }
}

/// Batch norm followed by a ternary activation with thresholds `(lo, hi)`.
pub struct BatchNormTz {
    bn: BatchNorm2d,
    lo: f64,
    hi: f64,
}

impl BatchNormTz {
    pub fn new(channels: usize, eps: f64, momentum: f64, lo: f64, hi: f64, scope: ParamScope) -> Result<Self> {
        Ok(Self {
            bn: BatchNorm2d::new(channels, eps, momentum, scope)?,
            lo,
            hi,
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        ternarize_activation_ste(&self.bn.forward_t(x, train)?, self.lo, self.hi)
    }
}

impl Node for BatchNormTz {
    fn children(&self) -> Vec<&dyn Node> {
        vec![&self.bn as &dyn Node]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn tz_outputs_are_ternary_and_stats_are_stored() {
        let varmap = VarMap::new();
        let scope = ParamScope::new(&varmap, &Device::Cpu).pp("bntz0");
        let norm = BatchNormTz::new(3, 1e-5, 0.1, 0.0, 0.0, scope).unwrap();
        let x = Tensor::randn(0f32, 2.0, (4, 3, 5, 5), &Device::Cpu).unwrap();
        let y = norm.forward_t(&x, true).unwrap();
        let vals = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(vals.iter().all(|&v| v == -1.0 || v == 0.0 || v == 1.0));

        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("bntz0.running_mean"));
        assert!(data.contains_key("bntz0.running_var"));
    }

    #[test]
    fn eval_uses_running_statistics() {
        let varmap = VarMap::new();
        let scope = ParamScope::new(&varmap, &Device::Cpu).pp("bn");
        let norm = BatchNorm2d::new(2, 1e-5, 0.1, scope).unwrap();
        // fresh running stats are mean 0, var 1: eval is (nearly) the identity
        let x = Tensor::new(&[[[[3f32]], [[-2f32]]]], &Device::Cpu).unwrap();
        let y = norm.forward_t(&x, false).unwrap();
        let vals = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((vals[0] - 3.0).abs() < 1e-3);
        assert!((vals[1] + 2.0).abs() < 1e-3);
        assert!(norm.param_groups().is_empty());
    }

    #[test]
    fn affine_norm_learns_scale_and_shift() {
        let varmap = VarMap::new();
        let scope = ParamScope::new(&varmap, &Device::Cpu).pp("bn3");
        let norm = BatchNorm2d::affine(2, 1e-4, 0.1, scope).unwrap();
        assert!(norm.is_affine());
        let groups = norm.param_groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "bn3");
        assert_eq!(groups[0].num_params(), 4);

        let (gamma, beta) = (groups[0].vars[0].clone(), groups[0].vars[1].clone());
        gamma.set(&Tensor::new(&[2f32, 0.5], &Device::Cpu).unwrap()).unwrap();
        beta.set(&Tensor::new(&[1f32, -1.0], &Device::Cpu).unwrap()).unwrap();
        // fresh running stats (mean 0, var 1): eval output is γ·x + β
        let x = Tensor::new(&[[[[3f32]], [[-2f32]]]], &Device::Cpu).unwrap();
        let vals = norm
            .forward_t(&x, false)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!((vals[0] - 7.0).abs() < 1e-2);
        assert!((vals[1] + 2.0).abs() < 1e-2);

        // training-mode output reaches γ and β
        let x = Tensor::randn(0f32, 1.0, (4, 2, 3, 3), &Device::Cpu).unwrap();
        let loss = norm.forward_t(&x, true).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(gamma.as_tensor()).is_some());
        assert!(grads.get(beta.as_tensor()).is_some());
    }
}
