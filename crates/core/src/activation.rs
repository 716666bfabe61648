//! Activations between the BN and the next layer of the `bnn` / `ffbnn` models.
//!
//! | Activation | Forward | Learned |
//! |------------|---------|---------|
//! | sign | `sign(x)`, saturating STE | nothing |
//! | PACT | `clip(x, 0, α)` | α |
//! | BiPACT | `clip(x, -α, α)` | α |
//!
//! Both clip variants are built from ReLUs so autodiff gives PACT's gradient
//! for α: `1{x >= α}` (and `-1{x <= -α}` for BiPACT). With `bits` set, the
//! clipped value is additionally snapped to `2^bits` uniform levels with a
//! straight-through gradient.

use candle_core::{Result, Tensor, Var};
use lowprec_common::{ActivationKind, ModelConfig};

use crate::constrain::{Node, ParamGroup, ParamScope};
use crate::quantize::{binarize_ste, quantize_uniform_ste};

// ── PACT ────────────────────────────────────────────────────────────────────

/// Parameterised clipping activation with a single learned clip level α.
pub struct Pact {
    name: String,
    alpha: Var,
    symmetric: bool,
    bits: Option<u32>,
}

impl Pact {
    pub fn new(symmetric: bool, alpha: f64, bits: Option<u32>, scope: ParamScope) -> Result<Self> {
        let init = Tensor::new(&[alpha as f32], scope.device())?;
        Ok(Self {
            name: scope.prefix(),
            alpha: scope.var("alpha", init)?,
            symmetric,
            bits,
        })
    }

    pub fn alpha(&self) -> &Var {
        &self.alpha
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let a = self.alpha.as_tensor();
        let clipped = if self.symmetric {
            let upper = (x.broadcast_add(a)?.relu()? - x.broadcast_sub(a)?.relu()?)?;
            upper.broadcast_sub(a)?
        } else {
            (x.relu()? - x.broadcast_sub(a)?.relu()?)?
        };
        match self.bits {
            Some(bits) => {
                let a = self.alpha.as_tensor().to_vec1::<f32>()?[0] as f64;
                let lo = if self.symmetric { -a } else { 0.0 };
                quantize_uniform_ste(&clipped, lo, a, bits)
            }
            None => Ok(clipped),
        }
    }
}

impl Node for Pact {
    fn param_groups(&self) -> Vec<ParamGroup> {
        let mut group = ParamGroup::full(self.name.clone(), vec![self.alpha.clone()]);
        group.clip = Some((0.0, f64::INFINITY));
        vec![group]
    }
}

// ── Activation ──────────────────────────────────────────────────────────────

pub enum Activation {
    Sign,
    Pact(Pact),
}

impl Activation {
    /// The activation `config.act` names, registered under `scope`.
    pub fn new(config: &ModelConfig, scope: ParamScope) -> Result<Self> {
        Ok(match config.act {
            ActivationKind::Sign => Self::Sign,
            ActivationKind::Pact => Self::Pact(Pact::new(false, config.pact_alpha, config.pact_bits, scope)?),
            ActivationKind::BiPact => Self::Pact(Pact::new(true, config.pact_alpha, config.pact_bits, scope)?),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Sign => binarize_ste(x, 1.0),
            Self::Pact(p) => p.forward(x),
        }
    }

    pub fn pact(&self) -> Option<&Pact> {
        match self {
            Self::Pact(p) => Some(p),
            Self::Sign => None,
        }
    }
}

impl Node for Activation {
    fn children(&self) -> Vec<&dyn Node> {
        match self {
            Self::Pact(p) => vec![p as &dyn Node],
            Self::Sign => Vec::new(),
        }
    }
}

/// `Σ α²` over the PACT activations in `acts`; `None` if there are none.
pub fn alpha_penalty<'a>(acts: impl IntoIterator<Item = &'a Activation>) -> Result<Option<Tensor>> {
    let mut total: Option<Tensor> = None;
    for pact in acts.into_iter().filter_map(Activation::pact) {
        let sq = pact.alpha().as_tensor().sqr()?.sum_all()?;
        total = Some(match total {
            Some(t) => (t + sq)?,
            None => sq,
        });
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn pact(symmetric: bool, alpha: f64, bits: Option<u32>, varmap: &VarMap) -> Pact {
        Pact::new(symmetric, alpha, bits, ParamScope::new(varmap, &Device::Cpu).pp("act0")).unwrap()
    }

    #[test]
    fn pact_clips_and_trains_alpha_on_saturated_inputs() {
        let varmap = VarMap::new();
        let p = pact(false, 1.0, None, &varmap);
        let x = Var::new(&[-1.0f32, 0.5, 2.0, 3.0], &Device::Cpu).unwrap();
        let y = p.forward(x.as_tensor()).unwrap();
        assert_eq!(y.to_vec1::<f32>().unwrap(), vec![0.0, 0.5, 1.0, 1.0]);

        let grads = y.sum_all().unwrap().backward().unwrap();
        let ga = grads.get(p.alpha().as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(ga, vec![2.0]);
        let gx = grads.get(x.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(gx, vec![0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn bipact_is_symmetric() {
        let varmap = VarMap::new();
        let p = pact(true, 1.0, None, &varmap);
        let x = Tensor::new(&[-3.0f32, -2.0, 0.5, 2.0], &Device::Cpu).unwrap();
        let y = p.forward(&x).unwrap();
        assert_eq!(y.to_vec1::<f32>().unwrap(), vec![-1.0, -1.0, 0.5, 1.0]);
        let grads = y.sum_all().unwrap().backward().unwrap();
        let ga = grads.get(p.alpha().as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(ga, vec![-1.0]);
    }

    #[test]
    fn quantized_pact_emits_discrete_levels() {
        let varmap = VarMap::new();
        let p = pact(false, 3.0, Some(2), &varmap);
        let x = Tensor::new(&[-1.0f32, 0.4, 1.6, 5.0], &Device::Cpu).unwrap();
        let y = p.forward(&x).unwrap();
        assert_eq!(y.to_vec1::<f32>().unwrap(), vec![0.0, 0.0, 2.0, 3.0]);
        // α still learns through the clip
        let grads = y.sum_all().unwrap().backward().unwrap();
        assert!(grads.get(p.alpha().as_tensor()).is_some());
    }

    #[test]
    fn alpha_group_is_clipped_at_zero_and_penalty_sums_squares() {
        let varmap = VarMap::new();
        let scope = ParamScope::new(&varmap, &Device::Cpu);
        let acts = [
            Activation::Pact(Pact::new(false, 2.0, None, scope.pp("a")).unwrap()),
            Activation::Sign,
            Activation::Pact(Pact::new(true, 3.0, None, scope.pp("b")).unwrap()),
        ];
        let groups = crate::constrain::collect_param_groups(&acts[0]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].clip, Some((0.0, f64::INFINITY)));
        assert!(acts[1].children().is_empty());

        let penalty = alpha_penalty(&acts).unwrap().unwrap();
        assert_eq!(penalty.to_scalar::<f32>().unwrap(), 13.0);
        assert!(alpha_penalty(&[Activation::Sign]).unwrap().is_none());
    }
}
