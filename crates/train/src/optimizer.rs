//! Grouped first-order optimisers.
//!
//! One optimiser instance serves every [`ParamGroup`] of a model; each group
//! contributes its `lr_scale` (multiplies the step) and an optional clip
//! interval applied by [`GroupedOptimizer::project`] after the step.
//!
//! Update rules (`g` = gradient, `η` = `lr · lr_scale`):
//!
//! | Kind | State | Step |
//! |------|-------|------|
//! | SGD | `b ← μb + g` | `w ← w − η b` |
//! | NAG | `b ← μb + g` | `w ← w − η (g + μb)` |
//! | RMSProp | `s ← ρs + (1−ρ)g²` | `w ← w − η g / (√s + ε)` |
//! | Adam | `m ← β₁m + (1−β₁)g`, `v ← β₂v + (1−β₂)g²` | `w ← w − η m̂ / (√v̂ + ε)` |

use candle_core::{backprop::GradStore, Result, Tensor, Var};
use lowprec_common::{OptimizerConfig, OptimizerKind};
use lowprec_core::ParamGroup;

struct Slot {
    var: Var,
    lr_scale: f64,
    clip: Option<(f64, f64)>,
    first: Tensor,
    second: Tensor,
}

pub struct GroupedOptimizer {
    kind: OptimizerKind,
    slots: Vec<Slot>,
    pub lr: f64,
    mom: f64,
    rho: f64,
    eps: f64,
    beta1: f64,
    beta2: f64,
    t: usize,
}

impl GroupedOptimizer {
    pub fn new(groups: Vec<ParamGroup>, kind: OptimizerKind, config: &OptimizerConfig) -> Result<Self> {
        let mut slots = Vec::new();
        for group in groups {
            for var in group.vars {
                let first = Tensor::zeros_like(var.as_tensor())?;
                let second = Tensor::zeros_like(var.as_tensor())?;
                slots.push(Slot {
                    var,
                    lr_scale: group.lr_scale,
                    clip: group.clip,
                    first,
                    second,
                });
            }
        }
        Ok(Self {
            kind,
            slots,
            lr: config.lr,
            mom: config.mom,
            rho: config.rho,
            eps: config.eps,
            beta1: config.beta1,
            beta2: config.beta2,
            t: 0,
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.lr = lr;
    }

    /// Number of optimised variables.
    pub fn num_vars(&self) -> usize {
        self.slots.len()
    }

    /// Apply one update. Variables without a gradient are left untouched.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.t += 1;
        let bias1 = 1.0 - self.beta1.powi(self.t as i32);
        let bias2 = 1.0 - self.beta2.powi(self.t as i32);

        for slot in &mut self.slots {
            let grad = match grads.get(slot.var.as_tensor()) {
                Some(g) => g.detach(),
                None => continue,
            };
            let update = match self.kind {
                OptimizerKind::Sgd => {
                    slot.first = ((&slot.first * self.mom)? + &grad)?;
                    slot.first.clone()
                }
                OptimizerKind::Nag => {
                    slot.first = ((&slot.first * self.mom)? + &grad)?;
                    (&grad + (&slot.first * self.mom)?)?
                }
                OptimizerKind::RmsProp => {
                    slot.second = ((&slot.second * self.rho)? + (grad.sqr()? * (1.0 - self.rho))?)?;
                    (&grad / (slot.second.sqrt()? + self.eps)?)?
                }
                OptimizerKind::Adam => {
                    slot.first = ((&slot.first * self.beta1)? + (&grad * (1.0 - self.beta1))?)?;
                    slot.second = ((&slot.second * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;
                    let m_hat = (&slot.first / bias1)?;
                    let v_hat = (&slot.second / bias2)?;
                    (m_hat / (v_hat.sqrt()? + self.eps)?)?
                }
            };
            let step = (update * (self.lr * slot.lr_scale))?;
            slot.var.set(&slot.var.as_tensor().sub(&step)?)?;
        }
        Ok(())
    }

    /// Clamp every clipped variable back onto its interval.
    pub fn project(&self) -> Result<()> {
        for slot in &self.slots {
            if let Some((lo, hi)) = slot.clip {
                let clamped = slot.var.as_tensor().clamp(lo as f32, hi as f32)?;
                slot.var.set(&clamped)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use lowprec_core::Precision;

    fn var(values: &[f32]) -> Var {
        Var::new(values, &Device::Cpu).unwrap()
    }

    fn group(v: &Var, lr_scale: f64, clip: Option<(f64, f64)>) -> ParamGroup {
        ParamGroup {
            name: "w".into(),
            vars: vec![v.clone()],
            lr_scale,
            clip,
            precision: Precision::Full,
        }
    }

    /// Gradient of `sum(w · c)` is `c`.
    fn linear_grads(v: &Var, c: &[f32]) -> GradStore {
        let c = Tensor::new(c, &Device::Cpu).unwrap();
        (v.as_tensor() * c).unwrap().sum_all().unwrap().backward().unwrap()
    }

    fn config(name: &str, lr: f64) -> OptimizerConfig {
        OptimizerConfig {
            name: name.into(),
            lr,
            ..Default::default()
        }
    }

    #[test]
    fn sgd_with_lr_scale() {
        let w = var(&[1.0, 1.0]);
        let mut cfg = config("sgd", 0.1);
        cfg.mom = 0.0;
        let mut opt = GroupedOptimizer::new(vec![group(&w, 2.0, None)], OptimizerKind::Sgd, &cfg).unwrap();
        opt.step(&linear_grads(&w, &[1.0, -1.0])).unwrap();
        let got = w.as_tensor().to_vec1::<f32>().unwrap();
        assert!((got[0] - 0.8).abs() < 1e-6);
        assert!((got[1] - 1.2).abs() < 1e-6);
    }

    #[test]
    fn nag_looks_ahead_of_momentum() {
        let w_sgd = var(&[0.0]);
        let w_nag = var(&[0.0]);
        let cfg = config("nag", 1.0);
        let mut sgd = GroupedOptimizer::new(vec![group(&w_sgd, 1.0, None)], OptimizerKind::Sgd, &cfg).unwrap();
        let mut nag = GroupedOptimizer::new(vec![group(&w_nag, 1.0, None)], OptimizerKind::Nag, &cfg).unwrap();
        sgd.step(&linear_grads(&w_sgd, &[1.0])).unwrap();
        nag.step(&linear_grads(&w_nag, &[1.0])).unwrap();
        // sgd: b = 1, w = -1. nag: b = 1, d = 1 + 0.9
        assert!((w_sgd.as_tensor().to_vec1::<f32>().unwrap()[0] + 1.0).abs() < 1e-6);
        assert!((w_nag.as_tensor().to_vec1::<f32>().unwrap()[0] + 1.9).abs() < 1e-6);
    }

    #[test]
    fn adam_first_step_is_lr_sized() {
        let w = var(&[0.5, 0.5]);
        let cfg = config("adam", 0.01);
        let mut opt = GroupedOptimizer::new(vec![group(&w, 1.0, None)], OptimizerKind::Adam, &cfg).unwrap();
        opt.step(&linear_grads(&w, &[3.0, -0.2])).unwrap();
        let got = w.as_tensor().to_vec1::<f32>().unwrap();
        assert!((got[0] - 0.49).abs() < 1e-5);
        assert!((got[1] - 0.51).abs() < 1e-5);
    }

    #[test]
    fn rmsprop_normalises_gradient() {
        let w = var(&[0.0]);
        let mut cfg = config("rmsprop", 0.1);
        cfg.rho = 0.0;
        let mut opt = GroupedOptimizer::new(vec![group(&w, 1.0, None)], OptimizerKind::RmsProp, &cfg).unwrap();
        opt.step(&linear_grads(&w, &[4.0])).unwrap();
        assert!((w.as_tensor().to_vec1::<f32>().unwrap()[0] + 0.1).abs() < 1e-5);
    }

    #[test]
    fn project_clamps_only_clipped_groups() {
        let clipped = var(&[-3.0, 0.5, 2.0]);
        let free = var(&[-3.0, 2.0]);
        let cfg = config("sgd", 0.1);
        let opt = GroupedOptimizer::new(
            vec![group(&clipped, 1.0, Some((-1.0, 1.0))), group(&free, 1.0, None)],
            OptimizerKind::Sgd,
            &cfg,
        )
        .unwrap();
        assert_eq!(opt.num_vars(), 2);
        opt.project().unwrap();
        assert_eq!(clipped.as_tensor().to_vec1::<f32>().unwrap(), vec![-1.0, 0.5, 1.0]);
        assert_eq!(free.as_tensor().to_vec1::<f32>().unwrap(), vec![-3.0, 2.0]);
    }

    #[test]
    fn missing_gradient_is_skipped() {
        let used = var(&[1.0]);
        let unused = var(&[1.0]);
        let mut opt = GroupedOptimizer::new(
            vec![group(&used, 1.0, None), group(&unused, 1.0, None)],
            OptimizerKind::Sgd,
            &config("sgd", 0.5),
        )
        .unwrap();
        opt.step(&linear_grads(&used, &[1.0])).unwrap();
        assert_eq!(unused.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0]);
        assert_eq!(used.as_tensor().to_vec1::<f32>().unwrap(), vec![0.5]);
    }
}
