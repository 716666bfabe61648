//! # lowprec-train — Optimisation and the Training Loop
//!
//! * **[`GroupedOptimizer`]** — SGD / NAG / RMSProp / Adam over the model's
//!   parameter groups, honouring each group's `lr_scale` and clip interval.
//! * **[`Trainer`]** — owns parameters, model, optimiser and the seeded RNG.
//!   One call to [`Trainer::step`] runs resample, forward, backward, update,
//!   projection and reconstrain.

pub mod optimizer;
pub mod trainer;

pub use optimizer::GroupedOptimizer;
pub use trainer::{checkpoint_epoch, EvalMetrics, StepMetrics, Trainer};
