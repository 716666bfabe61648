//! # lowprec-core — Constrained Layers and Model Assemblies
//!
//! Everything needed to train low-precision image classifiers on top of
//! `candle-core`'s autodiff:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`quantize`] | STE primitives: sign/binarize, stochastic binarize, TTQ ternarize, ternary activation |
//! | [`constrain`] | `Constrained` / `Node` traits, recursive `constrain`, `ParamGroup`, `ParamScope` |
//! | [`weight`] | Shadow-weight holders `TernaryWeight`, `BinaryWeight` |
//! | [`conv`] | `RealConv2d`, `Conv2dTtq`, `Conv2dBnn` |
//! | [`linear`] | `RealLinear`, `LinearBnn` |
//! | [`norm`] | `BatchNorm2d` (optionally affine), `BatchNormTz` |
//! | [`activation`] | sign, PACT and BiPACT activations, `alpha_penalty` |
//! | [`loss`] | cross-entropy and squared-hinge heads, error counting |
//! | [`resnet`] | `BasicBlock`, `TtqResnetModel`, `TtqResnet32Model` |
//! | [`model`] | `RealModel`, `TtqModel`, `BnnModel`, `FfBnnModel`, the `Model` enum, `ModelSummary` |
//!
//! ## Shadow / operational weights
//!
//! Constrained layers keep a full-precision shadow `Var` that the optimiser
//! updates, and forward with a cached quantised tensor built from it by
//! `reconstrain()`. The cached tensor stays linked to the shadow in the
//! autodiff graph, so `loss.backward()` delivers straight-through gradients
//! to the shadow. Call [`Model::constrain`] after every optimiser step.

pub mod activation;
pub mod constrain;
pub mod conv;
pub mod linear;
pub mod loss;
pub mod model;
pub mod norm;
pub mod quantize;
pub mod resnet;
pub mod weight;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use activation::{Activation, Pact};
pub use constrain::{Constrained, Node, ParamGroup, ParamScope, Precision};
pub use conv::{conv2d_unfold, Conv2dBnn, Conv2dTtq, ConvShape, RealConv2d};
pub use linear::{LinearBnn, RealLinear};
pub use loss::ForwardOutput;
pub use model::{model_summary, BnnModel, FfBnnModel, Model, ModelSummary, RealModel, TtqModel};
pub use resnet::{residual_add, BasicBlock, TtqResnet32Model, TtqResnetModel};
pub use weight::{BinaryConfig, BinaryWeight, QuantizedWeight, TernaryWeight};
