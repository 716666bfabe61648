//! Quantisation primitives: binary / ternary maps with straight-through estimators.
//!
//! Every constrained layer delegates to these functions, both to build its
//! operational weight in `reconstrain()` and to discretise activations.
//!
//! # STE construction
//!
//! All estimators use the detach-residual trick:
//!
//! ```text
//! out = q.detach() + (x - x.detach()) * g
//! ```
//!
//! In the forward pass the residual is exactly zero, so `out == q` bit for
//! bit. In the backward pass `∂out/∂x = g`, where `g` is a detached gradient
//! mask or scale (e.g. `1{|x| <= 1}` for sign).

use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::Rng;

// ── STE helpers ─────────────────────────────────────────────────────────────

/// `(x - x.detach()) * grad_scale`: zero forward, `grad_scale` backward.
#[inline]
fn ste_residual(x: &Tensor, grad_scale: &Tensor) -> Result<Tensor> {
    let residual = (x - &x.detach())?;
    residual.mul(&grad_scale.detach())
}

/// `1{|x| <= clip}` as a float mask of the same dtype.
#[inline]
pub fn saturation_mask(x: &Tensor, clip: f64) -> Result<Tensor> {
    x.abs()?.le(clip)?.to_dtype(x.dtype())
}

// ── Binary ──────────────────────────────────────────────────────────────────

/// Deterministic sign: `+1` where `x >= 0`, `-1` elsewhere (no STE).
///
/// Unlike [`Tensor::sign`], zero maps to `+1`.
pub fn sign_binary(x: &Tensor) -> Result<Tensor> {
    x.ge(0f64)?.to_dtype(x.dtype())?.affine(2.0, -1.0)
}

/// Binarise to `{-h, +h}` with a saturating STE.
///
/// ```text
/// forward:  q = h · sign(x)
/// backward: ∂L/∂x = ∂L/∂q · 1{|x| <= h}
/// ```
///
/// With `h = 1` this is the classic BinaryNet `SignBNN`.
pub fn binarize_ste(x: &Tensor, h: f64) -> Result<Tensor> {
    let q = sign_binary(x)?.affine(h, 0.0)?;
    let mask = saturation_mask(x, h)?;
    q.detach() + ste_residual(x, &mask)?
}

/// `clip((x + 1) / 2, 0, 1)`.
#[inline]
pub fn hard_sigmoid(x: &Tensor) -> Result<Tensor> {
    x.affine(0.5, 0.5)?.clamp(0f64, 1f64)
}

/// Uniform `[0, 1)` noise drawn from an explicit generator.
pub fn uniform_noise(dims: &[usize], rng: &mut StdRng, device: &Device) -> Result<Tensor> {
    let n: usize = dims.iter().product();
    let data: Vec<f32> = (0..n).map(|_| rng.gen::<f32>()).collect();
    Tensor::from_vec(data, dims, device)
}

/// Stochastic binarisation to `{-h, +h}`.
///
/// `+h` is chosen where `noise < hard_sigmoid(x / h)`, i.e. with probability
/// `clip((x/h + 1) / 2, 0, 1)` for uniform noise. Same STE as [`binarize_ste`].
pub fn binarize_stochastic_ste(x: &Tensor, noise: &Tensor, h: f64) -> Result<Tensor> {
    let p = hard_sigmoid(&x.affine(1.0 / h, 0.0)?)?;
    let q = p
        .gt(&noise.to_dtype(p.dtype())?)?
        .to_dtype(x.dtype())?
        .affine(2.0 * h, -h)?;
    let mask = saturation_mask(x, h)?;
    q.detach() + ste_residual(x, &mask)?
}

// ── Ternary ─────────────────────────────────────────────────────────────────

/// TTQ threshold `t = β · mean(|W|)`; never negative, `0` for an all-zero `W`.
pub fn ttq_threshold(w: &Tensor, beta: f64) -> Result<f64> {
    let mean_abs = w.abs()?.mean_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;
    Ok((beta * mean_abs).max(0.0))
}

/// Float masks `(W > t, W < -t)`.
pub fn ternary_masks(w: &Tensor, t: f64) -> Result<(Tensor, Tensor)> {
    let pos = w.gt(t)?.to_dtype(w.dtype())?;
    let neg = w.lt(-t)?.to_dtype(w.dtype())?;
    Ok((pos, neg))
}

/// Trained ternary quantisation to `{-α_neg, 0, +α_pos}`.
///
/// ```text
/// q[i] = +α_pos   if W[i] >  t
///        -α_neg   if W[i] < -t
///         0       otherwise
/// ```
///
/// Gradients: `∂L/∂W` is straight-through, scaled by `α_pos` / `α_neg` on the
/// active regions and by 1 inside the zero band. `∂L/∂α_pos` sums the upstream
/// gradient over positive positions; `∂L/∂α_neg` is minus the sum over
/// negative positions. `alpha_pos` / `alpha_neg` are shape `(1,)`.
pub fn ternarize_ste(w: &Tensor, t: f64, alpha_pos: &Tensor, alpha_neg: &Tensor) -> Result<Tensor> {
    let (pos, neg) = ternary_masks(w, t)?;
    let q = (pos.broadcast_mul(alpha_pos)? - neg.broadcast_mul(alpha_neg)?)?;

    let zero_band = (pos.ones_like()? - (&pos + &neg)?)?;
    let grad_scale = ((pos.broadcast_mul(&alpha_pos.detach())?
        + neg.broadcast_mul(&alpha_neg.detach())?)?
        + zero_band)?;
    q + ste_residual(w, &grad_scale)?
}

/// Ternary activation to `{-1, 0, +1}` with thresholds `lo <= hi`.
///
/// `+1` above `hi`, `-1` below `lo`, `0` in between. With `lo = hi = 0` this
/// is a sign that keeps exact zeros. Backward: `1{|x| <= 1}`.
pub fn ternarize_activation_ste(x: &Tensor, lo: f64, hi: f64) -> Result<Tensor> {
    let pos = x.gt(hi)?.to_dtype(x.dtype())?;
    let neg = x.lt(lo)?.to_dtype(x.dtype())?;
    let q = (pos - neg)?;
    let mask = saturation_mask(x, 1.0)?;
    q.detach() + ste_residual(x, &mask)?
}

// ── Uniform levels ──────────────────────────────────────────────────────────

/// Snap `x ∈ [lo, hi]` to `2^bits` evenly spaced levels; identity gradient.
///
/// A collapsed range (`hi <= lo`) maps everything to `lo`.
pub fn quantize_uniform_ste(x: &Tensor, lo: f64, hi: f64, bits: u32) -> Result<Tensor> {
    let q = if hi > lo {
        let step = (hi - lo) / ((1u64 << bits) - 1) as f64;
        x.detach()
            .affine(1.0 / step, -lo / step)?
            .round()?
            .affine(step, lo)?
    } else {
        x.detach().affine(0.0, lo)?
    };
    q.detach() + (x - &x.detach())?
}

// ── Debug helpers ───────────────────────────────────────────────────────────

/// Count `(negative, zero, positive)` entries of a quantised tensor.
pub fn level_counts(q: &Tensor) -> Result<(u64, u64, u64)> {
    let flat = q.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let (mut n_neg, mut n_zero, mut n_pos) = (0u64, 0u64, 0u64);
    for &v in &flat {
        if v < 0.0 {
            n_neg += 1;
        } else if v > 0.0 {
            n_pos += 1;
        } else {
            n_zero += 1;
        }
    }
    Ok((n_neg, n_zero, n_pos))
}

// ── Tests ───────────────────────────────────────────────────────────────────
