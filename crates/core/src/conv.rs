//! Convolutions: full-precision and shadow-weight constrained variants.
//!
//! | Type | Weight | Bias |
//! |------|--------|------|
//! | [`RealConv2d`] | f32, torch-style uniform init | yes |
//! | [`Conv2dTtq`] | `{-α_neg, 0, +α_pos}` | no |
//! | [`Conv2dBnn`] | `{-H, +H}` | yes |
//!
//! All of them run through [`conv2d_unfold`]: patches are gathered with
//! `narrow` / `index_select`, stacked into an im2col matrix and multiplied
//! with the flattened kernel, so the kernel gradient is an ordinary matmul
//! backward for any batch size.

use candle_core::{Result, Tensor, Var};
use rand::rngs::StdRng;

use crate::constrain::{uniform_init, Constrained, Node, ParamGroup, ParamScope};
use crate::weight::{BinaryConfig, BinaryWeight, QuantizedWeight, TernaryWeight};

/// Square-kernel geometry shared by every conv here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvShape {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvShape {
    /// `kernel × kernel` conv with stride 1 and no padding.
    pub fn new(in_channels: usize, out_channels: usize, kernel: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel,
            stride: 1,
            padding: 0,
        }
    }

    /// 3×3, padding 1.
    pub fn same3(in_channels: usize, out_channels: usize) -> Self {
        Self::new(in_channels, out_channels, 3).with_padding(1)
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn weight_dims(&self) -> [usize; 4] {
        [self.out_channels, self.in_channels, self.kernel, self.kernel]
    }

    pub fn fan_in(&self) -> usize {
        self.in_channels * self.kernel * self.kernel
    }

    pub fn fan_out(&self) -> usize {
        self.out_channels * self.kernel * self.kernel
    }

    /// Output side for an input side of `side` pixels.
    pub fn output_side(&self, side: usize) -> usize {
        (side + 2 * self.padding).saturating_sub(self.kernel) / self.stride + 1
    }
}

// ── im2col ──────────────────────────────────────────────────────────────────

/// Cross-correlation of `x: (n, c, h, w)` with `kernel: (o, c, k, k)`.
///
/// Returns `(n, o, oh, ow)`.
pub fn conv2d_unfold(x: &Tensor, kernel: &Tensor, stride: usize, padding: usize) -> Result<Tensor> {
    let (n, c, h, w) = x.dims4()?;
    let (o, kc, k, kw) = kernel.dims4()?;
    if kc != c || k != kw {
        candle_core::bail!(
            "conv kernel {:?} does not fit input {:?}",
            kernel.dims(),
            x.dims()
        );
    }
    if stride == 0 {
        candle_core::bail!("conv stride must be positive");
    }
    let (hp, wp) = (h + 2 * padding, w + 2 * padding);
    if hp < k || wp < k {
        candle_core::bail!("input {h}x{w} (padding {padding}) smaller than kernel {k}x{k}");
    }
    let oh = (hp - k) / stride + 1;
    let ow = (wp - k) / stride + 1;

    let x = if padding > 0 {
        x.pad_with_zeros(2, padding, padding)?
            .pad_with_zeros(3, padding, padding)?
    } else {
        x.clone()
    };
    let rows = strided_positions(oh, stride, x.device())?;
    let cols = strided_positions(ow, stride, x.device())?;

    let mut patches = Vec::with_capacity(k * k);
    for ky in 0..k {
        for kx in 0..k {
            let mut p = x
                .narrow(2, ky, (oh - 1) * stride + 1)?
                .narrow(3, kx, (ow - 1) * stride + 1)?;
            if stride > 1 {
                p = p.contiguous()?.index_select(&rows, 2)?.contiguous()?.index_select(&cols, 3)?;
            }
            patches.push(p);
        }
    }
    // (n, c, k·k, oh, ow) -> (n·oh·ow, c·k·k), matching the kernel's row layout
    let unfolded = Tensor::stack(&patches, 2)?
        .permute(vec![0, 3, 4, 1, 2])?
        .contiguous()?
        .reshape((n * oh * ow, c * k * k))?;
    let flat_kernel = kernel.reshape((o, c * k * k))?;
    unfolded
        .matmul(&flat_kernel.t()?)?
        .reshape((n, oh, ow, o))?
        .permute((0, 3, 1, 2))?
        .contiguous()
}

fn strided_positions(len: usize, stride: usize, device: &candle_core::Device) -> Result<Tensor> {
    let idx: Vec<u32> = (0..len).map(|i| (i * stride) as u32).collect();
    Tensor::from_vec(idx, len, device)
}

fn add_channel_bias(y: Tensor, bias: Option<&Var>) -> Result<Tensor> {
    match bias {
        Some(b) => y.broadcast_add(&b.as_tensor().reshape((1, b.elem_count(), 1, 1))?),
        None => Ok(y),
    }
}

// ── RealConv2d ──────────────────────────────────────────────────────────────

/// Plain f32 conv with bias; `U(±1/sqrt(fan_in))` init for weight and bias.
pub struct RealConv2d {
    name: String,
    weight: Var,
    bias: Var,
    shape: ConvShape,
}

impl RealConv2d {
    pub fn new(shape: ConvShape, scope: ParamScope, rng: &mut StdRng) -> Result<Self> {
        let bound = 1.0 / (shape.fan_in() as f64).sqrt();
        let weight = scope.var("weight", uniform_init(&shape.weight_dims(), bound, rng, scope.device())?)?;
        let bias = scope.var("bias", uniform_init(&[shape.out_channels], bound, rng, scope.device())?)?;
        Ok(Self {
            name: scope.prefix(),
            weight,
            bias,
            shape,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = conv2d_unfold(x, self.weight.as_tensor(), self.shape.stride, self.shape.padding)?;
        add_channel_bias(y, Some(&self.bias))
    }

    pub fn shape(&self) -> ConvShape {
        self.shape
    }
}

impl Node for RealConv2d {
    fn param_groups(&self) -> Vec<ParamGroup> {
        vec![ParamGroup::full(
            self.name.clone(),
            vec![self.weight.clone(), self.bias.clone()],
        )]
    }
}

// ── ConstrainedConv2d ───────────────────────────────────────────────────────

/// A conv whose kernel argument is always the operational weight of `W`.
pub struct ConstrainedConv2d<W> {
    name: String,
    weight: W,
    bias: Option<Var>,
    shape: ConvShape,
}

/// Trained-ternary conv, no bias.
pub type Conv2dTtq = ConstrainedConv2d<TernaryWeight>;

/// Binary-weight conv with a full-precision bias.
pub type Conv2dBnn = ConstrainedConv2d<BinaryWeight>;

impl<W: QuantizedWeight> ConstrainedConv2d<W> {
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let w = self.weight.operational()?;
        let y = conv2d_unfold(x, &w, self.shape.stride, self.shape.padding)?;
        add_channel_bias(y, self.bias.as_ref())
    }

    /// The cached operational kernel, reconstraining first if never synced.
    pub fn operational_weight(&self) -> Result<Tensor> {
        self.weight.operational()
    }

    pub fn weight(&self) -> &W {
        &self.weight
    }

    pub fn shape(&self) -> ConvShape {
        self.shape
    }
}

impl Conv2dTtq {
    pub fn ttq(shape: ConvShape, beta: f64, scope: ParamScope, rng: &mut StdRng) -> Result<Self> {
        let weight = TernaryWeight::new(
            &shape.weight_dims(),
            shape.fan_in(),
            shape.fan_out(),
            beta,
            scope.clone(),
            rng,
        )?;
        Ok(Self {
            name: scope.prefix(),
            weight,
            bias: None,
            shape,
        })
    }

    /// Threshold from the last reconstrain.
    pub fn threshold(&self) -> Option<f64> {
        self.weight.threshold()
    }
}

impl Conv2dBnn {
    pub fn bnn(shape: ConvShape, config: BinaryConfig, scope: ParamScope, rng: &mut StdRng) -> Result<Self> {
        let weight = BinaryWeight::new(
            &shape.weight_dims(),
            shape.fan_in(),
            shape.fan_out(),
            config,
            scope.clone(),
            rng,
        )?;
        let bias = scope.var("bias", uniform_init(&[shape.out_channels], 0.0, rng, scope.device())?)?;
        Ok(Self {
            name: scope.prefix(),
            weight,
            bias: Some(bias),
            shape,
        })
    }
}

impl<W: QuantizedWeight> Node for ConstrainedConv2d<W> {
    fn constrained(&self) -> Option<&dyn Constrained> {
        Some(&self.weight)
    }

    fn param_groups(&self) -> Vec<ParamGroup> {
        let mut groups = self.weight.param_groups();
        if let Some(b) = &self.bias {
            groups.push(ParamGroup::full(format!("{}.bias", self.name), vec![b.clone()]));
        }
        groups
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constrain::{collect_param_groups, constrain};
    use candle_core::{DType, Device, D};
    use candle_nn::VarMap;
    use rand::SeedableRng;

    #[test]
    fn ttq_conv_output_shape_and_stride() {
        let varmap = VarMap::new();
        let scope = ParamScope::new(&varmap, &Device::Cpu);
        let mut rng = StdRng::seed_from_u64(0);
        let conv = Conv2dTtq::ttq(ConvShape::same3(3, 8).with_stride(2), 0.05, scope.pp("c"), &mut rng).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &Device::Cpu).unwrap();
        let y = conv.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 8, 8, 8]);
        // first forward reconstrained lazily
        assert!(conv.threshold().is_some());
    }

    #[test]
    fn ttq_conv_gradients_reach_shadow_and_scales() {
        let varmap = VarMap::new();
        let scope = ParamScope::new(&varmap, &Device::Cpu);
        let mut rng = StdRng::seed_from_u64(1);
        let conv = Conv2dTtq::ttq(ConvShape::same3(2, 4), 0.05, scope.pp("c"), &mut rng).unwrap();
        constrain(&conv).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 2, 5, 5), &Device::Cpu).unwrap();
        let loss = conv.forward(&x).unwrap().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let (ap, an) = conv.weight().scales();
        assert!(grads.get(conv.weight().shadow().as_tensor()).is_some());
        assert!(grads.get(ap.as_tensor()).is_some());
        assert!(grads.get(an.as_tensor()).is_some());
    }

    #[test]
    fn bnn_conv_has_bias_and_clipped_group() {
        let varmap = VarMap::new();
        let scope = ParamScope::new(&varmap, &Device::Cpu);
        let mut rng = StdRng::seed_from_u64(2);
        let conv = Conv2dBnn::bnn(ConvShape::same3(3, 6), BinaryConfig::default(), scope.pp("b"), &mut rng).unwrap();
        let groups = collect_param_groups(&conv);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].clip, Some((-1.0, 1.0)));
        assert_eq!(groups[1].name, "b.bias");

        let x = Tensor::ones((1, 3, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let y = conv.forward(&x).unwrap();
        assert_eq!(y.dims(), &[1, 6, 4, 4]);
        // centre pixel sees all 27 inputs of ±1 weights: odd integer output
        let centre = y.narrow(D::Minus1, 1, 1).unwrap().narrow(2, 1, 1).unwrap();
        let centre = centre.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(centre.iter().all(|v| (v.abs() as i32) % 2 == 1));
    }

    #[test]
    fn real_conv_is_not_constrained() {
        let varmap = VarMap::new();
        let scope = ParamScope::new(&varmap, &Device::Cpu);
        let mut rng = StdRng::seed_from_u64(3);
        let conv = RealConv2d::new(ConvShape::new(4, 10, 1), scope.pp("head"), &mut rng).unwrap();
        assert_eq!(constrain(&conv).unwrap(), 0);
        let groups = collect_param_groups(&conv);
        assert_eq!(groups[0].num_params(), 4 * 10 + 10);
    }

    #[test]
    fn unfold_forward_matches_direct_conv() {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (3, 2, 7, 6), &dev).unwrap();
        let w = Tensor::randn(0f32, 1.0, (5, 2, 3, 3), &dev).unwrap();
        for (stride, padding) in [(1, 0), (1, 1), (2, 1), (2, 0)] {
            let ours = conv2d_unfold(&x, &w, stride, padding).unwrap();
            let direct = x.conv2d(&w, padding, stride, 1, 1).unwrap();
            assert_eq!(ours.dims(), direct.dims(), "stride {stride} padding {padding}");
            let diff = (ours - direct)
                .unwrap()
                .abs()
                .unwrap()
                .max_all()
                .unwrap()
                .to_scalar::<f32>()
                .unwrap();
            assert!(diff < 1e-4, "stride {stride} padding {padding}: {diff}");
        }
    }

    #[test]
    fn kernel_gradient_matches_finite_difference_for_batches() {
        let dev = Device::Cpu;
        let mut rng = StdRng::seed_from_u64(11);
        for (batch, stride) in [(2, 1), (4, 2)] {
            let x = Tensor::randn(0f64, 1.0, (batch, 2, 5, 5), &dev).unwrap();
            let w = Var::from_tensor(&Tensor::randn(0f64, 1.0, (3, 2, 3, 3), &dev).unwrap()).unwrap();
            let side = ConvShape::same3(2, 3).with_stride(stride).output_side(5);
            let g = Tensor::randn(0f64, 1.0, (batch, 3, side, side), &dev).unwrap();
            let objective = |w: &Tensor| -> Tensor {
                (conv2d_unfold(&x, w, stride, 1).unwrap() * &g)
                    .unwrap()
                    .sum_all()
                    .unwrap()
            };

            let grads = objective(w.as_tensor()).backward().unwrap();
            let grad = grads.get(w.as_tensor()).unwrap();

            let dir = uniform_init(&[3, 2, 3, 3], 1.0, &mut rng, &dev)
                .unwrap()
                .to_dtype(DType::F64)
                .unwrap();
            let analytic = (grad * &dir).unwrap().sum_all().unwrap().to_scalar::<f64>().unwrap();
            let eps = 1e-3;
            let plus = objective(&(w.as_tensor() + (&dir * eps).unwrap()).unwrap());
            let minus = objective(&(w.as_tensor() - (&dir * eps).unwrap()).unwrap());
            let numeric = (plus.to_scalar::<f64>().unwrap() - minus.to_scalar::<f64>().unwrap()) / (2.0 * eps);
            assert!(
                (analytic - numeric).abs() < 1e-6 * (1.0 + numeric.abs()),
                "batch {batch} stride {stride}: analytic {analytic} vs numeric {numeric}"
            );
        }
    }

    #[test]
    fn real_conv_bias_and_weight_gradients_agree_across_batch() {
        // a batch of two identical samples must give exactly twice the
        // single-sample gradient
        let varmap = VarMap::new();
        let scope = ParamScope::new(&varmap, &Device::Cpu);
        let mut rng = StdRng::seed_from_u64(12);
        let conv = RealConv2d::new(ConvShape::same3(2, 3), scope.pp("c"), &mut rng).unwrap();
        let one = Tensor::randn(0f32, 1.0, (1, 2, 4, 4), &Device::Cpu).unwrap();
        let two = Tensor::cat(&[&one, &one], 0).unwrap();
        let grad_of = |x: &Tensor| {
            let loss = conv.forward(x).unwrap().sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            grads
                .get(conv.weight.as_tensor())
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        };
        let g1 = grad_of(&one);
        let g2 = grad_of(&two);
        for (a, b) in g1.iter().zip(&g2) {
            assert!((2.0 * a - b).abs() < 1e-3 * (1.0 + b.abs()), "{a} vs {b}");
        }
    }
}
