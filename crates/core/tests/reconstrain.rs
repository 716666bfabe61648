//! The reconstrain protocol observed through whole layers and assemblies.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use lowprec_common::ModelConfig;
use lowprec_core::{BasicBlock, Conv2dTtq, ConvShape, Model, ParamScope, QuantizedWeight};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn values(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

#[test]
fn ttq_model_on_zero_images() {
    let varmap = VarMap::new();
    let mut config = ModelConfig::new("cifar10", "ttq").unwrap();
    config.width = 4;
    let mut rng = StdRng::seed_from_u64(0);
    let model = Model::new(&config, ParamScope::new(&varmap, &Device::Cpu), &mut rng).unwrap();

    let xs = Tensor::zeros((4, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();
    let ys = Tensor::new(&[0u32, 1, 2, 3], &Device::Cpu).unwrap();
    let out = model.forward_t(&xs, &ys, true).unwrap();

    assert!(out.loss.to_scalar::<f32>().unwrap().is_finite());
    assert!(out.batch_errors <= 4);
    assert_eq!(out.predictions.dims(), &[4]);
    let preds = out.predictions.to_vec1::<u32>().unwrap();
    assert!(preds.iter().all(|&p| p < 10));
}

#[test]
fn stale_forward_diverges_until_reconstrain() {
    let varmap = VarMap::new();
    let scope = ParamScope::new(&varmap, &Device::Cpu);
    let mut rng = StdRng::seed_from_u64(4);
    let conv = Conv2dTtq::ttq(ConvShape::same3(2, 3), 0.05, scope.pp("c"), &mut rng).unwrap();
    let x = Tensor::randn(0f32, 1.0, (1, 2, 6, 6), &Device::Cpu).unwrap();

    let synced = values(&conv.forward(&x).unwrap());

    // an optimiser-style update that skips reconstrain
    let shadow = conv.weight().shadow();
    shadow.set(&shadow.as_tensor().affine(-1.0, 0.0).unwrap()).unwrap();
    let stale = values(&conv.forward(&x).unwrap());
    assert_eq!(synced, stale);

    lowprec_core::constrain::constrain(&conv).unwrap();
    let fresh = values(&conv.forward(&x).unwrap());
    assert_ne!(stale, fresh);
}

#[test]
fn model_forward_always_resyncs() {
    let varmap = VarMap::new();
    let mut config = ModelConfig::new("mnist", "ttq").unwrap();
    config.width = 2;
    let mut rng = StdRng::seed_from_u64(6);
    let model = Model::new(&config, ParamScope::new(&varmap, &Device::Cpu), &mut rng).unwrap();
    let xs = Tensor::rand(0f32, 1.0, (2, 1, 28, 28), &Device::Cpu).unwrap();
    let ys = Tensor::new(&[0u32, 1], &Device::Cpu).unwrap();
    let before = values(&model.forward_t(&xs, &ys, false).unwrap().logits);

    // an update that skips reconstrain
    let stem = varmap.data().lock().unwrap()["conv0.weight"].clone();
    stem.set(&Tensor::randn(0f32, 1.0, stem.dims(), &Device::Cpu).unwrap())
        .unwrap();
    let after = values(&model.forward_t(&xs, &ys, false).unwrap().logits);
    assert_ne!(before, after);
}

#[test]
fn reconstrain_twice_is_bit_identical() {
    let varmap = VarMap::new();
    let mut config = ModelConfig::new("cifar10", "ttqresnet32").unwrap();
    config.width = 2;
    let mut rng = StdRng::seed_from_u64(8);
    let model = Model::new(&config, ParamScope::new(&varmap, &Device::Cpu), &mut rng).unwrap();
    let xs = Tensor::rand(0f32, 1.0, (2, 3, 32, 32), &Device::Cpu).unwrap();
    let ys = Tensor::new(&[4u32, 5], &Device::Cpu).unwrap();

    model.constrain().unwrap();
    let a = values(&model.forward_t(&xs, &ys, false).unwrap().logits);
    model.constrain().unwrap();
    let b = values(&model.forward_t(&xs, &ys, false).unwrap().logits);
    assert_eq!(a, b);
}

#[test]
fn bypass_matches_residual_for_configured_triples() {
    let varmap = VarMap::new();
    let scope = ParamScope::new(&varmap, &Device::Cpu);
    let mut config = ModelConfig::new("cifar10", "ttqresnet32").unwrap();
    config.width = 4;
    let mut rng = StdRng::seed_from_u64(9);
    let b = config.width;
    let triples = [(b, b, 1), (b, 2 * b, 2), (2 * b, 2 * b, 1), (2 * b, 4 * b, 2), (4 * b, 4 * b, 1)];
    for (i, (c_in, c_out, stride)) in triples.into_iter().enumerate() {
        let block = BasicBlock::new(c_in, c_out, stride, &config, scope.pp(i), &mut rng).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, c_in, 16, 16), &Device::Cpu).unwrap();
        let (bypass, residual) = block.paths(&x, true).unwrap();
        assert_eq!(bypass.dims(), residual.dims(), "triple {:?}", (c_in, c_out, stride));
        assert!(block.forward_t(&x, true).is_ok());
    }
}
