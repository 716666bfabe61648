//! Loss heads and error counting.

use candle_core::{DType, Result, Tensor, D};

/// What one forward pass over a labelled batch produces.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Scalar loss, still attached to the autodiff graph.
    pub loss: Tensor,
    /// Raw class scores `(batch, classes)`.
    pub logits: Tensor,
    /// `argmax` of the logits, `(batch,)` u32.
    pub predictions: Tensor,
    /// Mispredicted samples in the batch.
    pub batch_errors: usize,
}

/// Cross-entropy head (real and TTQ assemblies).
pub fn cross_entropy_head(logits: &Tensor, labels: &Tensor) -> Result<ForwardOutput> {
    let loss = candle_nn::loss::cross_entropy(logits, labels)?;
    finish(logits, labels, loss)
}

/// Squared hinge `mean(max(0, 1 - y·t)²)` against ±1 one-hot targets.
pub fn squared_hinge_head(logits: &Tensor, labels: &Tensor) -> Result<ForwardOutput> {
    let targets = signed_one_hot(labels, logits.dim(D::Minus1)?)?;
    let margin = (logits * &targets)?.affine(-1.0, 1.0)?.relu()?;
    let loss = margin.sqr()?.mean_all()?;
    finish(logits, labels, loss)
}

/// `+1` at the label, `-1` everywhere else: `(batch, classes)` f32.
pub fn signed_one_hot(labels: &Tensor, classes: usize) -> Result<Tensor> {
    let device = labels.device().clone();
    let labels = labels.to_dtype(DType::U32)?.to_vec1::<u32>()?;
    let mut data = vec![-1f32; labels.len() * classes];
    for (row, &label) in labels.iter().enumerate() {
        let label = label as usize;
        if label >= classes {
            candle_core::bail!("label {label} out of range for {classes} classes");
        }
        data[row * classes + label] = 1.0;
    }
    Tensor::from_vec(data, (labels.len(), classes), &device)
}

/// Number of rows whose argmax differs from the label.
pub fn batch_errors(predictions: &Tensor, labels: &Tensor) -> Result<usize> {
    let wrong = predictions
        .ne(&labels.to_dtype(predictions.dtype())?)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(wrong as usize)
}

fn finish(logits: &Tensor, labels: &Tensor, loss: Tensor) -> Result<ForwardOutput> {
    let predictions = logits.argmax(D::Minus1)?;
    let batch_errors = batch_errors(&predictions, labels)?;
    Ok(ForwardOutput {
        loss,
        logits: logits.clone(),
        predictions,
        batch_errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn errors_count_mispredictions() {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[0.1f32, 0.9], [0.8, 0.2], [0.3, 0.7]], &dev).unwrap();
        let labels = Tensor::new(&[1u32, 1, 1], &dev).unwrap();
        let out = cross_entropy_head(&logits, &labels).unwrap();
        assert_eq!(out.batch_errors, 1);
        assert_eq!(out.predictions.to_vec1::<u32>().unwrap(), vec![1, 0, 1]);
    }

    #[test]
    fn hinge_is_zero_beyond_margin() {
        let dev = Device::Cpu;
        let labels = Tensor::new(&[2u32, 0], &dev).unwrap();
        let targets = signed_one_hot(&labels, 3).unwrap();
        assert_eq!(
            targets.to_vec2::<f32>().unwrap(),
            vec![vec![-1., -1., 1.], vec![1., -1., -1.]]
        );
        let logits = targets.affine(2.0, 0.0).unwrap();
        let out = squared_hinge_head(&logits, &labels).unwrap();
        assert_eq!(out.loss.to_scalar::<f32>().unwrap(), 0.0);
        assert_eq!(out.batch_errors, 0);
    }

    #[test]
    fn hinge_penalises_wrong_sign() {
        let dev = Device::Cpu;
        let labels = Tensor::new(&[0u32], &dev).unwrap();
        let logits = Tensor::new(&[[0f32, 0.]], &dev).unwrap();
        let out = squared_hinge_head(&logits, &labels).unwrap();
        assert!((out.loss.to_scalar::<f32>().unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn out_of_range_label_is_an_error() {
        let dev = Device::Cpu;
        let labels = Tensor::new(&[5u32], &dev).unwrap();
        assert!(signed_one_hot(&labels, 3).is_err());
    }
}
