//! Trainer: one object owning the parameters, the model, the optimiser and
//! the run's RNG.
//!
//! A step is: resample stochastic layers → forward (train mode, which
//! reconstrains first) → backward → grouped optimiser step → projection →
//! `constrain()`. After the last stage the operational weights are in sync
//! with the updated shadows again, so an out-of-band forward never sees a
//! stale cache.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::SeedableRng;

use lowprec_common::{batch_to_tensors, ExperimentConfig, ImageDataset, ModelConfig};
use lowprec_core::{model_summary, Model, ModelSummary, ParamScope};

use crate::optimizer::GroupedOptimizer;

/// Metrics returned after each training step.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub step: usize,
    pub loss: f32,
    pub batch_errors: usize,
    pub batch_size: usize,
    pub lr: f64,
}

/// Aggregate over one pass of a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalMetrics {
    /// Sample-weighted mean loss.
    pub loss: f64,
    pub accuracy: f64,
    pub errors: usize,
    pub samples: usize,
}

impl EvalMetrics {
    fn accumulate(batches: impl IntoIterator<Item = (f64, usize, usize)>) -> Self {
        let mut loss_sum = 0.0;
        let mut errors = 0;
        let mut samples = 0;
        for (loss, errs, n) in batches {
            loss_sum += loss * n as f64;
            errors += errs;
            samples += n;
        }
        if samples == 0 {
            return Self {
                loss: f64::NAN,
                accuracy: 0.0,
                errors: 0,
                samples: 0,
            };
        }
        Self {
            loss: loss_sum / samples as f64,
            accuracy: 1.0 - errors as f64 / samples as f64,
            errors,
            samples,
        }
    }
}

// ── Trainer ─────────────────────────────────────────────────────────────────

pub struct Trainer {
    pub model: Model,
    pub varmap: VarMap,
    optimizer: GroupedOptimizer,
    pub config: ExperimentConfig,
    model_config: ModelConfig,
    rng: StdRng,
    pub global_step: usize,
    device: Device,
}

impl Trainer {
    /// Resolve `config`, build and initialise the model from `config.seed`.
    ///
    /// Configuration errors surface here, before any tensor is allocated.
    pub fn new(config: ExperimentConfig, device: Device) -> anyhow::Result<Self> {
        let model_config = config.model_config()?;
        let optimizer_kind = config.optimizer.kind()?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let varmap = VarMap::new();
        let model = Model::new(&model_config, ParamScope::new(&varmap, &device), &mut rng)?;
        let constrained = model.constrain()?;

        let summary = model_summary(&model);
        tracing::info!(
            dataset = model_config.dataset.name(),
            model = model_config.model.name(),
            width = model_config.width,
            constrained_layers = constrained,
            total_params = summary.total_params,
            ternary_params = summary.ternary_params,
            binary_params = summary.binary_params,
            effective_bits = format!("{:.2}", summary.effective_bits_per_param),
            "Model built"
        );

        let optimizer = GroupedOptimizer::new(model.param_groups(), optimizer_kind, &config.optimizer)?;

        Ok(Self {
            model,
            varmap,
            optimizer,
            config,
            model_config,
            rng,
            global_step: 0,
            device,
        })
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    pub fn summary(&self) -> ModelSummary {
        model_summary(&self.model)
    }

    /// The run's RNG, shared by data shuffling and stochastic quantisation.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.optimizer.set_lr(lr);
    }

    /// One optimiser step on a labelled batch.
    pub fn step(&mut self, images: &Tensor, labels: &Tensor) -> anyhow::Result<StepMetrics> {
        self.model.resample(&mut self.rng)?;
        let out = self.model.forward_t(images, labels, true)?;
        let loss = out.loss.to_scalar::<f32>()?;
        if !loss.is_finite() {
            tracing::warn!(step = self.global_step, loss, "non-finite training loss");
        }

        let grads = out.loss.backward()?;
        self.optimizer.step(&grads)?;
        self.optimizer.project()?;
        self.model.constrain()?;

        let metrics = StepMetrics {
            step: self.global_step,
            loss,
            batch_errors: out.batch_errors,
            batch_size: labels.dim(0)?,
            lr: self.optimizer.lr,
        };
        self.global_step += 1;

        let log_every = self.config.log_every;
        if log_every > 0 && metrics.step % log_every == 0 {
            tracing::info!(
                step = metrics.step,
                loss = format!("{:.4}", metrics.loss),
                errors = metrics.batch_errors,
                lr = metrics.lr,
                "train"
            );
        }
        Ok(metrics)
    }

    /// One shuffled pass over `dataset`; `on_step` sees every step's metrics.
    pub fn train_epoch(
        &mut self,
        dataset: &ImageDataset,
        mut on_step: impl FnMut(&StepMetrics),
    ) -> anyhow::Result<EvalMetrics> {
        let batches = dataset.shuffled_batches(self.config.batch_size, &mut self.rng);
        let mut seen = Vec::with_capacity(batches.len());
        for indices in &batches {
            let (images, labels) = batch_to_tensors(dataset, indices, &self.device)?;
            let m = self.step(&images, &labels)?;
            on_step(&m);
            seen.push((m.loss as f64, m.batch_errors, m.batch_size));
        }
        Ok(EvalMetrics::accumulate(seen))
    }

    /// Loss and accuracy over all of `dataset` with running BN statistics.
    pub fn evaluate(&self, dataset: &ImageDataset, batch_size: usize) -> anyhow::Result<EvalMetrics> {
        let mut seen = Vec::new();
        for indices in dataset.ordered_batches(batch_size) {
            let (images, labels) = batch_to_tensors(dataset, &indices, &self.device)?;
            let out = self.model.forward_t(&images, &labels, false)?;
            seen.push((out.loss.to_scalar::<f32>()? as f64, out.batch_errors, indices.len()));
        }
        Ok(EvalMetrics::accumulate(seen))
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    /// Write `<work_dir>/checkpoints/checkpoint-<epoch>.safetensors` and
    /// `<work_dir>/config.json`.
    pub fn save_checkpoint(&self, epoch: usize) -> anyhow::Result<PathBuf> {
        let dir = self.config.work_dir.join("checkpoints");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join(format!("checkpoint-{epoch}.safetensors"));
        self.varmap.save(&path)?;
        self.config.save(&self.config.work_dir.join("config.json"))?;
        tracing::info!(epoch, path = %path.display(), "Saved checkpoint");
        Ok(path)
    }

    /// Restore every variable (shadows, scales, BN statistics) and resync.
    pub fn load_checkpoint(&mut self, path: &Path) -> anyhow::Result<()> {
        self.varmap
            .load(path)
            .with_context(|| format!("loading checkpoint {}", path.display()))?;
        self.model.constrain()?;
        tracing::info!(path = %path.display(), "Loaded checkpoint");
        Ok(())
    }

    /// Load `checkpoint-<N>.safetensors` and continue the step count after
    /// epoch `N`. Returns the first epoch still to run, `N + 1`.
    pub fn resume(&mut self, path: &Path, steps_per_epoch: usize) -> anyhow::Result<usize> {
        let epoch = checkpoint_epoch(path).with_context(|| {
            format!(
                "cannot resume from {}: expected a checkpoint-<epoch>.safetensors file",
                path.display()
            )
        })?;
        self.load_checkpoint(path)?;
        self.global_step = epoch * steps_per_epoch;
        tracing::info!(epoch, global_step = self.global_step, "Resuming");
        Ok(epoch + 1)
    }

    /// `<work_dir>/logs/metrics.csv`, positioned for appending epoch rows.
    ///
    /// A fresh run truncates the file and writes the header; a resumed run
    /// appends to what is there (writing the header only if the file is new).
    pub fn open_metrics(&self, resume: bool) -> anyhow::Result<File> {
        let dir = self.config.work_dir.join("logs");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating {}", dir.display()))?;
        let path = dir.join("metrics.csv");
        let has_rows = resume && std::fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);
        let mut file = if resume {
            OpenOptions::new().create(true).append(true).open(&path)
        } else {
            File::create(&path)
        }
        .with_context(|| format!("opening {}", path.display()))?;
        if !has_rows {
            writeln!(file, "epoch,val_loss,val_acc")?;
        }
        Ok(file)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// `N` from a `checkpoint-N.safetensors` path.
pub fn checkpoint_epoch(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix("checkpoint-")?
        .strip_suffix(".safetensors")?
        .parse()
        .ok()
}
