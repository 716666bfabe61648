use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use candle_nn::VarMap;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;

use lowprec_common::{DatasetKind, ExperimentConfig, ImageDataset};
use lowprec_core::{model_summary, Model, ParamScope};
use lowprec_train::Trainer;

#[derive(Parser, Debug)]
#[command(name = "lowprec", about = "Train and evaluate ternary / binary CNNs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model, validating and snapshotting after every epoch.
    Train(TrainArgs),
    /// Evaluate a checkpoint on the test split.
    Eval(EvalArgs),
    /// Print parameter groups and the storage summary of a model.
    Info(InfoArgs),
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    /// Experiment config; created with defaults if missing.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[arg(long)]
    dataset: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    work_dir: Option<PathBuf>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    lr: Option<f64>,
    #[arg(long, value_parser = ["sgd", "nag", "rmsprop", "adam"])]
    optimizer: Option<String>,
    #[arg(long)]
    seed: Option<u64>,
    /// Activation of the bnn / ffbnn models.
    #[arg(long, value_parser = ["sign", "pact", "bipact"])]
    act: Option<String>,
    /// Train on N random images instead of reading `data_dir`.
    #[arg(long)]
    synthetic: Option<usize>,
    /// `checkpoint-<N>.safetensors` to restore; training continues at epoch N + 1.
    #[arg(long)]
    resume: Option<PathBuf>,
}

impl TrainArgs {
    fn apply(&self, config: &mut ExperimentConfig) {
        if let Some(v) = &self.dataset {
            config.dataset = v.clone();
        }
        if let Some(v) = &self.model {
            config.model = v.clone();
        }
        if let Some(v) = &self.data_dir {
            config.data_dir = v.clone();
        }
        if let Some(v) = &self.work_dir {
            config.work_dir = v.clone();
        }
        if let Some(v) = self.epochs {
            config.num_epochs = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.lr {
            config.optimizer.lr = v;
        }
        if let Some(v) = &self.optimizer {
            config.optimizer.name = v.clone();
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if let Some(v) = &self.act {
            config.act = v.clone();
        }
    }
}

// ── Eval / Info ────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct EvalArgs {
    /// Run directory holding `config.json`.
    #[arg(long)]
    work_dir: PathBuf,
    #[arg(long)]
    checkpoint: PathBuf,
    /// Evaluate on N random images instead of the test split.
    #[arg(long)]
    synthetic: Option<usize>,
    #[arg(long, default_value_t = 100)]
    batch_size: usize,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    #[arg(long, default_value = "mnist")]
    dataset: String,
    #[arg(long, default_value = "ttq")]
    model: String,
    #[arg(long)]
    width: Option<usize>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Eval(args) => cmd_eval(args),
        Command::Info(args) => cmd_info(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_train(args: TrainArgs) -> Result<()> {
    let mut config = if args.config.exists() {
        ExperimentConfig::load(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?
    } else {
        let default = ExperimentConfig::default();
        default.save(&args.config)?;
        eprintln!("Created default config at {}", args.config.display());
        default
    };
    args.apply(&mut config);

    let device = Device::cuda_if_available(0)?;
    let mut trainer = Trainer::new(config.clone(), device)?;

    let kind = trainer.model_config().dataset;
    let (train_full, test) = match args.synthetic {
        Some(n) => (
            ImageDataset::synthetic(kind, n, trainer.rng()),
            ImageDataset::synthetic(kind, (n / 5).max(1), trainer.rng()),
        ),
        None => load_splits(kind, &config.data_dir)?,
    };
    let (train, valid) = train_full.split_validation(kind.num_valid());
    eprintln!(
        "{}: {} train / {} valid / {} test",
        kind.name(),
        train.len(),
        valid.len(),
        test.len()
    );

    let steps_per_epoch = train.len() / config.batch_size.max(1);
    let first_epoch = match &args.resume {
        Some(path) => trainer.resume(path, steps_per_epoch)?,
        None => 1,
    };
    let mut metrics = trainer.open_metrics(args.resume.is_some())?;
    if first_epoch > config.num_epochs {
        eprintln!(
            "checkpoint already covers {} of {} epochs; nothing to train",
            first_epoch - 1,
            config.num_epochs
        );
    }

    for epoch in first_epoch..=config.num_epochs {
        let pb = ProgressBar::new(steps_per_epoch as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("epoch {prefix} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}")?
                .progress_chars("=>-"),
        );
        pb.set_prefix(epoch.to_string());

        let train_metrics = trainer.train_epoch(&train, |m| {
            pb.inc(1);
            pb.set_message(format!("loss {:.4} err {}/{}", m.loss, m.batch_errors, m.batch_size));
        })?;
        pb.finish_and_clear();

        let val = trainer.evaluate(&valid, config.batch_size)?;
        writeln!(metrics, "{epoch},{:.6},{:.6}", val.loss, val.accuracy)?;
        trainer.save_checkpoint(epoch)?;
        tracing::info!(
            epoch,
            train_loss = format!("{:.4}", train_metrics.loss),
            train_acc = format!("{:.4}", train_metrics.accuracy),
            val_loss = format!("{:.4}", val.loss),
            val_acc = format!("{:.4}", val.accuracy),
            "epoch done"
        );
    }

    let result = trainer.evaluate(&test, config.batch_size)?;
    eprintln!(
        "test: loss {:.4} accuracy {:.4} ({} errors / {})",
        result.loss, result.accuracy, result.errors, result.samples
    );
    Ok(())
}

fn load_splits(kind: DatasetKind, dir: &Path) -> Result<(ImageDataset, ImageDataset)> {
    let train = ImageDataset::load(kind, dir, true)?;
    let test = ImageDataset::load(kind, dir, false)?;
    Ok((train, test))
}

fn cmd_eval(args: EvalArgs) -> Result<()> {
    let config_path = args.work_dir.join("config.json");
    let config = ExperimentConfig::load(&config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;
    let device = Device::cuda_if_available(0)?;
    let mut trainer = Trainer::new(config.clone(), device)?;
    trainer.load_checkpoint(&args.checkpoint)?;

    let kind = trainer.model_config().dataset;
    let test = match args.synthetic {
        Some(n) => ImageDataset::synthetic(kind, n, trainer.rng()),
        None => ImageDataset::load(kind, &config.data_dir, false)?,
    };
    let result = trainer.evaluate(&test, args.batch_size)?;
    println!(
        "loss {:.4} accuracy {:.4} ({} errors / {})",
        result.loss, result.accuracy, result.errors, result.samples
    );
    Ok(())
}

fn cmd_info(args: InfoArgs) -> Result<()> {
    let config = ExperimentConfig {
        dataset: args.dataset,
        model: args.model,
        width: args.width,
        ..Default::default()
    };
    let model_config = config.model_config()?;
    let varmap = VarMap::new();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let model = Model::new(&model_config, ParamScope::new(&varmap, &Device::Cpu), &mut rng)?;

    println!(
        "{} on {} (width {}, {} constrained layers)",
        model_config.model.name(),
        model_config.dataset.name(),
        model_config.width,
        model.constrain()?
    );
    for group in model.param_groups() {
        let clip = match group.clip {
            Some((lo, hi)) => format!("[{lo}, {hi}]"),
            None => "-".to_string(),
        };
        println!(
            "  {:<28} {:>10} {:?} lr_scale={:.3} clip={clip}",
            group.name,
            group.num_params(),
            group.precision,
            group.lr_scale
        );
    }
    let s = model_summary(&model);
    println!(
        "total {} params ({} ternary, {} binary), {:.2} bits/param, {:.1}x vs f32",
        s.total_params, s.ternary_params, s.binary_params, s.effective_bits_per_param, s.compression_ratio_vs_f32
    );
    Ok(())
}
