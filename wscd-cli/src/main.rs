//! WSCD CLI: train, evaluate and inspect weakly supervised cloud detection runs.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use wscd_core::{ConfigOverrides, DatasetKind, DeviceSpec, ModelVariant};

/// WSCD: weakly supervised cloud detection trainer
#[derive(Parser, Debug)]
#[command(name = "wscd", version, about, long_about = None)]
struct Cli {
    /// Working directory (searched for wscd.toml)
    #[arg(short, long, default_value = ".")]
    workdir: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors to stderr
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train a model, or score a checkpoint with --test-only
    Train(TrainArgs),
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List the checkpoints written for a model
    Checkpoints {
        /// Model variant whose save directory is listed
        #[arg(short, long)]
        model: Option<ModelVariant>,

        /// Print the manifest as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default wscd.toml into the working directory
    Init,
    /// Print the resolved configuration
    Show,
}

/// Per-run overrides, applied over file and environment settings.
#[derive(clap::Args, Debug, Default)]
struct TrainArgs {
    /// Dataset identity: gf1, landsat or WDCD
    #[arg(long)]
    dataset: Option<DatasetKind>,

    /// Training data root
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Validation data root (landsat and WDCD)
    #[arg(long)]
    val_data_root: Option<PathBuf>,

    /// Pseudo label root
    #[arg(long)]
    pseudo_label_root: Option<PathBuf>,

    /// Checkpoint output directory
    #[arg(long)]
    save_dir: Option<PathBuf>,

    /// Model variant, e.g. mResNet34_PHA_DBRM
    #[arg(short, long)]
    model: Option<ModelVariant>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Iteration budget
    #[arg(long)]
    total_itrs: Option<usize>,

    /// Base learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Checkpoint to restore before training
    #[arg(long)]
    ckpt: Option<PathBuf>,

    /// Also restore optimizer and scheduler state from --ckpt
    #[arg(long)]
    continue_training: bool,

    /// Restore --ckpt and run one validation pass
    #[arg(long)]
    test_only: bool,

    #[arg(long)]
    random_seed: Option<u64>,

    /// cpu or cuda:<ordinal>
    #[arg(long)]
    device: Option<DeviceSpec>,
}

impl TrainArgs {
    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            dataset: self.dataset,
            data_root: self.data_root,
            val_data_root: self.val_data_root,
            pseudo_label_root: self.pseudo_label_root,
            save_dir: self.save_dir,
            model: self.model,
            batch_size: self.batch_size,
            total_itrs: self.total_itrs,
            lr: self.lr,
            ckpt: self.ckpt,
            continue_training: self.continue_training.then_some(true),
            test_only: self.test_only.then_some(true),
            random_seed: self.random_seed,
            device: self.device,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        _ if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "wscd", "wscd")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "wscd.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workdir = cli
        .workdir
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workdir, cli.config.as_deref())
}
