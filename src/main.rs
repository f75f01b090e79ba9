use std::path::PathBuf;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use bitmap_fea::{config::SimulationConfig, error::FeaError, run_sample, SampleRequest};

/// Generates the hyperelastic response dataset entry for one bitmap.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Row of the dataset file to simulate
    index: usize,

    /// 1 for the training file, 0 for the test file
    #[arg(value_parser = clap::value_parser!(u8).range(0..=1))]
    is_train: u8,

    /// Mesh divisions per side of the domain
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    mesh_size: u64,

    /// Directory holding mnist_img_train.txt and mnist_img_test.txt
    #[arg(long, default_value = "../sample_data")]
    input_dir: PathBuf,

    /// Directory the run folder is written into
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// JSON file overriding the default simulation constants
    #[arg(long)]
    config: Option<PathBuf>,

    /// Debug logging (Newton iterations, reactions)
    #[arg(short, long)]
    verbose: bool,

    /// Log every conjugate gradient iteration
    #[arg(long)]
    trace_linear: bool,
}

fn run(cli: &Cli) -> Result<PathBuf, FeaError> {
    let config = match &cli.config {
        Some(path) => SimulationConfig::from_json_file(path)?,
        None => SimulationConfig::default(),
    };

    let request = SampleRequest {
        index: cli.index,
        is_train: cli.is_train == 1,
        mesh_divisions: cli.mesh_size as usize,
        input_dir: cli.input_dir.clone(),
        output_dir: cli.output_dir.clone(),
    };

    run_sample(&config, &request, cli.trace_linear)
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(err) = run(&cli) {
        error!("{err}");
        std::process::exit(err.exit_code());
    }
}
