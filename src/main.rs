use std::path::PathBuf;

use anyhow::Result;
use burn::backend::{ndarray::NdArrayDevice, wgpu::WgpuDevice, Autodiff, NdArray, Wgpu};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;
use warpctc::{parse_config::CtcJobConfig, runner::run};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendKind {
    Ndarray,
    Wgpu,
}

/// Compute CTC losses and gradients over a synthetic dataset.
#[derive(Parser, Debug)]
#[command(name = "warpctc", version)]
struct Args {
    /// YAML job description with LOSS and JOB sections.
    #[arg(short, long)]
    config: PathBuf,

    #[arg(long, value_enum, default_value_t = BackendKind::Ndarray)]
    backend: BackendKind,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = CtcJobConfig::from_yaml(&args.config)?;

    let summary = match args.backend {
        BackendKind::Ndarray => run::<Autodiff<NdArray>>(NdArrayDevice::Cpu, &config)?,
        BackendKind::Wgpu => run::<Autodiff<Wgpu>>(WgpuDevice::default(), &config)?,
    };

    println!(
        "{} sequences, mean loss {:.5}, {} exact matches",
        summary.sequences, summary.mean_loss, summary.exact_matches
    );

    Ok(())
}
