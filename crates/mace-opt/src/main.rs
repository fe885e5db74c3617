//! MACE model optimizer
//!
//! Rewrites a trained MACE model with fused inference kernels, saves it next
//! to the input and optionally benchmarks it against the original.
//!
//! # Usage
//!
//! ```bash
//! # Optimize, keeping f32
//! mace-opt --model runs/mace.safetensors
//!
//! # Optimize in f64 and benchmark both models on a trajectory
//! mace-opt --model runs/mace.safetensors --dtype float64 \
//!          --benchmark --benchmark-file structures.xyz
//! ```

use anyhow::Result;
use clap::Parser;
use mace_opt::cli::Args;

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    let outcome = args.into_pipeline()?.run()?;

    println!("Optimized model saved to {}", outcome.output_path.display());
    for report in [&outcome.optimized, &outcome.original].into_iter().flatten() {
        println!("{report}");
    }
    Ok(())
}
