//! Command-line arguments.

use crate::pipeline::{parse_device, Pipeline, PipelineBuilder, DEFAULT_OUTPUT};
use anyhow::Result;
use clap::Parser;
use mace_opt_core::kernels::KernelTiling;
use mace_opt_core::model::Precision;
use std::path::PathBuf;

/// Optimize a MACE model for accelerated inference
#[derive(Parser, Debug, Clone)]
#[command(name = "mace-opt")]
#[command(about = "Rewrite a MACE model with fused kernels and optionally benchmark it")]
#[command(version)]
pub struct Args {
    /// Path to the trained model (.safetensors)
    #[arg(long)]
    pub model: PathBuf,

    /// File name of the optimized model, written next to the input model
    #[arg(long, default_value = DEFAULT_OUTPUT)]
    pub output: PathBuf,

    /// Working precision
    #[arg(long, default_value = "float32", value_parser = parse_precision)]
    pub dtype: Precision,

    /// Benchmark the optimized and the original model
    #[arg(long)]
    pub benchmark: bool,

    /// Extended XYZ file with benchmark structures
    ///
    /// Falls back to a 10x10x10 diamond crystal when missing or unreadable
    #[arg(long)]
    pub benchmark_file: Option<PathBuf>,

    /// Device: cpu, cuda or cuda:N
    #[arg(long, default_value = "cpu")]
    pub device: String,

    /// Timed passes per benchmarked model
    #[arg(long, default_value_t = 500)]
    pub repetitions: usize,

    /// Untimed warm-up passes per benchmarked model
    #[arg(long, default_value_t = 3)]
    pub warmup: usize,

    /// Contraction tiling as XxYxZ
    #[arg(long, default_value = "32x4x1", value_parser = parse_tiling)]
    pub tiling: KernelTiling,
}

fn parse_precision(s: &str) -> std::result::Result<Precision, String> {
    s.parse().map_err(|e: mace_opt_core::MaceOptError| e.to_string())
}

fn parse_tiling(s: &str) -> std::result::Result<KernelTiling, String> {
    let dims = s
        .split('x')
        .map(str::parse::<u32>)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| format!("invalid tiling `{s}`: {e}"))?;
    match dims.as_slice() {
        [x, y, z] if *x > 0 && *y > 0 && *z > 0 => Ok(KernelTiling::new(*x, *y, *z)),
        _ => Err(format!("tiling `{s}` must be three positive sizes XxYxZ")),
    }
}

impl Args {
    /// Pipeline described by these arguments.
    pub fn into_pipeline(self) -> Result<Pipeline> {
        Ok(PipelineBuilder::new()
            .model_path(self.model)
            .output(self.output)
            .precision(self.dtype)
            .device(parse_device(&self.device)?)
            .benchmark(self.benchmark)
            .benchmark_file(self.benchmark_file)
            .repetitions(self.repetitions)
            .warmup(self.warmup)
            .tiling(self.tiling)
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["mace-opt", "--model", "m.safetensors"]).unwrap();
        assert_eq!(args.output, PathBuf::from("optimized_model.safetensors"));
        assert_eq!(args.dtype, Precision::Float32);
        assert!(!args.benchmark);
        assert_eq!(args.repetitions, 500);
        assert_eq!(args.tiling, KernelTiling::default());

        let pipeline = args.into_pipeline().unwrap();
        assert_eq!(pipeline.config().bench.repetitions, 500);
    }

    #[test]
    fn all_flags() {
        let args = Args::try_parse_from([
            "mace-opt",
            "--model",
            "runs/m.safetensors",
            "--output",
            "fast.safetensors",
            "--dtype",
            "float64",
            "--benchmark",
            "--benchmark-file",
            "bench.xyz",
            "--repetitions",
            "10",
            "--tiling",
            "16x8x2",
        ])
        .unwrap();
        assert_eq!(args.dtype, Precision::Float64);
        assert!(args.benchmark);
        assert_eq!(args.benchmark_file, Some(PathBuf::from("bench.xyz")));
        assert_eq!(args.tiling, KernelTiling::new(16, 8, 2));

        let pipeline = args.into_pipeline().unwrap();
        assert_eq!(
            pipeline.config().output_path(),
            PathBuf::from("runs/fast.safetensors")
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(Args::try_parse_from(["mace-opt"]).is_err());
        assert!(
            Args::try_parse_from(["mace-opt", "--model", "m", "--dtype", "float16"]).is_err()
        );
        assert!(Args::try_parse_from(["mace-opt", "--model", "m", "--tiling", "32x4"]).is_err());
        let args = Args::try_parse_from(["mace-opt", "--model", "m", "--device", "npu"]).unwrap();
        assert!(args.into_pipeline().is_err());
    }
}
