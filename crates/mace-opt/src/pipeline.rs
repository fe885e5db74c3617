//! The optimize-and-benchmark run.

use anyhow::{bail, Context, Result};
use candle_core::Device;
use mace_opt_core::bench::{
    benchmark, load_structures, prepare_batch, BenchmarkOptions, BenchmarkReport,
};
use mace_opt_core::kernels::KernelTiling;
use mace_opt_core::model::{Mace, Precision};
use mace_opt_core::transform::{optimize_with, OptimizeOptions};
use std::path::{Path, PathBuf};

/// Default file name of the rewritten model.
pub const DEFAULT_OUTPUT: &str = "optimized_model.safetensors";

/// Configuration of one run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Path to the trained model.
    pub model_path: PathBuf,
    /// File name of the rewritten model, placed next to the input.
    pub output: PathBuf,
    /// Working precision.
    pub precision: Precision,
    /// Device to run on.
    pub device: Device,
    /// Benchmark both models after the rewrite.
    pub benchmark: bool,
    /// Extended XYZ file with benchmark structures.
    pub benchmark_file: Option<PathBuf>,
    /// Timing parameters.
    pub bench: BenchmarkOptions,
    /// Contraction tiling.
    pub tiling: KernelTiling,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            output: PathBuf::from(DEFAULT_OUTPUT),
            precision: Precision::Float32,
            device: Device::Cpu,
            benchmark: false,
            benchmark_file: None,
            bench: BenchmarkOptions::default(),
            tiling: KernelTiling::default(),
        }
    }
}

impl PipelineConfig {
    /// `<model dir>/<output>`.
    pub fn output_path(&self) -> PathBuf {
        let dir = self.model_path.parent().unwrap_or_else(|| Path::new(""));
        dir.join(&self.output)
    }
}

/// Builder for a [`Pipeline`].
pub struct PipelineBuilder {
    config: PipelineConfig,
}

impl PipelineBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
        }
    }

    /// Set model path.
    pub fn model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.model_path = path.into();
        self
    }

    /// Set output file name.
    pub fn output(mut self, output: impl Into<PathBuf>) -> Self {
        self.config.output = output.into();
        self
    }

    /// Set working precision.
    pub fn precision(mut self, precision: Precision) -> Self {
        self.config.precision = precision;
        self
    }

    /// Set device.
    pub fn device(mut self, device: Device) -> Self {
        self.config.device = device;
        self
    }

    /// Enable benchmarking.
    pub fn benchmark(mut self, enabled: bool) -> Self {
        self.config.benchmark = enabled;
        self
    }

    /// Set benchmark structure file.
    pub fn benchmark_file(mut self, path: Option<PathBuf>) -> Self {
        self.config.benchmark_file = path;
        self
    }

    /// Set number of timed passes.
    pub fn repetitions(mut self, repetitions: usize) -> Self {
        self.config.bench.repetitions = repetitions;
        self
    }

    /// Set number of untimed warm-up passes.
    pub fn warmup(mut self, warmup: usize) -> Self {
        self.config.bench.warmup = warmup;
        self
    }

    /// Set contraction tiling.
    pub fn tiling(mut self, tiling: KernelTiling) -> Self {
        self.config.tiling = tiling;
        self
    }

    /// Build the pipeline.
    pub fn build(self) -> Pipeline {
        Pipeline {
            config: self.config,
        }
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a run.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    /// Where the rewritten model was saved.
    pub output_path: PathBuf,
    /// Benchmark of the rewritten model.
    pub optimized: Option<BenchmarkReport>,
    /// Benchmark of the original model.
    pub original: Option<BenchmarkReport>,
}

/// Load, rewrite, save and optionally benchmark a model.
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    /// Create a new pipeline builder.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Get pipeline configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn load_model(&self) -> Result<Mace> {
        let path = &self.config.model_path;
        let model = Mace::load(path, &self.config.device)
            .with_context(|| format!("failed to load model from {}", path.display()))?;
        Ok(model.to_dtype(self.config.precision.dtype())?)
    }

    /// Execute the run.
    pub fn run(&self) -> Result<PipelineOutcome> {
        let config = &self.config;
        if config.model_path.as_os_str().is_empty() {
            bail!("no model path given");
        }

        let model = self.load_model()?;
        tracing::info!(
            model = %config.model_path.display(),
            precision = %config.precision,
            layers = model.num_interactions(),
            "loaded model"
        );

        let options = OptimizeOptions::default().with_tiling(config.tiling);
        let optimized = optimize_with(model, &options).context("failed to optimize model")?;

        let output_path = config.output_path();
        optimized
            .save(&output_path)
            .with_context(|| format!("failed to save model to {}", output_path.display()))?;

        let mut outcome = PipelineOutcome {
            output_path,
            optimized: None,
            original: None,
        };
        if !config.benchmark {
            return Ok(outcome);
        }

        let structures = load_structures(config.benchmark_file.as_deref());
        let graph = prepare_batch(&optimized, &structures)?;
        let report = benchmark(&optimized, &graph, "opt", &config.bench)?;
        outcome.optimized = Some(report);
        drop(optimized);

        let original = self.load_model()?;
        let report = benchmark(&original, &graph, "orig", &config.bench)?;
        outcome.original = Some(report);
        Ok(outcome)
    }
}

/// Parse `cpu`, `cuda` or `cuda:N`.
pub fn parse_device(name: &str) -> Result<Device> {
    match name {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(0).context("failed to open CUDA device 0"),
        other => match other.strip_prefix("cuda:") {
            Some(ordinal) => {
                let ordinal: usize = ordinal
                    .parse()
                    .with_context(|| format!("invalid CUDA ordinal `{ordinal}`"))?;
                Device::new_cuda(ordinal)
                    .with_context(|| format!("failed to open CUDA device {ordinal}"))
            }
            None => bail!("unknown device `{other}` (expected cpu, cuda or cuda:N)"),
        },
    }
}
