//! Benchmark harness.
//!
//! Times full `forward(compute_force = true)` passes of a model on one
//! structure, synchronizing the device around every pass so asynchronous
//! accelerator work is counted.

use crate::data::{diamond, read_extxyz, AtomicGraph, AtomicNumberTable, Configuration};
use crate::error::Result;
use crate::model::Mace;
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

/// Lattice constant of the fallback diamond crystal in Angstrom.
pub const FALLBACK_LATTICE_CONSTANT: f64 = 3.567;

/// Repetitions of the fallback cubic cell along each axis.
pub const FALLBACK_REPEAT: [usize; 3] = [10, 10, 10];

/// Timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchmarkOptions {
    /// Untimed passes before measuring.
    pub warmup: usize,
    /// Timed passes.
    pub repetitions: usize,
}

impl Default for BenchmarkOptions {
    fn default() -> Self {
        Self {
            warmup: 3,
            repetitions: 500,
        }
    }
}

/// Timing summary of one model on one graph.
#[derive(Debug, Clone)]
pub struct BenchmarkReport {
    /// Name the run is reported under.
    pub label: String,
    /// Atoms in the graph.
    pub num_atoms: usize,
    /// Edges in the graph.
    pub num_edges: usize,
    /// Timed passes.
    pub repetitions: usize,
    /// Mean pass time.
    pub mean: Duration,
    /// Median pass time.
    pub median: Duration,
    /// Fastest pass.
    pub min: Duration,
    /// Slowest pass.
    pub max: Duration,
}

impl BenchmarkReport {
    fn from_samples(label: &str, graph: &AtomicGraph, mut samples: Vec<Duration>) -> Self {
        samples.sort_unstable();
        let n = samples.len();
        let total: Duration = samples.iter().sum();
        let median = match n {
            0 => Duration::ZERO,
            _ if n % 2 == 1 => samples[n / 2],
            _ => (samples[n / 2 - 1] + samples[n / 2]) / 2,
        };
        Self {
            label: label.to_string(),
            num_atoms: graph.num_nodes(),
            num_edges: graph.num_edges(),
            repetitions: n,
            mean: if n == 0 { Duration::ZERO } else { total / n as u32 },
            median,
            min: samples.first().copied().unwrap_or_default(),
            max: samples.last().copied().unwrap_or_default(),
        }
    }
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} atoms, {} edges, {} runs: mean {:.3?}, median {:.3?}, min {:.3?}, max {:.3?}",
            self.label,
            self.num_atoms,
            self.num_edges,
            self.repetitions,
            self.mean,
            self.median,
            self.min,
            self.max
        )
    }
}

/// Structures from `path`, or the fallback diamond crystal when the file is
/// missing or unreadable.
pub fn load_structures(path: Option<&Path>) -> Vec<Configuration> {
    if let Some(path) = path {
        match read_extxyz(path) {
            Ok(frames) if !frames.is_empty() => return frames,
            Ok(_) => tracing::warn!(path = %path.display(), "benchmark file has no frames"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not read benchmark file"),
        }
    }
    let crystal = diamond(FALLBACK_LATTICE_CONSTANT).repeat(FALLBACK_REPEAT);
    tracing::warn!(atoms = crystal.len(), "benchmarking on synthetic diamond crystal");
    vec![crystal]
}

/// Graph of the first structure, built for `model`.
pub fn prepare_batch(model: &Mace, structures: &[Configuration]) -> Result<AtomicGraph> {
    let config = model.config();
    let table = AtomicNumberTable::new(config.atomic_numbers.clone());
    let graph = AtomicGraph::from_configurations(
        &structures[..structures.len().min(1)],
        &table,
        config.r_max,
        model.device(),
    )?;
    tracing::info!(
        atoms = graph.num_nodes(),
        edges = graph.num_edges(),
        "prepared benchmark batch"
    );
    Ok(graph)
}

/// Time `options.repetitions` energy-and-force passes of `model`.
pub fn benchmark(
    model: &Mace,
    graph: &AtomicGraph,
    label: &str,
    options: &BenchmarkOptions,
) -> Result<BenchmarkReport> {
    let device = model.device();
    for _ in 0..options.warmup {
        model.forward(graph, true)?;
    }
    device.synchronize()?;

    let mut samples = Vec::with_capacity(options.repetitions);
    for _ in 0..options.repetitions {
        let start = Instant::now();
        model.forward(graph, true)?;
        device.synchronize()?;
        samples.push(start.elapsed());
    }

    let report = BenchmarkReport::from_samples(label, graph, samples);
    tracing::info!(
        label,
        mean_us = report.mean.as_micros() as u64,
        median_us = report.median.as_micros() as u64,
        "benchmark finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MaceConfig;
    use candle_core::{DType, Device};
    use std::io::Write;

    fn small_model() -> Mace {
        let config = MaceConfig {
            atomic_numbers: vec![6],
            atomic_energies: vec![-1.0],
            r_max: 2.0,
            hidden_channels: 4,
            radial_mlp: vec![8],
            readout_hidden: 4,
            ..Default::default()
        };
        Mace::random(config, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn missing_file_falls_back_to_diamond() {
        let structures = load_structures(Some(Path::new("/nonexistent/bench.xyz")));
        assert_eq!(structures.len(), 1);
        assert_eq!(structures[0].len(), 8000);
    }

    #[test]
    fn reads_benchmark_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "2\nProperties=species:S:1:pos:R:3\nC 0 0 0\nC 0 0 1.5").unwrap();
        let structures = load_structures(Some(file.path()));
        assert_eq!(structures[0].len(), 2);
    }

    #[test]
    fn report_statistics() {
        let model = small_model();
        let graph = prepare_batch(&model, &[diamond(3.567)]).unwrap();
        let samples = [4, 1, 3, 2].map(Duration::from_millis).to_vec();
        let report = BenchmarkReport::from_samples("ref", &graph, samples);
        assert_eq!(report.min, Duration::from_millis(1));
        assert_eq!(report.max, Duration::from_millis(4));
        assert_eq!(report.median, Duration::from_micros(2500));
        assert_eq!(report.mean, Duration::from_micros(2500));
        assert!(report.to_string().starts_with("ref: 8 atoms"));
    }

    #[test]
    fn benchmark_runs() {
        let model = small_model();
        let graph = prepare_batch(&model, &[diamond(3.567), diamond(3.0)]).unwrap();
        assert_eq!(graph.num_graphs(), 1);
        let options = BenchmarkOptions {
            warmup: 1,
            repetitions: 3,
        };
        let report = benchmark(&model, &graph, "reference", &options).unwrap();
        assert_eq!(report.repetitions, 3);
        assert!(report.min <= report.median && report.median <= report.max);
    }
}
