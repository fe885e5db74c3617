//! Load, rewrite, compare and benchmark a small model.

use candle_core::{DType, Device, Tensor};
use mace_opt_core::bench::{benchmark, prepare_batch, BenchmarkOptions};
use mace_opt_core::data::{diamond, Configuration};
use mace_opt_core::kernels::KernelTiling;
use mace_opt_core::model::{Mace, MaceConfig};
use mace_opt_core::transform::{optimize, optimize_with, OptimizeOptions};

fn config() -> MaceConfig {
    MaceConfig {
        atomic_numbers: vec![1, 6],
        atomic_energies: vec![-13.6, -1029.0],
        r_max: 3.0,
        hidden_channels: 8,
        radial_mlp: vec![16, 16],
        readout_hidden: 8,
        num_interactions: 2,
        ..Default::default()
    }
}

/// First 10 sites of a rattled 2x1x1 diamond supercell, as an isolated
/// cluster with one hydrogen.
fn structure() -> Configuration {
    let mut crystal = diamond(3.567).repeat([2, 1, 1]);
    crystal.rattle(0.05, 11);
    let mut atomic_numbers = crystal.atomic_numbers[..10].to_vec();
    atomic_numbers[9] = 1;
    Configuration::isolated(atomic_numbers, crystal.positions[..10].to_vec()).unwrap()
}

fn max_abs(t: &Tensor) -> f64 {
    t.abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_dtype(DType::F64)
        .unwrap()
        .to_scalar::<f64>()
        .unwrap()
}

#[test]
fn optimized_model_matches_reference_in_f64() {
    let model = Mace::random(config(), DType::F64, &Device::Cpu).unwrap();
    let graph = prepare_batch(&model, &[structure()]).unwrap();
    assert_eq!(graph.num_nodes(), 10);

    let reference = model.forward(&graph, true).unwrap();
    let optimized_model = optimize(model).unwrap();
    let optimized = optimized_model.forward(&graph, true).unwrap();

    assert_eq!(optimized.energy.dims(), &[1]);
    assert_eq!(optimized.node_energy.dims(), &[10]);
    let forces = optimized.forces.unwrap();
    assert_eq!(forces.dims(), &[10, 3]);

    let energy_diff = max_abs(&(reference.energy - &optimized.energy).unwrap());
    let force_diff = max_abs(&(reference.forces.unwrap() - &forces).unwrap());
    assert!(energy_diff < 1e-8, "energy diff {energy_diff}");
    assert!(force_diff < 1e-8, "force diff {force_diff}");
    assert!(max_abs(&forces).is_finite());
}

#[test]
fn optimized_model_matches_reference_in_f32() {
    let model = Mace::random(config(), DType::F32, &Device::Cpu).unwrap();
    let graph = prepare_batch(&model, &[structure()]).unwrap();

    let reference = model.forward(&graph, true).unwrap();
    let tiling = KernelTiling::new(16, 8, 1);
    let optimized_model =
        optimize_with(model, &OptimizeOptions::default().with_tiling(tiling)).unwrap();
    let optimized = optimized_model.forward(&graph, true).unwrap();

    let scale = max_abs(&reference.energy).max(1.0);
    let rel = max_abs(&(reference.energy - optimized.energy).unwrap()) / scale;
    assert!(rel < 1e-4, "relative energy diff {rel}");

    let ref_forces = reference.forces.unwrap();
    let opt_forces = optimized.forces.unwrap();
    let scale = max_abs(&ref_forces).max(1.0);
    let rel = max_abs(&(ref_forces - opt_forces).unwrap()) / scale;
    assert!(rel < 1e-4, "relative force diff {rel}");
}

#[test]
fn rewritten_model_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let original = dir.path().join("model.safetensors");
    let rewritten = dir.path().join("optimized_model.safetensors");

    Mace::random(config(), DType::F32, &Device::Cpu)
        .unwrap()
        .save(&original)
        .unwrap();
    let model = Mace::load(&original, &Device::Cpu).unwrap();
    let optimized = optimize(model).unwrap();
    optimized.save(&rewritten).unwrap();

    let loaded = Mace::load(&rewritten, &Device::Cpu).unwrap();
    assert!(loaded.is_accelerated());
    assert_eq!(loaded.parameters().len(), optimized.parameters().len());
}

#[test]
fn both_models_benchmark() {
    let model = Mace::random(config(), DType::F32, &Device::Cpu).unwrap();
    let structures = [structure(), diamond(3.567)];
    let graph = prepare_batch(&model, &structures).unwrap();
    let options = BenchmarkOptions {
        warmup: 1,
        repetitions: 2,
    };

    let optimized = optimize(model.clone()).unwrap();
    let opt = benchmark(&optimized, &graph, "opt", &options).unwrap();
    let orig = benchmark(&model, &graph, "orig", &options).unwrap();
    assert_eq!(opt.num_atoms, 10);
    assert_eq!(orig.num_edges, opt.num_edges);
}
