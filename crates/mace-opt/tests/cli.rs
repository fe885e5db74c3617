//! Runs the `mace-opt` binary on a small saved model.

use candle_core::{DType, Device};
use mace_opt::model::{Mace, MaceConfig};
use std::path::Path;
use std::process::Command;

fn save_model(path: &Path) {
    let config = MaceConfig {
        atomic_numbers: vec![1, 6],
        atomic_energies: vec![-0.5, -1.0],
        r_max: 2.0,
        hidden_channels: 4,
        radial_mlp: vec![8],
        readout_hidden: 4,
        ..Default::default()
    };
    Mace::random(config, DType::F32, &Device::Cpu)
        .unwrap()
        .save(path)
        .unwrap();
}

fn mace_opt() -> Command {
    Command::new(env!("CARGO_BIN_EXE_mace-opt"))
}

#[test]
fn writes_optimized_model_next_to_input() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("model.safetensors");
    save_model(&model);

    let output = mace_opt()
        .args(["--model", model.to_str().unwrap(), "--dtype", "float64"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let optimized =
        Mace::load(&dir.path().join("optimized_model.safetensors"), &Device::Cpu).unwrap();
    assert!(optimized.is_accelerated());
    assert_eq!(optimized.dtype(), DType::F64);
}

#[test]
fn benchmark_with_unreadable_file_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("model.safetensors");
    save_model(&model);
    let bogus = dir.path().join("broken.xyz");
    std::fs::write(&bogus, "not an xyz file\n").unwrap();

    let output = mace_opt()
        .args([
            "--model",
            model.to_str().unwrap(),
            "--output",
            "fast.safetensors",
            "--benchmark",
            "--benchmark-file",
            bogus.to_str().unwrap(),
            "--repetitions",
            "1",
            "--warmup",
            "0",
        ])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("opt: 8000 atoms"), "{stdout}");
    assert!(stdout.contains("orig: 8000 atoms"), "{stdout}");
    assert!(dir.path().join("fast.safetensors").exists());
}

#[test]
fn missing_model_fails() {
    let output = mace_opt()
        .args(["--model", "/nonexistent/model.safetensors"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to load model"));
}
