use simpost_core::domain::Volume;
use simpost_core::modules::storage::{RawVolumeStore, VolumeStore};
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn simpost(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_simpost"))
        .arg("--dir")
        .arg(dir)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("simpost should run")
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn write_completed_seed(dir: &Path, run: &str, window: u8, value: f32) {
    RawVolumeStore
        .write(
            &Volume::filled(vec![2, 8, 8], value),
            &dir.join(format!("{}.w{:02}.im", run, window)),
        )
        .expect("seed image");
    fs::write(dir.join(format!("{}.res", run)), "done\n").expect("result file");
}

fn seeded_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("simpost.json");
    fs::write(&path, r#"{ "tools": { "noiseSeed": 7 } }"#).expect("config");
    path
}

#[test]
fn pipeline_command_averages_combines_and_postprocesses() {
    let temp = TempDir::new().expect("tempdir should be created");
    let dir = temp.path();
    for seed in 1..=2 {
        write_completed_seed(dir, &format!("sim_Tc99m_liver_{}", seed), 1, 2.0);
        write_completed_seed(dir, &format!("sim_Tc99m_lung_{}", seed), 1, 1.0);
    }
    let config = seeded_config(dir);

    let output = simpost(
        dir,
        &[
            "--config",
            config.to_str().expect("utf-8 path"),
            "pipeline",
            "--activity",
            "2",
            "--frame-duration",
            "10",
        ],
    );

    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    let summary = stdout(&output);
    assert!(summary.contains("AVERAGE status: OK"));
    assert!(summary.contains("COMBINE status: OK"));
    assert!(summary.contains("POSTPROCESS status: OK"));

    let combined = RawVolumeStore
        .read(&dir.join("combined.w01.avg.im"))
        .expect("combined");
    assert!(combined.data().iter().all(|value| *value == 3.0));
    let noise_free = RawVolumeStore
        .read(&dir.join("prj.nf.avg.w01.im"))
        .expect("noise free");
    assert!(noise_free.data().iter().all(|value| *value == 60.0));
    assert!(dir.join("prj.n.avg.w01.im").is_file());
}

#[test]
fn existing_outputs_collide_in_fresh_run_mode() {
    let temp = TempDir::new().expect("tempdir should be created");
    let dir = temp.path();
    for seed in 1..=2 {
        write_completed_seed(dir, &format!("sim_Tc99m_liver_{}", seed), 1, 2.0);
    }

    let first = simpost(dir, &["average"]);
    assert_eq!(first.status.code(), Some(0), "stderr: {}", stderr(&first));

    let second = simpost(dir, &["--require-fresh", "average"]);
    assert_eq!(second.status.code(), Some(3));
    let diagnostics = stderr(&second);
    assert!(diagnostics.contains("ERROR: [OUTPUT.EXISTS]"), "{}", diagnostics);
    assert!(diagnostics.contains("FATAL EXIT CODE: 3"));
}

#[test]
fn empty_directory_is_a_configuration_error() {
    let temp = TempDir::new().expect("tempdir should be created");
    let output = simpost(temp.path(), &["combine"]);

    assert_eq!(output.status.code(), Some(2));
    let diagnostics = stderr(&output);
    assert!(diagnostics.contains("ERROR: [CONFIG.NO_INPUTS]"));
    assert!(diagnostics.contains("FATAL EXIT CODE: 2"));
}

#[test]
fn missing_scale_arguments_are_a_usage_error() {
    let temp = TempDir::new().expect("tempdir should be created");
    let output = simpost(temp.path(), &["postprocess"]);

    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("ERROR: [CONFIG.CLI_USAGE]"));
}

#[test]
fn abandoned_group_exits_with_one() {
    let temp = TempDir::new().expect("tempdir should be created");
    let dir = temp.path();
    RawVolumeStore
        .write(&Volume::filled(vec![2, 8, 8], 1.0), &dir.join("sim_Tc99m_liver.w01.avg.im"))
        .expect("window 1");
    RawVolumeStore
        .write(&Volume::filled(vec![2, 8, 8], 1.0), &dir.join("sim_Tc99m_liver.w03.avg.im"))
        .expect("window 3");

    let output = simpost(dir, &["combine"]);
    assert_eq!(output.status.code(), Some(1));
    let summary = stdout(&output);
    assert!(summary.contains("COMBINE status: INCOMPLETE"));
    assert!(summary.contains("w02: abandoned ERROR: [GROUP.MISSING_INPUT]"));
    assert!(dir.join("combined.w01.avg.im").is_file());
    assert!(dir.join("combined.w03.avg.im").is_file());
}

#[test]
fn validate_reports_every_problem() {
    let temp = TempDir::new().expect("tempdir should be created");
    let dir = temp.path();
    RawVolumeStore
        .write(&Volume::filled(vec![2, 4, 4], 1000.0), &dir.join("phantom_dens.im"))
        .expect("density map");
    RawVolumeStore
        .write(&Volume::filled(vec![2, 4, 4], -1.0), &dir.join("liver.im"))
        .expect("object");

    let output = simpost(
        dir,
        &["validate", "--density-map", "phantom_dens", "liver.im", "liver.im"],
    );
    assert_eq!(output.status.code(), Some(2));
    let diagnostics = stderr(&output);
    assert!(diagnostics.contains("ERROR: [CONFIG.PREFLIGHT]"));
    assert!(diagnostics.contains("negative values"));
    assert!(diagnostics.contains("listed more than once"));
}

#[test]
fn runs_command_removes_stale_logs() {
    let temp = TempDir::new().expect("tempdir should be created");
    let dir = temp.path();
    for name in ["sim_a_1.log", "sim_a_1.res", "sim_a_2.log"] {
        fs::write(dir.join(name), "x").expect("fixture");
    }

    let output = simpost(dir, &["runs", "--remove-stale"]);
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    let summary = stdout(&output);
    assert!(summary.contains("runs: 1 complete, 1 stale"));
    assert!(summary.contains("removed 1 stale run log(s)"));
    assert!(!dir.join("sim_a_2.log").exists());
    assert!(dir.join("sim_a_1.log").exists());
}
