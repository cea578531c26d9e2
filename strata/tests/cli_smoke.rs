use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use strata_bytecode::fixtures::layout_table;
use strata_mir::fixtures;

fn scratch_dir(tag: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let dir = std::env::temp_dir().join(format!("strata-{tag}-{}-{ts}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Fixture program and its layout table, written next to each other.
fn inputs(dir: &Path) -> (PathBuf, PathBuf) {
    let program = dir.join("program.json");
    let layout = dir.join("layout.json");
    std::fs::write(&program, fixtures::program().to_json().expect("program json")).expect("write program");
    std::fs::write(
        &layout,
        serde_json::to_string(&layout_table()).expect("layout json"),
    )
    .expect("write layout");
    (program, layout)
}

fn strata(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_strata"))
        .args(args)
        .current_dir(dir)
        .env_remove("STRATA_LOG")
        .output()
        .expect("spawn strata")
}

fn path_arg(p: &Path) -> &str {
    p.to_str().expect("temp path must be UTF-8")
}

#[test]
fn check_accepts_the_fixture_program() {
    let dir = scratch_dir("check");
    let (program, _) = inputs(&dir);

    let out = strata(&dir, &["check", path_arg(&program)]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8_lossy(&out.stdout).contains(": ok ("));
}

#[test]
fn lower_writes_an_assembly() {
    let dir = scratch_dir("lower");
    let (program, layout) = inputs(&dir);
    let target = dir.join("out.json");

    let out = strata(
        &dir,
        &["lower", path_arg(&program), "--layout", path_arg(&layout), "-o", path_arg(&target)],
    );
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let text = std::fs::read_to_string(&target).expect("output written");
    let asm: serde_json::Value = serde_json::from_str(&text).expect("valid json");
    assert!(asm["functions"]["Main::id"].is_object());
    assert_eq!(asm["const_pool"]["entries"][0]["value"], "none");
}

#[test]
fn api_reports_requested_entrypoints() {
    let dir = scratch_dir("api");
    let (program, _) = inputs(&dir);

    let out = strata(&dir, &["api", path_arg(&program), "--entry", "Main::id"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let manifest: serde_json::Value = serde_json::from_slice(&out.stdout).expect("valid json");
    assert_eq!(manifest["apisig"][0]["name"], "Main::id");
    assert!(manifest["apitypes"].as_array().is_some_and(|a| !a.is_empty()));
}

#[test]
fn config_entrypoints_apply_without_flags() {
    let dir = scratch_dir("api-config");
    let (program, _) = inputs(&dir);
    std::fs::write(dir.join("strata.toml"), "[api]\nentrypoints = [\"Main::id\"]\n").expect("write config");

    let out = strata(&dir, &["api", path_arg(&program)]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let manifest: serde_json::Value = serde_json::from_slice(&out.stdout).expect("valid json");
    assert_eq!(manifest["apisig"].as_array().map(Vec::len), Some(1));
}

#[test]
fn broken_config_fails_with_a_diagnostic() {
    let dir = scratch_dir("bad-config");
    let (program, _) = inputs(&dir);
    std::fs::write(dir.join("strata.toml"), "[lower]\nmax_specialization_rounds = \"many\"\n")
        .expect("write config");

    let out = strata(&dir, &["check", path_arg(&program)]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("strata.toml"));
}

#[test]
fn unknown_entrypoints_are_errors() {
    let dir = scratch_dir("api-missing");
    let (program, _) = inputs(&dir);

    let out = strata(&dir, &["api", path_arg(&program), "--entry", "Main::nope"]);
    assert!(!out.status.success());
}
