// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! A full orchestrated build against this binary running as a local worker.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use attestable_build::archive;
use attestable_build::attestation::Verifier;
use attestable_build::manifest::BuildManifest;
use attestable_build::orchestrator::{self, OrchestratorConfig, WorkerMode};
use attestable_build::readiness::BootPolicy;
use attestable_build::transport::Transport;

const MANIFEST: &str =
    r#"{"language":"c","input":{"cmd":"echo hi > out.txt","env":["GREETING=hi"]},"output":{"files":["out.txt"]}}"#;

#[tokio::test]
async fn test_local_build_saves_artifact() {
    let project = tempfile::tempdir().unwrap();
    fs::write(project.path().join("build.json"), MANIFEST).unwrap();
    fs::write(project.path().join("main.c"), "int main(void) { return 0; }\n").unwrap();
    // A leftover artifact from an earlier run must not be shipped as source.
    fs::write(project.path().join("app.tar"), "stale").unwrap();

    let config = OrchestratorConfig::builder()
        .work_dir(project.path())
        .manifest(BuildManifest::from_json(MANIFEST).unwrap())
        .listen(Transport::parse("tcp://127.0.0.1:0").unwrap())
        .mode(WorkerMode::Local {
            program: PathBuf::from(env!("CARGO_BIN_EXE_attestable-build")),
        })
        .output(project.path().join("app"))
        .nonce(orchestrator::generate_nonce())
        .vendor_image("ata-build-c")
        .boot_policy(BootPolicy {
            initial_probe: Duration::from_millis(100),
            probe_interval: Duration::from_millis(100),
            ..BootPolicy::default()
        })
        .verifier(Verifier::aws_nitro().unwrap())
        .worker_exit_timeout(Duration::from_secs(10))
        .build();

    let summary = tokio::time::timeout(Duration::from_secs(60), orchestrator::run_build(&config))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(summary.artifact, project.path().join("app.tar"));
    assert_eq!(summary.boot_attempts, 1);
    assert!(summary.report_path.is_none());
    assert!(!project.path().join("app.report").exists());
    assert_eq!(archive::list_files(&summary.artifact).unwrap(), vec!["out.txt"]);
}
