//! End-to-end upgrade runs against a scripted runtime.

use std::fs;
use std::path::PathBuf;

use pgshift_core::models::suffixed_path;
use pgshift_core::{UpgradeStatus, VersionPair};
use pgshift_runtime::BindSpec;
use pgshift_test_helpers::{
    DataDirFixture, FakeRuntime, HELPER_CONTAINER_ID, RecordingExecutor, RuntimeCall,
    TEST_CONTAINER_ID,
};
use pgshift_upgrade::{Orchestrator, StaticProbe, UpgradeOutcome, ledger};

fn probe() -> StaticProbe {
    StaticProbe(TEST_CONTAINER_ID.to_string())
}

fn pair() -> VersionPair {
    VersionPair::new("9.6", "11")
}

#[test]
fn equal_versions_are_a_no_op() {
    let fixture = DataDirFixture::with_version("11");
    let config = fixture.config("11");
    let runtime = fixture.runtime();
    let executor = RecordingExecutor::new();
    let probe = probe();

    let outcome = Orchestrator::new(&config, &runtime, &executor, &probe)
        .run()
        .expect("run");

    assert_eq!(
        outcome,
        UpgradeOutcome::UpToDate {
            version: "11".into()
        }
    );
    assert!(runtime.calls().is_empty(), "{:?}", runtime.calls());
    assert!(executor.plans().is_empty());
    assert!(
        ledger::discover_all(&fixture.data_dir())
            .expect("discover")
            .is_empty(),
        "no ledger is written for a no-op"
    );
}

#[test]
fn successful_upgrade_swaps_clusters_and_records_done() {
    let fixture = DataDirFixture::with_version("9.6");
    let config = fixture.config("11");
    let runtime = fixture
        .runtime()
        .on_start(fixture.helper_creates_cluster("11"));
    let executor = RecordingExecutor::new();
    let probe = probe();

    let outcome = Orchestrator::new(&config, &runtime, &executor, &probe)
        .run()
        .expect("upgrade");
    assert_eq!(
        outcome,
        UpgradeOutcome::Upgraded {
            from: "9.6".into(),
            to: "11".into()
        }
    );

    let spec = runtime.created_spec().expect("helper container created");
    assert_eq!(spec.image, "helper-image:9.6-to-11");
    assert_eq!(spec.working_dir, PathBuf::from("/workspace"));
    assert_eq!(
        spec.binds,
        vec![
            BindSpec::new("/host/data/.9.6-to-11-upgrade", "/workspace"),
            BindSpec::new("/host/data/postgresql", "/var/lib/db/9.6/data"),
            BindSpec::new("/host/data/postgresql-11", "/var/lib/db/11/data"),
        ]
    );

    let calls = runtime.calls();
    assert_eq!(calls[0], RuntimeCall::Inspect(TEST_CONTAINER_ID.into()));
    assert_eq!(calls[1], RuntimeCall::Pull("helper-image:9.6-to-11".into()));
    assert!(matches!(calls[2], RuntimeCall::Create(_)));
    assert_eq!(
        calls[3..],
        [
            RuntimeCall::Start(HELPER_CONTAINER_ID.into()),
            RuntimeCall::Wait(HELPER_CONTAINER_ID.into()),
            RuntimeCall::Logs(HELPER_CONTAINER_ID.into()),
        ]
    );

    let data = fixture.pg_data_path();
    assert_eq!(fixture.marker(&data).as_deref(), Some("11"));
    assert_eq!(
        fixture.marker(&suffixed_path(&data, "9.6")).as_deref(),
        Some("9.6")
    );
    assert!(!suffixed_path(&data, "11").exists());

    assert_eq!(
        executor.commands(),
        vec![
            format!("chown -R postgres {}", data.display()),
            format!("su-exec postgres /postgres-optimize.sh {}", data.display()),
        ]
    );
    let work_dir = fixture.data_dir().join(".9.6-to-11-upgrade");
    for plan in executor.plans() {
        assert_eq!(plan.dir(), Some(work_dir.as_path()));
    }

    assert_eq!(
        fixture.ledger(&pair()).read().expect("ledger"),
        UpgradeStatus::Done
    );
}

#[test]
fn failing_helper_leaves_ledger_started_and_data_untouched() {
    let fixture = DataDirFixture::with_version("9.6");
    let config = fixture.config("11");
    let runtime = fixture
        .runtime()
        .exit_code(1)
        .logs("pg_upgrade: could not connect to source cluster\n");
    let executor = RecordingExecutor::new();
    let probe = probe();

    let err = Orchestrator::new(&config, &runtime, &executor, &probe)
        .run()
        .unwrap_err();

    assert_eq!(err.error_type(), "UPGRADE_CONTAINER_FAILED");
    assert!(err.to_string().contains("exit status 1"), "{err}");
    let output = err.output().expect("captured output");
    assert!(output.contains("could not connect to source cluster"), "{output}");
    assert!(output.contains("Downloaded newer image"), "pull progress is kept");

    assert_eq!(
        fixture.ledger(&pair()).read().expect("ledger"),
        UpgradeStatus::Started
    );
    let data = fixture.pg_data_path();
    assert_eq!(fixture.marker(&data).as_deref(), Some("9.6"));
    assert!(!suffixed_path(&data, "9.6").exists());
    assert!(executor.plans().is_empty());
}

#[test]
fn wait_error_still_drains_logs() {
    let fixture = DataDirFixture::with_version("9.6");
    let config = fixture.config("11");
    let runtime = fixture
        .runtime()
        .fail_wait("connection reset by peer")
        .logs("partial output\n");
    let executor = RecordingExecutor::new();
    let probe = probe();

    let err = Orchestrator::new(&config, &runtime, &executor, &probe)
        .run()
        .unwrap_err();

    assert_eq!(err.error_type(), "UPGRADE_CONTAINER_FAILED");
    assert!(err.to_string().contains("wait failed"), "{err}");
    assert!(err.output().expect("output").contains("partial output"));
    assert!(
        runtime
            .calls()
            .contains(&RuntimeCall::Logs(HELPER_CONTAINER_ID.into()))
    );
}

#[test]
fn pull_failure_aborts_before_any_container_exists() {
    let fixture = DataDirFixture::with_version("9.6");
    let config = fixture.config("11");
    let runtime = fixture.runtime().fail_pull("manifest unknown");
    let executor = RecordingExecutor::new();
    let probe = probe();

    let err = Orchestrator::new(&config, &runtime, &executor, &probe)
        .run()
        .unwrap_err();

    assert_eq!(err.error_type(), "RUNTIME_ERROR");
    assert_eq!(err.phase(), "pulling");
    assert!(err.to_string().contains("manifest unknown"), "{err}");
    assert!(!runtime.created_container());
    assert_eq!(
        fixture.ledger(&pair()).read().expect("ledger"),
        UpgradeStatus::Started
    );
}

#[test]
fn failed_optimize_script_restores_the_old_layout() {
    let fixture = DataDirFixture::with_version("9.6");
    let config = fixture.config("11");
    let runtime = fixture
        .runtime()
        .on_start(fixture.helper_creates_cluster("11"));
    let executor = RecordingExecutor::new().fail_on("/postgres-optimize.sh");
    let probe = probe();

    let err = Orchestrator::new(&config, &runtime, &executor, &probe)
        .run()
        .unwrap_err();

    assert_eq!(err.error_type(), "FINALIZE_FAILED");
    assert!(err.to_string().contains("optimize script"), "{err}");
    assert!(err.output().expect("output").contains("simulated failure"));

    let data = fixture.pg_data_path();
    assert_eq!(fixture.marker(&data).as_deref(), Some("9.6"));
    assert_eq!(
        fixture.marker(&suffixed_path(&data, "11")).as_deref(),
        Some("11")
    );
    assert!(!suffixed_path(&data, "9.6").exists());
    assert_eq!(
        fixture.ledger(&pair()).read().expect("ledger"),
        UpgradeStatus::Started
    );
}

#[test]
fn failed_chown_after_the_swap_restores_the_old_layout() {
    let fixture = DataDirFixture::with_version("9.6");
    let config = fixture.config("11");
    let runtime = fixture
        .runtime()
        .on_start(fixture.helper_creates_cluster("11"));
    let executor = RecordingExecutor::new().fail_on("chown");
    let probe = probe();

    let err = Orchestrator::new(&config, &runtime, &executor, &probe)
        .run()
        .unwrap_err();

    assert_eq!(err.error_type(), "FINALIZE_FAILED");
    assert!(err.to_string().contains("fixing ownership"), "{err}");
    assert!(!err.to_string().contains("rollback also failed"), "{err}");

    let data = fixture.pg_data_path();
    assert_eq!(fixture.marker(&data).as_deref(), Some("9.6"));
    assert_eq!(
        fixture.marker(&suffixed_path(&data, "11")).as_deref(),
        Some("11")
    );
    assert!(!suffixed_path(&data, "9.6").exists());
    // The optimize script never ran.
    assert_eq!(executor.plans().len(), 1);
}

#[test]
fn lost_backup_during_rollback_is_reported() {
    let fixture = DataDirFixture::with_version("9.6");
    let config = fixture.config("11");
    let runtime = fixture
        .runtime()
        .on_start(fixture.helper_creates_cluster("11"));
    let old_backup = suffixed_path(&fixture.pg_data_path(), "9.6");
    let executor = RecordingExecutor::new().fail_on("chown").on_failure(move || {
        fs::remove_dir_all(&old_backup).expect("remove backup");
    });
    let probe = probe();

    let err = Orchestrator::new(&config, &runtime, &executor, &probe)
        .run()
        .unwrap_err();

    assert_eq!(err.error_type(), "FINALIZE_FAILED");
    let message = err.to_string();
    assert!(message.contains("fixing ownership"), "{message}");
    assert!(message.contains("rollback also failed"), "{message}");

    // The upgraded cluster was moved back out of the way before the restore failed.
    let data = fixture.pg_data_path();
    assert!(!data.exists());
    assert_eq!(
        fixture.marker(&suffixed_path(&data, "11")).as_deref(),
        Some("11")
    );
    assert_eq!(
        fixture.ledger(&pair()).read().expect("ledger"),
        UpgradeStatus::Started
    );
}

#[test]
fn failed_done_write_restores_the_old_layout() {
    let fixture = DataDirFixture::with_version("9.6");
    let config = fixture.config("11");
    let create_cluster = fixture.helper_creates_cluster("11");
    let work_dir = fixture.ledger(&pair()).dir().to_path_buf();
    // Replace the workspace with a plain file so the final ledger write fails.
    let runtime = fixture.runtime().on_start(move |spec| {
        create_cluster(spec);
        fs::remove_dir_all(&work_dir).expect("remove workspace");
        fs::write(&work_dir, "").expect("block workspace");
    });
    let executor = RecordingExecutor::new();
    let probe = probe();

    let err = Orchestrator::new(&config, &runtime, &executor, &probe)
        .run()
        .unwrap_err();

    assert_eq!(err.error_type(), "FINALIZE_FAILED");
    assert!(
        err.to_string().contains("recording the finished upgrade"),
        "{err}"
    );

    let data = fixture.pg_data_path();
    assert_eq!(fixture.marker(&data).as_deref(), Some("9.6"));
    assert_eq!(
        fixture.marker(&suffixed_path(&data, "11")).as_deref(),
        Some("11")
    );
    assert!(!suffixed_path(&data, "9.6").exists());
    // Both finalize plans ran before the write was attempted.
    assert_eq!(executor.plans().len(), 2);
}

#[test]
fn helper_that_produced_nothing_fails_before_renaming() {
    let fixture = DataDirFixture::with_version("9.6");
    let config = fixture.config("11");
    let runtime = fixture.runtime();
    let executor = RecordingExecutor::new();
    let probe = probe();

    let err = Orchestrator::new(&config, &runtime, &executor, &probe)
        .run()
        .unwrap_err();

    assert_eq!(err.error_type(), "FINALIZE_FAILED");
    assert_eq!(
        fixture.marker(&fixture.pg_data_path()).as_deref(),
        Some("9.6")
    );
    assert!(executor.plans().is_empty());
}

#[test]
fn leftover_backup_blocks_the_upgrade_before_the_ledger() {
    let fixture = DataDirFixture::with_version("9.6");
    fs::create_dir_all(suffixed_path(&fixture.pg_data_path(), "9.6")).expect("mkdir");
    let config = fixture.config("11");
    let runtime = fixture.runtime();
    let executor = RecordingExecutor::new();
    let probe = probe();

    let err = Orchestrator::new(&config, &runtime, &executor, &probe)
        .run()
        .unwrap_err();

    assert_eq!(err.error_type(), "STALE_ARTIFACT");
    assert!(runtime.calls().is_empty());
    assert_eq!(
        fixture.ledger(&pair()).read().expect("ledger"),
        UpgradeStatus::Empty
    );
}

#[test]
fn unresolvable_host_path_fails_before_the_ledger() {
    let fixture = DataDirFixture::with_version("9.6");
    let config = fixture.config("11");
    let runtime = FakeRuntime::new(TEST_CONTAINER_ID, Default::default());
    let executor = RecordingExecutor::new();
    let probe = probe();

    let err = Orchestrator::new(&config, &runtime, &executor, &probe)
        .run()
        .unwrap_err();

    assert_eq!(err.error_type(), "HOST_PATH_NOT_FOUND");
    assert!(!runtime.created_container());
    assert!(!fixture.ledger(&pair()).dir().exists());
}

#[test]
fn missing_marker_is_fatal() {
    let fixture = DataDirFixture::empty();
    fs::create_dir_all(fixture.pg_data_path()).expect("mkdir");
    let config = fixture.config("11");
    let runtime = fixture.runtime();
    let executor = RecordingExecutor::new();
    let probe = probe();

    let err = Orchestrator::new(&config, &runtime, &executor, &probe)
        .run()
        .unwrap_err();
    assert_eq!(err.error_type(), "VERSION_UNKNOWN");
    assert!(runtime.calls().is_empty());
}

#[test]
fn rerun_after_failure_is_stopped_by_the_gate() {
    let fixture = DataDirFixture::with_version("9.6");
    let config = fixture.config("11");
    let executor = RecordingExecutor::new();
    let probe = probe();

    let failing = fixture.runtime().exit_code(2);
    Orchestrator::new(&config, &failing, &executor, &probe)
        .run()
        .unwrap_err();

    let second = fixture
        .runtime()
        .on_start(fixture.helper_creates_cluster("11"));
    let err = Orchestrator::new(&config, &second, &executor, &probe)
        .run()
        .unwrap_err();
    assert_eq!(err.error_type(), "INTERRUPTED_UPGRADE");
    assert!(!second.created_container());
}

#[test]
fn status_reports_pending_upgrade_without_mutating() {
    let fixture = DataDirFixture::with_version("9.6");
    fixture.write_ledger(&VersionPair::new("9.5", "9.6"), UpgradeStatus::Done);
    let config = fixture.config("11");
    let runtime = fixture.runtime();
    let executor = RecordingExecutor::new();
    let probe = probe();

    let report = Orchestrator::new(&config, &runtime, &executor, &probe)
        .status()
        .expect("status");

    assert_eq!(report.on_disk_version.as_deref(), Some("9.6"));
    assert_eq!(report.expected_version, "11");
    assert!(report.upgrade_needed);
    assert!(!report.interrupted);
    assert_eq!(report.ledgers.len(), 1);
    assert_eq!(report.ledgers[0].status, UpgradeStatus::Done);
    assert!(runtime.calls().is_empty());
    assert!(!fixture.ledger(&pair()).dir().exists());
}
