//! Shared test helpers for the pgshift workspace.
//!
//! - [`FakeRuntime`]: a scripted [`ContainerRuntime`] that records calls
//! - [`RecordingExecutor`]: a [`PrivilegedExecutor`] that records plans
//! - [`DataDirFixture`]: a throwaway data directory with a version marker

#![forbid(unsafe_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use pgshift_core::models::{VERSION_MARKER_FILE_NAME, suffixed_path};
use pgshift_core::{Config, UpgradeStatus, VersionPair};
use pgshift_runtime::{
    ContainerMounts, ContainerRuntime, ContainerSpec, ExitStatus, RuntimeError, RuntimeResult,
};
use pgshift_upgrade::exec::{CommandPlan, ExecFailure, PrivilegedExecutor};
use pgshift_upgrade::ledger::Ledger;
use tempfile::TempDir;

/// Container id the fixture's [`Config`] pins via `CONTAINER_ID`.
pub const TEST_CONTAINER_ID: &str = "test-container";
/// Host path the fixture's data directory is bound from.
pub const HOST_DATA_DIR: &str = "/host/data";
/// Id returned by [`FakeRuntime::create_container`].
pub const HELPER_CONTAINER_ID: &str = "fake-helper-1";

// ── FakeRuntime ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Pull(String),
    Create(ContainerSpec),
    Start(String),
    Wait(String),
    Logs(String),
    Inspect(String),
}

type StartHook = Box<dyn Fn(&ContainerSpec)>;

/// Scripted container runtime.
///
/// Every call is recorded. `start` runs the optional hook with the created
/// spec, which lets a test play the helper container's side effects.
pub struct FakeRuntime {
    calls: Mutex<Vec<RuntimeCall>>,
    created: Mutex<Option<ContainerSpec>>,
    inspected_id: String,
    mounts: ContainerMounts,
    pull_output: String,
    pull_error: Option<String>,
    exit_code: i64,
    wait_error: Option<String>,
    logs: String,
    on_start: Option<StartHook>,
}

impl FakeRuntime {
    /// A runtime where `inspect(container_id)` returns `mounts` and the
    /// helper exits 0.
    #[must_use]
    pub fn new(container_id: impl Into<String>, mounts: ContainerMounts) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            created: Mutex::new(None),
            inspected_id: container_id.into(),
            mounts,
            pull_output: "Status: Downloaded newer image\n".to_string(),
            pull_error: None,
            exit_code: 0,
            wait_error: None,
            logs: "Upgrade Complete\n".to_string(),
            on_start: None,
        }
    }

    #[must_use]
    pub fn exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    #[must_use]
    pub fn logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = logs.into();
        self
    }

    #[must_use]
    pub fn fail_pull(mut self, message: impl Into<String>) -> Self {
        self.pull_error = Some(message.into());
        self
    }

    #[must_use]
    pub fn fail_wait(mut self, message: impl Into<String>) -> Self {
        self.wait_error = Some(message.into());
        self
    }

    #[must_use]
    pub fn on_start(mut self, hook: impl Fn(&ContainerSpec) + 'static) -> Self {
        self.on_start = Some(Box::new(hook));
        self
    }

    /// Snapshot of the calls made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// The spec passed to `create`, if any.
    #[must_use]
    pub fn created_spec(&self) -> Option<ContainerSpec> {
        self.created.lock().expect("created lock").clone()
    }

    /// Whether any container was created.
    #[must_use]
    pub fn created_container(&self) -> bool {
        self.created_spec().is_some()
    }

    fn record(&self, call: RuntimeCall) {
        tracing::debug!(?call, "fake runtime");
        self.calls.lock().expect("calls lock").push(call);
    }

    fn failure(command: &str, message: &str) -> RuntimeError {
        RuntimeError::CommandFailed {
            command: command.to_string(),
            code: 1,
            stderr: message.to_string(),
        }
    }
}

impl ContainerRuntime for FakeRuntime {
    fn pull_image(&self, image: &str, out: &mut dyn Write) -> RuntimeResult<()> {
        self.record(RuntimeCall::Pull(image.to_string()));
        if let Some(message) = &self.pull_error {
            return Err(Self::failure("docker pull", message));
        }
        out.write_all(self.pull_output.as_bytes())?;
        Ok(())
    }

    fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        self.record(RuntimeCall::Create(spec.clone()));
        *self.created.lock().expect("created lock") = Some(spec.clone());
        Ok(HELPER_CONTAINER_ID.to_string())
    }

    fn start_container(&self, id: &str) -> RuntimeResult<()> {
        self.record(RuntimeCall::Start(id.to_string()));
        if let (Some(hook), Some(spec)) = (&self.on_start, self.created_spec()) {
            hook(&spec);
        }
        Ok(())
    }

    fn wait_container(&self, id: &str) -> RuntimeResult<ExitStatus> {
        self.record(RuntimeCall::Wait(id.to_string()));
        match &self.wait_error {
            Some(message) => Err(Self::failure("docker wait", message)),
            None => Ok(ExitStatus(self.exit_code)),
        }
    }

    fn fetch_logs(&self, id: &str, out: &mut dyn Write) -> RuntimeResult<()> {
        self.record(RuntimeCall::Logs(id.to_string()));
        out.write_all(self.logs.as_bytes())?;
        Ok(())
    }

    fn inspect_container(&self, id: &str) -> RuntimeResult<ContainerMounts> {
        self.record(RuntimeCall::Inspect(id.to_string()));
        if id == self.inspected_id {
            Ok(self.mounts.clone())
        } else {
            Err(Self::failure(
                "docker inspect",
                &format!("Error: No such container: {id}"),
            ))
        }
    }
}

// ── RecordingExecutor ──

/// Records every plan instead of running it.
///
/// `fail_on(program)` makes the first step whose program or argument equals
/// `program` fail with exit status 1. `apply_mkdir()` performs `mkdir -p`
/// steps for real so cleanup paths can be observed. `on_failure(hook)` runs
/// `hook` just before the simulated failure is reported.
#[derive(Default)]
pub struct RecordingExecutor {
    plans: Mutex<Vec<CommandPlan>>,
    fail_on: Option<String>,
    on_failure: Option<Box<dyn Fn()>>,
    apply_mkdir: bool,
}

impl RecordingExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn fail_on(mut self, program: impl Into<String>) -> Self {
        self.fail_on = Some(program.into());
        self
    }

    #[must_use]
    pub fn on_failure(mut self, hook: impl Fn() + 'static) -> Self {
        self.on_failure = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn apply_mkdir(mut self) -> Self {
        self.apply_mkdir = true;
        self
    }

    #[must_use]
    pub fn plans(&self) -> Vec<CommandPlan> {
        self.plans.lock().expect("plans lock").clone()
    }

    /// Every executed step rendered as a command line, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.plans()
            .iter()
            .flat_map(|plan| plan.steps().iter().map(ToString::to_string))
            .collect()
    }
}

impl PrivilegedExecutor for RecordingExecutor {
    fn run(&self, plan: &CommandPlan, out: &mut dyn Write) -> Result<(), ExecFailure> {
        self.plans.lock().expect("plans lock").push(plan.clone());
        for step in plan.steps() {
            let fails = self
                .fail_on
                .as_deref()
                .is_some_and(|p| step.program == p || step.args.iter().any(|a| a == p));
            if fails {
                if let Some(hook) = &self.on_failure {
                    hook();
                }
                writeln!(out, "{step}: simulated failure")?;
                return Err(ExecFailure::NonZeroExit {
                    command: step.to_string(),
                    code: Some(1),
                });
            }
            if self.apply_mkdir && step.program == "mkdir" {
                for dir in step.args.iter().filter(|a| !a.starts_with('-')) {
                    fs::create_dir_all(dir)?;
                }
            }
            writeln!(out, "{step}")?;
        }
        Ok(())
    }
}

// ── DataDirFixture ──

/// A temporary `<tmp>/data` directory standing in for `DATA_DIR`, bound
/// from [`HOST_DATA_DIR`] on the fake host.
pub struct DataDirFixture {
    dir: TempDir,
}

impl DataDirFixture {
    /// Empty `DATA_DIR` without a cluster.
    #[must_use]
    pub fn empty() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("data")).expect("create data dir");
        Self { dir }
    }

    /// `DATA_DIR` holding a cluster whose marker reads `version`.
    #[must_use]
    pub fn with_version(version: &str) -> Self {
        let fixture = Self::empty();
        fs::create_dir_all(fixture.pg_data_path()).expect("create cluster dir");
        fixture.write_marker(&fixture.pg_data_path(), version);
        fixture
    }

    /// Container-side `DATA_DIR`.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    #[must_use]
    pub fn pg_data_path(&self) -> PathBuf {
        self.data_dir().join("postgresql")
    }

    #[must_use]
    pub fn run_dir(&self) -> PathBuf {
        self.dir.path().join("run")
    }

    /// Config pointing at this fixture, expecting `expected_version`.
    #[must_use]
    pub fn config(&self, expected_version: &str) -> Config {
        Config {
            data_dir: self.data_dir(),
            pg_subdir: "postgresql".to_string(),
            pg_version: expected_version.to_string(),
            helper_image_repo: "helper-image".to_string(),
            helper_data_root: PathBuf::from("/var/lib/db"),
            helper_workdir: PathBuf::from("/workspace"),
            container_id: Some(TEST_CONTAINER_ID.to_string()),
            run_dir: self.run_dir(),
            ..Config::default()
        }
    }

    /// Mounts of the test container: `/host/data` bound at `DATA_DIR`.
    #[must_use]
    pub fn mounts(&self) -> ContainerMounts {
        ContainerMounts {
            binds: vec![format!("{HOST_DATA_DIR}:{}", self.data_dir().display())],
            mounts: Vec::new(),
        }
    }

    /// A [`FakeRuntime`] that knows this fixture's mounts.
    #[must_use]
    pub fn runtime(&self) -> FakeRuntime {
        FakeRuntime::new(TEST_CONTAINER_ID, self.mounts())
    }

    /// A start hook that creates `<cluster>-<new>` with an upgraded marker,
    /// as the real helper image does.
    #[must_use]
    pub fn helper_creates_cluster(&self, new_version: &str) -> impl Fn(&ContainerSpec) + 'static {
        let target = suffixed_path(&self.pg_data_path(), new_version);
        let version = new_version.to_string();
        move |_spec| {
            fs::create_dir_all(&target).expect("create upgraded cluster");
            fs::write(target.join(VERSION_MARKER_FILE_NAME), format!("{version}\n"))
                .expect("write upgraded marker");
        }
    }

    #[must_use]
    pub fn ledger(&self, pair: &VersionPair) -> Ledger {
        Ledger::for_pair(&self.data_dir(), pair)
    }

    pub fn write_ledger(&self, pair: &VersionPair, status: UpgradeStatus) {
        self.ledger(pair).write(status).expect("write ledger");
    }

    pub fn write_marker(&self, cluster: &Path, version: &str) {
        fs::write(cluster.join(VERSION_MARKER_FILE_NAME), format!("{version}\n"))
            .expect("write marker");
    }

    /// Marker of the cluster at `path`, trimmed.
    #[must_use]
    pub fn marker(&self, path: &Path) -> Option<String> {
        fs::read_to_string(path.join(VERSION_MARKER_FILE_NAME))
            .ok()
            .map(|s| s.trim().to_string())
    }
}
