//! Containers: a materialized image plus the one process that runs in it.
//!
//! A container's lifetime is bound to its process. Lifecycle:
//!
//! ```text
//! Created --start--> Running --wait--> Exited(code)
//!                       └─────kill───> Killed
//! ```
//!
//! The root filesystem lives under the containers directory until
//! [`Container::remove`] is called.

use crate::builder::runner::{isolated_command, ProcessGroupGuard, ProcessSpec};
use crate::config::Isolation;
use crate::error::{Result, StrataError};
use crate::events::{EventBus, EventKind};
use crate::observability::metrics;
use crate::store::ImageStore;
use crate::types::Image;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Child;
use tracing::{debug, info, instrument, warn};

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running { pid: u32 },
    Exited(i32),
    Killed,
}

impl ContainerState {
    /// Exit code of a stopped container; a kill counts as SIGKILL.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Killed => Some(128 + libc::SIGKILL),
            Self::Created | Self::Running { .. } => None,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running { pid } => write!(f, "running (pid {})", pid),
            Self::Exited(code) => write!(f, "exited ({})", code),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// Changes to the image's default process, as given to `strata run`.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    /// Replaces the image CMD; the entrypoint is kept
    pub args: Vec<String>,
    /// Replaces the image entrypoint
    pub entrypoint: Option<Vec<String>>,
    /// Added to (or replacing) the image environment
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
    pub user: Option<String>,
}

/// Works out the process a container runs from the image config.
pub fn process_for(image: &Image, overrides: &RunOverrides) -> ProcessSpec {
    let config = &image.config;

    let entrypoint = overrides.entrypoint.clone().unwrap_or_else(|| config.entrypoint.clone());
    let cmd = if overrides.args.is_empty() { config.cmd.clone() } else { overrides.args.clone() };

    let mut env = config.process_env();
    for (key, value) in &overrides.env {
        match env.iter_mut().find(|(k, _)| k == key) {
            Some(existing) => existing.1 = value.clone(),
            None => env.push((key.clone(), value.clone())),
        }
    }

    let workdir = overrides
        .workdir
        .clone()
        .or_else(|| (!config.workdir.is_empty()).then(|| config.workdir.clone()))
        .unwrap_or_else(|| "/".to_string());

    ProcessSpec {
        argv: entrypoint.into_iter().chain(cmd).collect(),
        env,
        workdir,
        user: overrides.user.clone().or_else(|| config.user.clone()),
    }
}

/// A container created from an image.
pub struct Container {
    pub id: String,
    pub image_id: String,
    /// Directory holding the container's files
    pub dir: PathBuf,
    pub rootfs: PathBuf,
    pub process: ProcessSpec,
    state: ContainerState,
    isolation: Isolation,
    child: Option<Child>,
    group: Option<ProcessGroupGuard>,
    events: Option<EventBus>,
}

impl Container {
    /// Materializes `image` into a fresh root filesystem under `containers_dir`.
    #[instrument(skip_all, fields(image_id = %image.short_id()))]
    pub fn create(
        store: &ImageStore,
        image: &Image,
        containers_dir: &Path,
        isolation: Isolation,
        overrides: &RunOverrides,
    ) -> Result<Self> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let process = process_for(image, overrides);
        if process.argv.is_empty() {
            return Err(StrataError::NoCommand { id });
        }

        let dir = containers_dir.join(&id);
        let rootfs = dir.join("rootfs");
        if let Err(e) = store.materialize(image, &rootfs) {
            let _ = std::fs::remove_dir_all(&dir);
            return Err(e);
        }

        info!(container_id = %id, argv = ?process.argv, workdir = %process.workdir, "Created container");
        Ok(Self {
            id,
            image_id: image.id.clone(),
            dir,
            rootfs,
            process,
            state: ContainerState::Created,
            isolation: isolation.resolve(),
            child: None,
            group: None,
            events: None,
        })
    }

    /// Publishes start and exit events on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    fn invalid(&self, action: &str) -> StrataError {
        StrataError::InvalidContainerState { id: self.id.clone(), action: action.to_string(), state: self.state.to_string() }
    }

    fn emit(&self, kind: EventKind) {
        if let Some(events) = &self.events {
            events.emit(&self.id, kind);
        }
    }

    /// Starts the process with the caller's stdio.
    pub fn start(&mut self) -> Result<()> {
        if self.state != ContainerState::Created {
            return Err(self.invalid("start"));
        }

        let mut cmd = isolated_command(self.isolation, &self.rootfs, &self.process)
            .map_err(|e| StrataError::ContainerStartFailed { id: self.id.clone(), reason: e.to_string() })?;
        cmd.stdin(Stdio::inherit()).stdout(Stdio::inherit()).stderr(Stdio::inherit()).kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| StrataError::ContainerStartFailed { id: self.id.clone(), reason: e.to_string() })?;
        let pid = child.id().unwrap_or_default();

        self.group = Some(ProcessGroupGuard::new(pid));
        self.child = Some(child);
        self.state = ContainerState::Running { pid };

        metrics::record_container_started();
        self.emit(EventKind::ContainerStarted { image_id: self.image_id.clone() });
        info!(container_id = %self.id, pid, isolation = ?self.isolation, "Started container");
        Ok(())
    }

    /// Waits for the process to exit and returns its exit code
    /// (128 + signal number when killed by a signal).
    pub async fn wait(&mut self) -> Result<i32> {
        let ContainerState::Running { .. } = self.state else {
            return Err(self.invalid("wait"));
        };
        let Some(child) = self.child.as_mut() else {
            return Err(self.invalid("wait"));
        };

        let status = child.wait().await.map_err(|e| StrataError::io(&self.rootfs, e))?;
        let code = exit_code(status);
        self.finish(ContainerState::Exited(code));
        Ok(code)
    }

    /// Kills the whole process group and reaps the process.
    pub async fn kill(&mut self) -> Result<()> {
        let ContainerState::Running { pid } = self.state else {
            return Err(self.invalid("kill"));
        };

        debug!(container_id = %self.id, pid, "Killing container");
        // Dropping the guard signals the whole group
        self.group.take();
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill().await {
                warn!(container_id = %self.id, error = %e, "Failed to reap killed container");
            }
        }
        self.finish(ContainerState::Killed);
        Ok(())
    }

    /// Starts the process and waits for it.
    pub async fn run(&mut self) -> Result<i32> {
        self.start()?;
        self.wait().await
    }

    /// Called once the process has been reaped.
    fn finish(&mut self, state: ContainerState) {
        self.child = None;
        if let Some(group) = self.group.take() {
            group.disarm();
        }
        self.state = state;

        let exit_code = state.exit_code().unwrap_or(1);
        self.emit(EventKind::ContainerExited { exit_code });
        info!(container_id = %self.id, state = %state, "Container stopped");
    }

    /// Deletes the container's files. A running container must be stopped first.
    pub fn remove(self) -> Result<()> {
        if let ContainerState::Running { .. } = self.state {
            return Err(self.invalid("remove"));
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StrataError::io(&self.dir, e)),
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::layer::{LayerWriter, Owner};
    use crate::state::StateManager;
    use crate::store::BlobStore;
    use crate::types::{ImageConfig, LayerDescriptor};
    use tempfile::TempDir;

    async fn image_with(temp: &TempDir, config: ImageConfig) -> (ImageStore, Image) {
        let store = ImageStore::with_parts(
            BlobStore::new(&temp.path().join("blobs")).unwrap(),
            StateManager::new_in_memory().await.unwrap(),
        );
        let mut writer = LayerWriter::new(temp.path());
        writer.add_dir("app", 0o755, Owner::default());
        writer.add_bytes("app/main.py", b"print('hi')\n".to_vec(), 0o644, Owner::default());
        let blob = writer.finish().unwrap();
        let info = store.blobs().import_file(blob.file.path(), &blob.digest).unwrap();
        let layer = LayerDescriptor { digest: info.digest, size: info.size, created_by: "COPY . .".into() };
        let image = Image::new(config, vec![layer], vec![], None);
        store.publish(&image, None).await.unwrap();
        (store, image)
    }

    fn script_config(script: &str) -> ImageConfig {
        ImageConfig {
            workdir: "/app".into(),
            entrypoint: vec!["/bin/sh".into(), "-c".into()],
            cmd: vec![script.into()],
            ..ImageConfig::scratch()
        }
    }

    #[test]
    fn test_process_for_applies_overrides() {
        let config = ImageConfig {
            workdir: "/app".into(),
            entrypoint: vec!["python".into()],
            cmd: vec!["main.py".into()],
            env: vec!["MODE=prod".into()],
            ..ImageConfig::scratch()
        };
        let image = Image::new(config, vec![], vec![], None);

        let default = process_for(&image, &RunOverrides::default());
        assert_eq!(default.argv, vec!["python", "main.py"]);
        assert_eq!(default.workdir, "/app");

        let overrides = RunOverrides {
            args: vec!["other.py".into()],
            env: vec![("MODE".into(), "dev".into())],
            ..Default::default()
        };
        let changed = process_for(&image, &overrides);
        assert_eq!(changed.argv, vec!["python", "other.py"]);
        assert!(changed.env.contains(&("MODE".to_string(), "dev".to_string())));
    }

    #[tokio::test]
    async fn test_container_runs_in_workdir_with_default_argv() {
        let temp = TempDir::new().unwrap();
        let (store, image) = image_with(&temp, script_config("pwd > cwd.txt; echo \"$0\" > argv.txt")).await;

        let mut container =
            Container::create(&store, &image, &temp.path().join("containers"), Isolation::Host, &RunOverrides::default())
                .unwrap();
        assert_eq!(container.state(), ContainerState::Created);
        assert_eq!(container.run().await.unwrap(), 0);
        assert_eq!(container.state(), ContainerState::Exited(0));

        let app = container.rootfs.join("app");
        let cwd = std::fs::read_to_string(app.join("cwd.txt")).unwrap();
        assert_eq!(Path::new(cwd.trim()).canonicalize().unwrap(), app.canonicalize().unwrap());
        assert!(app.join("main.py").exists());

        container.remove().unwrap();
        assert!(!temp.path().join("containers").read_dir().unwrap().any(|_| true));
    }

    #[tokio::test]
    async fn test_exit_code_propagates() {
        let temp = TempDir::new().unwrap();
        let (store, image) = image_with(&temp, script_config("exit 7")).await;

        let mut container =
            Container::create(&store, &image, &temp.path().join("containers"), Isolation::Host, &RunOverrides::default())
                .unwrap();
        assert_eq!(container.run().await.unwrap(), 7);
        assert!(matches!(container.start(), Err(StrataError::InvalidContainerState { .. })));
    }

    #[tokio::test]
    async fn test_kill_running_container() {
        let temp = TempDir::new().unwrap();
        let (store, image) = image_with(&temp, script_config("sleep 30")).await;

        let mut container =
            Container::create(&store, &image, &temp.path().join("containers"), Isolation::Host, &RunOverrides::default())
                .unwrap();
        assert!(matches!(container.kill().await, Err(StrataError::InvalidContainerState { .. })));

        container.start().unwrap();
        assert!(matches!(container.state(), ContainerState::Running { .. }));
        container.kill().await.unwrap();
        assert_eq!(container.state(), ContainerState::Killed);
        assert_eq!(container.state().exit_code(), Some(137));
        assert!(matches!(container.wait().await, Err(StrataError::InvalidContainerState { .. })));
    }

    #[tokio::test]
    async fn test_image_without_command() {
        let temp = TempDir::new().unwrap();
        let (store, image) = image_with(&temp, ImageConfig::scratch()).await;

        let result =
            Container::create(&store, &image, &temp.path().join("containers"), Isolation::Host, &RunOverrides::default());
        assert!(matches!(result, Err(StrataError::NoCommand { .. })));
    }
}
