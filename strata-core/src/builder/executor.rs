//! Build executor for Strata images.
//!
//! Runs a [`BuildPlan`] step by step on top of a resolved base image. Each
//! filesystem step yields at most one layer; metadata steps only change the
//! image config. Every step result goes through the [`LayerCache`] under a
//! per-key lock, so concurrent builds of the same inputs compute a layer
//! once.
//!
//! The working root filesystem is materialized lazily: a build that hits
//! the cache for every step never unpacks anything.

use crate::builder::base::{BaseImageResolver, SCRATCH};
use crate::builder::cache::{CacheError, CacheLookupResult, LayerCache};
use crate::builder::context::{normalize, BuildContext, ContextEntry, ContextError, EntryKind};
use crate::builder::layer::{self, LayerBlob, LayerWriter, Owner, Snapshot};
use crate::builder::parser::{Dockerfile, Instruction, ParseError, RunCommand};
use crate::builder::plan::{base_reference, BuildPlan, CopySpec, PlannedStep, StepAction};
use crate::builder::runner::{is_dependency_install, lookup_user, OutputSink, ProcessSpec, RunRequest, RunnerError, StepRunner};
use crate::error::StrataError;
use crate::events::{EventBus, EventKind};
use crate::observability::metrics;
use crate::store::{BlobInfo, ImageStore};
use crate::types::{Image, ImageConfig, ImageReference, LayerDescriptor, LayerHistory};
use chrono::Utc;
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tar::{Archive, EntryType};
use tempfile::TempDir;
use tracing::{debug, error, info, instrument, warn};

/// Result type for build operations.
pub type BuildResult<T> = Result<T, BuildError>;

/// Error type for build operations.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Dockerfile parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Step {step}: {reason}")]
    InvalidInstruction { step: usize, reason: String },

    #[error("Base image {reference} could not be resolved: {reason}")]
    BaseImageUnresolvable { reference: String, reason: String },

    #[error("Step {step}: {path}: no such file or directory in build context")]
    MissingSource { step: usize, path: String },

    #[error("Step {step}: dependency installation failed with exit code {exit_code}\n{output}")]
    DependencyInstallFailed { step: usize, exit_code: i32, output: String },

    #[error("Step {step}: command failed with exit code {exit_code}\n{output}")]
    CommandFailed { step: usize, exit_code: i32, output: String },

    #[error("Step {step}: timed out after {timeout_secs}s")]
    StepTimedOut { step: usize, timeout_secs: u64 },

    #[error("Step {step}: {source}")]
    Runner {
        step: usize,
        #[source]
        source: RunnerError,
    },

    #[error("Build context error: {0}")]
    Context(#[from] ContextError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("{0}")]
    Store(#[from] StrataError),

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Build cancelled")]
    Cancelled,
}

impl BuildError {
    /// Process exit code for this failure.
    ///
    /// A failing RUN step propagates its own exit code; everything else maps
    /// to a sysexits-style code.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::Parse(_) | BuildError::InvalidInstruction { .. } => 65,
            BuildError::MissingSource { .. } => 66,
            BuildError::BaseImageUnresolvable { .. } => 69,
            BuildError::DependencyInstallFailed { exit_code, .. } | BuildError::CommandFailed { exit_code, .. } => {
                if (1..=255).contains(exit_code) {
                    *exit_code
                } else {
                    1
                }
            }
            BuildError::StepTimedOut { .. } => 124,
            BuildError::Runner { .. } => 126,
            BuildError::Cancelled => 130,
            BuildError::Store(StrataError::InvalidReference { .. }) => 64,
            BuildError::Context(_) | BuildError::Cache(_) | BuildError::Store(_) | BuildError::Io { .. } => 74,
        }
    }

    /// The step that failed, if the failure belongs to one.
    pub fn step(&self) -> Option<usize> {
        match self {
            BuildError::InvalidInstruction { step, .. }
            | BuildError::MissingSource { step, .. }
            | BuildError::DependencyInstallFailed { step, .. }
            | BuildError::CommandFailed { step, .. }
            | BuildError::StepTimedOut { step, .. }
            | BuildError::Runner { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            BuildError::Parse(_) => "parse",
            BuildError::InvalidInstruction { .. } => "invalid_instruction",
            BuildError::BaseImageUnresolvable { .. } => "base_image",
            BuildError::MissingSource { .. } => "missing_source",
            BuildError::DependencyInstallFailed { .. } => "dependency_install",
            BuildError::CommandFailed { .. } => "command_failed",
            BuildError::StepTimedOut { .. } => "timeout",
            BuildError::Runner { .. } => "runner",
            BuildError::Context(_) => "context",
            BuildError::Cache(_) => "cache",
            BuildError::Store(_) => "store",
            BuildError::Io { .. } => "io",
            BuildError::Cancelled => "cancelled",
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BuildError + '_ {
    move |source| BuildError::Io { path: path.to_path_buf(), source }
}

/// Where a build is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Unbuilt,
    Building,
    Built,
    Failed,
}

impl BuildPhase {
    pub fn can_transition_to(self, next: BuildPhase) -> bool {
        matches!(
            (self, next),
            (BuildPhase::Unbuilt, BuildPhase::Building)
                | (BuildPhase::Building, BuildPhase::Built)
                | (BuildPhase::Building, BuildPhase::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BuildPhase::Built | BuildPhase::Failed)
    }
}

/// Inputs for one build.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Build context directory
    pub context_dir: PathBuf,
    /// Dockerfile path; defaults to `Dockerfile` in the context
    pub dockerfile: Option<PathBuf>,
    /// Tag for the built image (e.g., "myapp:latest")
    pub tag: Option<String>,
    /// `--build-arg` values
    pub build_args: HashMap<String, String>,
    /// Execute every step even when cached
    pub no_cache: bool,
    /// Upper bound for each RUN step
    pub step_timeout: Option<Duration>,
}

impl BuildOptions {
    pub fn new(context_dir: impl Into<PathBuf>) -> Self {
        Self { context_dir: context_dir.into(), ..Default::default() }
    }

    pub fn dockerfile_path(&self) -> PathBuf {
        self.dockerfile.clone().unwrap_or_else(|| self.context_dir.join("Dockerfile"))
    }
}

/// How a step was satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Cached { step: usize, cache_key: String, layer: Option<String> },
    Executed { step: usize, cache_key: String, layer: Option<String>, duration_ms: u64 },
}

impl StepOutcome {
    pub fn is_cached(&self) -> bool {
        matches!(self, StepOutcome::Cached { .. })
    }

    pub fn layer(&self) -> Option<&str> {
        match self {
            StepOutcome::Cached { layer, .. } | StepOutcome::Executed { layer, .. } => layer.as_deref(),
        }
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub build_id: String,
    pub image: Image,
    pub tag: Option<ImageReference>,
    pub phase: BuildPhase,
    pub steps: Vec<StepOutcome>,
    pub duration: Duration,
    /// `--build-arg` names no ARG consumed
    pub unused_args: Vec<String>,
}

impl BuildReport {
    pub fn cached_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.is_cached()).count()
    }
}

/// Per-build bookkeeping: phase and event routing.
struct BuildRun<'a> {
    id: String,
    phase: BuildPhase,
    events: &'a EventBus,
}

impl BuildRun<'_> {
    fn transition(&mut self, next: BuildPhase) {
        if !self.phase.can_transition_to(next) {
            warn!(build_id = %self.id, from = ?self.phase, to = ?next, "Ignoring invalid build phase transition");
            return;
        }
        self.phase = next;
    }

    fn emit(&self, kind: EventKind) {
        self.events.emit(&self.id, kind);
    }
}

/// Image state accumulated across steps.
struct WorkingImage {
    config: ImageConfig,
    layers: Vec<LayerDescriptor>,
    history: Vec<LayerHistory>,
    /// CMD came from the base image, so an ENTRYPOINT clears it
    cmd_inherited: bool,
    rootfs: Option<TempDir>,
    /// Number of `layers` already unpacked into `rootfs`
    applied: usize,
}

struct Executed {
    blob: Option<LayerBlob>,
    /// The step changed the working rootfs directly
    in_place: bool,
}

/// Builds images from Dockerfiles.
pub struct Builder {
    store: ImageStore,
    cache: Arc<LayerCache>,
    resolver: Arc<dyn BaseImageResolver>,
    runner: Arc<dyn StepRunner>,
    events: EventBus,
    work_dir: PathBuf,
}

impl Builder {
    /// Creates a builder. Working root filesystems live under `work_dir`.
    pub fn new(
        store: ImageStore,
        cache: Arc<LayerCache>,
        resolver: Arc<dyn BaseImageResolver>,
        runner: Arc<dyn StepRunner>,
        work_dir: PathBuf,
    ) -> Self {
        Self { store, cache, resolver, runner, events: EventBus::new(), work_dir }
    }

    /// Publishes progress on `events` instead of a private bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    /// Builds `dockerfile` against `context` and publishes the image.
    ///
    /// Steps run in order and the build stops at the first failure; nothing
    /// is registered unless every step succeeds. Dropping the future kills
    /// a running step and publishes nothing.
    #[instrument(skip_all, fields(base = %dockerfile.base_image(), tag = ?options.tag))]
    pub async fn build(
        &self,
        dockerfile: &Dockerfile,
        context: &BuildContext,
        options: &BuildOptions,
    ) -> BuildResult<BuildReport> {
        let mut run = BuildRun { id: uuid::Uuid::new_v4().to_string(), phase: BuildPhase::Unbuilt, events: &self.events };
        let started = Instant::now();

        run.transition(BuildPhase::Building);
        run.emit(EventKind::BuildStarted { total_steps: dockerfile.steps.len() });
        info!(build_id = %run.id, steps = dockerfile.steps.len(), "Starting build");

        match self.run_build(&run, dockerfile, context, options).await {
            Ok(mut report) => {
                run.transition(BuildPhase::Built);
                report.phase = run.phase;
                report.duration = started.elapsed();
                metrics::record_build(report.duration.as_secs_f64());
                run.emit(EventKind::BuildCompleted {
                    image_id: report.image.id.clone(),
                    cached_steps: report.cached_steps(),
                    total_steps: report.steps.len(),
                });
                info!(
                    image_id = %report.image.short_id(),
                    cached = report.cached_steps(),
                    duration_ms = report.duration.as_millis() as u64,
                    "Build complete"
                );
                Ok(report)
            }
            Err(e) => {
                run.transition(BuildPhase::Failed);
                metrics::record_build_failure(e.reason());
                run.emit(EventKind::BuildFailed { step: e.step(), error: e.to_string() });
                error!(build_id = %run.id, step = ?e.step(), "Build failed: {}", e);
                Err(e)
            }
        }
    }

    async fn run_build(
        &self,
        run: &BuildRun<'_>,
        dockerfile: &Dockerfile,
        context: &BuildContext,
        options: &BuildOptions,
    ) -> BuildResult<BuildReport> {
        let tag = options.tag.as_deref().map(ImageReference::parse).transpose()?;

        if dockerfile.steps.is_empty() {
            return Err(BuildError::InvalidInstruction { step: 0, reason: "Dockerfile has no build steps".to_string() });
        }

        let reference = base_reference(dockerfile, &options.build_args)?;
        let platform = match dockerfile.steps.first().map(|s| &s.instruction) {
            Some(Instruction::From { platform, .. }) => platform.as_deref(),
            _ => None,
        };
        let base = self.resolver.resolve(&reference, platform).await?;
        if base.pulled {
            run.emit(EventKind::ImagePulled { reference: reference.clone(), image_id: base.image_id.clone() });
        }

        // Sources are matched and hashed here, so a missing file fails the
        // build before any step runs
        let plan = BuildPlan::new(dockerfile, context, &options.build_args, &base.config)?;
        let keys = plan.cache_keys(&base.image_id);
        let total = plan.steps.len();

        let mut state = WorkingImage {
            config: base.config.clone(),
            layers: base.layers.clone(),
            history: base.history.clone(),
            cmd_inherited: true,
            rootfs: None,
            applied: 0,
        };

        let mut outcomes = Vec::with_capacity(total);
        for (step, key) in plan.steps.iter().zip(&keys) {
            let outcome = self.run_step(run, step, key, total, context, options, &mut state).await?;
            outcomes.push(outcome);
        }

        let parent = (reference != SCRATCH).then(|| reference.clone());
        let image = Image::new(state.config, state.layers, state.history, parent);
        self.store.publish(&image, tag.as_ref()).await?;
        if let Some(tag) = &tag {
            info!(image_id = %image.short_id(), "Tagged image as {}", tag);
        }

        Ok(BuildReport {
            build_id: run.id.clone(),
            image,
            tag,
            phase: run.phase,
            steps: outcomes,
            duration: Duration::ZERO,
            unused_args: plan.unused_args,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        run: &BuildRun<'_>,
        step: &PlannedStep,
        key: &str,
        total: usize,
        context: &BuildContext,
        options: &BuildOptions,
        state: &mut WorkingImage,
    ) -> BuildResult<StepOutcome> {
        run.emit(EventKind::StepStarted { step: step.number, total, instruction: step.text.clone() });
        info!("Step {}/{}: {}", step.number, total, step.text);
        let started = Instant::now();

        // Held until the result is cached; an identical concurrent build waits here
        let _guard = self.cache.lock_key(key).await;

        if !options.no_cache {
            let cached = self.reuse_cached(step, key)?;
            metrics::record_cache_lookup(cached.is_some());
            if let Some(layer) = cached {
                let digest = layer.as_ref().map(|l| l.digest.clone());
                record_step(state, step, layer, "cached");
                run.emit(EventKind::StepCached { step: step.number, cache_key: key.to_string() });
                return Ok(StepOutcome::Cached { step: step.number, cache_key: key.to_string(), layer: digest });
            }
        }

        metrics::record_step(step.keyword());
        let executed = self.execute(run, step, context, options, state).await?;

        let layer = match executed.blob {
            Some(blob) => {
                let info = self.store.blobs().import_file(blob.file.path(), &blob.digest)?;
                self.cache.insert(key, Some(blob), &step.text)?;
                Some(LayerDescriptor { digest: info.digest, size: info.size, created_by: step.text.clone() })
            }
            None => {
                self.cache.insert(key, None, &step.text)?;
                None
            }
        };

        let digest = layer.as_ref().map(|l| l.digest.clone());
        record_step(state, step, layer, "");
        if executed.in_place {
            state.applied = state.layers.len();
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        run.emit(EventKind::StepFinished { step: step.number, duration_ms, layer: digest.clone() });
        debug!(step = step.number, duration_ms, layer = ?digest, "Step finished");

        Ok(StepOutcome::Executed { step: step.number, cache_key: key.to_string(), layer: digest, duration_ms })
    }

    /// Looks up a cached step result and moves its layer into the blob store.
    ///
    /// `Some(None)` is a cached step that produced no layer. An entry whose
    /// tarball is gone or no longer matches its digest is dropped and
    /// treated as a miss.
    fn reuse_cached(&self, step: &PlannedStep, key: &str) -> BuildResult<Option<Option<LayerDescriptor>>> {
        let CacheLookupResult::Hit { layer_path, metadata } = self.cache.lookup(key)? else {
            return Ok(None);
        };

        let (Some(path), Some(digest)) = (layer_path, metadata.digest) else {
            return Ok(Some(None));
        };

        Ok(self.import_cached(step.number, key, &path, &digest)?.map(|info| {
            Some(LayerDescriptor { digest: info.digest, size: info.size, created_by: step.text.clone() })
        }))
    }

    /// Moves a cached tarball into the blob store. `None` means the entry
    /// was unusable and has been dropped.
    fn import_cached(&self, step: usize, key: &str, path: &Path, digest: &str) -> BuildResult<Option<BlobInfo>> {
        match self.store.blobs().import_file(path, digest) {
            Ok(info) => Ok(Some(info)),
            Err(StrataError::BlobCorrupt { actual, .. }) => {
                warn!(step, expected = %digest, actual = %actual, "Discarding corrupt cache entry");
                self.cache.remove(key)?;
                Ok(None)
            }
            Err(StrataError::IoError { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                warn!(step, key = %key, "Cached layer vanished before import");
                self.cache.remove(key)?;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn execute(
        &self,
        run: &BuildRun<'_>,
        step: &PlannedStep,
        context: &BuildContext,
        options: &BuildOptions,
        state: &mut WorkingImage,
    ) -> BuildResult<Executed> {
        let executed = match &step.action {
            StepAction::Workdir { path } => {
                let rootfs = self.ensure_rootfs(state)?;
                let target = rootfs.join(path.trim_start_matches('/'));
                if target.is_dir() {
                    Executed { blob: None, in_place: true }
                } else {
                    let before = Snapshot::capture(&rootfs)?;
                    std::fs::create_dir_all(&target).map_err(io_error(&target))?;
                    let after = Snapshot::capture(&rootfs)?;
                    let blob = layer::write_diff_layer(&rootfs, &before, &after, &self.cache.tmp_dir())?;
                    Executed { blob, in_place: true }
                }
            }

            StepAction::Copy(spec) => {
                let rootfs = self.ensure_rootfs(state)?;
                Executed { blob: self.copy_layer(step.number, spec, false, context, &rootfs)?, in_place: false }
            }

            StepAction::Add(spec) => {
                let rootfs = self.ensure_rootfs(state)?;
                Executed { blob: self.copy_layer(step.number, spec, true, context, &rootfs)?, in_place: false }
            }

            StepAction::Run { command, args } => {
                let rootfs = self.ensure_rootfs(state)?;
                let before = Snapshot::capture(&rootfs)?;
                self.run_command(run, step.number, command, args, &state.config, &rootfs, options.step_timeout)
                    .await?;
                let after = Snapshot::capture(&rootfs)?;
                let blob = layer::write_diff_layer(&rootfs, &before, &after, &self.cache.tmp_dir())?;
                Executed { blob, in_place: true }
            }

            StepAction::From { .. }
            | StepAction::Env { .. }
            | StepAction::Arg { .. }
            | StepAction::Label { .. }
            | StepAction::Expose { .. }
            | StepAction::User { .. }
            | StepAction::Entrypoint { .. }
            | StepAction::Cmd { .. }
            | StepAction::Shell { .. }
            | StepAction::Stopsignal { .. } => Executed { blob: None, in_place: false },
        };

        Ok(executed)
    }

    /// Returns the working rootfs with every recorded layer applied.
    fn ensure_rootfs(&self, state: &mut WorkingImage) -> BuildResult<PathBuf> {
        let root = match &state.rootfs {
            Some(dir) => dir.path().to_path_buf(),
            None => {
                std::fs::create_dir_all(&self.work_dir).map_err(io_error(&self.work_dir))?;
                let dir = tempfile::Builder::new()
                    .prefix("rootfs-")
                    .tempdir_in(&self.work_dir)
                    .map_err(io_error(&self.work_dir))?;
                let path = dir.path().to_path_buf();
                state.rootfs = Some(dir);
                path
            }
        };

        for layer in &state.layers[state.applied..] {
            self.store.apply_layer(&layer.digest, &root)?;
        }
        state.applied = state.layers.len();
        Ok(root)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_command(
        &self,
        run: &BuildRun<'_>,
        step: usize,
        command: &RunCommand,
        args: &[(String, String)],
        config: &ImageConfig,
        rootfs: &Path,
        timeout: Option<Duration>,
    ) -> BuildResult<()> {
        if command.is_empty() {
            return Err(BuildError::InvalidInstruction { step, reason: "RUN requires a command".to_string() });
        }

        let mut env = config.process_env();
        for (name, value) in args {
            if !env.iter().any(|(k, _)| k == name) {
                env.push((name.clone(), value.clone()));
            }
        }

        let request = RunRequest {
            step,
            rootfs: rootfs.to_path_buf(),
            process: ProcessSpec {
                argv: command.to_argv(&config.shell_or_default()),
                env,
                workdir: if config.workdir.is_empty() { "/".to_string() } else { config.workdir.clone() },
                user: config.user.clone(),
            },
        };

        let events = run.events.clone();
        let build_id = run.id.clone();
        let sink: OutputSink = Arc::new(move |stream, line| {
            debug!(step, "{}", line);
            events.emit(&build_id, EventKind::StepOutput { step, stream, line });
        });

        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.runner.run(&request, sink)).await {
                Ok(result) => result,
                Err(_) => return Err(BuildError::StepTimedOut { step, timeout_secs: limit.as_secs() }),
            },
            None => self.runner.run(&request, sink).await,
        }
        .map_err(|source| BuildError::Runner { step, source })?;

        if output.success() {
            return Ok(());
        }

        let text = match command {
            RunCommand::Shell(cmd) => cmd.clone(),
            RunCommand::Exec(argv) => argv.join(" "),
        };
        if is_dependency_install(&text) {
            Err(BuildError::DependencyInstallFailed { step, exit_code: output.exit_code, output: output.tail })
        } else {
            Err(BuildError::CommandFailed { step, exit_code: output.exit_code, output: output.tail })
        }
    }

    /// Writes the layer for a COPY or ADD step.
    ///
    /// Directories that already exist in the image keep their mode and
    /// owner; everything staged gets the `--chown` owner (root otherwise).
    fn copy_layer(
        &self,
        step: usize,
        spec: &CopySpec,
        extract_archives: bool,
        context: &BuildContext,
        rootfs: &Path,
    ) -> BuildResult<Option<LayerBlob>> {
        let owner = match &spec.chown {
            Some(chown) => {
                let (uid, gid) = lookup_user(rootfs, chown)
                    .map_err(|reason| BuildError::InvalidInstruction { step, reason: format!("--chown={}: {}", chown, reason) })?;
                Some(Owner { uid: uid as u64, gid: gid as u64 })
            }
            None => None,
        };
        let staged_owner = owner.unwrap_or_default();

        let dest = spec.destination.trim_start_matches('/').to_string();
        let dest_is_dir = spec.dest_is_dir || rootfs.join(&dest).is_dir();

        let mut writer = LayerWriter::new(&self.cache.tmp_dir());
        preserve_existing_dirs(&mut writer, rootfs, &dest, dest_is_dir);

        for source in &spec.matched {
            if extract_archives && !source.is_dir && is_archive(&source.abs) {
                extract_archive(&mut writer, &source.abs, &dest, owner)
                    .map_err(|reason| BuildError::InvalidInstruction { step, reason })?;
                continue;
            }

            if source.is_dir && !dest.is_empty() && !rootfs.join(&dest).is_dir() {
                writer.add_dir(&dest, 0o755, staged_owner);
            }

            for entry in context.entries(source)? {
                let target = if source.is_dir || dest_is_dir { join_rel(&dest, &entry.rel) } else { dest.clone() };
                add_context_entry(&mut writer, &target, &entry, staged_owner);
            }
        }

        if writer.is_empty() {
            return Ok(None);
        }
        Ok(Some(writer.finish()?))
    }
}

fn record_step(state: &mut WorkingImage, step: &PlannedStep, layer: Option<LayerDescriptor>, comment: &str) {
    apply_config(state, &step.action);

    // The base image's history already covers FROM
    if matches!(step.action, StepAction::From { .. }) {
        return;
    }

    state.history.push(LayerHistory {
        created_by: step.text.clone(),
        digest: layer.as_ref().map(|l| l.digest.clone()),
        size_bytes: layer.as_ref().map(|l| l.size).unwrap_or(0),
        created_at: Utc::now(),
        comment: comment.to_string(),
        empty_layer: layer.is_none(),
    });
    if let Some(layer) = layer {
        state.layers.push(layer);
    }
}

fn apply_config(state: &mut WorkingImage, action: &StepAction) {
    let config = &mut state.config;
    match action {
        StepAction::Workdir { path } => config.workdir = path.clone(),
        StepAction::Env { vars } => {
            for (key, value) in vars {
                config.set_env(key, value);
            }
        }
        StepAction::Label { labels } => {
            for (key, value) in labels {
                config.labels.insert(key.clone(), value.clone());
            }
        }
        StepAction::Expose { ports } => config.exposed_ports.extend(ports.iter().cloned()),
        StepAction::User { user } => config.user = Some(user.clone()),
        StepAction::Entrypoint { command } => {
            config.entrypoint = command.to_argv(&config.shell_or_default());
            if state.cmd_inherited {
                config.cmd.clear();
            }
        }
        StepAction::Cmd { command } => {
            config.cmd = command.to_argv(&config.shell_or_default());
            state.cmd_inherited = false;
        }
        StepAction::Shell { shell } => config.shell = shell.clone(),
        StepAction::Stopsignal { signal } => config.stop_signal = Some(signal.clone()),
        StepAction::From { .. } | StepAction::Arg { .. } | StepAction::Copy(_) | StepAction::Add(_) | StepAction::Run { .. } => {}
    }
}

/// Re-records existing ancestors of `dest` (and `dest` itself when it is a
/// directory) with their current metadata, so the layer does not reset them
/// to root-owned `0755`.
fn preserve_existing_dirs(writer: &mut LayerWriter, rootfs: &Path, dest: &str, dest_is_dir: bool) {
    let dest_path = Path::new(dest);
    let mut dirs: Vec<&Path> = dest_path.ancestors().skip(1).filter(|p| !p.as_os_str().is_empty()).collect();
    if dest_is_dir && !dest.is_empty() {
        dirs.push(dest_path);
    }

    for dir in dirs {
        let host = rootfs.join(dir);
        let Ok(meta) = std::fs::symlink_metadata(&host) else { continue };
        if !meta.is_dir() {
            continue;
        }
        use std::os::unix::fs::MetadataExt;
        let owner = Owner { uid: meta.uid() as u64, gid: meta.gid() as u64 };
        writer.add_dir(&dir.to_string_lossy(), layer::mode_of(&host, 0o755), owner);
    }
}

fn add_context_entry(writer: &mut LayerWriter, target: &str, entry: &ContextEntry, owner: Owner) {
    match &entry.kind {
        EntryKind::File => writer.add_file(target, &entry.abs, entry.mode, owner),
        EntryKind::Dir => writer.add_dir(target, entry.mode, owner),
        EntryKind::Symlink(link) => writer.add_symlink(target, link, owner),
    }
}

fn join_rel(dest: &str, rel: &Path) -> String {
    let rel = rel.to_string_lossy();
    match (dest.is_empty(), rel.is_empty()) {
        (true, _) => rel.to_string(),
        (false, true) => dest.to_string(),
        (false, false) => format!("{}/{}", dest, rel),
    }
}

fn is_archive(path: &Path) -> bool {
    // A symlinked archive is copied as a link, never opened
    if !std::fs::symlink_metadata(path).map(|m| m.file_type().is_file()).unwrap_or(false) {
        return false;
    }
    let name = path.file_name().map(|n| n.to_string_lossy().to_lowercase()).unwrap_or_default();
    name.ends_with(".tar") || name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

/// Unpacks a local archive into the layer under `dest`.
///
/// Entries keep their own owner unless `owner` overrides it. Hard links and
/// special files are skipped.
fn extract_archive(writer: &mut LayerWriter, path: &Path, dest: &str, owner: Option<Owner>) -> Result<(), String> {
    let describe = |e: std::io::Error| format!("{}: {}", path.display(), e);

    let mut file = BufReader::new(File::open(path).map_err(describe)?);
    let mut magic = [0u8; 2];
    let gzipped = {
        use std::io::BufRead;
        let head = file.fill_buf().map_err(describe)?;
        if head.len() >= 2 {
            magic.copy_from_slice(&head[..2]);
        }
        magic == [0x1f, 0x8b]
    };

    let reader: Box<dyn Read> = if gzipped { Box::new(GzDecoder::new(file)) } else { Box::new(file) };
    let mut archive = Archive::new(reader);

    for entry in archive.entries().map_err(describe)? {
        let mut entry = entry.map_err(describe)?;
        let raw = entry.path().map_err(describe)?.to_string_lossy().to_string();
        let Some(rel) = normalize(&raw) else {
            return Err(format!("{}: entry {} escapes the destination", path.display(), raw));
        };
        if rel.as_os_str().is_empty() {
            continue;
        }

        let header = entry.header();
        let mode = header.mode().unwrap_or(0o644) & 0o7777;
        let entry_owner = owner.unwrap_or(Owner {
            uid: header.uid().unwrap_or(0),
            gid: header.gid().unwrap_or(0),
        });
        let target = join_rel(dest, &rel);

        match header.entry_type() {
            EntryType::Directory => writer.add_dir(&target, mode, entry_owner),
            EntryType::Regular | EntryType::Continuous => {
                let mut data = Vec::new();
                entry.read_to_end(&mut data).map_err(describe)?;
                writer.add_bytes(&target, data, mode, entry_owner);
            }
            EntryType::Symlink => {
                if let Some(link) = entry.link_name().map_err(describe)? {
                    writer.add_symlink(&target, &link, entry_owner);
                }
            }
            other => debug!(entry = %raw, kind = ?other, "Skipping archive entry"),
        }
    }

    Ok(())
}
