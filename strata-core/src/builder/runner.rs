//! Command execution for RUN steps.
//!
//! [`StepRunner`] is the seam between the builder and whatever actually runs
//! a command. [`ProcessRunner`] runs it as a local process, either chrooted
//! into the image root filesystem (root only) or on the host with its
//! working directory inside the root filesystem.
//!
//! Output is streamed line by line to a sink and the last lines are kept
//! for error reports. Children run in their own process group, which is
//! killed when the run future is dropped, so timeouts and cancellation
//! leave nothing behind.

use crate::config::Isolation;
use crate::events::OutputStream;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Lines of output kept for error reports.
pub const OUTPUT_TAIL_LINES: usize = 50;

/// Commands that install dependencies through a package manager.
static DEPENDENCY_INSTALL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        \b(
            pip3?\s+install
          | python[0-9.]*\s+-m\s+pip\s+install
          | poetry\s+install
          | pipenv\s+install
          | uv\s+(pip\s+install|sync)
          | apt(-get)?\s+(-\S+\s+)*install
          | apk\s+(-\S+\s+)*add
          | (yum|dnf|microdnf|zypper)\s+(-\S+\s+)*install
          | npm\s+(install|ci|i)\b
          | yarn(\s+install\b|\s*($|&&|;|\|))
          | pnpm\s+install
          | gem\s+install
          | bundle(\s+install\b|\s*($|&&|;|\|))
          | cargo\s+(install|fetch)
          | go\s+(mod\s+download|get)
          | composer\s+install
        )",
    )
    .expect("Invalid dependency install regex")
});

/// True if `command` invokes a package installer.
pub fn is_dependency_install(command: &str) -> bool {
    DEPENDENCY_INSTALL_REGEX.is_match(command)
}

/// A process to start inside an image root filesystem.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Absolute working directory inside the image
    pub workdir: String,
    /// `user[:group]` to run as
    pub user: Option<String>,
}

/// A build command to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Step number, for logs
    pub step: usize,
    pub rootfs: PathBuf,
    pub process: ProcessSpec,
}

/// How a command ended.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Exit code; 128 + signal number when killed by a signal
    pub exit_code: i32,
    /// Last [`OUTPUT_TAIL_LINES`] lines of combined output
    pub tail: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Receives output lines as they are produced.
pub type OutputSink = Arc<dyn Fn(OutputStream, String) + Send + Sync>;

/// Errors starting or supervising a command.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for command: {0}")]
    Wait(#[source] std::io::Error),

    #[error("Cannot run as user {user}: {reason}")]
    User { user: String, reason: String },

    #[error("Chroot isolation requires root privileges")]
    NotPermitted,

    #[error("Empty command")]
    EmptyCommand,
}

/// Runs build commands.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Runs the command and waits for it. Dropping the future kills it.
    async fn run(&self, request: &RunRequest, sink: OutputSink) -> Result<RunOutput, RunnerError>;
}

/// Runs commands as local child processes.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    isolation: Isolation,
}

impl ProcessRunner {
    /// `Auto` isolation is resolved here, once.
    pub fn new(isolation: Isolation) -> Self {
        Self { isolation: isolation.resolve() }
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }
}

/// Builds a command for `process` under the given isolation.
///
/// The child gets exactly `process.env`, starts in its own process group
/// and, with chroot isolation, sees `rootfs` as `/`. Stdio is left to the
/// caller.
pub fn isolated_command(isolation: Isolation, rootfs: &Path, process: &ProcessSpec) -> Result<Command, RunnerError> {
    let (program, args) = process.argv.split_first().ok_or(RunnerError::EmptyCommand)?;
    let spawn_err = |source: std::io::Error| RunnerError::Spawn { program: program.clone(), source };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(process.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .process_group(0);

    let cwd = rootfs.join(process.workdir.trim_start_matches('/'));
    std::fs::create_dir_all(&cwd).map_err(spawn_err)?;

    match isolation.resolve() {
        Isolation::Chroot => {
            if !crate::builder::layer::is_root() {
                return Err(RunnerError::NotPermitted);
            }
            let invalid = |e: std::ffi::NulError| spawn_err(std::io::Error::new(std::io::ErrorKind::InvalidInput, e));
            let root = CString::new(rootfs.as_os_str().as_bytes()).map_err(invalid)?;
            let workdir = CString::new(if process.workdir.is_empty() { "/" } else { process.workdir.as_str() })
                .map_err(invalid)?;

            if let Some(user) = &process.user {
                let (uid, gid) =
                    lookup_user(rootfs, user).map_err(|reason| RunnerError::User { user: user.clone(), reason })?;
                cmd.uid(uid).gid(gid);
            }

            // SAFETY: only async-signal-safe libc calls on pre-built C strings.
            unsafe {
                cmd.pre_exec(move || {
                    if libc::chroot(root.as_ptr()) != 0 || libc::chdir(workdir.as_ptr()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        Isolation::Host | Isolation::Auto => {
            cmd.current_dir(cwd);
            if process.user.is_some() {
                debug!("USER is ignored with host isolation");
            }
        }
    }

    Ok(cmd)
}

#[async_trait]
impl StepRunner for ProcessRunner {
    #[instrument(skip_all, fields(step = request.step))]
    async fn run(&self, request: &RunRequest, sink: OutputSink) -> Result<RunOutput, RunnerError> {
        let mut cmd = isolated_command(self.isolation, &request.rootfs, &request.process)?;
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
        debug!(argv = ?request.process.argv, isolation = ?self.isolation, "Spawning step command");

        let mut child = cmd.spawn().map_err(|e| RunnerError::Spawn {
            program: request.process.argv.first().cloned().unwrap_or_default(),
            source: e,
        })?;
        let group = child.id().map(ProcessGroupGuard::new);

        let tail = Arc::new(Mutex::new(OutputTail::new(OUTPUT_TAIL_LINES)));
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (status, _, _) = tokio::join!(
            child.wait(),
            pump(stdout, OutputStream::Stdout, sink.clone(), tail.clone()),
            pump(stderr, OutputStream::Stderr, sink, tail.clone()),
        );
        let status = status.map_err(RunnerError::Wait)?;
        if let Some(group) = group {
            group.disarm();
        }

        let exit_code = match (status.code(), status.signal()) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        };

        let tail = tail.lock().map(|t| t.joined()).unwrap_or_default();
        debug!(exit_code, "Step command finished");
        Ok(RunOutput { exit_code, tail })
    }
}

/// Kills a whole process group when dropped.
///
/// Disarm it once the group leader has been reaped: from then on the
/// group id may belong to an unrelated process.
pub(crate) struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    pub(crate) fn new(pgid: u32) -> Self {
        Self { pgid: Some(pgid) }
    }

    pub(crate) fn disarm(mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        let Some(pgid) = self.pgid.take() else { return };
        // Stragglers (background jobs, children of a killed shell) go too
        unsafe {
            libc::kill(-(pgid as i32), libc::SIGKILL);
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(
    reader: Option<R>,
    stream: OutputStream,
    sink: OutputSink,
    tail: Arc<Mutex<OutputTail>>,
) {
    let Some(reader) = reader else { return };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Ok(mut tail) = tail.lock() {
            tail.push(&line);
        }
        sink(stream, line);
    }
}

/// Bounded buffer of the most recent output lines.
#[derive(Debug)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self { lines: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn push(&mut self, line: &str) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn joined(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Resolves `user[:group]` to numeric ids using the image's passwd and
/// group files. Numeric values are used as-is.
pub fn lookup_user(rootfs: &Path, spec: &str) -> Result<(u32, u32), String> {
    let (user, group) = match spec.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (spec, None),
    };

    let (uid, primary_gid) = match user.parse::<u32>() {
        Ok(uid) => {
            let gid = find_entry(&rootfs.join("etc/passwd"), |fields| fields.get(2) == Some(&user))
                .and_then(|fields| fields.get(3).and_then(|g| g.parse().ok()))
                .unwrap_or(uid);
            (uid, gid)
        }
        Err(_) => {
            let fields = find_entry(&rootfs.join("etc/passwd"), |fields| fields.first() == Some(&user))
                .ok_or_else(|| format!("no user named {} in /etc/passwd", user))?;
            let uid = fields.get(2).and_then(|v| v.parse().ok()).ok_or("malformed /etc/passwd entry")?;
            let gid = fields.get(3).and_then(|v| v.parse().ok()).ok_or("malformed /etc/passwd entry")?;
            (uid, gid)
        }
    };

    let gid = match group {
        None => primary_gid,
        Some(g) => match g.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => find_entry(&rootfs.join("etc/group"), |fields| fields.first() == Some(&g))
                .and_then(|fields| fields.get(2).and_then(|v| v.parse().ok()))
                .ok_or_else(|| format!("no group named {} in /etc/group", g))?,
        },
    };

    Ok((uid, gid))
}

fn find_entry(path: &Path, pred: impl Fn(&Vec<&str>) -> bool) -> Option<Vec<String>> {
    let content = std::fs::read_to_string(path).ok()?;
    content.lines().find_map(|line| {
        let fields: Vec<&str> = line.split(':').collect();
        pred(&fields).then(|| fields.iter().map(|f| f.to_string()).collect())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn request(rootfs: &Path, script: &str) -> RunRequest {
        RunRequest {
            step: 1,
            rootfs: rootfs.to_path_buf(),
            process: ProcessSpec {
                argv: vec!["/bin/sh".into(), "-c".into(), script.into()],
                env: vec![("PATH".into(), crate::types::image::DEFAULT_PATH.into()), ("GREETING".into(), "hello".into())],
                workdir: "/app".into(),
                user: None,
            },
        }
    }

    fn collecting_sink() -> (OutputSink, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let sink: OutputSink = Arc::new(move |_stream, line| captured.lock().unwrap().push(line));
        (sink, lines)
    }

    #[test]
    fn test_dependency_install_detection() {
        assert!(is_dependency_install("pip install -r requirements.txt"));
        assert!(is_dependency_install("python3 -m pip install flask"));
        assert!(is_dependency_install("apt-get update && apt-get install -y curl"));
        assert!(is_dependency_install("apt-get -y install curl"));
        assert!(is_dependency_install("apk add --no-cache git"));
        assert!(is_dependency_install("npm ci"));
        assert!(is_dependency_install("yarn"));
        assert!(is_dependency_install("cd web && yarn install --frozen-lockfile"));
        assert!(is_dependency_install("poetry install --no-root"));
        assert!(is_dependency_install("go mod download"));

        assert!(!is_dependency_install("python main.py"));
        assert!(!is_dependency_install("make test"));
        assert!(!is_dependency_install("echo pipeline"));
        assert!(!is_dependency_install("npm run build"));
    }

    #[test]
    fn test_output_tail_is_bounded() {
        let mut tail = OutputTail::new(2);
        tail.push("one");
        tail.push("two");
        tail.push("three");
        assert_eq!(tail.joined(), "two\nthree");
    }

    #[test]
    fn test_lookup_user() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc")).unwrap();
        std::fs::write(tmp.path().join("etc/passwd"), "root:x:0:0:root:/root:/bin/sh\napp:x:1000:1001::/home/app:/bin/sh\n").unwrap();
        std::fs::write(tmp.path().join("etc/group"), "root:x:0:\nstaff:x:50:\n").unwrap();

        assert_eq!(lookup_user(tmp.path(), "app").unwrap(), (1000, 1001));
        assert_eq!(lookup_user(tmp.path(), "app:staff").unwrap(), (1000, 50));
        assert_eq!(lookup_user(tmp.path(), "1000").unwrap(), (1000, 1001));
        assert_eq!(lookup_user(tmp.path(), "2000:3000").unwrap(), (2000, 3000));
        assert!(lookup_user(tmp.path(), "ghost").is_err());
        assert!(lookup_user(tmp.path(), "app:nogroup").is_err());
    }

    #[tokio::test]
    async fn test_host_runner_uses_workdir_and_env() {
        let tmp = TempDir::new().unwrap();
        let runner = ProcessRunner::new(Isolation::Host);
        let (sink, lines) = collecting_sink();

        let output = runner
            .run(&request(tmp.path(), "echo $GREETING > greeting.txt; echo done"), sink)
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(std::fs::read_to_string(tmp.path().join("app/greeting.txt")).unwrap(), "hello\n");
        assert_eq!(lines.lock().unwrap().as_slice(), ["done".to_string()]);
    }

    #[tokio::test]
    async fn test_host_runner_reports_exit_code_and_tail() {
        let tmp = TempDir::new().unwrap();
        let runner = ProcessRunner::new(Isolation::Host);
        let (sink, _lines) = collecting_sink();

        let output = runner
            .run(&request(tmp.path(), "echo first; echo oops >&2; exit 3"), sink)
            .await
            .unwrap();

        assert_eq!(output.exit_code, 3);
        assert!(output.tail.contains("first"));
        assert!(output.tail.contains("oops"));
    }

    #[tokio::test]
    async fn test_dropping_run_kills_command() {
        let tmp = TempDir::new().unwrap();
        let runner = ProcessRunner::new(Isolation::Host);
        let (sink, _lines) = collecting_sink();

        let req = request(tmp.path(), "sleep 30; touch finished");
        let result = tokio::time::timeout(Duration::from_millis(200), runner.run(&req, sink)).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!tmp.path().join("app/finished").exists());
    }

    #[tokio::test]
    async fn test_disarmed_group_guard_sends_nothing() {
        let mut armed = Command::new("sleep").arg("30").process_group(0).spawn().unwrap();
        drop(ProcessGroupGuard::new(armed.id().unwrap()));
        let status = armed.wait().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));

        let mut reaped = Command::new("sleep").arg("30").process_group(0).spawn().unwrap();
        ProcessGroupGuard::new(reaped.id().unwrap()).disarm();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(reaped.try_wait().unwrap().is_none());
        reaped.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let tmp = TempDir::new().unwrap();
        let runner = ProcessRunner::new(Isolation::Host);
        let (sink, _lines) = collecting_sink();

        let mut req = request(tmp.path(), "");
        req.process.argv = vec!["/definitely/not/here".into()];
        assert!(matches!(runner.run(&req, sink).await, Err(RunnerError::Spawn { .. })));
    }
}
