//! Build plan for Strata image building.
//!
//! Resolves parsed steps against build arguments, the base image config and
//! the build context: variables are expanded, relative paths made absolute
//! and COPY/ADD sources matched and hashed. A missing source fails here,
//! before any step runs.
//!
//! Each planned step carries a digest of everything that affects its result.
//! Cache keys chain those digests from the base image ID, so a change to
//! any step invalidates it and every step after it.

use crate::builder::context::{BuildContext, ContextError, MatchedSource};
use crate::builder::executor::BuildError;
use crate::builder::expand::Scope;
use crate::builder::parser::{Dockerfile, Instruction, RunCommand};
use crate::types::ImageConfig;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// A step with every input resolved.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    /// 1-based position in the Dockerfile
    pub number: usize,
    /// Line the instruction starts on
    pub line: usize,
    /// Instruction as written
    pub text: String,
    pub action: StepAction,
    /// Hex SHA256 over the resolved action (and source contents)
    pub digest: String,
}

impl PlannedStep {
    pub fn keyword(&self) -> &'static str {
        self.action.keyword()
    }
}

/// What a step does once its inputs are resolved.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StepAction {
    From { reference: String, platform: Option<String> },
    Workdir { path: String },
    Copy(CopySpec),
    Add(CopySpec),
    /// `args` are the build args in scope; they reach the command's
    /// environment but are not persisted in the image
    Run { command: RunCommand, args: Vec<(String, String)> },
    Env { vars: Vec<(String, String)> },
    Arg { name: String, value: Option<String> },
    Label { labels: Vec<(String, String)> },
    Expose { ports: Vec<String> },
    User { user: String },
    Entrypoint { command: RunCommand },
    Cmd { command: RunCommand },
    Shell { shell: Vec<String> },
    Stopsignal { signal: String },
}

impl StepAction {
    pub fn keyword(&self) -> &'static str {
        match self {
            StepAction::From { .. } => "FROM",
            StepAction::Workdir { .. } => "WORKDIR",
            StepAction::Copy(_) => "COPY",
            StepAction::Add(_) => "ADD",
            StepAction::Run { .. } => "RUN",
            StepAction::Env { .. } => "ENV",
            StepAction::Arg { .. } => "ARG",
            StepAction::Label { .. } => "LABEL",
            StepAction::Expose { .. } => "EXPOSE",
            StepAction::User { .. } => "USER",
            StepAction::Entrypoint { .. } => "ENTRYPOINT",
            StepAction::Cmd { .. } => "CMD",
            StepAction::Shell { .. } => "SHELL",
            StepAction::Stopsignal { .. } => "STOPSIGNAL",
        }
    }
}

/// Resolved COPY/ADD parameters.
#[derive(Debug, Clone, Serialize)]
pub struct CopySpec {
    /// Source patterns after expansion
    pub sources: Vec<String>,
    /// Absolute destination inside the image
    pub destination: String,
    /// Destination names a directory (trailing `/`, `.`, or several sources)
    pub dest_is_dir: bool,
    /// `--chown` value after expansion
    pub chown: Option<String>,
    /// Digest of the matched source contents
    pub content_digest: String,
    #[serde(skip)]
    pub matched: Vec<MatchedSource>,
}

/// The full plan for one build.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub steps: Vec<PlannedStep>,
    /// `--build-arg` names no ARG declared
    pub unused_args: Vec<String>,
}

impl BuildPlan {
    /// Resolves `dockerfile` for a build on top of `base`.
    pub fn new(
        dockerfile: &Dockerfile,
        context: &BuildContext,
        build_args: &HashMap<String, String>,
        base: &ImageConfig,
    ) -> Result<Self, BuildError> {
        PlanBuilder::new(dockerfile, context, build_args, base).build()
    }

    /// Chains step digests into cache keys, starting from the base image.
    ///
    /// The FROM step's key depends only on `base_image_id`; each later key
    /// hashes the previous key with the step digest.
    pub fn cache_keys(&self, base_image_id: &str) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.steps.len());
        let mut hasher = Sha256::new();
        hasher.update(b"from");
        hasher.update(base_image_id.as_bytes());
        let mut parent = format!("{:x}", hasher.finalize());

        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                let mut hasher = Sha256::new();
                hasher.update(parent.as_bytes());
                hasher.update(step.digest.as_bytes());
                parent = format!("{:x}", hasher.finalize());
            }
            keys.push(parent.clone());
        }

        keys
    }
}

/// Expands the FROM reference using global ARGs and `--build-arg` values.
pub fn base_reference(dockerfile: &Dockerfile, build_args: &HashMap<String, String>) -> Result<String, BuildError> {
    let scope = global_scope(dockerfile, build_args);
    let raw = dockerfile.base_image();
    let reference = scope
        .expand(raw)
        .map_err(|reason| BuildError::InvalidInstruction { step: 1, reason })?;
    if reference.trim().is_empty() {
        return Err(BuildError::InvalidInstruction {
            step: 1,
            reason: format!("FROM {} expands to an empty image reference", raw),
        });
    }
    Ok(reference)
}

fn global_scope(dockerfile: &Dockerfile, build_args: &HashMap<String, String>) -> Scope {
    let mut scope = Scope::new();
    for (name, default) in &dockerfile.global_args {
        let value = build_args.get(name).cloned().or_else(|| {
            default.as_ref().map(|d| scope.expand(d).unwrap_or_else(|_| d.clone()))
        });
        if let Some(value) = value {
            scope.set(name.clone(), value);
        }
    }
    scope
}

struct PlanBuilder<'a> {
    dockerfile: &'a Dockerfile,
    context: &'a BuildContext,
    build_args: &'a HashMap<String, String>,
    global: Scope,
    /// Variables visible to the current step (ARGs overlaid by ENV)
    scope: Scope,
    /// ARGs declared so far, in declaration order
    args: BTreeMap<String, Option<String>>,
    workdir: String,
}

impl<'a> PlanBuilder<'a> {
    fn new(
        dockerfile: &'a Dockerfile,
        context: &'a BuildContext,
        build_args: &'a HashMap<String, String>,
        base: &ImageConfig,
    ) -> Self {
        let mut scope = Scope::new();
        for (key, value) in base.process_env() {
            scope.set(key, value);
        }

        Self {
            dockerfile,
            context,
            build_args,
            global: global_scope(dockerfile, build_args),
            scope,
            args: BTreeMap::new(),
            workdir: if base.workdir.is_empty() { "/".to_string() } else { base.workdir.clone() },
        }
    }

    fn build(mut self) -> Result<BuildPlan, BuildError> {
        let mut steps = Vec::with_capacity(self.dockerfile.steps.len());

        for step in &self.dockerfile.steps {
            let action = self.resolve(step.number, &step.instruction)?;
            let digest = digest_action(&action);
            debug!(step = step.number, digest = %&digest[..12], "Planned {}", step.text);
            steps.push(PlannedStep {
                number: step.number,
                line: step.line,
                text: step.text.clone(),
                action,
                digest,
            });
        }

        let declared: Vec<&String> = self
            .dockerfile
            .global_args
            .iter()
            .map(|(name, _)| name)
            .chain(self.args.keys())
            .collect();
        let mut unused_args: Vec<String> =
            self.build_args.keys().filter(|k| !declared.contains(k)).cloned().collect();
        unused_args.sort();
        for name in &unused_args {
            warn!("Build argument {} was not consumed by any ARG", name);
        }

        Ok(BuildPlan { steps, unused_args })
    }

    fn expand(&self, step: usize, value: &str) -> Result<String, BuildError> {
        self.scope
            .expand(value)
            .map_err(|reason| BuildError::InvalidInstruction { step, reason })
    }

    fn resolve(&mut self, step: usize, instruction: &Instruction) -> Result<StepAction, BuildError> {
        let invalid = |reason: String| BuildError::InvalidInstruction { step, reason };

        Ok(match instruction {
            Instruction::From { image, platform } => StepAction::From {
                reference: self.global.expand(image).map_err(invalid)?,
                platform: platform.clone(),
            },

            Instruction::Workdir { path } => {
                let path = self.expand(step, path)?;
                self.workdir = absolutize(&self.workdir, &path);
                StepAction::Workdir { path: self.workdir.clone() }
            }

            Instruction::Copy { sources, destination, chown } => {
                StepAction::Copy(self.resolve_copy(step, sources, destination, chown.as_deref())?)
            }

            Instruction::Add { sources, destination, chown } => {
                StepAction::Add(self.resolve_copy(step, sources, destination, chown.as_deref())?)
            }

            Instruction::Run { command } => {
                let args = self
                    .args
                    .iter()
                    .filter_map(|(name, value)| {
                        // ENV wins over an ARG of the same name
                        let value = value.as_ref()?;
                        (self.scope.get(name) == Some(value.as_str())).then(|| (name.clone(), value.clone()))
                    })
                    .collect();
                StepAction::Run { command: command.clone(), args }
            }

            Instruction::Env { vars } => {
                let mut resolved = Vec::with_capacity(vars.len());
                // Docker expands every pair against the scope before the instruction
                for (key, value) in vars {
                    resolved.push((key.clone(), self.expand(step, value)?));
                }
                for (key, value) in &resolved {
                    self.scope.set(key.clone(), value.clone());
                }
                StepAction::Env { vars: resolved }
            }

            Instruction::Arg { name, default } => {
                let value = match self.build_args.get(name) {
                    Some(v) => Some(v.clone()),
                    None => match default {
                        Some(d) => Some(self.expand(step, d)?),
                        // Redeclaring a global ARG inherits its value
                        None => self.global.get(name).map(str::to_string),
                    },
                };
                self.args.insert(name.clone(), value.clone());
                if let Some(v) = &value {
                    self.scope.set(name.clone(), v.clone());
                }
                StepAction::Arg { name: name.clone(), value }
            }

            Instruction::Label { labels } => {
                let mut resolved = Vec::with_capacity(labels.len());
                for (key, value) in labels {
                    resolved.push((self.expand(step, key)?, self.expand(step, value)?));
                }
                StepAction::Label { labels: resolved }
            }

            Instruction::Expose { ports } => {
                let mut resolved = Vec::with_capacity(ports.len());
                for port in ports {
                    let expanded = self.expand(step, port)?;
                    for p in expanded.split_whitespace() {
                        resolved.push(normalize_port(p).map_err(invalid)?);
                    }
                }
                StepAction::Expose { ports: resolved }
            }

            Instruction::User { user } => StepAction::User { user: self.expand(step, user)? },

            Instruction::Entrypoint { command } => StepAction::Entrypoint { command: command.clone() },

            Instruction::Cmd { command } => StepAction::Cmd { command: command.clone() },

            Instruction::Shell { shell } => StepAction::Shell { shell: shell.clone() },

            Instruction::Stopsignal { signal } => StepAction::Stopsignal { signal: self.expand(step, signal)? },
        })
    }

    fn resolve_copy(
        &self,
        step: usize,
        sources: &[String],
        destination: &str,
        chown: Option<&str>,
    ) -> Result<CopySpec, BuildError> {
        let mut expanded = Vec::with_capacity(sources.len());
        let mut matched = Vec::new();

        for source in sources {
            let source = self.expand(step, source)?;
            if is_remote(&source) {
                return Err(BuildError::InvalidInstruction {
                    step,
                    reason: format!("remote source {} is not supported; download it in a RUN step", source),
                });
            }
            matched.extend(self.context.match_source(&source).map_err(|e| context_error(step, e))?);
            expanded.push(source);
        }

        let raw_dest = self.expand(step, destination)?;
        let dest_is_dir = raw_dest.ends_with('/')
            || raw_dest == "."
            || raw_dest.ends_with("/.")
            || matched.iter().any(|m| m.is_dir);

        if matched.len() > 1 && !dest_is_dir {
            return Err(BuildError::InvalidInstruction {
                step,
                reason: format!("with more than one source the destination must be a directory ending in '/', got {}", raw_dest),
            });
        }

        let chown = chown.map(|c| self.expand(step, c)).transpose()?;
        let content_digest = self.context.digest_sources(&matched).map_err(|e| context_error(step, e))?;

        Ok(CopySpec {
            sources: expanded,
            destination: absolutize(&self.workdir, &raw_dest),
            dest_is_dir: dest_is_dir || matched.len() > 1,
            chown,
            content_digest,
            matched,
        })
    }
}

fn digest_action(action: &StepAction) -> String {
    // Serializing enums of strings and vectors cannot fail.
    let canonical = serde_json::to_vec(action).unwrap_or_default();
    format!("{:x}", Sha256::digest(&canonical))
}

fn context_error(step: usize, err: ContextError) -> BuildError {
    match err {
        ContextError::Missing { path } => BuildError::MissingSource { step, path },
        ContextError::OutsideContext { path } => BuildError::InvalidInstruction {
            step,
            reason: format!("{} is outside the build context", path),
        },
        ContextError::InvalidPattern { pattern, reason } => BuildError::InvalidInstruction {
            step,
            reason: format!("invalid source pattern {}: {}", pattern, reason),
        },
        ContextError::Io { path, source } => BuildError::Io { path, source },
    }
}

fn is_remote(source: &str) -> bool {
    ["http://", "https://", "git@", "git://"].iter().any(|p| source.starts_with(p))
}

/// Joins `path` onto `base` unless it is absolute, then normalizes it.
pub fn absolutize(base: &str, path: &str) -> String {
    let joined = if path.starts_with('/') { path.to_string() } else { format!("{}/{}", base, path) };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Normalizes `port[/proto]` to `port/proto`.
fn normalize_port(port: &str) -> Result<String, String> {
    let (number, proto) = port.split_once('/').unwrap_or((port, "tcp"));
    let proto = proto.to_lowercase();
    if !matches!(proto.as_str(), "tcp" | "udp" | "sctp") {
        return Err(format!("invalid protocol in EXPOSE {}", port));
    }
    let valid = |n: &str| n.parse::<u16>().map(|n| n > 0).unwrap_or(false);
    // Ranges such as 8000-8010 are allowed
    let ok = match number.split_once('-') {
        Some((lo, hi)) => valid(lo) && valid(hi),
        None => valid(number),
    };
    if !ok {
        return Err(format!("invalid port in EXPOSE {}", port));
    }
    Ok(format!("{}/{}", number, proto))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::parser::parse_dockerfile;
    use tempfile::TempDir;

    const APP: &str = r#"
FROM python:3.8-slim
WORKDIR /app
COPY requirements.txt .
RUN pip install -r requirements.txt
COPY . .
CMD ["python", "main.py"]
"#;

    fn context() -> (TempDir, BuildContext) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "flask==2.0\n").unwrap();
        std::fs::write(dir.path().join("main.py"), "print('hi')\n").unwrap();
        let ctx = BuildContext::open(dir.path()).unwrap();
        (dir, ctx)
    }

    fn plan(dockerfile: &str, ctx: &BuildContext) -> Result<BuildPlan, BuildError> {
        let parsed = parse_dockerfile(dockerfile).unwrap();
        BuildPlan::new(&parsed, ctx, &HashMap::new(), &ImageConfig::scratch())
    }

    #[test]
    fn test_app_plan_resolves_destinations() {
        let (_dir, ctx) = context();
        let plan = plan(APP, &ctx).unwrap();
        assert_eq!(plan.steps.len(), 6);

        match &plan.steps[2].action {
            StepAction::Copy(spec) => {
                assert_eq!(spec.destination, "/app");
                assert!(spec.dest_is_dir);
                assert_eq!(spec.matched.len(), 1);
            }
            other => panic!("Expected COPY, got {:?}", other),
        }
    }

    #[test]
    fn test_keys_chain_and_invalidate_downstream() {
        let (dir, ctx) = context();
        let before = plan(APP, &ctx).unwrap().cache_keys("sha256:base");

        std::fs::write(dir.path().join("requirements.txt"), "flask==2.1\n").unwrap();
        let after = plan(APP, &ctx).unwrap().cache_keys("sha256:base");

        // FROM and WORKDIR unchanged; the COPY and everything after it differ
        assert_eq!(before[0], after[0]);
        assert_eq!(before[1], after[1]);
        for i in 2..6 {
            assert_ne!(before[i], after[i], "step {} should be invalidated", i + 1);
        }
    }

    #[test]
    fn test_keys_depend_on_base_image() {
        let (_dir, ctx) = context();
        let plan = plan(APP, &ctx).unwrap();
        let a = plan.cache_keys("sha256:one");
        let b = plan.cache_keys("sha256:two");
        assert!(a.iter().zip(&b).all(|(x, y)| x != y));
        assert_eq!(a, plan.cache_keys("sha256:one"));
    }

    #[test]
    fn test_missing_source_is_reported_with_step() {
        let (_dir, ctx) = context();
        let err = plan("FROM scratch\nRUN echo hi\nCOPY nope.txt /\n", &ctx).unwrap_err();
        match err {
            BuildError::MissingSource { step, path } => {
                assert_eq!(step, 3);
                assert_eq!(path, "nope.txt");
            }
            other => panic!("Expected MissingSource, got {:?}", other),
        }
    }

    #[test]
    fn test_copy_and_add_resolve_alike() {
        let (_dir, ctx) = context();
        let plan = plan("FROM scratch\nCOPY main.py /srv/\nADD main.py /srv/\n", &ctx).unwrap();

        let (StepAction::Copy(copy), StepAction::Add(add)) = (&plan.steps[1].action, &plan.steps[2].action) else {
            panic!("Expected COPY then ADD, got {:?}", plan.steps);
        };
        assert_eq!(copy.destination, add.destination);
        assert_eq!(copy.dest_is_dir, add.dest_is_dir);
        assert_eq!(copy.matched.len(), add.matched.len());
    }

    #[test]
    fn test_remote_add_is_rejected() {
        let (_dir, ctx) = context();
        let err = plan("FROM scratch\nADD https://example.com/x.tgz /opt/\n", &ctx).unwrap_err();
        assert!(matches!(err, BuildError::InvalidInstruction { step: 2, .. }));
    }

    #[test]
    fn test_multiple_sources_need_directory() {
        let (_dir, ctx) = context();
        let err = plan("FROM scratch\nCOPY main.py requirements.txt /app\n", &ctx).unwrap_err();
        assert!(matches!(err, BuildError::InvalidInstruction { step: 2, .. }));
        assert!(plan("FROM scratch\nCOPY main.py requirements.txt /app/\n", &ctx).is_ok());
    }

    #[test]
    fn test_args_env_and_expansion() {
        let (_dir, ctx) = context();
        let dockerfile = r#"
ARG PY=3.8
FROM python:${PY}-slim
ARG PY
ARG APP_HOME=/srv
ENV HOME_DIR=$APP_HOME/app
WORKDIR ${HOME_DIR}
RUN pip install .
EXPOSE 8080 53/udp
"#;
        let parsed = parse_dockerfile(dockerfile).unwrap();
        let mut args = HashMap::new();
        args.insert("APP_HOME".to_string(), "/opt".to_string());
        args.insert("UNUSED".to_string(), "1".to_string());

        assert_eq!(base_reference(&parsed, &args).unwrap(), "python:3.8-slim");

        let plan = BuildPlan::new(&parsed, &ctx, &args, &ImageConfig::scratch()).unwrap();
        assert!(matches!(&plan.steps[0].action, StepAction::From { reference, .. } if reference == "python:3.8-slim"));
        assert!(matches!(&plan.steps[1].action, StepAction::Arg { value: Some(v), .. } if v == "3.8"));
        assert!(matches!(&plan.steps[4].action, StepAction::Workdir { path } if path == "/opt/app"));
        match &plan.steps[5].action {
            StepAction::Run { args, .. } => {
                assert!(args.contains(&("APP_HOME".to_string(), "/opt".to_string())));
            }
            other => panic!("Expected RUN, got {:?}", other),
        }
        assert!(matches!(&plan.steps[6].action, StepAction::Expose { ports } if ports == &vec!["8080/tcp".to_string(), "53/udp".to_string()]));
        assert_eq!(plan.unused_args, vec!["UNUSED".to_string()]);
    }

    #[test]
    fn test_build_arg_changes_run_key() {
        let (_dir, ctx) = context();
        let parsed = parse_dockerfile("FROM scratch\nARG MODE=dev\nRUN make $MODE\n").unwrap();

        let dev = BuildPlan::new(&parsed, &ctx, &HashMap::new(), &ImageConfig::scratch()).unwrap();
        let mut args = HashMap::new();
        args.insert("MODE".to_string(), "prod".to_string());
        let prod = BuildPlan::new(&parsed, &ctx, &args, &ImageConfig::scratch()).unwrap();

        assert_ne!(dev.steps[2].digest, prod.steps[2].digest);
    }

    #[test]
    fn test_absolutize() {
        assert_eq!(absolutize("/", "app"), "/app");
        assert_eq!(absolutize("/app", "."), "/app");
        assert_eq!(absolutize("/app", "../srv/"), "/srv");
        assert_eq!(absolutize("/app", "/opt"), "/opt");
        assert_eq!(absolutize("/", "../.."), "/");
    }

    #[test]
    fn test_invalid_expose() {
        let (_dir, ctx) = context();
        assert!(plan("FROM scratch\nEXPOSE 99999\n", &ctx).is_err());
        assert!(plan("FROM scratch\nEXPOSE 80/http\n", &ctx).is_err());
    }
}
