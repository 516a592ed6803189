//! End-to-end tests for the build pipeline.
//!
//! A local `python:3.8-slim` stand-in is published into a temporary store
//! and `pip install` is simulated by a scripted runner, so these tests need
//! neither network access nor a Python toolchain.
//!
//! ```bash
//! cargo test -p strata-core --test build_pipeline
//! ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use strata_core::builder::layer::{LayerWriter, Owner};
use strata_core::builder::runner::{OutputSink, ProcessSpec, RunOutput, RunRequest, RunnerError};
use strata_core::builder::{
    parse_dockerfile, BuildContext, BuildError, BuildOptions, BuildReport, Builder, LayerCache, StepRunner,
    StoreResolver,
};
use strata_core::config::{Isolation, PullPolicy};
use strata_core::events::OutputStream;
use strata_core::runtime::{process_for, Container, RunOverrides};
use strata_core::types::{Image, ImageConfig, ImageReference, LayerDescriptor};
use strata_core::ImageStore;
use tempfile::TempDir;

const DOCKERFILE: &str = r#"
FROM python:3.8-slim
WORKDIR /app
COPY requirements.txt .
RUN pip install -r requirements.txt
COPY . .
CMD ["python", "main.py"]
"#;

/// Installs each line of requirements.txt as a file under site-packages.
#[derive(Default)]
struct FakePip {
    calls: Mutex<Vec<ProcessSpec>>,
}

#[async_trait]
impl StepRunner for FakePip {
    async fn run(&self, request: &RunRequest, sink: OutputSink) -> Result<RunOutput, RunnerError> {
        self.calls.lock().unwrap().push(request.process.clone());

        let workdir = request.rootfs.join(request.process.workdir.trim_start_matches('/'));
        let requirements = std::fs::read_to_string(workdir.join("requirements.txt")).unwrap_or_default();
        let site = request.rootfs.join("usr/local/lib/python3.8/site-packages");
        std::fs::create_dir_all(&site).unwrap();

        for package in requirements.lines().filter(|l| !l.trim().is_empty()) {
            if package == "broken-pkg" {
                let line = format!("ERROR: No matching distribution found for {}", package);
                sink(OutputStream::Stderr, line.clone());
                return Ok(RunOutput { exit_code: 1, tail: line });
            }
            sink(OutputStream::Stdout, format!("Successfully installed {}", package));
            std::fs::write(site.join(package), b"installed").unwrap();
        }
        Ok(RunOutput { exit_code: 0, tail: String::new() })
    }
}

struct Harness {
    temp: TempDir,
    store: ImageStore,
    builder: Builder,
    pip: Arc<FakePip>,
}

impl Harness {
    async fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let store = ImageStore::open(&temp.path().join("data")).await.unwrap();
        publish_python_base(&store, temp.path()).await;

        let cache = Arc::new(LayerCache::with_config(temp.path().join("data/cache/layers"), u64::MAX).unwrap());
        let resolver = Arc::new(StoreResolver::new(store.clone(), PullPolicy::Never));
        let pip = Arc::new(FakePip::default());
        let builder = Builder::new(store.clone(), cache, resolver, pip.clone(), temp.path().join("data/builds"));

        let harness = Self { temp, store, builder, pip };
        harness.write("requirements.txt", "flask\nrequests\n");
        harness.write("main.py", "print('hello')\n");
        harness
    }

    fn context_dir(&self) -> PathBuf {
        self.temp.path().join("ctx")
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.context_dir().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    async fn build(&self) -> Result<BuildReport, BuildError> {
        let dockerfile = parse_dockerfile(DOCKERFILE).unwrap();
        let context = BuildContext::open(&self.context_dir()).unwrap();
        let options = BuildOptions { tag: Some("myapp:latest".into()), ..BuildOptions::new(self.context_dir()) };
        self.builder.build(&dockerfile, &context, &options).await
    }

    fn pip_runs(&self) -> usize {
        self.pip.calls.lock().unwrap().len()
    }
}

async fn publish_python_base(store: &ImageStore, scratch: &Path) {
    let mut writer = LayerWriter::new(scratch);
    writer.add_bytes("usr/local/bin/python", b"#!/bin/sh\necho python\n".to_vec(), 0o755, Owner::default());
    writer.add_dir("usr/local/lib/python3.8/site-packages", 0o755, Owner::default());
    let blob = writer.finish().unwrap();
    let info = store.blobs().import_file(blob.file.path(), &blob.digest).unwrap();

    let mut config = ImageConfig::scratch();
    config.set_env("PATH", "/usr/local/bin:/usr/bin:/bin");
    config.set_env("LANG", "C.UTF-8");
    config.cmd = vec!["python3".into()];
    let layer = LayerDescriptor { digest: info.digest, size: info.size, created_by: "base".into() };
    let image = Image::new(config, vec![layer], vec![], None);
    store.publish(&image, Some(&ImageReference::parse("python:3.8-slim").unwrap())).await.unwrap();
}

fn cached_steps(report: &BuildReport) -> Vec<usize> {
    report
        .steps
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_cached())
        .map(|(i, _)| i + 1)
        .collect()
}

#[tokio::test]
async fn test_python_app_build() {
    let h = Harness::new().await;
    let report = h.build().await.unwrap();

    let image = &report.image;
    assert_eq!(image.config.workdir, "/app");
    assert_eq!(image.config.cmd, vec!["python", "main.py"]);
    assert_eq!(image.config.env_get("LANG"), Some("C.UTF-8"));
    assert_eq!(image.parent.as_deref(), Some("python:3.8-slim"));
    // Base layer plus WORKDIR, COPY, RUN, COPY
    assert_eq!(image.layers.len(), 5);
    assert_eq!(h.store.resolve("myapp").await.unwrap().id, image.id);

    let call = &h.pip.calls.lock().unwrap()[0];
    assert_eq!(call.workdir, "/app");
    assert_eq!(call.argv, vec!["/bin/sh", "-c", "pip install -r requirements.txt"]);
    assert!(call.env.contains(&("LANG".to_string(), "C.UTF-8".to_string())));

    let rootfs = h.temp.path().join("inspect");
    h.store.materialize(image, &rootfs).unwrap();
    assert_eq!(std::fs::read_to_string(rootfs.join("app/main.py")).unwrap(), "print('hello')\n");
    assert!(rootfs.join("usr/local/lib/python3.8/site-packages/flask").exists());
    assert!(rootfs.join("usr/local/bin/python").exists());
}

#[tokio::test]
async fn test_unchanged_rebuild_is_reproducible() {
    let h = Harness::new().await;
    let first = h.build().await.unwrap();
    let second = h.build().await.unwrap();

    assert_eq!(first.image.id, second.image.id);
    assert_eq!(first.image.config, second.image.config);
    assert_eq!(second.cached_steps(), second.steps.len());
    assert_eq!(h.pip_runs(), 1);
}

#[tokio::test]
async fn test_source_change_keeps_install_cached() {
    let h = Harness::new().await;
    let first = h.build().await.unwrap();

    h.write("main.py", "print('changed')\n");
    let second = h.build().await.unwrap();

    assert_eq!(cached_steps(&second), vec![1, 2, 3, 4]);
    assert_ne!(first.image.id, second.image.id);
    assert_eq!(h.pip_runs(), 1);
}

#[tokio::test]
async fn test_requirements_change_reruns_install() {
    let h = Harness::new().await;
    h.build().await.unwrap();

    h.write("requirements.txt", "flask\nrequests\nnumpy\n");
    let report = h.build().await.unwrap();

    assert_eq!(cached_steps(&report), vec![1, 2]);
    assert_eq!(h.pip_runs(), 2);

    let rootfs = h.temp.path().join("inspect");
    h.store.materialize(&report.image, &rootfs).unwrap();
    assert!(rootfs.join("usr/local/lib/python3.8/site-packages/numpy").exists());
}

#[tokio::test]
async fn test_failed_install_leaves_previous_image_tagged() {
    let h = Harness::new().await;
    let good = h.build().await.unwrap();

    h.write("requirements.txt", "flask\nbroken-pkg\n");
    let err = h.build().await.unwrap_err();

    match &err {
        BuildError::DependencyInstallFailed { step, exit_code, output } => {
            assert_eq!(*step, 4);
            assert_eq!(*exit_code, 1);
            assert!(output.contains("broken-pkg"));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(h.store.resolve("myapp:latest").await.unwrap().id, good.image.id);
    assert_eq!(h.store.state().list_images().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_missing_requirements_fails_before_any_run() {
    let h = Harness::new().await;
    std::fs::remove_file(h.context_dir().join("requirements.txt")).unwrap();

    let err = h.build().await.unwrap_err();
    assert!(matches!(err, BuildError::MissingSource { step: 3, ref path } if path == "requirements.txt"));
    assert_eq!(h.pip_runs(), 0);
    assert!(h.store.resolve("myapp").await.is_err());
}

#[tokio::test]
async fn test_container_uses_workdir_and_default_command() {
    let h = Harness::new().await;
    let image = h.build().await.unwrap().image;

    let process = process_for(&image, &RunOverrides::default());
    assert_eq!(process.argv, vec!["python", "main.py"]);
    assert_eq!(process.workdir, "/app");

    // The stand-in interpreter is not runnable on the host, so check the
    // working directory with a shell instead
    let overrides = RunOverrides {
        entrypoint: Some(vec!["/bin/sh".into(), "-c".into()]),
        args: vec!["pwd > cwd.txt".into()],
        ..Default::default()
    };
    let containers = h.temp.path().join("data/containers");
    let mut container = Container::create(&h.store, &image, &containers, Isolation::Host, &overrides).unwrap();
    assert_eq!(container.run().await.unwrap(), 0);

    let app = container.rootfs.join("app");
    let cwd = std::fs::read_to_string(app.join("cwd.txt")).unwrap();
    assert_eq!(Path::new(cwd.trim()).canonicalize().unwrap(), app.canonicalize().unwrap());
    assert!(app.join("main.py").exists());
    container.remove().unwrap();
}
