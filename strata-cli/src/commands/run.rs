//! Run command implementation for Strata CLI.
//!
//! Creates a container from an image and runs its process in the
//! foreground. The CLI exits with the container's exit code.

use super::open_store;
use anyhow::{Context, Result};
use colored::Colorize;
use strata_core::runtime::{Container, RunOverrides};
use strata_core::Config;
use tracing::warn;

/// Arguments of `strata run`.
pub struct RunRequest {
    pub image: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
    pub user: Option<String>,
    /// An empty string clears the image entrypoint
    pub entrypoint: Option<String>,
    pub keep: bool,
}

/// Runs a container and returns its exit code.
pub async fn run(request: RunRequest, config: &Config) -> Result<i32> {
    let store = open_store(config).await?;
    let image = store.resolve(&request.image).await.with_context(|| format!("No such image: {}", request.image))?;

    let overrides = RunOverrides {
        args: request.args,
        entrypoint: request.entrypoint.map(entrypoint_override),
        env: request.env,
        workdir: request.workdir,
        user: request.user,
    };

    let mut container = Container::create(&store, &image, &config.containers_path(), config.isolation, &overrides)
        .with_context(|| format!("Failed to create container from {}", request.image))?;
    container.start().context("Failed to start container")?;

    let exited = tokio::select! {
        code = container.wait() => Some(code?),
        _ = tokio::signal::ctrl_c() => None,
    };
    let code = match exited {
        Some(code) => code,
        None => {
            eprintln!("{}", "Interrupted, killing container".yellow());
            container.kill().await?;
            container.state().exit_code().unwrap_or(1)
        }
    };

    if request.keep {
        eprintln!("Container files kept at {}", container.dir.display().to_string().yellow());
    } else {
        let dir = container.dir.clone();
        if let Err(e) = container.remove() {
            warn!(dir = %dir.display(), error = %e, "Failed to remove container files");
        }
    }

    Ok(code)
}

fn entrypoint_override(entrypoint: String) -> Vec<String> {
    if entrypoint.is_empty() {
        Vec::new()
    } else {
        vec![entrypoint]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entrypoint_override() {
        assert_eq!(entrypoint_override("/bin/sh".into()), vec!["/bin/sh"]);
        assert!(entrypoint_override(String::new()).is_empty());
    }
}
