use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use strata_core::builder::BuildError;
use strata_core::config::{Isolation, PullPolicy};
use strata_core::Config;

mod commands;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Layered container image builder", long_about = None)]
struct Cli {
    /// Log level (overrides the configured one; RUST_LOG wins over both)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Data directory (images, blobs, cache)
    #[arg(long, global = true, env = "STRATA_DATA_DIR")]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image from a Dockerfile
    Build {
        /// Build context directory
        #[arg(default_value = ".")]
        context: String,

        /// Name and optionally a tag (name:tag)
        #[arg(short, long)]
        tag: Option<String>,

        /// Path to the Dockerfile (default: <context>/Dockerfile)
        #[arg(short, long)]
        file: Option<String>,

        /// Build-time variables (KEY=VALUE)
        #[arg(long = "build-arg")]
        build_arg: Vec<String>,

        /// Do not reuse cached layers
        #[arg(long)]
        no_cache: bool,

        /// When to pull the base image (missing, always, never)
        #[arg(long)]
        pull: Option<PullPolicy>,

        /// Per-step timeout in seconds (0 disables it)
        #[arg(long)]
        timeout: Option<u64>,

        /// How RUN steps are isolated (auto, chroot, host)
        #[arg(long)]
        isolation: Option<Isolation>,

        /// Only print the image ID
        #[arg(short, long)]
        quiet: bool,
    },

    /// Run a container from an image
    Run {
        /// Image tag or ID
        image: String,

        /// Arguments replacing the image's CMD
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,

        /// Environment variables (KEY=VALUE)
        #[arg(short, long)]
        env: Vec<String>,

        /// Working directory inside the container
        #[arg(short, long)]
        workdir: Option<String>,

        /// User to run as
        #[arg(short, long)]
        user: Option<String>,

        /// Override the image's ENTRYPOINT
        #[arg(long)]
        entrypoint: Option<String>,

        /// How the container is isolated (auto, chroot, host)
        #[arg(long)]
        isolation: Option<Isolation>,

        /// Keep the container's files after it exits
        #[arg(long)]
        keep: bool,
    },

    /// Pull an image from a registry
    Pull {
        /// Image reference (e.g., "alpine:3.19")
        image: String,
    },

    /// List images
    Images,

    /// Show the history of an image
    History {
        /// Image tag or ID
        image: String,
    },

    /// Display detailed information on an image
    Inspect {
        /// Image tag or ID
        image: String,
    },

    /// Remove image tags, deleting images no tag points at
    Rmi {
        /// Image tags or IDs
        #[arg(required = true)]
        images: Vec<String>,

        /// Remove an image by ID even if it is tagged
        #[arg(short, long)]
        force: bool,
    },

    /// Manage the build cache
    #[command(subcommand)]
    Cache(CacheCommands),
}

#[derive(Subcommand)]
enum CacheCommands {
    /// List cached layers
    Ls,

    /// Evict least recently used layers down to a size
    Prune {
        /// Target size in bytes (default: configured limit)
        #[arg(long)]
        keep_bytes: Option<u64>,
    },

    /// Remove every cached layer
    Clear,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = Config::load()?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    if let Err(e) = strata_core::init_observability(&config.log_level) {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }

    match cli.command {
        Commands::Build { context, tag, file, build_arg, no_cache, pull, timeout, isolation, quiet } => {
            if let Some(policy) = pull {
                config.pull_policy = policy;
            }
            if let Some(isolation) = isolation {
                config.isolation = isolation;
            }
            if let Some(secs) = timeout {
                config.step_timeout_secs = secs;
            }

            let build_args = commands::parse_key_values(&build_arg, "build arg")?;
            let request = commands::build::BuildRequest {
                context,
                tag,
                dockerfile: file,
                build_args,
                no_cache,
                quiet,
            };
            commands::build::build(request, &config).await?;
        }

        Commands::Run { image, args, env, workdir, user, entrypoint, isolation, keep } => {
            if let Some(isolation) = isolation {
                config.isolation = isolation;
            }

            let env = commands::parse_key_values(&env, "env")?;
            let request = commands::run::RunRequest { image, args, env, workdir, user, entrypoint, keep };
            return commands::run::run(request, &config).await;
        }

        Commands::Pull { image } => {
            commands::pull::pull(&image, &config).await?;
        }

        Commands::Images => {
            commands::images::images(&config).await?;
        }

        Commands::History { image } => {
            commands::image::history(&image, &config).await?;
        }

        Commands::Inspect { image } => {
            commands::image::inspect(&image, &config).await?;
        }

        Commands::Rmi { images, force } => {
            commands::image::rmi(&images, force, &config).await?;
        }

        Commands::Cache(cache_cmd) => match cache_cmd {
            CacheCommands::Ls => commands::cache::ls(&config)?,
            CacheCommands::Prune { keep_bytes } => commands::cache::prune(keep_bytes, &config)?,
            CacheCommands::Clear => commands::cache::clear(&config)?,
        },
    }

    Ok(0)
}

/// Build failures carry their own exit codes; anything else exits 1.
fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<BuildError>().map(BuildError::exit_code).unwrap_or(1)
}
