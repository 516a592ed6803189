//! Build command implementation for Strata CLI.
//!
//! Builds images from Dockerfiles, rendering step progress from the build's
//! event stream.

use anyhow::{Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use strata_core::builder::{build_image, BuildError, BuildOptions, BuildReport};
use strata_core::events::{EventBus, EventKind, EventSubscriber, OutputStream};
use strata_core::types::short_digest;
use strata_core::Config;

/// Arguments of `strata build`.
pub struct BuildRequest {
    pub context: String,
    pub tag: Option<String>,
    pub dockerfile: Option<String>,
    pub build_args: Vec<(String, String)>,
    pub no_cache: bool,
    pub quiet: bool,
}

/// Builds an image from a Dockerfile.
///
/// Ctrl-C drops the build, which kills any running step and publishes
/// nothing.
pub async fn build(request: BuildRequest, config: &Config) -> Result<()> {
    let quiet = request.quiet;
    let options = BuildOptions {
        dockerfile: request.dockerfile.map(PathBuf::from),
        tag: request.tag,
        build_args: request.build_args.into_iter().collect(),
        no_cache: request.no_cache,
        ..BuildOptions::new(&request.context)
    };

    if !quiet {
        let target = options.tag.as_deref().unwrap_or("<untagged>");
        println!("{} Building {} from {}", "»".bold().blue(), target.green(), request.context.cyan());
        if options.no_cache {
            println!("  {}", "Cache disabled".yellow());
        }
    }

    let events = EventBus::new();
    let progress = tokio::spawn(render_progress(events.subscribe(vec![]), quiet));

    let result = tokio::select! {
        result = build_image(options, config, events.clone()) => result,
        _ = tokio::signal::ctrl_c() => Err(BuildError::Cancelled),
    };

    // The renderer stops once the last sender is gone
    drop(events);
    let _ = progress.await;

    let report = result.context("Build failed")?;

    if quiet {
        println!("{}", report.image.id);
    } else {
        print_summary(&report);
    }
    Ok(())
}

fn print_summary(report: &BuildReport) {
    let total = report.steps.len();
    let cached = report.cached_steps();

    println!();
    println!("{}", "Build completed successfully!".green().bold());
    println!();
    println!("  Image ID:    {}", report.image.short_id().cyan());
    if let Some(tag) = &report.tag {
        println!("  Tagged:      {}", tag.to_string().green());
    }
    println!("  Layers:      {}", report.image.layers.len());
    println!("  Steps:       {} ({} cached)", total, cached);
    println!("  Total size:  {:.1} MB", report.image.size_bytes as f64 / 1024.0 / 1024.0);
    println!("  Duration:    {}", format_duration(report.duration.as_secs_f64()).yellow());

    if cached > 0 && total > 0 {
        println!("  Cache hit:   {:.0}%", (cached as f64 / total as f64) * 100.0);
    }
    if !report.unused_args.is_empty() {
        println!("  {} build args were not consumed: {}", "Warning:".yellow(), report.unused_args.join(", "));
    }

    if let Some(tag) = &report.tag {
        println!();
        println!("  Run with: {}", format!("strata run {}", tag).cyan());
    }
}

/// Draws a progress bar and echoes step output until the build ends.
async fn render_progress(mut events: EventSubscriber, quiet: bool) {
    let pb = if quiet { ProgressBar::hidden() } else { ProgressBar::new(0) };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );

    while let Some(event) = events.recv().await {
        match event.kind {
            EventKind::BuildStarted { total_steps } => pb.set_length(total_steps as u64),
            EventKind::ImagePulled { reference, image_id } => {
                pb.println(format!("  Pulled {} ({})", reference.green(), short_digest(&image_id)));
            }
            EventKind::StepStarted { step, total, instruction } => {
                pb.println(format!("{} {}", format!("[{}/{}]", step, total).bold().blue(), instruction));
                pb.set_message(format!("Step {}", step));
            }
            EventKind::StepCached { .. } => {
                pb.println(format!("  {}", "---> Using cache".dimmed()));
                pb.inc(1);
            }
            EventKind::StepOutput { line, stream, .. } => match stream {
                OutputStream::Stdout => pb.println(format!("  {}", line)),
                OutputStream::Stderr => pb.println(format!("  {}", line.yellow())),
            },
            EventKind::StepFinished { duration_ms, layer, .. } => {
                let layer = layer.as_deref().map(short_digest).unwrap_or("no changes");
                pb.println(format!(
                    "  {} {} in {}",
                    "--->".dimmed(),
                    layer,
                    format_duration(duration_ms as f64 / 1000.0)
                ));
                pb.inc(1);
            }
            EventKind::BuildCompleted { .. } => pb.finish_with_message("Build complete"),
            EventKind::BuildFailed { step, .. } => {
                let msg = match step {
                    Some(step) => format!("Failed at step {}", step),
                    None => "Failed".to_string(),
                };
                pb.abandon_with_message(msg.red().to_string());
            }
            _ => {}
        }
    }

    if !pb.is_finished() {
        pb.abandon();
    }
}

/// Formats a duration in seconds to a human-readable string.
fn format_duration(secs: f64) -> String {
    if secs < 1.0 {
        format!("{:.0}ms", secs * 1000.0)
    } else if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        let mins = (secs / 60.0).floor();
        let remaining_secs = secs - (mins * 60.0);
        format!("{:.0}m{:.0}s", mins, remaining_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration_milliseconds() {
        assert_eq!(format_duration(0.123), "123ms");
    }

    #[test]
    fn test_format_duration_seconds() {
        assert_eq!(format_duration(5.7), "5.7s");
    }

    #[test]
    fn test_format_duration_minutes() {
        assert_eq!(format_duration(125.0), "2m5s");
    }

    #[tokio::test]
    async fn test_renderer_stops_when_bus_dropped() {
        let bus = EventBus::new();
        let renderer = tokio::spawn(render_progress(bus.subscribe(vec![]), true));

        bus.emit("b", EventKind::BuildStarted { total_steps: 1 });
        bus.emit("b", EventKind::StepCached { step: 1, cache_key: "k".into() });
        drop(bus);

        tokio::time::timeout(std::time::Duration::from_secs(1), renderer).await.unwrap().unwrap();
    }
}
