use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mediagrab::cli::{Cli, Commands, Target};
use mediagrab::config::Config;
use mediagrab::output;
use mediagrab::pipeline::{AcquisitionPipeline, MetadataRecord, TaskOutput, TranscriptOutcome, WorkerEvent};
use mediagrab::utils;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "mediagrab=debug" } else { "mediagrab=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::load().await?;

    match cli.command {
        Commands::Metadata(target) => {
            let pipeline = prepare(&config).await;
            let save_dir = save_dir(&target, &config);

            let path = pipeline.run_metadata_only(&target.url, &save_dir).await?;
            let content = fs_err::read_to_string(&path)?;
            let record: MetadataRecord =
                serde_json::from_str(&content).context("Failed to read back saved metadata")?;

            output::print_metadata(&record);
            println!("{} {}", style("Metadata saved to:").green(), path.display());
        }
        Commands::Transcript(target) => {
            let pipeline = prepare(&config).await;
            let save_dir = save_dir(&target, &config);

            match pipeline.run_transcript_only(&target.url, &save_dir).await? {
                TranscriptOutcome::Unavailable => {
                    println!("{}", style(mediagrab::pipeline::NO_TRANSCRIPT).yellow());
                }
                TranscriptOutcome::Saved { language, path, .. } => {
                    println!(
                        "{} {} ({})",
                        style("Transcript saved to:").green(),
                        path.display(),
                        language
                    );
                }
            }
        }
        Commands::Audio(target) => {
            let pipeline = prepare(&config).await;
            let save_dir = save_dir(&target, &config);

            let path = run_audio(&pipeline, &target.url, &save_dir, cli.quiet).await?;
            let size = fs_err::metadata(&path)?.len();
            println!(
                "{} {} ({})",
                style("Audio saved to:").green(),
                path.display(),
                utils::format_file_size(size)
            );
        }
        Commands::All(target) => {
            let pipeline = prepare(&config).await;
            let save_dir = save_dir(&target, &config);

            let (tx, rx) = mpsc::unbounded_channel();
            let renderer = tokio::spawn(render_events(rx, cli.quiet));

            let summary = tokio::select! {
                summary = pipeline.run_all(&target.url, &save_dir, tx) => summary,
                _ = tokio::signal::ctrl_c() => {
                    anyhow::bail!("Interrupted");
                }
            };
            let _ = renderer.await;
            let summary = summary?;

            println!("{} {}", style("Metadata saved to:").green(), summary.metadata.display());
            match summary.transcript.path() {
                Some(path) => println!("{} {}", style("Transcript saved to:").green(), path.display()),
                None => println!("{}", style(summary.transcript.text()).yellow()),
            }
            println!("{} {}", style("Audio saved to:").green(), summary.audio.display());
        }
        Commands::Config { show } => {
            if show {
                config.display();
            } else {
                println!("Configuration file: {}", Config::config_path()?.display());
                println!("Edit it to change defaults, or run `mediagrab config --show` to inspect them.");
            }
        }
        Commands::Platforms => {
            println!("Supported platforms:");
            println!("  • YouTube (youtube.com, youtu.be)");
        }
    }

    Ok(())
}

/// Warn about missing tools and build the pipeline
async fn prepare(config: &Config) -> AcquisitionPipeline {
    let missing_deps = utils::check_dependencies(&config.engine.yt_dlp_path).await;
    if !missing_deps.is_empty() {
        eprintln!("{}", style("⚠️  Dependency check warnings:").yellow());
        for dep in missing_deps {
            eprintln!("   • {}", dep);
        }
        eprintln!("   (Continuing anyway - tools may be available)");
    }

    AcquisitionPipeline::new(config)
}

fn save_dir(target: &Target, config: &Config) -> PathBuf {
    target
        .output_dir
        .clone()
        .or_else(|| config.app.save_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Drive an audio worker, rendering its events and stopping it on Ctrl-C
async fn run_audio(pipeline: &AcquisitionPipeline, url: &str, save_dir: &Path, quiet: bool) -> Result<PathBuf> {
    let (tx, rx) = mpsc::unbounded_channel();
    let renderer = tokio::spawn(render_events(rx, quiet));

    let worker = match pipeline.prepare_audio(url, save_dir, tx).await {
        Ok(worker) => worker,
        Err(e) => {
            let _ = renderer.await;
            return Err(e.into());
        }
    };

    let handle = worker.handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", style("Stopping after the current step…").yellow());
            handle.stop();
        }
    });

    let result = worker.run().await;
    interrupt.abort();
    let _ = renderer.await;

    match result? {
        TaskOutput::Audio(path) => Ok(path),
        other => anyhow::bail!("Unexpected worker output: {:?}", other),
    }
}

/// Render worker events until the channel closes
async fn render_events(mut events: mpsc::UnboundedReceiver<WorkerEvent>, quiet: bool) {
    let progress = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(100)
    };
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
    {
        progress.set_style(bar_style.progress_chars("#>-"));
    }

    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Progress(update) => {
                progress.set_position((update.fraction * 100.0).round() as u64);
                progress.set_message(update.phase.to_string());
            }
            WorkerEvent::Log(line) => progress.println(line),
            WorkerEvent::Error(report) => {
                let message = if report.cancelled { "Cancelled" } else { "Failed" };
                progress.abandon_with_message(message);
            }
            WorkerEvent::Finished => progress.finish_with_message("Done"),
        }
    }
}
