//! Roomie CLI
//!
//! Command-line interface for the room design pipeline:
//! normalize a photo, submit it with the room brief, print the proposal.
//!
//! Copyright (c) 2025 Michael A Wright

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use core_pipeline::{normalize, DesignResult, RawImage};
use llm_bridge::{
    CancellationToken, DesignPipeline, GeminiClient, InferenceBackend, PipelineConfig,
    ScriptedBackend,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ncommit: ",
    env!("BUILT_GIT_COMMIT_HASH"),
    "\nbuilt: ",
    env!("BUILT_TIME_UTC"),
    "\nhost: ",
    env!("BUILT_HOST"),
);

/// Canned reply used by `design --dry-run`
const DRY_RUN_PAYLOAD: &str = r##"{
  "analysis": "Dry run: no photo was analyzed.",
  "colors": [{"hex": "#F4EFE6", "name": "Warm white", "desc": "Neutral base that keeps small rooms open"}],
  "layout": "Dry run: keep the walkway from the door to the window clear.",
  "items": [{"name": "Storage bed", "style": "Minimal", "reason": "Frees floor space"}]
}"##;

#[derive(Parser)]
#[command(name = "roomie")]
#[command(about = "Interior design proposals from a room photo", long_about = None)]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a room photo and propose colors, layout and furniture
    Design {
        /// Room photo (PNG, JPEG or WEBP)
        #[arg(short, long)]
        image: PathBuf,

        /// Room area / size, e.g. "3m x 3.5m"
        #[arg(short, long, default_value = "")]
        area: String,

        /// Furniture needed, e.g. "bed, desk"
        #[arg(short, long, default_value = "")]
        furniture: String,

        /// Desired mood or style, e.g. "minimal, wood tones"
        #[arg(short, long, default_value = "")]
        mood: String,

        /// JSON configuration file (defaults are used when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        /// Use a canned reply instead of calling Gemini
        #[arg(long)]
        dry_run: bool,
    },

    /// Normalize a photo to the submission budget and write it out
    Normalize {
        /// Input photo
        #[arg(short, long)]
        image: PathBuf,

        /// Output JPEG path
        #[arg(short, long)]
        output: PathBuf,

        /// JSON configuration file supplying the normalize section
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the maximum edge length in pixels
        #[arg(long)]
        max_edge: Option<u32>,

        /// Override the byte budget
        #[arg(long)]
        budget: Option<usize>,
    },

    /// Print the default configuration as JSON
    Config,

    /// Print detailed build information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Design {
            image,
            area,
            furniture,
            mood,
            config,
            json,
            dry_run,
        } => {
            let config = load_config(config.as_ref())?;
            let backend: Arc<dyn InferenceBackend> = if dry_run {
                Arc::new(dry_run_backend(&config))
            } else {
                Arc::new(GeminiClient::from_env()?)
            };
            let raw = RawImage::from_path(&image)?;
            let pipeline = DesignPipeline::new(backend, config)?;

            let cancel = CancellationToken::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted; cancelling design request");
                    on_ctrl_c.cancel();
                }
            });

            let run = match pipeline
                .run_until_cancelled(&raw, &area, &furniture, &mood, &cancel)
                .await
            {
                Ok(run) => run,
                Err(e) => {
                    tracing::error!(kind = e.kind(), "{}", e);
                    anyhow::bail!(e.user_message());
                }
            };

            tracing::info!(
                target_model = %run.target,
                attempts = run.attempts.len(),
                width = run.image.width,
                height = run.image.height,
                bytes = run.image.byte_size(),
                "design complete"
            );

            if json {
                println!("{}", serde_json::to_string_pretty(&run.result)?);
            } else {
                print!("{}", render(&run.result));
            }
            Ok(())
        }
        Commands::Normalize {
            image,
            output,
            config,
            max_edge,
            budget,
        } => {
            let mut options = load_config(config.as_ref())?.normalize;
            if let Some(max_edge) = max_edge {
                options.max_edge = max_edge;
                options.min_edge = options.min_edge.min(max_edge);
            }
            if let Some(budget) = budget {
                options.byte_budget = budget;
            }

            let raw = RawImage::from_path(&image)?;
            let normalized = normalize(&raw, &options)?;
            std::fs::write(&output, &normalized.bytes)
                .with_context(|| format!("Failed to write {}", output.display()))?;

            println!(
                "{} ({}x{}, {} bytes) -> {} ({}x{}, {} bytes, quality {})",
                image.display(),
                raw.width(),
                raw.height(),
                raw.bytes().len(),
                output.display(),
                normalized.width,
                normalized.height,
                normalized.byte_size(),
                normalized
                    .quality
                    .map_or_else(|| "unchanged".to_string(), |q| q.to_string()),
            );
            if normalized.floor_reached {
                println!(
                    "warning: budget of {} bytes not met at the quality/resolution floor",
                    options.byte_budget
                );
            }
            Ok(())
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&PipelineConfig::default())?);
            Ok(())
        }
        Commands::Version => {
            println!("roomie {LONG_VERSION}");
            println!("rustc: {}", built_info::RUSTC_VERSION);
            println!("target: {}", built_info::TARGET);
            println!("profile: {}", built_info::PROFILE);
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_file(path),
        None => Ok(PipelineConfig::default()),
    }
}

fn dry_run_backend(config: &PipelineConfig) -> ScriptedBackend {
    config
        .targets
        .iter()
        .fold(ScriptedBackend::new(), |backend, target| {
            backend.always(&target.name, Ok(DRY_RUN_PAYLOAD.to_string()))
        })
}

/// Human-readable rendering of a design proposal
fn render(result: &DesignResult) -> String {
    let mut out = String::new();
    out.push_str("Analysis\n");
    out.push_str(&format!("  {}\n\n", result.analysis));

    out.push_str("Color palette\n");
    for color in &result.colors {
        out.push_str(&format!("  {}  {}: {}\n", color.hex, color.name, color.rationale));
    }

    out.push_str("\nLayout\n");
    out.push_str(&format!("  {}\n", result.layout));

    if !result.items.is_empty() {
        out.push_str("\nFurniture\n");
        for item in &result.items {
            out.push_str(&format!("  - {} ({}): {}\n", item.name, item.style, item.rationale));
        }
    }
    out
}
