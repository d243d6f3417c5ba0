use clap::{Parser, Subcommand};
use colored::Colorize;
use kiln_core::builder::{PlanAction, PlanEntry};
use kiln_core::{build_image, BuildRequest, Config, DockerStore, KilnError};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Dependency-aware container image builds with content-addressed caching", long_about = None)]
struct Cli {
    /// Verbosity (-v info, -vv debug). Default is warnings only.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image and its ancestors, reusing cached results
    Build {
        /// Build context directory
        path: PathBuf,

        /// Name of the image to build
        #[arg(short, long)]
        name: String,

        /// Commit identifier to build against (passed as GIT_SHA)
        #[arg(short = 'g', long)]
        commit: String,

        /// Build file path; defaults to the configured pattern
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,

        /// Tag pattern with a single {commit} placeholder, e.g. "{commit}-untested"
        #[arg(short = 't', long)]
        tag_pattern: Option<String>,

        /// Extra tags applied to every resolved image
        #[arg(short = 'e', long = "extra-tag")]
        extra_tag: Vec<String>,

        /// Extra name:tag aliases for the resolved images
        #[arg(long = "extra-name")]
        extra_name: Vec<String>,

        /// Build-time variables (KEY=VALUE); GIT_SHA and IMAGE_TAG are passed by default
        #[arg(long = "build-arg", value_name = "KEY=VALUE")]
        build_arg: Vec<String>,

        /// Registry identifying images buildable from this tree
        #[arg(long)]
        registry: Option<String>,

        /// Build with the raw external command, skipping all caching logic
        #[arg(short, long)]
        raw: bool,

        /// Resolve and plan without building or tagging anything
        #[arg(short, long)]
        dry_run: bool,

        /// Write the per-file `path -> digest` trace to this file
        #[arg(short = 'o', long = "output-hash")]
        output_hash: Option<PathBuf>,

        /// Print the outcome as JSON instead of human-readable text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::from(exit_code(&err))
        }
    }
}

async fn run(command: Commands) -> kiln_core::Result<()> {
    match command {
        Commands::Build {
            path,
            name,
            commit,
            file,
            tag_pattern,
            extra_tag,
            extra_name,
            build_arg,
            registry,
            raw,
            dry_run,
            output_hash,
            json,
        } => {
            let mut config = Config::from_env()?;
            if let Some(registry) = registry {
                config.registry = registry;
            }
            if let Some(tag_pattern) = tag_pattern {
                config.tag_pattern = tag_pattern;
            }
            config.validate()?;

            if config.registry.is_empty() {
                return Err(KilnError::InvalidConfig {
                    reason: "registry must be provided via --registry or KILN_REGISTRY".into(),
                });
            }

            let context = path.canonicalize().map_err(|e| KilnError::IoError {
                path: path.clone(),
                source: e,
            })?;

            let request = BuildRequest {
                image: name,
                context,
                commit,
                buildfile: file,
                build_args: parse_build_args(&build_arg)?,
                extra_tags: extra_tag,
                extra_names: extra_name,
                raw,
                dry_run,
                trace_path: output_hash,
            };

            let store = Arc::new(DockerStore::new(config.probe_attempts));
            let outcome = build_image(request, config, store).await?;

            if json {
                let rendered = serde_json::to_string_pretty(&outcome)
                    .map_err(|e| KilnError::Internal(format!("failed to render outcome: {e}")))?;
                println!("{rendered}");
                return Ok(());
            }

            for entry in &outcome.plan {
                print_plan_entry(entry, dry_run);
            }
            if let Some(digest) = &outcome.digest {
                println!("{} {} ({})", "done:".green().bold(), outcome.image, digest.cyan());
            } else {
                println!("{} no build or tag operations performed", "dry run:".blue().bold());
            }
            Ok(())
        }
    }
}

fn print_plan_entry(entry: &PlanEntry, dry_run: bool) {
    let action = match (entry.action, dry_run) {
        (PlanAction::Build, true) => "would build".yellow(),
        (PlanAction::Build, false) => "built".yellow(),
        (PlanAction::Reuse, _) => "reused".green(),
        (PlanAction::UpToDate, _) => "up-to-date".blue(),
    };
    let fingerprint = entry.fingerprint.get(..12).unwrap_or(&entry.fingerprint);
    if fingerprint.is_empty() {
        println!("  {:<12} {}", action, entry.image);
    } else {
        println!("  {:<12} {} ({})", action, entry.image, fingerprint.dimmed());
    }
}

/// Split `KEY=VALUE` arguments into a map.
fn parse_build_args(pairs: &[String]) -> kiln_core::Result<BTreeMap<String, String>> {
    let mut args = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair.split_once('=').ok_or_else(|| KilnError::InvalidConfig {
            reason: format!("--build-arg must be in KEY=VALUE format, got `{pair}`"),
        })?;
        args.insert(key.to_string(), value.to_string());
    }
    Ok(args)
}

/// Name the failing image and pipeline stage, then the cause chain.
fn report(err: &KilnError) {
    match err.failing_image() {
        Some(image) => {
            eprintln!("{} [{}] image {}: {}", "error:".red().bold(), err.stage(), image, err)
        }
        None => eprintln!("{} [{}] {}", "error:".red().bold(), err.stage(), err),
    }

    let mut cause = std::error::Error::source(err);
    while let Some(err) = cause {
        eprintln!("  caused by: {err}");
        cause = err.source();
    }
}

/// Nonzero exit codes distinguish the failing pipeline stage.
fn exit_code(err: &KilnError) -> u8 {
    match err.stage() {
        "parse" => 2,
        "hash" => 3,
        "cache-check" => 4,
        "build" => 5,
        "tag" => 6,
        _ => 1,
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
