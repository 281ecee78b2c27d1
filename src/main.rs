mod cache;
mod config;
mod engines;
mod errors;
mod identity;
mod output;
mod pipeline;
mod signatures;
mod signing;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use config::WardenConfig;
use pipeline::{CancelToken, ScanOptions, Severity, Verdict};

/// Warden -- static security gatekeeper for machine-learning artifacts.
#[derive(Parser)]
#[command(name = "warden", version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a file or directory and render a verdict
    Scan {
        /// Path to scan
        path: PathBuf,

        /// Upstream registry repository to verify identity against
        #[arg(long)]
        repo: Option<String>,

        /// Container image reference to sign on a passing scan
        #[arg(long)]
        image: Option<String>,

        /// Force approval even when findings would otherwise block
        #[arg(long)]
        force: bool,

        /// Render results as JSON
        #[arg(long)]
        json: bool,

        /// Render results as SARIF 2.1.0
        #[arg(long)]
        sarif: bool,

        /// Bypass the hash cache and rehash every file
        #[arg(long)]
        no_cache: bool,

        /// Minimum severity that blocks the verdict
        #[arg(long)]
        fail_on: Option<String>,

        /// Flag every pickle reference outside the scientific-computing
        /// whitelist at MEDIUM, not just ones on the severity map
        #[arg(long)]
        strict: bool,
    },

    /// Generate a signing key pair
    Keygen {
        /// Output file prefix
        #[arg(default_value = "warden")]
        prefix: String,
    },

    /// Refresh the local signature file from the configured feed
    Update,

    /// Print version information
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Scan {
            path,
            repo,
            image,
            force,
            json,
            sarif,
            no_cache,
            fail_on,
            strict,
        } => cmd_scan(path, repo, image, force, json, sarif, no_cache, fail_on, strict),
        Commands::Keygen { prefix } => cmd_keygen(&prefix),
        Commands::Update => cmd_update(),
        Commands::Version => {
            println!("warden {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_scan(
    path: PathBuf,
    repo: Option<String>,
    image: Option<String>,
    force: bool,
    json: bool,
    sarif: bool,
    no_cache: bool,
    fail_on: Option<String>,
    strict: bool,
) -> anyhow::Result<ExitCode> {
    let mut config = WardenConfig::load()?;
    if strict {
        config.strict_pickle = true;
    }
    let signature_path = config::home_signature_path();
    let signatures = Arc::new(signatures::SignatureStore::load_or_default(&signature_path)?);

    let cache = if no_cache {
        Arc::new(cache::HashCache::in_memory()?)
    } else {
        Arc::new(cache::HashCache::open(&config::home_cache_path())?)
    };

    let identity_client = repo
        .as_ref()
        .map(|_| Arc::new(identity::IdentityClient::new(config.hf_token.clone())));

    let fail_on_severity = fail_on
        .as_deref()
        .and_then(Severity::parse)
        .unwrap_or(config.fail_on_severity);

    let options = ScanOptions {
        root: &path,
        repo: repo.as_deref(),
        force,
        no_cache,
        fail_on: fail_on_severity,
        cancel: CancelToken::new(),
    };

    let report = pipeline::run_scan(&options, &config, signatures, cache, identity_client)?;

    if sarif {
        output::print_report_sarif(&report, &path.display().to_string());
    } else if json {
        output::print_report_json(&report);
    } else {
        output::print_report_table(&report);
        output::print_verdict(report.verdict);
    }

    if matches!(report.verdict, Verdict::Pass | Verdict::ForcedApproval) {
        if let Some(image_ref) = image {
            if let Some(key_path) = &config.private_key_path {
                signing::sign(&image_ref, key_path, &[])?;
                println!("  signed {image_ref}");
            } else {
                eprintln!("{} no private key configured, skipping signing", "warn:".yellow());
            }
        }
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn cmd_keygen(prefix: &str) -> anyhow::Result<ExitCode> {
    signing::generate_key_pair(prefix)?;
    println!("  wrote {prefix}.key and {prefix}.pub");
    Ok(ExitCode::SUCCESS)
}

fn cmd_update() -> anyhow::Result<ExitCode> {
    // No feed endpoint is wired in by default; a user pointing at a private
    // feed can set one via configuration and re-run this command.
    let path = config::home_signature_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = signatures::SignatureStore::load_or_default(&path)?;
    println!("  signatures up to date at {}", path.display());
    Ok(ExitCode::SUCCESS)
}
