use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};

use request_guard::config::{config_warnings, load_config, parse_config, ConfigError, GuardConfig};
use request_guard::security::headers::csp_header_value;
use request_guard::security::sanitizer::{sanitize_report, SanitizationPolicy};

#[derive(Parser)]
#[command(name = "guard-cli")]
#[command(about = "Offline tooling for request-guard configurations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a configuration file
    CheckConfig {
        path: PathBuf,
    },
    /// Sanitize markup from a file (or stdin) under the configured policy
    Sanitize {
        #[arg(short, long)]
        config: Option<PathBuf>,
        file: Option<PathBuf>,
    },
    /// Print the Content-Security-Policy header the configuration produces
    Csp {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig { path } => check_config(&path),
        Commands::Sanitize { config, file } => {
            let config = config_or_default(config.as_deref())?;
            let raw = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut input = String::new();
                    std::io::stdin()
                        .read_to_string(&mut input)
                        .context("reading stdin")?;
                    input
                }
            };

            let policy = SanitizationPolicy::from_config(&config.sanitizer);
            let report = sanitize_report(&raw, &policy);
            if let Some(err) = report.parse_error {
                eprintln!("warning: {}", err);
            }
            println!("{}", report.html);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Csp { config } => {
            let config = config_or_default(config.as_deref())?;
            let name = if config.csp.report_only {
                "Content-Security-Policy-Report-Only"
            } else {
                "Content-Security-Policy"
            };
            println!("{}: {}", name, csp_header_value(&config.csp.directives));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn check_config(path: &Path) -> anyhow::Result<ExitCode> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

    match parse_config(&content) {
        Ok(config) => {
            for warning in config_warnings(&config) {
                eprintln!("  warning: {}", warning);
            }
            println!("{}: ok", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Err(ConfigError::Validation(errors)) => {
            eprintln!("{}: {} problem(s)", path.display(), errors.len());
            for error in errors {
                eprintln!("  {}", error);
            }
            Ok(ExitCode::FAILURE)
        }
        Err(err) => {
            eprintln!("{}: {}", path.display(), err);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn config_or_default(path: Option<&Path>) -> anyhow::Result<GuardConfig> {
    match path {
        Some(path) => load_config(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(GuardConfig::default()),
    }
}
