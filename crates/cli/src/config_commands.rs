use std::path::Path;

use {
    anyhow::{Result, bail},
    clap::Subcommand,
    secrecy::Secret,
};

use deckhand_config::validate::{self, Severity, ValidationResult};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Validate the configuration and report errors/warnings.
    Check {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
    /// Print the effective configuration with secrets redacted.
    Show,
}

pub fn handle_config(action: ConfigAction, explicit: Option<&Path>) -> Result<()> {
    match action {
        ConfigAction::Check { verbose } => check(explicit, verbose),
        ConfigAction::Show => show(explicit),
    }
}

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

fn check(explicit: Option<&Path>, verbose: bool) -> Result<()> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(deckhand_config::find_config_file);

    let result = match &path {
        Some(path) => {
            eprintln!("Checking {}\n", path.display());
            validate::validate_file(path)?
        },
        None => {
            eprintln!("No config file found; checking defaults and environment.\n");
            validate::validate_config(&deckhand_config::discover_and_load()?)
        },
    };

    print_diagnostics(&result, verbose);

    let errors = result.count(Severity::Error);
    if errors > 0 {
        bail!("{errors} configuration error(s)");
    }
    Ok(())
}

fn show(explicit: Option<&Path>) -> Result<()> {
    let mut config = crate::load_config(explicit)?;
    if config.store.database_url.is_some() {
        config.store.database_url = Some(Secret::new("[REDACTED]".to_string()));
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

pub(crate) fn print_diagnostics(result: &ValidationResult, verbose: bool) {
    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }

        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
            Severity::Info => (CYAN, "info"),
        };

        if d.path.is_empty() {
            eprintln!("  {BOLD}{color}{label}{RESET} {}", d.message);
        } else {
            eprintln!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message);
        }
        shown += 1;
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);

    if shown > 0 {
        eprintln!();
    }

    if errors == 0 && warnings == 0 {
        eprintln!("No issues found.");
    } else {
        eprintln!("{errors} error(s), {warnings} warning(s)");
    }
}
