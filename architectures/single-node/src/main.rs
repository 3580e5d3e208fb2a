use std::{env, io, path::PathBuf};

use anyhow::{anyhow, Result};
use clap::ValueEnum;
use sae_client::{run, BootstrapError, Collaborators, ConfigurationError};
use sae_core::ProcessEnvironment;
use sae_logging::{logging, LogOutput};
use sae_modeling::dtype_name;
use tracing::{error, info};

/// Console log format: console, json or none.
const LOGS_VAR: &str = "SAE_LOGS";
/// Also append logs to this file.
const WRITE_LOG_VAR: &str = "SAE_WRITE_LOG";

fn log_output() -> Result<LogOutput> {
    match env::var(LOGS_VAR) {
        Ok(value) => LogOutput::from_str(&value, true)
            .map_err(|err| anyhow!("invalid value for {LOGS_VAR}: {err}")),
        Err(_) => Ok(LogOutput::default()),
    }
}

fn main() -> Result<()> {
    logging()
        .with_output(log_output()?)
        .with_log_file(env::var_os(WRITE_LOG_VAR).map(PathBuf::from))
        .init()?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting run");

    match run(
        &ProcessEnvironment,
        env::args_os(),
        &Collaborators::default(),
        Box::new(io::stdout()),
    ) {
        Ok(summary) => {
            info!(
                sequences = summary.sequences,
                dtype = dtype_name(summary.dtype),
                "Training complete"
            );
            Ok(())
        }
        // prints usage, or help and version, with clap's exit codes
        Err(BootstrapError::Configuration(ConfigurationError::Arguments(err))) => err.exit(),
        Err(err) => {
            error!(%err, "Run failed");
            Err(err.into())
        }
    }
}
