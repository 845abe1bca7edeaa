//! Writes the zone holding a payload, or checks that a validating resolver can hand the payload
//! back purely from its aggressive NSEC cache.
//!
//! The configuration is read from the TOML file named by the `NSEC_CONFIG` environment variable,
//! or defaulted if it isn't set. The first argument picks the mode:
//!  * `zone` writes the zone file for an external signer and prints a summary of it as JSON.
//!  * `run` (the default) waits for the resolver, primes it, probes it and prints the report. The
//!    exit status is zero only if the run passed.
//!
//! Logs go to stderr and are filtered with `RUST_LOG`, defaulting to `info`.

#![deny(missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;

use nsec_datastore::config::Config;
use nsec_datastore::{run, zone};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_logging() {
	let filter = EnvFilter::builder()
		.with_default_directive(LevelFilter::INFO.into())
		.from_env_lossy();
	tracing_subscriber::registry()
		.with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
		.with(filter)
		.init();
}

fn load_config() -> Result<Config, String> {
	let config = match std::env::var_os("NSEC_CONFIG") {
		Some(path) => {
			let path = PathBuf::from(path);
			Config::read_config(&path).map_err(|e| format!("Failed to load {}: {}", path.display(), e))?
		},
		None => Config::default(),
	};
	config.validate().map_err(|e| format!("Invalid configuration: {}", e))?;
	Ok(config)
}

fn write_zone(config: &Config) -> Result<(), String> {
	let zone = zone::build_from_config(config).map_err(|e| format!("Failed to build zone: {}", e))?;
	zone.write_to(&config.zone.output)
		.map_err(|e| format!("Failed to write {}: {}", config.zone.output.display(), e))?;
	tracing::info!("Wrote {} chunks below {} to {}", zone.meta.chunk_count, zone.meta.apex,
		config.zone.output.display());
	let meta = serde_json::to_string_pretty(&zone.meta).map_err(|e| e.to_string())?;
	println!("{}", meta);
	Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
	init_logging();
	let config = match load_config() {
		Ok(config) => config,
		Err(e) => {
			eprintln!("{}", e);
			return ExitCode::from(2);
		},
	};

	match std::env::args().nth(1).as_deref() {
		Some("zone") => match write_zone(&config) {
			Ok(()) => ExitCode::SUCCESS,
			Err(e) => {
				eprintln!("{}", e);
				ExitCode::FAILURE
			},
		},
		None | Some("run") => {
			let report = run::run_from_config(&config).await;
			println!("{}", report);
			if let Some(path) = &config.report.json {
				if let Err(e) = report.write_json(path) {
					tracing::warn!("Failed to write the JSON report to {}: {}", path.display(), e);
				}
			}
			ExitCode::from(report.exit_code() as u8)
		},
		Some(mode) => {
			eprintln!("Unknown mode {}, expected zone or run", mode);
			ExitCode::from(2)
		},
	}
}
