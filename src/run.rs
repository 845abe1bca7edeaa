//! Drives a whole run: readiness, priming, probing, reassembly and the report.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::codec;
use crate::config::Config;
use crate::counter::{QueryCounter, QueryLogCounter};
use crate::error::Error;
use crate::primer::{self, Primer};
use crate::query::{Resolver, UdpResolver};
use crate::record::{PrimeRecord, VerificationRecord};
use crate::report::{self, Report, RunSummary};
use crate::verifier::{self, Verifier};

#[derive(Default)]
struct Progress {
	payload: Option<Vec<u8>>,
	prime_records: Vec<PrimeRecord>,
	records: Vec<VerificationRecord>,
}

async fn phases<R, C>(config: &Config, resolver: Arc<R>, counter: Arc<C>, progress: &mut Progress)
-> Result<(), Error>
where R: Resolver + ?Sized + 'static, C: QueryCounter + ?Sized + 'static {
	config.validate()?;
	let payload = config.load_payload()?;
	let labels = codec::encode(&payload, config.chunk_size)?;
	progress.payload = Some(payload);
	info!("Encoded {} bytes into {} labels below {}",
		progress.payload.as_ref().map_or(0, Vec::len), labels.len(), config.apex);

	primer::wait_until_ready(&*resolver, &config.apex, &config.resolver).await?;

	let prime_targets = primer::prime_targets(&config.apex, &labels, config.prime.strategy)?;
	let mut primer = Primer::new(&*resolver, &*counter, config);
	let primed = primer.prime(&prime_targets).await;
	progress.prime_records = primer.into_records();
	primed?;

	let probe_targets = verifier::probe_targets(&config.apex, &labels, config.prime.strategy,
		config.probe.variant)?;
	progress.records = Verifier::new(resolver, counter, config).verify(&probe_targets).await;
	Ok(())
}

/// Runs every phase against `resolver`, watching `counter`.
///
/// This never fails: whatever stops the run early is recorded in the report, alongside anything
/// collected before it.
pub async fn run<R, C>(config: &Config, resolver: Arc<R>, counter: Arc<C>) -> Report
where R: Resolver + ?Sized + 'static, C: QueryCounter + ?Sized + 'static {
	let mut progress = Progress::default();
	let fatal_error = match phases(config, resolver, counter, &mut progress).await {
		Ok(()) => None,
		Err(e) => {
			error!("Run aborted: {}", e);
			Some(e.to_string())
		},
	};

	let summary = RunSummary::new(config, progress.payload.as_ref().map_or(0, Vec::len));
	let report = Report::compile(summary, progress.payload.as_deref(), progress.prime_records,
		progress.records, fatal_error);
	if let Some(path) = &config.report.records_log {
		let (log, records) = (path.clone(), report.records.clone());
		match tokio::task::spawn_blocking(move || report::append_records(&log, &records)).await {
			Ok(Ok(())) => {},
			Ok(Err(e)) => warn!("Failed to append verification records to {}: {}", path.display(), e),
			Err(e) => warn!("Appending verification records to {} did not complete: {}", path.display(), e),
		}
	}
	info!("Run {}", if report.passed() { "passed" } else { "failed" });
	report
}

/// Runs against the configured resolver over UDP, counting queries in the configured query log.
pub async fn run_from_config(config: &Config) -> Report {
	let resolver = Arc::new(UdpResolver::new(config.resolver.address));
	let counter = Arc::new(QueryLogCounter::new(config.counter.query_log.clone()));
	run(config, resolver, counter).await
}
