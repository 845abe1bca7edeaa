//! Probes gap names the resolver has never seen and classifies how each was answered.
//!
//! A validating resolver doing aggressive NSEC caching answers a probe from the proofs it cached
//! while priming, so the authoritative server never hears of it. We can't look inside the
//! resolver, so we watch the authoritative query counter instead: snapshots taken around each
//! query show whether the answer needed a round trip.
//!
//! Probes run concurrently, but only one query may sit between a pair of snapshots at a time so
//! one probe's round trip is never pinned on another.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::codec::{self, EncodedLabel, GapKind, Slot};
use crate::config::{Config, PrimeStrategy, RetryPolicy};
use crate::counter::{self, QueryCounter};
use crate::error::{CodecError, CounterError, QueryError, ValidationFailure};
use crate::query::{self, NsecProof, Resolver, Response};
use crate::record::{ProbeState, Verdict, VerificationRecord};
use crate::rr::*;

/// The gap names probed with the given variant, in chain order.
///
/// These are the gaps `strategy` primed. Under [`PrimeStrategy::EveryGap`] that includes the one
/// after the last chunk, whose answer closes the ring.
pub fn probe_targets(apex: &Name, labels: &[EncodedLabel], strategy: PrimeStrategy, variant: u8)
-> Result<Vec<(Slot, Name)>, CodecError> {
	labels.iter()
		.filter(|label| strategy.includes(label.slot))
		.map(|label| Ok((label.slot, label.gap_name(apex, GapKind::Probe(variant))?)))
		.collect()
}

enum Attempt {
	Answered(Response, u64),
	Query(QueryError),
	Counter(CounterError),
}

struct Shared<R: ?Sized, C: ?Sized> {
	resolver: Arc<R>,
	counter: Arc<C>,
	policy: RetryPolicy,
	timeout: Duration,
	settle: Duration,
	// Held from the first snapshot of an attempt to the second
	bracket: Mutex<()>,
}

impl<R: Resolver + ?Sized, C: QueryCounter + ?Sized> Shared<R, C> {
	async fn attempt(&self, name: &Name) -> Attempt {
		let _bracket = self.bracket.lock().await;
		let before = match self.counter.snapshot().await {
			Ok(count) => count,
			Err(e) => return Attempt::Counter(e),
		};
		let resp = match query::query_with_timeout(&*self.resolver, name, A::TYPE, self.timeout).await {
			Ok(resp) => resp,
			Err(e) => return Attempt::Query(e),
		};
		tokio::time::sleep(self.settle).await;
		match self.counter.snapshot().await.and_then(|after| counter::delta(before, after)) {
			Ok(delta) => Attempt::Answered(resp, delta),
			Err(e) => Attempt::Counter(e),
		}
	}

	async fn probe(&self, slot: Slot, name: Name) -> VerificationRecord {
		let mut record = VerificationRecord::new(slot, name);
		let (resp, delta) = loop {
			record.attempts += 1;
			record.state = ProbeState::Sent;
			match self.attempt(&record.name).await {
				Attempt::Answered(resp, delta) => break (resp, delta),
				Attempt::Counter(e) => return record.failed(ProbeState::Failed, e),
				Attempt::Query(QueryError::InvalidResponse) => {
					record.state = ProbeState::Answered;
					record.verdict = Verdict::ValidationFailure(ValidationFailure::Malformed);
					warn!("Probe {} ({}) got a malformed response", record.name, slot);
					record.timestamp = OffsetDateTime::now_utc();
					return record;
				},
				Attempt::Query(e) if record.attempts < self.policy.attempts => {
					let backoff = self.policy.backoff(record.attempts);
					debug!("Probe {} attempt {} failed ({}), retrying in {:?}", record.name, record.attempts, e, backoff);
					tokio::time::sleep(backoff).await;
				},
				Attempt::Query(e @ QueryError::Timeout) => return record.failed(ProbeState::TimedOut, e),
				Attempt::Query(e) => return record.failed(ProbeState::Failed, e),
			}
		};

		record.state = ProbeState::Answered;
		record.counter_delta = Some(delta);
		record.timestamp = OffsetDateTime::now_utc();
		record.verdict = match resp.check_denial() {
			Ok(proofs) => {
				record.proofs = proofs;
				if delta == 0 { Verdict::CacheSynthesized } else { Verdict::AuthoritativeRoundtrip }
			},
			Err(failure) => {
				warn!("Excluding probe {} ({}): {}", record.name, slot, failure);
				record.proofs = resp.nsecs().map(NsecProof::from).collect();
				Verdict::ValidationFailure(failure)
			},
		};
		record.chunk = record.proofs.iter()
			.filter_map(|proof| proof.owner.labels().next())
			.filter_map(|label| codec::parse_label(label).ok())
			.find(|(owner_slot, _)| *owner_slot == slot)
			.map(|(_, block)| block);
		debug!("Probe {} ({}) answered after {} attempts, counter delta {}: {:?}",
			record.name, slot, record.attempts, delta, record.verdict);
		record
	}
}

/// Runs probes concurrently and collects their records.
pub struct Verifier<R: ?Sized, C: ?Sized> {
	shared: Arc<Shared<R, C>>,
	concurrency: usize,
}

impl<R: Resolver + ?Sized + 'static, C: QueryCounter + ?Sized + 'static> Verifier<R, C> {
	/// Creates a verifier using the retry, timeout, settle and concurrency settings of `config`.
	pub fn new(resolver: Arc<R>, counter: Arc<C>, config: &Config) -> Self {
		Verifier {
			shared: Arc::new(Shared {
				resolver, counter, policy: config.retry, timeout: config.resolver.timeout(),
				settle: config.probe.settle(), bracket: Mutex::new(()),
			}),
			concurrency: config.probe.concurrency.max(1),
		}
	}

	/// Probes every target, returning one record per target in chain order.
	///
	/// Probes never fail the run, a probe which can't complete is recorded as
	/// [`Verdict::Failed`].
	pub async fn verify(&self, targets: &[(Slot, Name)]) -> Vec<VerificationRecord> {
		info!("Probing {} gaps, up to {} at a time", targets.len(), self.concurrency);
		let permits = Arc::new(Semaphore::new(self.concurrency));
		let mut tasks = JoinSet::new();
		for (slot, name) in targets.iter().cloned() {
			let shared = Arc::clone(&self.shared);
			let permits = Arc::clone(&permits);
			tasks.spawn(async move {
				let _permit = match permits.acquire().await {
					Ok(permit) => permit,
					Err(e) => return VerificationRecord::new(slot, name).failed(ProbeState::NotSent, e),
				};
				shared.probe(slot, name).await
			});
		}

		let mut records = Vec::with_capacity(targets.len());
		while let Some(res) = tasks.join_next().await {
			match res {
				Ok(record) => records.push(record),
				Err(e) => warn!("Probe task did not complete: {}", e),
			}
		}
		// A probe whose task died still gets a record
		for (slot, name) in targets {
			if !records.iter().any(|r| r.slot == *slot && r.name == *name) {
				records.push(VerificationRecord::new(*slot, name.clone())
					.failed(ProbeState::Failed, "probe task did not complete"));
			}
		}
		records.sort_by(|a, b| a.slot.cmp(&b.slot).then_with(|| a.name.canonical_cmp(&b.name)));

		let synthesized = records.iter().filter(|r| r.verdict == Verdict::CacheSynthesized).count();
		let roundtrips = records.iter().filter(|r| r.verdict == Verdict::AuthoritativeRoundtrip).count();
		info!("Probed {} gaps: {} synthesized, {} authoritative, {} excluded",
			records.len(), synthesized, roundtrips, records.len() - synthesized - roundtrips);
		records
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::decoder;
	use crate::primer::{self, Primer};
	use crate::test::stub::*;
	use std::sync::atomic::Ordering;

	fn config(concurrency: usize) -> Config {
		let mut config = Config::default();
		config.retry = RetryPolicy { attempts: 3, initial_backoff_ms: 100, max_backoff_ms: 1000 };
		config.resolver.timeout_ms = 1000;
		config.probe.settle_ms = 10;
		config.probe.concurrency = concurrency;
		config
	}

	async fn primed(payload: &[u8], chunk_size: usize) -> (Arc<StubResolver>, Vec<EncodedLabel>) {
		let (stub, labels) = StubResolver::new(payload, chunk_size);
		let targets = primer::prime_targets(&apex(), &labels, PrimeStrategy::EveryGap).unwrap();
		let counter = stub.counter.clone();
		Primer::new(&stub, &*counter, &config(1)).prime(&targets).await.unwrap();
		(Arc::new(stub), labels)
	}

	fn accepted_proofs(records: &[VerificationRecord]) -> Vec<NsecProof> {
		records.iter().filter(|r| r.verdict.is_accepted()).flat_map(|r| r.proofs.iter().cloned()).collect()
	}

	#[test]
	fn test_probe_targets() {
		let labels = codec::encode(b"hi", 1).unwrap();
		let targets = probe_targets(&apex(), &labels, PrimeStrategy::EveryGap, 1).unwrap();
		assert_eq!(targets.len(), 3);
		assert_eq!(targets[2].0, Slot::Chunk(1));
		assert_eq!(targets[2].1.as_str(), format!("{}y1.{}", labels[2].label, APEX));
		let primes = primer::prime_targets(&apex(), &labels, PrimeStrategy::EveryGap).unwrap();
		assert!(targets.iter().all(|(_, name)| primes.iter().all(|(_, p)| p != name)));
	}

	#[tokio::test(start_paused = true)]
	async fn test_primed_cache_synthesizes() {
		let (stub, labels) = primed(b"hello from nsec", 4).await;
		let targets = probe_targets(&apex(), &labels, PrimeStrategy::EveryGap, 0).unwrap();
		let records = Verifier::new(stub.clone(), stub.counter.clone(), &config(4)).verify(&targets).await;

		assert_eq!(records.len(), labels.len());
		for (record, label) in records.iter().zip(labels.iter()) {
			assert_eq!(record.slot, label.slot);
			assert_eq!(record.state, ProbeState::Answered);
			assert_eq!(record.verdict, Verdict::CacheSynthesized);
			assert_eq!(record.counter_delta, Some(0));
			assert_eq!(record.attempts, 1);
			assert!(record.chunk.is_some());
		}
		let outcome = decoder::reassemble(&apex(), &accepted_proofs(&records));
		assert_eq!(outcome.payload.as_deref(), Some(&b"hello from nsec"[..]));
	}

	#[tokio::test(start_paused = true)]
	async fn test_covering_gaps_synthesize() {
		let (stub, labels) = StubResolver::new(b"hello", 2);
		let primes = primer::prime_targets(&apex(), &labels, PrimeStrategy::Covering).unwrap();
		let counter = stub.counter.clone();
		Primer::new(&stub, &*counter, &config(1)).prime(&primes).await.unwrap();
		let stub = Arc::new(stub);

		let targets = probe_targets(&apex(), &labels, PrimeStrategy::Covering, 0).unwrap();
		assert_eq!(targets.iter().map(|(slot, _)| *slot).collect::<Vec<_>>(), vec![Slot::Sentinel, Slot::Chunk(1)]);
		let records = Verifier::new(stub.clone(), stub.counter.clone(), &config(2)).verify(&targets).await;
		assert!(records.iter().all(|r| r.verdict == Verdict::CacheSynthesized));
		// The last chunk only turns up as a next name
		let outcome = decoder::reassemble(&apex(), &accepted_proofs(&records));
		assert_eq!(outcome.payload.as_deref(), Some(&b"hello"[..]));
	}

	#[tokio::test(start_paused = true)]
	async fn test_uncached_answers_are_authoritative() {
		let (stub, labels) = primed(b"hello", 2).await;
		stub.faults.lock().unwrap().no_cache = true;
		let targets = probe_targets(&apex(), &labels, PrimeStrategy::EveryGap, 0).unwrap();
		let records = Verifier::new(stub.clone(), stub.counter.clone(), &config(3)).verify(&targets).await;
		for record in &records {
			assert_eq!(record.verdict, Verdict::AuthoritativeRoundtrip);
			// Concurrent probes never see each other's round trips
			assert_eq!(record.counter_delta, Some(1));
		}
		let outcome = decoder::reassemble(&apex(), &accepted_proofs(&records));
		assert_eq!(outcome.payload.as_deref(), Some(&b"hello"[..]));
	}

	#[tokio::test(start_paused = true)]
	async fn test_unauthenticated_probe_excluded() {
		let (stub, labels) = primed(b"hi", 1).await;
		let mut targets = probe_targets(&apex(), &labels, PrimeStrategy::EveryGap, 0).unwrap();
		targets.extend(probe_targets(&apex(), &labels, PrimeStrategy::EveryGap, 1).unwrap());
		stub.faults.lock().unwrap().unauthenticated.insert(targets[1].1.clone());
		let records = Verifier::new(stub.clone(), stub.counter.clone(), &config(2)).verify(&targets).await;

		let excluded: Vec<_> = records.iter().filter(|r| !r.verdict.is_accepted()).collect();
		assert_eq!(excluded.len(), 1);
		assert_eq!(excluded[0].name, targets[1].1);
		assert_eq!(excluded[0].verdict, Verdict::ValidationFailure(ValidationFailure::Unauthenticated));
		let outcome = decoder::reassemble(&apex(), &accepted_proofs(&records));
		assert_eq!(outcome.payload.as_deref(), Some(&b"hi"[..]));
	}

	#[tokio::test(start_paused = true)]
	async fn test_servfail_is_a_validation_failure() {
		let (stub, labels) = primed(b"hi", 1).await;
		let targets = probe_targets(&apex(), &labels, PrimeStrategy::EveryGap, 0).unwrap();
		stub.faults.lock().unwrap().servfail.insert(targets[0].1.clone());
		let records = Verifier::new(stub.clone(), stub.counter.clone(), &config(1)).verify(&targets).await;
		assert_eq!(records[0].verdict,
			Verdict::ValidationFailure(ValidationFailure::UnexpectedRcode { rcode: query::SERVFAIL }));
		assert_eq!(records[0].state, ProbeState::Answered);
		// The wildcard denials in the other answers still name the sentinel
		let outcome = decoder::reassemble(&apex(), &accepted_proofs(&records));
		assert_eq!(outcome.payload.as_deref(), Some(&b"hi"[..]));
	}

	#[tokio::test(start_paused = true)]
	async fn test_timeouts_retry_then_fail() {
		let (stub, labels) = primed(b"hi", 1).await;
		let targets = probe_targets(&apex(), &labels, PrimeStrategy::EveryGap, 0).unwrap();
		{
			let mut faults = stub.faults.lock().unwrap();
			faults.drop_first.insert(targets[1].1.clone(), 1);
			faults.drop_first.insert(targets[2].1.clone(), 100);
		}
		let records = Verifier::new(stub.clone(), stub.counter.clone(), &config(3)).verify(&targets).await;

		assert_eq!(records[0].attempts, 1);
		assert_eq!(records[1].attempts, 2);
		assert_eq!(records[1].verdict, Verdict::CacheSynthesized);
		assert_eq!(records[2].attempts, 3);
		assert_eq!(records[2].state, ProbeState::TimedOut);
		assert_eq!(records[2].verdict, Verdict::Failed);
		assert!(records[2].error.is_some());
		assert!(records[2].proofs.is_empty());
		assert_eq!(stub.query_count(&targets[2].1), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn test_counter_failure_fails_probe() {
		let (stub, labels) = primed(b"hi", 1).await;
		stub.counter.broken.store(true, Ordering::SeqCst);
		let targets = probe_targets(&apex(), &labels, PrimeStrategy::EveryGap, 0).unwrap();
		let records = Verifier::new(stub.clone(), stub.counter.clone(), &config(2)).verify(&targets).await;
		for record in &records {
			assert_eq!(record.state, ProbeState::Failed);
			assert_eq!(record.verdict, Verdict::Failed);
			assert_eq!(record.counter_delta, None);
		}
		// Nothing was sent without a baseline
		assert!(targets.iter().all(|(_, name)| stub.query_count(name) == 0));
	}
}
