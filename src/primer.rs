//! Warms the resolver's aggressive NSEC cache.
//!
//! Priming walks the chain by asking for names which don't exist, one in each gap, so the resolver
//! has to fetch (and cache) the NSEC record covering each gap from the authoritative server. It
//! only proceeds once the resolver answers for the zone with validated data.

use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::codec::{EncodedLabel, GapKind, Slot};
use crate::config::{Config, PrimeStrategy, ResolverConfig, RetryPolicy};
use crate::counter::{self, QueryCounter};
use crate::error::{CodecError, ConfigError, PrimeError};
use crate::query::{self, NsecProof, Resolver, NOERROR};
use crate::record::PrimeRecord;
use crate::rr::*;

/// Blocks until `resolver` returns a validated answer for the apex SOA.
///
/// Fails with [`ConfigError::ResolverUnreachable`] if that doesn't happen within
/// [`ResolverConfig::readiness_timeout`].
pub async fn wait_until_ready<R: Resolver + ?Sized>(resolver: &R, apex: &Name, config: &ResolverConfig)
-> Result<(), ConfigError> {
	let start = tokio::time::Instant::now();
	let deadline = start + config.readiness_timeout();
	let mut attempts = 0u32;
	loop {
		attempts += 1;
		let last = match query::query_with_timeout(resolver, apex, Soa::TYPE, config.timeout()).await {
			Ok(resp) if resp.rcode == NOERROR && resp.authenticated => {
				info!("Resolver {} is serving validated data for {} after {} attempts",
					config.address, apex, attempts);
				return Ok(());
			},
			Ok(resp) if resp.rcode != NOERROR => format!("response code {}", resp.rcode),
			Ok(_) => "answer was not validated".to_owned(),
			Err(e) => e.to_string(),
		};
		debug!("Resolver not ready yet: {}", last);
		let now = tokio::time::Instant::now();
		if now + config.readiness_interval() > deadline {
			return Err(ConfigError::ResolverUnreachable {
				addr: config.address.to_string(), waited_ms: (now - start).as_millis(), last,
			});
		}
		tokio::time::sleep(config.readiness_interval()).await;
	}
}

/// The gap names primed under `strategy`, in chain order.
pub fn prime_targets(apex: &Name, labels: &[EncodedLabel], strategy: PrimeStrategy)
-> Result<Vec<(Slot, Name)>, CodecError> {
	labels.iter()
		.filter(|label| strategy.includes(label.slot))
		.map(|label| Ok((label.slot, label.gap_name(apex, GapKind::Prime)?)))
		.collect()
}

/// Primes gaps one at a time, collecting a [`PrimeRecord`] for each.
pub struct Primer<'a, R: Resolver + ?Sized, C: QueryCounter + ?Sized> {
	resolver: &'a R,
	counter: &'a C,
	policy: RetryPolicy,
	timeout: std::time::Duration,
	settle: std::time::Duration,
	records: Vec<PrimeRecord>,
}

impl<'a, R: Resolver + ?Sized, C: QueryCounter + ?Sized> Primer<'a, R, C> {
	/// Creates a primer using the retry, timeout and settle settings of `config`.
	pub fn new(resolver: &'a R, counter: &'a C, config: &Config) -> Self {
		Primer {
			resolver, counter, policy: config.retry, timeout: config.resolver.timeout(),
			settle: config.probe.settle(), records: Vec::new(),
		}
	}

	/// The records collected so far, including those from before a failure.
	pub fn records(&self) -> &[PrimeRecord] { &self.records }

	/// Consumes the primer, returning its records.
	pub fn into_records(self) -> Vec<PrimeRecord> { self.records }

	/// Primes each target in turn, stopping at the first one which never gets an answer.
	pub async fn prime(&mut self, targets: &[(Slot, Name)]) -> Result<(), PrimeError> {
		info!("Priming {} gaps", targets.len());
		for (slot, name) in targets {
			self.prime_gap(*slot, name).await?;
		}
		let authoritative = self.records.iter().filter(|r| r.counter_delta > 0).count();
		info!("Primed {} gaps, {} reached the authoritative server", self.records.len(), authoritative);
		Ok(())
	}

	async fn prime_gap(&mut self, slot: Slot, name: &Name) -> Result<(), PrimeError> {
		let before = self.counter.snapshot().await?;
		let mut attempts = 0;
		let response = loop {
			attempts += 1;
			match query::query_with_timeout(self.resolver, name, A::TYPE, self.timeout).await {
				Ok(resp) => break resp,
				Err(e) if e.is_retryable() && attempts < self.policy.attempts => {
					let backoff = self.policy.backoff(attempts);
					warn!("Priming query for {} failed ({}), retrying in {:?}", name, e, backoff);
					tokio::time::sleep(backoff).await;
				},
				Err(last) => return Err(PrimeError::PrimingTimeout { name: name.clone(), attempts, last }),
			}
		};
		tokio::time::sleep(self.settle).await;
		let counter_delta = counter::delta(before, self.counter.snapshot().await?)?;

		let (proofs, validation_failure) = match response.check_denial() {
			Ok(proofs) => (proofs, None),
			Err(failure) => {
				warn!("Priming answer for {} unusable: {}", name, failure);
				(response.nsecs().map(NsecProof::from).collect(), Some(failure))
			},
		};
		debug!("Primed {} ({}) with {} NSEC records, counter delta {}", name, slot, proofs.len(), counter_delta);
		self.records.push(PrimeRecord {
			name: name.clone(), slot, attempts, counter_delta, proofs, validation_failure,
			timestamp: OffsetDateTime::now_utc(),
		});
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::{QueryError, ValidationFailure};
	use crate::test::stub::*;
	use std::time::Duration;

	fn config() -> Config {
		let mut config = Config::default();
		config.retry = RetryPolicy { attempts: 3, initial_backoff_ms: 100, max_backoff_ms: 1000 };
		config.resolver.timeout_ms = 1000;
		config.probe.settle_ms = 10;
		config
	}

	#[test]
	fn test_prime_targets() {
		let labels = crate::codec::encode(b"abcdefghij", 2).unwrap();
		let every = prime_targets(&apex(), &labels, PrimeStrategy::EveryGap).unwrap();
		assert_eq!(every.len(), 6);
		assert_eq!(every[0], (Slot::Sentinel, labels[0].gap_name(&apex(), GapKind::Prime).unwrap()));
		assert!(every.iter().all(|(_, name)| name.child_label_of(&apex()).unwrap().contains('z')));

		let covering = prime_targets(&apex(), &labels, PrimeStrategy::Covering).unwrap();
		let slots: Vec<Slot> = covering.iter().map(|(slot, _)| *slot).collect();
		assert_eq!(slots, vec![Slot::Sentinel, Slot::Chunk(1), Slot::Chunk(3)]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_prime_every_gap() {
		let (stub, labels) = StubResolver::new(b"hello from nsec", 4);
		let counter = stub.counter.clone();
		let targets = prime_targets(&apex(), &labels, PrimeStrategy::EveryGap).unwrap();
		let config = config();
		let mut primer = Primer::new(&stub, &*counter, &config);
		primer.prime(&targets).await.unwrap();

		let records = primer.into_records();
		assert_eq!(records.len(), labels.len());
		for (record, label) in records.iter().zip(labels.iter()) {
			assert_eq!(record.slot, label.slot);
			assert_eq!(record.attempts, 1);
			assert_eq!(record.counter_delta, 1);
			assert_eq!(record.validation_failure, None);
			assert_eq!(record.proofs[0].owner, label.owner_name(&apex()).unwrap());
		}

		// A second pass is answered entirely from the cache
		let mut primer = Primer::new(&stub, &*counter, &config);
		primer.prime(&targets).await.unwrap();
		assert!(primer.records().iter().all(|r| r.counter_delta == 0));
	}

	#[tokio::test(start_paused = true)]
	async fn test_prime_retries_with_backoff() {
		let (stub, labels) = StubResolver::new(b"hi", 1);
		let targets = prime_targets(&apex(), &labels, PrimeStrategy::EveryGap).unwrap();
		stub.faults.lock().unwrap().drop_first.insert(targets[1].1.clone(), 2);
		let counter = stub.counter.clone();
		let config = config();
		let mut primer = Primer::new(&stub, &*counter, &config);

		let start = tokio::time::Instant::now();
		primer.prime(&targets).await.unwrap();
		// Two timeouts, then backoffs of 100ms and 200ms, then three settle delays
		let elapsed = start.elapsed();
		assert!(elapsed >= Duration::from_millis(2000 + 300 + 30), "{:?}", elapsed);
		assert!(elapsed < Duration::from_millis(2400), "{:?}", elapsed);
		assert_eq!(primer.records()[1].attempts, 3);
		assert_eq!(stub.query_count(&targets[1].1), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn test_priming_timeout() {
		let (stub, labels) = StubResolver::new(b"hi", 1);
		let targets = prime_targets(&apex(), &labels, PrimeStrategy::EveryGap).unwrap();
		stub.faults.lock().unwrap().drop_first.insert(targets[1].1.clone(), 100);
		let counter = stub.counter.clone();
		let config = config();
		let mut primer = Primer::new(&stub, &*counter, &config);

		match primer.prime(&targets).await {
			Err(PrimeError::PrimingTimeout { name, attempts, last: QueryError::Timeout }) => {
				assert_eq!(name, targets[1].1);
				assert_eq!(attempts, 3);
			},
			res => panic!("{:?}", res),
		}
		// The gap before the failure was still recorded
		assert_eq!(primer.records().len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_unauthenticated_priming_answer_is_recorded() {
		let (stub, labels) = StubResolver::new(b"hi", 1);
		let targets = prime_targets(&apex(), &labels, PrimeStrategy::EveryGap).unwrap();
		stub.faults.lock().unwrap().unauthenticated.insert(targets[0].1.clone());
		let counter = stub.counter.clone();
		let config = config();
		let mut primer = Primer::new(&stub, &*counter, &config);
		primer.prime(&targets).await.unwrap();
		assert_eq!(primer.records()[0].validation_failure, Some(ValidationFailure::Unauthenticated));
		assert!(!primer.records()[0].proofs.is_empty());
		assert_eq!(primer.records()[1].validation_failure, None);
	}

	#[tokio::test(start_paused = true)]
	async fn test_wait_until_ready() {
		let (stub, _) = StubResolver::new(b"hi", 1);
		let config = config();
		wait_until_ready(&stub, &apex(), &config.resolver).await.unwrap();
		assert_eq!(stub.query_count(&apex()), 1);

		// Not validating yet, then never validating
		stub.faults.lock().unwrap().unauthenticated.insert(apex());
		let mut resolver = config.resolver.clone();
		resolver.readiness_timeout_ms = 2_000;
		resolver.readiness_interval_ms = 500;
		match wait_until_ready(&stub, &apex(), &resolver).await {
			Err(ConfigError::ResolverUnreachable { last, .. }) => assert_eq!(last, "answer was not validated"),
			res => panic!("{:?}", res),
		}
		// Queried at 0, 500, 1000, 1500 and 2000ms
		assert_eq!(stub.query_count(&apex()), 1 + 5);
	}
}
