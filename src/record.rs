//! The records kept of each query made against the resolver.
//!
//! Records outlive the run: they feed the report and may be appended to a log as JSON lines.

use serde::Serialize;
use time::OffsetDateTime;
use tracing::warn;

use crate::codec::Slot;
use crate::error::ValidationFailure;
use crate::query::NsecProof;
use crate::rr::Name;

/// Where a probe got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeState {
	/// No query has gone out.
	NotSent,
	/// A query is in flight.
	Sent,
	/// A response arrived.
	Answered,
	/// Every attempt timed out.
	TimedOut,
	/// The probe could not be completed.
	Failed,
}

/// How a probe was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
	/// The resolver answered without contacting the authoritative server.
	CacheSynthesized,
	/// The authoritative server saw queries while the probe was answered.
	AuthoritativeRoundtrip,
	/// An answer arrived but can't be used.
	ValidationFailure(ValidationFailure),
	/// No usable answer arrived.
	Failed,
}

impl Verdict {
	/// Whether the probe's proofs may be used to reassemble the payload.
	pub fn is_accepted(&self) -> bool {
		matches!(self, Verdict::CacheSynthesized | Verdict::AuthoritativeRoundtrip)
	}
}

/// The outcome of one probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationRecord {
	/// The gap name queried.
	pub name: Name,
	/// The label whose gap was queried.
	pub slot: Slot,
	/// How far the probe got.
	pub state: ProbeState,
	/// The classification.
	pub verdict: Verdict,
	/// Queries sent, including retries.
	pub attempts: u32,
	/// Authoritative queries seen around the answered attempt.
	pub counter_delta: Option<u64>,
	/// The NSEC records in the answer.
	pub proofs: Vec<NsecProof>,
	/// The block carried by the probed label, as seen in the answer, still padded.
	#[serde(serialize_with = "crate::decoder::serialize_opt_hex")]
	pub chunk: Option<Vec<u8>>,
	/// What went wrong, for failed probes.
	pub error: Option<String>,
	/// When the probe finished.
	#[serde(with = "time::serde::rfc3339")]
	pub timestamp: OffsetDateTime,
}

impl VerificationRecord {
	pub(crate) fn new(slot: Slot, name: Name) -> Self {
		VerificationRecord {
			name, slot, state: ProbeState::NotSent, verdict: Verdict::Failed, attempts: 0,
			counter_delta: None, proofs: Vec::new(), chunk: None, error: None,
			timestamp: OffsetDateTime::now_utc(),
		}
	}

	pub(crate) fn failed<E: std::fmt::Display>(mut self, state: ProbeState, error: E) -> Self {
		warn!("Probe {} ({}) failed: {}", self.name, self.slot, error);
		self.state = state;
		self.verdict = Verdict::Failed;
		self.error = Some(error.to_string());
		self.timestamp = OffsetDateTime::now_utc();
		self
	}
}


/// The outcome of one priming query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrimeRecord {
	/// The gap name queried.
	pub name: Name,
	/// The label whose gap was queried.
	pub slot: Slot,
	/// How many queries it took to get an answer.
	pub attempts: u32,
	/// How many queries reached the authoritative server meanwhile. Zero means the resolver already
	/// had this part of the chain cached.
	pub counter_delta: u64,
	/// The NSEC records returned.
	pub proofs: Vec<NsecProof>,
	/// Why the answer was unusable, if it was.
	pub validation_failure: Option<ValidationFailure>,
	/// When the answer arrived.
	#[serde(with = "time::serde::rfc3339")]
	pub timestamp: OffsetDateTime,
}
