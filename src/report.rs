//! Turns the records of a run into a verdict, for people and for machines.
//!
//! A run passes when the whole payload was reassembled and none of the probes it was reassembled
//! from needed the authoritative server. A [`Report`] is produced for every run, including runs
//! cut short by a fatal error, in which case the error is carried in the report.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use hex_conservative::DisplayHex;
use ring::digest;
use serde::Serialize;
use time::OffsetDateTime;

use crate::codec::Slot;
use crate::config::{Config, PrimeStrategy};
use crate::decoder::{self, DecodeOutcome};
use crate::record::{PrimeRecord, Verdict, VerificationRecord};
use crate::rr::Name;

const WIDTH: usize = 70;

/// What the run was asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
	/// The zone apex.
	pub apex: Name,
	/// The resolver queried.
	pub resolver: String,
	/// The authoritative name server.
	pub nameserver: Name,
	/// Payload bytes per chunk.
	pub chunk_size: usize,
	/// Chunks in the chain, not counting the sentinel.
	pub chunk_count: usize,
	/// The length of the payload which was encoded.
	pub payload_len: usize,
	/// How gaps were chosen for priming.
	pub prime_strategy: PrimeStrategy,
	/// The most probes in flight at once.
	pub concurrency: usize,
	/// The probe name variant.
	pub variant: u8,
}

impl RunSummary {
	/// Summarizes `config` for a payload of `payload_len` bytes.
	pub fn new(config: &Config, payload_len: usize) -> Self {
		let chunk_count = config.layout().map_or(0, |layout| layout.chunk_count(payload_len));
		RunSummary {
			apex: config.apex.clone(), resolver: config.resolver.address.to_string(),
			nameserver: config.nameserver(), chunk_size: config.chunk_size, chunk_count, payload_len,
			prime_strategy: config.prime.strategy, concurrency: config.probe.concurrency,
			variant: config.probe.variant,
		}
	}
}

/// Totals over the priming queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrimingSummary {
	/// Gaps primed.
	pub gaps: usize,
	/// Priming queries which reached the authoritative server.
	pub authoritative: usize,
	/// Authoritative queries seen over all priming queries.
	pub counter_delta: u64,
	/// Priming answers which couldn't be validated.
	pub validation_failures: usize,
}

impl PrimingSummary {
	/// Totals `records`.
	pub fn new(records: &[PrimeRecord]) -> Self {
		PrimingSummary {
			gaps: records.len(),
			authoritative: records.iter().filter(|r| r.counter_delta > 0).count(),
			counter_delta: records.iter().map(|r| r.counter_delta).sum(),
			validation_failures: records.iter().filter(|r| r.validation_failure.is_some()).count(),
		}
	}
}

/// Probe counts per verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerificationSummary {
	/// Probes sent.
	pub probes: usize,
	/// Probes answered from the cache.
	pub cache_synthesized: usize,
	/// Probes which needed the authoritative server.
	pub authoritative_roundtrip: usize,
	/// Probes whose answers couldn't be used.
	pub validation_failures: usize,
	/// Probes which never got an answer.
	pub failed: usize,
	/// Authoritative queries seen over all answered probes.
	pub counter_delta: u64,
}

impl VerificationSummary {
	/// Totals `records`.
	pub fn new(records: &[VerificationRecord]) -> Self {
		let mut summary = VerificationSummary { probes: records.len(), ..Default::default() };
		for record in records {
			match record.verdict {
				Verdict::CacheSynthesized => summary.cache_synthesized += 1,
				Verdict::AuthoritativeRoundtrip => summary.authoritative_roundtrip += 1,
				Verdict::ValidationFailure(_) => summary.validation_failures += 1,
				Verdict::Failed => summary.failed += 1,
			}
			summary.counter_delta += record.counter_delta.unwrap_or(0);
		}
		summary
	}
}

/// The outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
	/// The payload was reassembled purely from the resolver's cache.
	Pass,
	/// It wasn't.
	Fail,
}

/// Everything known about a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
	/// When the report was compiled.
	#[serde(with = "time::serde::rfc3339")]
	pub generated: OffsetDateTime,
	/// The run's configuration.
	pub config: RunSummary,
	/// Priming totals.
	pub priming: PrimingSummary,
	/// Every priming query.
	pub prime_records: Vec<PrimeRecord>,
	/// Probe totals.
	pub verification: VerificationSummary,
	/// Every probe.
	pub records: Vec<VerificationRecord>,
	/// What was reassembled from the accepted probes.
	pub decoded: DecodeOutcome,
	/// SHA-256 of the reassembled payload.
	pub payload_sha256: Option<String>,
	/// SHA-256 of the payload which was encoded, if known.
	pub expected_sha256: Option<String>,
	/// Whether the two digests agree, when both are known.
	pub matches_expected: Option<bool>,
	/// The error which cut the run short, if any.
	pub fatal_error: Option<String>,
	/// The overall outcome.
	pub outcome: Outcome,
}

fn sha256_hex(data: &[u8]) -> String {
	digest::digest(&digest::SHA256, data).as_ref().to_lower_hex_string()
}

impl Report {
	/// Compiles a report from whatever the run produced.
	///
	/// Only probes with an accepted verdict contribute proofs to the reassembly.
	pub fn compile(config: RunSummary, expected: Option<&[u8]>, prime_records: Vec<PrimeRecord>,
		records: Vec<VerificationRecord>, fatal_error: Option<String>) -> Self {
		let contributing = records.iter().filter(|r| r.verdict.is_accepted() && !r.proofs.is_empty());
		let decoded = decoder::reassemble(&config.apex, contributing.clone().flat_map(|r| r.proofs.iter()));
		let any_roundtrip = contributing.clone().any(|r| r.verdict == Verdict::AuthoritativeRoundtrip);

		let payload_sha256 = decoded.payload.as_deref().map(sha256_hex);
		let expected_sha256 = expected.map(sha256_hex);
		let matches_expected = match (&payload_sha256, &expected_sha256) {
			(Some(ours), Some(theirs)) => Some(ours == theirs),
			_ => None,
		};
		let outcome = if decoded.is_complete() && !any_roundtrip && matches_expected != Some(false) {
			Outcome::Pass
		} else {
			Outcome::Fail
		};

		Report {
			generated: OffsetDateTime::now_utc(),
			priming: PrimingSummary::new(&prime_records),
			verification: VerificationSummary::new(&records),
			config, prime_records, records, decoded, payload_sha256, expected_sha256,
			matches_expected, fatal_error, outcome,
		}
	}

	/// Whether the run passed.
	pub fn passed(&self) -> bool { self.outcome == Outcome::Pass }

	/// The process exit status for this report.
	pub fn exit_code(&self) -> i32 { if self.passed() { 0 } else { 1 } }

	/// The report as pretty-printed JSON.
	pub fn to_json(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string_pretty(self)
	}

	/// Writes the JSON report to `path`.
	pub fn write_json(&self, path: &Path) -> crate::error::Result<()> {
		fs::write(path, self.to_json()?)?;
		Ok(())
	}
}

/// Appends `records` to the log at `path`, one JSON object per line.
pub fn append_records(path: &Path, records: &[VerificationRecord]) -> crate::error::Result<()> {
	let mut lines = Vec::new();
	for record in records {
		serde_json::to_writer(&mut lines, record)?;
		lines.push(b'\n');
	}
	let mut log = OpenOptions::new().create(true).append(true).open(path)?;
	log.write_all(&lines)?;
	log.flush()?;
	Ok(())
}

fn write_bytes(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
	match core::str::from_utf8(bytes) {
		Ok(text) => write!(f, "{}", text.escape_debug()),
		Err(_) => write!(f, "<{}>", bytes.as_hex()),
	}
}

fn heading(f: &mut fmt::Formatter<'_>, title: &str) -> fmt::Result {
	writeln!(f, "{}", title)?;
	writeln!(f, "{}", "-".repeat(40))
}

fn banner(f: &mut fmt::Formatter<'_>, title: &str) -> fmt::Result {
	writeln!(f, "{}", "=".repeat(WIDTH))?;
	writeln!(f, "{:^width$}", title, width = WIDTH)?;
	writeln!(f, "{}", "=".repeat(WIDTH))
}

impl fmt::Display for Report {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "{}", "=".repeat(WIDTH))?;
		writeln!(f, "{:^width$}", "NSEC CACHE DATASTORE REPORT", width = WIDTH)?;
		let generated = self.generated.format(&time::format_description::well_known::Rfc3339)
			.map_err(|_| fmt::Error)?;
		writeln!(f, "{:^width$}", format!("Generated: {}", generated), width = WIDTH)?;
		writeln!(f, "{}", "=".repeat(WIDTH))?;
		writeln!(f)?;

		heading(f, "CONFIGURATION")?;
		writeln!(f, "  Zone:              {}", self.config.apex)?;
		writeln!(f, "  Resolver:          {}", self.config.resolver)?;
		writeln!(f, "  Name server:       {}", self.config.nameserver)?;
		writeln!(f, "  Payload:           {} bytes in {} chunks of {}",
			self.config.payload_len, self.config.chunk_count, self.config.chunk_size)?;
		writeln!(f)?;

		heading(f, "DECODED PAYLOAD")?;
		match &self.decoded.payload {
			Some(payload) => {
				f.write_str("  \"")?;
				write_bytes(f, payload)?;
				writeln!(f, "\"")?;
			},
			None => {
				let end = match self.decoded.sentinel {
					Some(info) => info.chunk_count(),
					None => self.decoded.chunks.keys().next_back().map_or(0, |last| last + 1),
				};
				f.write_str("  (partial) \"")?;
				for idx in 0..end {
					match self.decoded.chunks.get(&idx) {
						Some(chunk) => write_bytes(f, chunk)?,
						None => write!(f, "[{} missing]", Slot::Chunk(idx))?,
					}
				}
				writeln!(f, "\"")?;
				if self.decoded.sentinel.is_none() { writeln!(f, "  Sentinel missing, length unknown")?; }
			},
		}
		if let Some(digest) = &self.payload_sha256 { writeln!(f, "  SHA-256:           {}", digest)?; }
		if let Some(matches) = self.matches_expected {
			writeln!(f, "  Matches expected:  {}", if matches { "yes" } else { "NO" })?;
		}
		for mismatch in &self.decoded.mismatches { writeln!(f, "  Chain mismatch:    {}", mismatch)?; }
		for corrupt in &self.decoded.corrupt { writeln!(f, "  Corrupt:           {}", corrupt)?; }
		writeln!(f)?;

		heading(f, "PRIMING PHASE")?;
		if self.prime_records.is_empty() {
			writeln!(f, "  [No priming results available]")?;
		} else {
			writeln!(f, "  Gaps primed:                 {}", self.priming.gaps)?;
			writeln!(f, "  Reached authoritative:       {}", self.priming.authoritative)?;
			writeln!(f, "  New auth queries:            {}", self.priming.counter_delta)?;
			writeln!(f, "  Validation failures:         {}", self.priming.validation_failures)?;
			writeln!(f)?;
			writeln!(f, "  [Expected: priming contacts the authoritative server to fill the cache]")?;
		}
		writeln!(f)?;

		heading(f, "VERIFICATION PHASE")?;
		if self.records.is_empty() {
			writeln!(f, "  [No verification results available]")?;
		} else {
			let v = &self.verification;
			writeln!(f, "  Cache synthesized:           {}/{}", v.cache_synthesized, v.probes)?;
			writeln!(f, "  Authoritative round trips:   {}", v.authoritative_roundtrip)?;
			writeln!(f, "  Validation failures:         {}", v.validation_failures)?;
			writeln!(f, "  Failed:                      {}", v.failed)?;
			writeln!(f, "  New auth queries:            {}", v.counter_delta)?;
			for record in self.records.iter().filter(|r| r.verdict != Verdict::CacheSynthesized) {
				write!(f, "    {} {}: {:?}", record.slot, record.name, record.verdict)?;
				if let Some(error) = &record.error { write!(f, " ({})", error)?; }
				writeln!(f)?;
			}
			writeln!(f)?;
			writeln!(f, "  [Expected: verification never contacts the authoritative server]")?;
		}
		writeln!(f)?;

		banner(f, "VERDICT")?;
		writeln!(f)?;
		if let Some(error) = &self.fatal_error { writeln!(f, "  Run aborted: {}", error)?; }
		match self.outcome {
			Outcome::Pass => {
				writeln!(f, "  PASS: RFC 8198 aggressive negative caching confirmed.")?;
				writeln!(f, "  The resolver served every proof needed for the payload from its cache.")?;
			},
			Outcome::Fail if !self.decoded.is_complete() => {
				writeln!(f, "  FAIL: the payload could not be fully reassembled.")?;
				if !self.decoded.missing.is_empty() {
					let missing: Vec<String> = self.decoded.missing.iter().map(|s| s.to_string()).collect();
					writeln!(f, "  Missing: {}", missing.join(", "))?;
				}
			},
			Outcome::Fail if self.matches_expected == Some(false) => {
				writeln!(f, "  FAIL: the reassembled payload differs from the one encoded.")?;
			},
			Outcome::Fail => {
				writeln!(f, "  FAIL: the authoritative server was contacted during verification.")?;
				writeln!(f, "  The cached NSEC records may have expired, or aggressive NSEC caching is off.")?;
			},
		}
		writeln!(f)?;
		banner(f, "END OF REPORT")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::codec::{self, EncodedLabel};
	use crate::error::ValidationFailure;
	use crate::query::NsecProof;
	use crate::record::ProbeState;

	fn apex() -> Name { "zone.test.".try_into().unwrap() }

	fn summary(payload_len: usize) -> RunSummary {
		let mut config = Config::default();
		config.apex = apex();
		RunSummary::new(&config, payload_len)
	}

	/// One answered probe per label, each carrying the NSEC owned by its label.
	fn records(labels: &[EncodedLabel], verdict: Verdict) -> Vec<VerificationRecord> {
		let mut names: Vec<Name> = labels.iter().map(|l| l.owner_name(&apex()).unwrap()).collect();
		names.push(apex().prepend_label("ns1").unwrap());
		labels.iter().enumerate().map(|(i, label)| {
			let mut record = VerificationRecord::new(label.slot, names[i].prepend_label("x").unwrap());
			record.state = ProbeState::Answered;
			record.verdict = verdict;
			record.attempts = 1;
			record.counter_delta = Some(if verdict == Verdict::AuthoritativeRoundtrip { 1 } else { 0 });
			record.proofs = vec![NsecProof { owner: names[i].clone(), next: names[i + 1].clone() }];
			record
		}).collect()
	}

	#[test]
	fn test_pass() {
		let labels = codec::encode(b"hi", 1).unwrap();
		let report = Report::compile(summary(2), Some(b"hi"), Vec::new(),
			records(&labels, Verdict::CacheSynthesized), None);
		assert!(report.passed());
		assert_eq!(report.exit_code(), 0);
		assert_eq!(report.decoded.payload.as_deref(), Some(&b"hi"[..]));
		assert_eq!(report.matches_expected, Some(true));
		assert_eq!(report.payload_sha256.as_deref(),
			Some("8f434346648f6b96df89dda901c5176b10a6d83961dd3c1ac88b59b2dc327aa4"));
		assert_eq!(report.verification.cache_synthesized, 3);

		let text = report.to_string();
		for section in ["CONFIGURATION", "DECODED PAYLOAD", "PRIMING PHASE", "VERIFICATION PHASE", "VERDICT"] {
			assert!(text.contains(section), "{}", section);
		}
		assert!(text.contains("  \"hi\"\n"));
		assert!(text.contains("PASS"));
	}

	#[test]
	fn test_roundtrip_fails() {
		let labels = codec::encode(b"hi", 1).unwrap();
		let mut records = records(&labels, Verdict::CacheSynthesized);
		records[1].verdict = Verdict::AuthoritativeRoundtrip;
		records[1].counter_delta = Some(2);
		let report = Report::compile(summary(2), None, Vec::new(), records, None);
		assert_eq!(report.outcome, Outcome::Fail);
		assert_eq!(report.exit_code(), 1);
		// Reassembly still succeeds, the round trip alone fails the run
		assert!(report.decoded.is_complete());
		assert_eq!(report.matches_expected, None);
		assert_eq!(report.verification.counter_delta, 2);
		assert!(report.to_string().contains("contacted during verification"));
	}

	#[test]
	fn test_excluded_probe_roundtrip_does_not_count() {
		let labels = codec::encode(b"hi", 1).unwrap();
		let mut records = records(&labels, Verdict::CacheSynthesized);
		let mut extra = records[0].clone();
		extra.name = apex().prepend_label("other").unwrap();
		extra.verdict = Verdict::ValidationFailure(ValidationFailure::Unauthenticated);
		extra.counter_delta = Some(1);
		records.push(extra);
		let report = Report::compile(summary(2), Some(b"hi"), Vec::new(), records, None);
		assert!(report.passed());
		assert_eq!(report.verification.validation_failures, 1);
	}

	#[test]
	fn test_partial_payload() {
		let labels = codec::encode(b"abcdef", 2).unwrap();
		let mut records = records(&labels, Verdict::CacheSynthesized);
		// Chunk 1 is named by the probes either side of it
		for record in &mut records[1..3] {
			record.verdict = Verdict::Failed;
			record.state = ProbeState::TimedOut;
			record.proofs.clear();
		}
		let report = Report::compile(summary(6), Some(b"abcdef"), Vec::new(), records, None);
		assert!(!report.passed());
		assert_eq!(report.decoded.missing, vec![Slot::Chunk(1)]);
		assert_eq!(report.matches_expected, None);
		let text = report.to_string();
		assert!(text.contains("(partial) \"ab[#1 missing]ef\""), "{}", text);
		assert!(text.contains("Missing: #1"));
	}

	#[test]
	fn test_expected_mismatch_fails() {
		let labels = codec::encode(b"hi", 1).unwrap();
		let report = Report::compile(summary(2), Some(b"ho"), Vec::new(),
			records(&labels, Verdict::CacheSynthesized), None);
		assert_eq!(report.matches_expected, Some(false));
		assert!(!report.passed());
	}

	#[test]
	fn test_aborted_run() {
		let report = Report::compile(summary(2), Some(b"hi"), Vec::new(), Vec::new(),
			Some("resolver unreachable".to_owned()));
		assert!(!report.passed());
		let text = report.to_string();
		assert!(text.contains("[No priming results available]"));
		assert!(text.contains("[No verification results available]"));
		assert!(text.contains("Run aborted: resolver unreachable"));
		let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
		assert_eq!(json["outcome"], "fail");
		assert_eq!(json["fatal_error"], "resolver unreachable");
		assert_eq!(json["decoded"]["missing"], serde_json::json!([-1]));
	}

	#[test]
	fn test_append_records() {
		let labels = codec::encode(b"hi", 1).unwrap();
		let records = records(&labels, Verdict::CacheSynthesized);
		let path = std::env::temp_dir().join(format!("nsec-records-{}.jsonl", std::process::id()));
		let _ = fs::remove_file(&path);
		append_records(&path, &records).unwrap();
		append_records(&path, &records[..1]).unwrap();
		let log = fs::read_to_string(&path).unwrap();
		let lines: Vec<serde_json::Value> = log.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
		assert_eq!(lines.len(), 4);
		assert_eq!(lines[0]["slot"], -1);
		assert_eq!(lines[3]["slot"], -1);
		assert_eq!(lines[1]["verdict"]["verdict"], "cache_synthesized");
		fs::remove_file(&path).unwrap();
	}
}
