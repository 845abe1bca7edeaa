//! Run configuration, read from TOML.
//!
//! Every field has a default, so an empty file describes the stock demo: the message
//! `hello from nsec cache datastore` in 8 byte chunks below `zone.test.`.
//!
//! ```toml
//! apex = "zone.test."
//! payload = "hello from nsec cache datastore"
//! chunk_size = 8
//!
//! [resolver]
//! address = "172.28.0.3:53"
//!
//! [counter]
//! query_log = "/auth-logs/query.log"
//! ```

use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{self, Layout, Slot};
use crate::error::ConfigError;
use crate::rr::Name;

/// The default message stored in the chain.
pub const DEFAULT_PAYLOAD: &str = "hello from nsec cache datastore";
/// The default TTL of the zone's records, and its negative caching TTL.
pub const DEFAULT_TTL: u32 = 60;

/// The full configuration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
	/// The apex of the zone holding the chain.
	pub apex: Name,
	/// The payload, as text.
	pub payload: String,
	/// A file to read the payload from instead of [`Self::payload`].
	pub payload_file: Option<PathBuf>,
	/// Payload bytes per label.
	pub chunk_size: usize,
	/// The TTL of every record in the zone.
	pub ttl: u32,
	/// How the zone file is written.
	pub zone: ZoneConfig,
	/// The validating resolver under test.
	pub resolver: ResolverConfig,
	/// Retry and backoff for timed out queries.
	pub retry: RetryPolicy,
	/// Cache warming.
	pub prime: PrimeConfig,
	/// Cache residency probing.
	pub probe: ProbeConfig,
	/// The authoritative query counter.
	pub counter: CounterConfig,
	/// Report output.
	pub report: ReportConfig,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			apex: Name::try_from("zone.test.").unwrap_or_else(|()| Name::root()),
			payload: DEFAULT_PAYLOAD.to_owned(),
			payload_file: None,
			chunk_size: codec::DEFAULT_CHUNK_SIZE,
			ttl: DEFAULT_TTL,
			zone: ZoneConfig::default(),
			resolver: ResolverConfig::default(),
			retry: RetryPolicy::default(),
			prime: PrimeConfig::default(),
			probe: ProbeConfig::default(),
			counter: CounterConfig::default(),
			report: ReportConfig::default(),
		}
	}
}

impl Config {
	/// Reads a [`Config`] from the TOML file at `path`.
	pub fn read_config(path: &Path) -> Result<Self, ConfigError> {
		let toml = fs::read_to_string(path)?;
		Self::from_toml(&toml)
	}

	/// Reads a [`Config`] from the given TOML string.
	pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
		Ok(toml::from_str(toml)?)
	}

	/// Checks everything which can be checked before touching the network.
	pub fn validate(&self) -> Result<(), ConfigError> {
		let layout = self.layout()?;
		if self.payload_file.is_none() && self.payload.is_empty() {
			return Err(ConfigError::EmptyPayload);
		}
		if self.probe.concurrency == 0 { return Err(ConfigError::NotPositive("probe.concurrency")); }
		if self.retry.attempts == 0 { return Err(ConfigError::NotPositive("retry.attempts")); }
		if self.resolver.timeout_ms == 0 { return Err(ConfigError::NotPositive("resolver.timeout_ms")); }
		if self.ttl == 0 { return Err(ConfigError::NotPositive("ttl")); }

		let needed = if self.apex.as_str() == "." {
			layout.gap_label_len() + 1
		} else {
			layout.gap_label_len() + 1 + self.apex.len()
		};
		if needed > 255 {
			return Err(ConfigError::ApexTooLong { apex: self.apex.clone(), needed });
		}
		crate::zone::check_nameserver(&self.apex, &self.nameserver())
	}

	/// The label layout for the configured chunk size.
	pub fn layout(&self) -> Result<Layout, ConfigError> {
		Ok(Layout::new(self.chunk_size)?)
	}

	/// The payload bytes, from [`Self::payload_file`] if set, else [`Self::payload`].
	pub fn load_payload(&self) -> Result<Vec<u8>, ConfigError> {
		let payload = match &self.payload_file {
			Some(path) => fs::read(path)?,
			None => self.payload.as_bytes().to_vec(),
		};
		if payload.is_empty() { return Err(ConfigError::EmptyPayload); }
		Ok(payload)
	}

	/// The zone's name server, `ns1` below the apex unless configured.
	pub fn nameserver(&self) -> Name {
		match &self.zone.nameserver {
			Some(ns) => ns.clone(),
			None => self.apex.prepend_label("ns1").unwrap_or_else(|()| self.apex.clone()),
		}
	}
}

impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(toml: &str) -> Result<Self, Self::Err> {
		Self::from_toml(toml)
	}
}

/// How the zone file is written.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZoneConfig {
	/// The name server host. Defaults to `ns1` below the apex.
	pub nameserver: Option<Name>,
	/// The address given to the name server when it lies within the zone.
	pub nameserver_address: Ipv4Addr,
	/// The local part of the SOA responsible mailbox.
	pub admin: String,
	/// Where `zone` mode writes the zone file.
	pub output: PathBuf,
}

impl Default for ZoneConfig {
	fn default() -> Self {
		ZoneConfig {
			nameserver: None,
			nameserver_address: Ipv4Addr::new(192, 0, 2, 1),
			admin: "hostmaster".to_owned(),
			output: PathBuf::from("zone.db"),
		}
	}
}

/// The validating resolver under test.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
	/// Where queries are sent.
	pub address: SocketAddr,
	/// How long to wait for each response.
	pub timeout_ms: u64,
	/// How long the readiness handshake may take in total.
	pub readiness_timeout_ms: u64,
	/// The pause between readiness attempts.
	pub readiness_interval_ms: u64,
}

impl Default for ResolverConfig {
	fn default() -> Self {
		ResolverConfig {
			address: SocketAddr::from(([127, 0, 0, 1], 53)),
			timeout_ms: 2_000,
			readiness_timeout_ms: 30_000,
			readiness_interval_ms: 500,
		}
	}
}

impl ResolverConfig {
	/// The per-query timeout.
	pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_ms) }
	/// The overall readiness deadline.
	pub fn readiness_timeout(&self) -> Duration { Duration::from_millis(self.readiness_timeout_ms) }
	/// The pause between readiness attempts.
	pub fn readiness_interval(&self) -> Duration { Duration::from_millis(self.readiness_interval_ms) }
}

/// Bounded retries with exponential backoff, shared by priming and probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
	/// The total number of attempts, including the first.
	pub attempts: u32,
	/// The pause after the first failed attempt.
	pub initial_backoff_ms: u64,
	/// The longest pause between attempts.
	pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		RetryPolicy { attempts: 3, initial_backoff_ms: 250, max_backoff_ms: 4_000 }
	}
}

impl RetryPolicy {
	/// The pause after `failed` attempts have failed, doubling each time up to the maximum.
	pub fn backoff(&self, failed: u32) -> Duration {
		let shift = failed.saturating_sub(1).min(32);
		let ms = self.initial_backoff_ms.saturating_mul(1u64 << shift).min(self.max_backoff_ms);
		Duration::from_millis(ms)
	}
}

/// Which gaps are primed, and then probed.
///
/// Probes only go to primed gaps, as a gap which was never primed has nothing cached to answer
/// from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrimeStrategy {
	/// Every gap: after the sentinel and after every chunk.
	#[default]
	EveryGap,
	/// Every other gap: after the sentinel, then after chunks 1, 3, 5 and so on. The NSEC records
	/// for these gaps between them own or point at every label.
	Covering,
}
impl PrimeStrategy {
	/// Whether the gap following `slot` is queried.
	pub fn includes(self, slot: Slot) -> bool {
		match (self, slot) {
			(PrimeStrategy::EveryGap, _) => true,
			(PrimeStrategy::Covering, Slot::Sentinel) => true,
			(PrimeStrategy::Covering, Slot::Chunk(idx)) => idx % 2 == 1,
		}
	}
}

/// Cache warming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrimeConfig {
	/// Which gaps to query.
	pub strategy: PrimeStrategy,
}

/// Cache residency probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProbeConfig {
	/// The most probes in flight at once.
	pub concurrency: usize,
	/// Selects a fresh set of probe names, so reruns query names the resolver has never seen.
	pub variant: u8,
	/// The pause before the second counter read, letting the authoritative server's log catch up.
	pub settle_ms: u64,
}

impl Default for ProbeConfig {
	fn default() -> Self {
		ProbeConfig { concurrency: 4, variant: 0, settle_ms: 100 }
	}
}

impl ProbeConfig {
	/// The counter settle delay.
	pub fn settle(&self) -> Duration { Duration::from_millis(self.settle_ms) }
}

/// The authoritative query counter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CounterConfig {
	/// The authoritative server's query log.
	pub query_log: PathBuf,
}

impl Default for CounterConfig {
	fn default() -> Self {
		CounterConfig { query_log: PathBuf::from("/auth-logs/query.log") }
	}
}

/// Report output.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportConfig {
	/// Where to write the JSON report, in addition to printing the text report.
	pub json: Option<PathBuf>,
	/// A file verification records are appended to, one JSON object per line.
	pub records_log: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults() {
		let config = Config::from_toml("").unwrap();
		assert_eq!(config, Config::default());
		assert_eq!(config.apex.as_str(), "zone.test.");
		assert_eq!(config.chunk_size, 8);
		assert_eq!(config.load_payload().unwrap(), DEFAULT_PAYLOAD.as_bytes());
		assert_eq!(config.nameserver().as_str(), "ns1.zone.test.");
		assert_eq!(config.prime.strategy, PrimeStrategy::EveryGap);
		config.validate().unwrap();
	}

	#[test]
	fn test_read_toml() {
		let config: Config = r#"
			apex = "Data.Example"
			payload = "hi"
			chunk_size = 1

			[resolver]
			address = "172.28.0.3:53"
			timeout_ms = 500

			[retry]
			attempts = 5

			[prime]
			strategy = "covering"

			[probe]
			concurrency = 1
			variant = 7
		"#.parse().unwrap();
		assert_eq!(config.apex.as_str(), "data.example.");
		assert_eq!(config.resolver.address, "172.28.0.3:53".parse().unwrap());
		assert_eq!(config.resolver.timeout(), Duration::from_millis(500));
		assert_eq!(config.retry.attempts, 5);
		assert_eq!(config.retry.initial_backoff_ms, 250);
		assert_eq!(config.prime.strategy, PrimeStrategy::Covering);
		assert_eq!(config.probe.variant, 7);
		assert_eq!(config.probe.settle_ms, 100);
		config.validate().unwrap();

		assert!(matches!(Config::from_toml("chunk_size = \"eight\""), Err(ConfigError::TomlDecode(_))));
		assert!(matches!(Config::from_toml("unknown_key = 1"), Err(ConfigError::TomlDecode(_))));
	}

	#[test]
	fn test_validation() {
		let check = |toml: &str| Config::from_toml(toml).unwrap().validate();
		assert!(matches!(check("chunk_size = 0"), Err(ConfigError::Codec(_))));
		assert!(matches!(check("chunk_size = 34"), Err(ConfigError::Codec(_))));
		check("chunk_size = 33").unwrap();
		assert!(matches!(check("payload = \"\""), Err(ConfigError::EmptyPayload)));
		assert!(matches!(check("[probe]\nconcurrency = 0"), Err(ConfigError::NotPositive("probe.concurrency"))));
		assert!(matches!(check("[retry]\nattempts = 0"), Err(ConfigError::NotPositive("retry.attempts"))));

		let long_apex = vec!["a".repeat(60); 4].join(".") + ".";
		let err = check(&format!("apex = \"{}\"", long_apex)).unwrap_err();
		assert!(matches!(err, ConfigError::ApexTooLong { .. }));

		assert!(matches!(check("[zone]\nnameserver = \"b.zone.test.\""),
			Err(ConfigError::NameserverInChain { .. })));
		check("[zone]\nnameserver = \"ns.provider.test.\"").unwrap();
	}

	#[test]
	fn test_backoff() {
		let policy = RetryPolicy { attempts: 6, initial_backoff_ms: 100, max_backoff_ms: 500 };
		assert_eq!(policy.backoff(1), Duration::from_millis(100));
		assert_eq!(policy.backoff(2), Duration::from_millis(200));
		assert_eq!(policy.backoff(3), Duration::from_millis(400));
		assert_eq!(policy.backoff(4), Duration::from_millis(500));
		assert_eq!(policy.backoff(100), Duration::from_millis(500));
	}
}
