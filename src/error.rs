//! The closed set of errors this crate can produce.
//!
//! Each concern has its own error type, and all of them convert into the crate-level [`Error`],
//! whose [`Error::kind`] names the category a failure belongs to.

use std::{fmt, io};

use serde::Serialize;
use thiserror::Error;

use crate::codec::Slot;
use crate::rr::Name;

/// An alias for results returned by functions of this crate
pub type Result<T> = ::std::result::Result<T, Error>;

/// Why a label could not be decoded as a chunk of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum CorruptReason {
	/// The label is not the length every label of the chain shares.
	#[error("wrong label length")]
	Length,
	/// The label does not start with a sentinel or chunk tag.
	#[error("unknown tag")]
	Tag,
	/// The sequence index token is not a fixed-width decimal number.
	#[error("malformed sequence index")]
	Index,
	/// The label contains a character outside the base32hex alphabet.
	#[error("character outside the label alphabet")]
	Character,
	/// The label body is not canonical base32hex.
	#[error("non-canonical base32hex body")]
	Encoding,
	/// Padding bytes beyond the payload are not zero.
	#[error("non-zero padding")]
	Padding,
	/// Another, different, label claims the same slot.
	#[error("conflicts with another label for the same slot")]
	ConflictingSlot,
	/// The sentinel's chunk size does not fit the label length.
	#[error("inconsistent sentinel")]
	Sentinel,
	/// The chunk index lies past the end the sentinel describes.
	#[error("index past the end of the payload")]
	OutOfRange,
}

/// Errors from encoding or decoding a payload as chain labels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
	/// The chunk size can't produce labels within DNS limits.
	#[error("chunk size {0} is outside 1..={max}", max = crate::codec::MAX_CHUNK_SIZE)]
	InvalidChunkSize(usize),
	/// The payload needs more chunks than the index token can address.
	#[error("payload needs {chunks} chunks, at most {max} are addressable", max = crate::codec::MAX_CHUNKS)]
	PayloadTooLarge {
		/// The number of chunks required.
		chunks: usize,
	},
	/// Appending a label to the apex exceeds the 255 octet name limit.
	#[error("label {label:?} does not fit below {apex}")]
	NameTooLong {
		/// The label being placed below the apex.
		label: String,
		/// The zone apex.
		apex: Name,
	},
	/// One or more slots between the sentinel and the last chunk were never seen.
	#[error("chain is incomplete, missing {}", SlotList(.missing))]
	IncompleteChain {
		/// Every slot which is missing, in order.
		missing: Vec<Slot>,
	},
	/// A label is not a valid chunk encoding.
	#[error("label {label:?} is not a valid chunk: {reason}")]
	CorruptChunk {
		/// The offending label.
		label: String,
		/// What is wrong with it.
		reason: CorruptReason,
	},
}

struct SlotList<'a>(&'a [Slot]);
impl fmt::Display for SlotList<'_> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for (i, slot) in self.0.iter().enumerate() {
			if i != 0 { f.write_str(", ")?; }
			fmt::Display::fmt(slot, f)?;
		}
		Ok(())
	}
}

/// A harvested proof whose `next` name is not the successor of its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("NSEC {owner} -> {next} does not follow the chain, expected {expected} after {owner_slot}")]
pub struct ChainMismatch {
	/// The NSEC owner name.
	pub owner: Name,
	/// The NSEC next name.
	pub next: Name,
	/// The slot the owner decoded to.
	pub owner_slot: Slot,
	/// The slot which should follow it.
	pub expected: Slot,
}

/// Why a probe's answer could not be used, even though one arrived.
///
/// These are never retried, the probe is excluded and the run continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ValidationFailure {
	/// The resolver did not set the AD bit, so it did not validate the answer.
	#[error("the resolver did not authenticate the response")]
	Unauthenticated,
	/// An NXDOMAIN arrived without any NSEC record to prove it.
	#[error("NXDOMAIN response carried no NSEC records")]
	MissingNsec,
	/// A response code other than NXDOMAIN, SERVFAIL usually meaning the signatures were bogus.
	#[error("unexpected response code {rcode}")]
	UnexpectedRcode {
		/// The RCODE received.
		rcode: u8,
	},
	/// The response could not be parsed.
	#[error("the response was malformed")]
	Malformed,
}

/// Errors sending a query or receiving its response.
#[derive(Debug, Error)]
pub enum QueryError {
	/// No response arrived within the timeout.
	#[error("query timed out")]
	Timeout,
	/// The socket failed.
	#[error("transport error: {0}")]
	Io(#[from] io::Error),
	/// The response was not a valid DNS message or did not answer our question.
	#[error("invalid response")]
	InvalidResponse,
}
impl QueryError {
	/// Whether another attempt may succeed.
	pub fn is_retryable(&self) -> bool {
		!matches!(self, QueryError::InvalidResponse)
	}
}

/// Errors reading the authoritative query counter.
#[derive(Debug, Error)]
pub enum CounterError {
	/// The counter source could not be read.
	#[error("failed to read query counter: {0}")]
	Io(#[from] io::Error),
	/// The counter went backwards, so it is not the monotonic counter we were promised.
	#[error("query counter went backwards from {before} to {after}")]
	NotMonotonic {
		/// The earlier reading.
		before: u64,
		/// The later, smaller, reading.
		after: u64,
	},
}

/// Errors which abort priming.
#[derive(Debug, Error)]
pub enum PrimeError {
	/// A priming query never got an answer within the retry budget.
	#[error("priming query for {name} failed after {attempts} attempts: {last}")]
	PrimingTimeout {
		/// The gap name being primed.
		name: Name,
		/// How many attempts were made.
		attempts: u32,
		/// The error from the final attempt.
		last: QueryError,
	},
	/// The query counter could not be read.
	#[error(transparent)]
	Counter(#[from] CounterError),
}

/// Configuration errors, all fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// The payload to encode is empty.
	#[error("the payload is empty")]
	EmptyPayload,
	/// The chunk size can't produce valid labels.
	#[error(transparent)]
	Codec(#[from] CodecError),
	/// A setting which must be positive is zero.
	#[error("{0} must be greater than zero")]
	NotPositive(&'static str),
	/// The zone apex is too long to hold gap names below it.
	#[error("apex {apex} is too long, gap names need {needed} octets")]
	ApexTooLong {
		/// The configured apex.
		apex: Name,
		/// The total name length a gap name would need.
		needed: usize,
	},
	/// An in-zone name server would sort inside the chain and split it.
	#[error("name server {nameserver} would sort inside the payload chain")]
	NameserverInChain {
		/// The configured name server.
		nameserver: Name,
	},
	/// The resolver never answered the readiness handshake.
	#[error("resolver {addr} did not become ready within {waited_ms}ms: {last}")]
	ResolverUnreachable {
		/// The resolver's address.
		addr: String,
		/// How long we waited.
		waited_ms: u128,
		/// What the last attempt saw.
		last: String,
	},
	/// The configuration file could not be read.
	#[error("failed to read configuration: {0}")]
	Io(#[from] io::Error),
	/// The configuration file is not valid TOML for our schema.
	#[error("toml decode error: {0}")]
	TomlDecode(#[from] toml::de::Error),
}

/// The category of an [`Error`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
	/// Fatal configuration problems.
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	/// Encoding or decoding the chain.
	#[error("codec error: {0}")]
	Codec(#[from] CodecError),
	/// A harvested proof out of chain order.
	#[error("chain mismatch: {0}")]
	ChainMismatch(#[from] ChainMismatch),
	/// An unusable answer.
	#[error("validation failure: {0}")]
	Validation(#[from] ValidationFailure),
	/// Network failures.
	#[error("query error: {0}")]
	Query(#[from] QueryError),
	/// The authoritative query counter.
	#[error("counter error: {0}")]
	Counter(#[from] CounterError),
	/// Priming aborted.
	#[error("priming error: {0}")]
	Prime(#[from] PrimeError),
	/// Writing output.
	#[error("io error: {0}")]
	Io(#[from] io::Error),
	/// Encoding the report.
	#[error("json encode error: {0}")]
	Json(#[from] serde_json::Error),
}

/// The error type for errors that get returned in the crate
#[derive(Debug)]
pub struct Error {
	kind: Box<ErrorKind>,
}

impl Error {
	/// Get the kind of the error
	pub fn kind(&self) -> &ErrorKind {
		&self.kind
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Display::fmt(&self.kind, f)
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		std::error::Error::source(&*self.kind)
	}
}

impl<E> From<E> for Error
where
	E: Into<ErrorKind>,
{
	fn from(error: E) -> Self {
		Self { kind: Box::new(error.into()) }
	}
}
