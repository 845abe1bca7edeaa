//! Writes the unsigned zone holding an encoded chain, ready for an external signer.
//!
//! The zone only needs one record per label for the signer to link the labels with NSEC records,
//! so each label gets a single `A` record from TEST-NET-1. Record order in the text is cosmetic,
//! the signer sorts names canonically itself.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::Serialize;
use time::OffsetDateTime;

use crate::codec::{self, EncodedLabel, Slot};
use crate::config::Config;
use crate::error::{CodecError, ConfigError};
use crate::rr::Name;

const REFRESH: u32 = 3600;
const RETRY: u32 = 900;
const EXPIRE: u32 = 604800;

/// Zone contents besides the chain itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneOptions {
	/// The authoritative name server, given glue if it lies in the zone.
	pub nameserver: Name,
	/// The glue address for an in-zone name server.
	pub nameserver_address: Ipv4Addr,
	/// The local part of the SOA mailbox.
	pub admin: String,
	/// The SOA serial.
	pub serial: u32,
}

impl ZoneOptions {
	/// Options from the configuration, with a serial for the current hour.
	pub fn from_config(config: &Config) -> Self {
		ZoneOptions {
			nameserver: config.nameserver(),
			nameserver_address: config.zone.nameserver_address,
			admin: config.zone.admin.clone(),
			serial: serial_for(OffsetDateTime::now_utc()),
		}
	}
}

/// The conventional `YYYYMMDDHH` serial for `time`.
pub fn serial_for(time: OffsetDateTime) -> u32 {
	let time = time.to_offset(time::UtcOffset::UTC);
	time.year() as u32 * 1_000_000 + u8::from(time.month()) as u32 * 10_000
		+ time.day() as u32 * 100 + time.hour() as u32
}

/// A summary of a built zone, so later phases need not parse it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZoneMeta {
	/// The zone apex.
	pub apex: Name,
	/// The name server host.
	pub nameserver: Name,
	/// The number of payload chunks, not counting the sentinel.
	pub chunk_count: u32,
	/// The length of every chain label.
	pub label_len: usize,
	/// The SOA serial.
	pub serial: u32,
	/// The TTL of every record.
	pub ttl: u32,
}

/// A built zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zone {
	/// The zone file, in BIND master file format.
	pub text: String,
	/// What went into it.
	pub meta: ZoneMeta,
}

impl Zone {
	/// Writes the zone file to `path`, creating parent directories as needed.
	pub fn write_to(&self, path: &Path) -> io::Result<()> {
		if let Some(parent) = path.parent() {
			if !parent.as_os_str().is_empty() { fs::create_dir_all(parent)?; }
		}
		fs::write(path, &self.text)
	}
}

fn chain_address(slot: Slot) -> Ipv4Addr {
	match slot {
		Slot::Sentinel => Ipv4Addr::new(192, 0, 2, 9),
		Slot::Chunk(idx) => Ipv4Addr::new(192, 0, 2, 10 + (idx % 240) as u8),
	}
}

/// Checks that an in-zone name server can't land inside the chain.
pub(crate) fn check_nameserver(apex: &Name, nameserver: &Name) -> Result<(), ConfigError> {
	if nameserver == apex || !nameserver.is_within(apex) { return Ok(()); }
	let below_apex = nameserver.labels().rev().nth(apex.label_count());
	if below_apex.map_or(true, codec::sorts_outside_chain) {
		Ok(())
	} else {
		Err(ConfigError::NameserverInChain { nameserver: nameserver.clone() })
	}
}

/// Builds the zone text for `labels` below `apex`.
///
/// The SOA minimum is set to `ttl` so negative answers are cached exactly as long as the chain.
pub fn build(labels: &[EncodedLabel], ttl: u32, apex: &Name, options: &ZoneOptions) -> Result<Zone, ConfigError> {
	check_nameserver(apex, &options.nameserver)?;
	let rname = apex.prepend_label(&options.admin).map_err(|()| CodecError::NameTooLong {
		label: options.admin.clone(), apex: apex.clone(),
	})?;
	let chunk_count = labels.iter().filter(|l| matches!(l.slot, Slot::Chunk(_))).count() as u32;
	let label_len = labels.first().map_or(0, |l| l.label.len());

	let mut text = String::new();
	// Writing to a String never fails
	let _ = writeln!(text, "$ORIGIN {}", apex);
	let _ = writeln!(text, "$TTL {}", ttl);
	let _ = writeln!(text, "; {} payload chunks in labels of {} characters", chunk_count, label_len);
	let _ = writeln!(text, "@\tIN\tSOA\t{} {} (", options.nameserver, rname);
	let _ = writeln!(text, "\t\t{}\t; serial", options.serial);
	let _ = writeln!(text, "\t\t{}\t; refresh", REFRESH);
	let _ = writeln!(text, "\t\t{}\t; retry", RETRY);
	let _ = writeln!(text, "\t\t{}\t; expire", EXPIRE);
	let _ = writeln!(text, "\t\t{}\t; minimum", ttl);
	let _ = writeln!(text, "\t)");
	let _ = writeln!(text, "@\tIN\tNS\t{}", options.nameserver);
	if options.nameserver.is_within(apex) && options.nameserver != *apex {
		let _ = writeln!(text, "{}\tIN\tA\t{}", options.nameserver, options.nameserver_address);
	}
	let _ = writeln!(text, "; the signer links these with NSEC records in this order");
	for label in labels {
		// Fails early if the apex is too long for the chain
		label.owner_name(apex)?;
		let _ = writeln!(text, "{}\tIN\tA\t{}\t; {}", label.label, chain_address(label.slot), label.slot);
	}

	Ok(Zone {
		text,
		meta: ZoneMeta {
			apex: apex.clone(), nameserver: options.nameserver.clone(), chunk_count, label_len,
			serial: options.serial, ttl,
		},
	})
}

/// Encodes the configured payload and builds its zone.
pub fn build_from_config(config: &Config) -> Result<Zone, ConfigError> {
	config.validate()?;
	let payload = config.load_payload()?;
	let labels = codec::encode(&payload, config.chunk_size)?;
	build(&labels, config.ttl, &config.apex, &ZoneOptions::from_config(config))
}
