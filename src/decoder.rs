//! Reassembles a payload from the NSEC proofs harvested by probes.
//!
//! Each proof's owner name carries one chunk, and its next name should carry the chunk which
//! follows it. Proofs which break that rule are reported as [`ChainMismatch`]es and left out of
//! the reassembly. When different labels turn up for the same slot none of them is trusted, and
//! the slot is reported missing.

use std::collections::{BTreeMap, BTreeSet};

use hex_conservative::DisplayHex;
use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::codec::{self, ChainDecoder, SentinelInfo, Slot};
use crate::error::{ChainMismatch, CodecError, CorruptReason};
use crate::query::NsecProof;
use crate::rr::Name;

/// Everything learned from a set of proofs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DecodeOutcome {
	/// The payload, if every chunk was recovered.
	#[serde(serialize_with = "serialize_opt_hex")]
	pub payload: Option<Vec<u8>>,
	/// The payload length and chunk size, if the sentinel was recovered.
	pub sentinel: Option<SentinelInfo>,
	/// The recovered chunks by index.
	#[serde(serialize_with = "serialize_chunks")]
	pub chunks: BTreeMap<u32, Vec<u8>>,
	/// Slots known to be missing.
	pub missing: Vec<Slot>,
	/// Proofs which didn't follow the chain.
	pub mismatches: Vec<ChainMismatch>,
	/// Labels which couldn't be decoded.
	#[serde(serialize_with = "serialize_display")]
	pub corrupt: Vec<CodecError>,
	/// How many distinct proofs contributed a label.
	pub proofs_used: usize,
}

impl DecodeOutcome {
	/// Whether the whole payload was recovered.
	pub fn is_complete(&self) -> bool { self.payload.is_some() }
}

pub(crate) fn serialize_opt_hex<S: Serializer>(payload: &Option<Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
	match payload {
		Some(payload) => ser.serialize_some(&payload.to_lower_hex_string()),
		None => ser.serialize_none(),
	}
}

fn serialize_chunks<S: Serializer>(chunks: &BTreeMap<u32, Vec<u8>>, ser: S) -> Result<S::Ok, S::Error> {
	ser.collect_map(chunks.iter().map(|(idx, chunk)| (idx, chunk.to_lower_hex_string())))
}

fn serialize_display<S: Serializer>(errors: &[CodecError], ser: S) -> Result<S::Ok, S::Error> {
	ser.collect_seq(errors.iter().map(|e| e.to_string()))
}

/// The chain label of a name directly below `apex`, or `None` for names which merely bound the
/// chain (the apex itself, the name server, anything outside the zone).
fn chain_label<'a>(name: &'a Name, apex: &Name) -> Option<&'a str> {
	name.child_label_of(apex).filter(|label| codec::is_chain_label(label))
}

fn parse_claim(label: Option<&str>) -> Result<Option<(&str, Slot)>, (&str, CodecError)> {
	match label {
		None => Ok(None),
		Some(label) => codec::parse_label(label).map(|(slot, _)| Some((label, slot))).map_err(|e| (label, e)),
	}
}

/// A proof naming a label. `predecessor` is the owner's slot when the label is the proof's next
/// name.
struct Source<'a> {
	proof: &'a NsecProof,
	predecessor: Option<Slot>,
}

type Claims<'a> = BTreeMap<Slot, BTreeMap<&'a str, Vec<Source<'a>>>>;

fn claim<'a>(claims: &mut Claims<'a>, (label, slot): (&'a str, Slot), source: Source<'a>) {
	claims.entry(slot).or_default().entry(label).or_default().push(source);
}

/// Reassembles whatever `proofs` allow.
///
/// Both the owner and the next name of a proof carry a label, so a label can be learned from the
/// proof for the gap before it as well as the one after it. Proofs may arrive in any order, and
/// the same proof may appear any number of times.
pub fn reassemble<'a, I: IntoIterator<Item = &'a NsecProof>>(apex: &Name, proofs: I) -> DecodeOutcome {
	let proofs: BTreeSet<&NsecProof> = proofs.into_iter().collect();
	let mut mismatches = Vec::new();
	let mut corrupt = Vec::new();
	let mut seen_corrupt = BTreeSet::new();
	let mut claims = Claims::new();
	// Proofs closing the ring can only be checked once the chunk count is known
	let mut ring_closers = Vec::new();

	let mut record_corrupt = |label: &str, e: CodecError, corrupt: &mut Vec<CodecError>| {
		if seen_corrupt.insert(label.to_owned()) {
			warn!("Excluding undecodable label {}: {}", label, e);
			corrupt.push(e);
		}
	};

	for proof in proofs {
		let owner = parse_claim(chain_label(&proof.owner, apex));
		let next = parse_claim(chain_label(&proof.next, apex));
		let (owner, next) = match (owner, next) {
			(Ok(owner), Ok(next)) => (owner, next),
			(owner, next) => {
				for (label, e) in owner.err().into_iter().chain(next.err()) {
					record_corrupt(label, e, &mut corrupt);
				}
				continue;
			},
		};
		match (owner, next) {
			(Some((_, owner_slot)), Some((_, next_slot))) if next_slot != owner_slot.successor() => {
				mismatches.push(mismatch(proof, owner_slot, owner_slot.successor()));
			},
			(Some(owner), Some(next)) => {
				claim(&mut claims, owner, Source { proof, predecessor: None });
				claim(&mut claims, next, Source { proof, predecessor: Some(owner.1) });
			},
			(Some(owner), None) => ring_closers.push((proof, owner)),
			// Only the sentinel directly follows a name sorting before the chain
			(None, Some(next)) if next.1 == Slot::Sentinel => {
				claim(&mut claims, next, Source { proof, predecessor: None });
			},
			(None, _) => debug!("Ignoring NSEC {} -> {}, it does not lead into the chain", proof.owner, proof.next),
		}
	}

	let sentinel = match claims.get(&Slot::Sentinel) {
		Some(labels) if labels.len() == 1 => labels.keys().next().and_then(|label| {
			let mut lookahead = ChainDecoder::new();
			lookahead.insert(label).ok()?;
			lookahead.sentinel()
		}),
		_ => None,
	};
	let last = sentinel.map(|info| match info.chunk_count() {
		0 => Slot::Sentinel,
		count => Slot::Chunk(count - 1),
	});
	for (proof, owner) in ring_closers {
		match last {
			Some(last) if owner.1 != last => mismatches.push(mismatch(proof, owner.1, owner.1.successor())),
			_ => claim(&mut claims, owner, Source { proof, predecessor: None }),
		}
	}

	let mut decoder = ChainDecoder::new();
	let mut used = BTreeSet::new();
	for (slot, labels) in claims.iter() {
		if labels.len() > 1 {
			// Which of them the chain really holds is unknowable, so none is used
			warn!("{} different labels claim slot {}", labels.len(), slot);
			for (label, sources) in labels {
				for source in sources {
					if let Some(predecessor) = source.predecessor {
						mismatches.push(mismatch(source.proof, predecessor, *slot));
					}
				}
				let e = CodecError::CorruptChunk { label: (*label).to_owned(), reason: CorruptReason::ConflictingSlot };
				record_corrupt(label, e, &mut corrupt);
			}
			continue;
		}
		for (label, sources) in labels {
			match decoder.insert(label) {
				Ok(_) => used.extend(sources.iter().map(|source| source.proof)),
				Err(e) => record_corrupt(label, e, &mut corrupt),
			}
		}
	}

	let partial = decoder.partial();
	// Labels excluded above don't stop the rest from decoding
	let payload = partial.payload();
	for e in partial.corrupt.iter() {
		corrupt.push(e.clone());
	}
	debug!("Reassembled {} of {} chunks from {} proofs, {} missing",
		partial.chunks.len(), partial.sentinel.map_or(0, |info| info.chunk_count()), used.len(),
		partial.missing.len());
	DecodeOutcome {
		payload,
		sentinel: partial.sentinel,
		chunks: partial.chunks,
		missing: partial.missing,
		mismatches,
		corrupt,
		proofs_used: used.len(),
	}
}

fn mismatch(proof: &NsecProof, owner_slot: Slot, expected: Slot) -> ChainMismatch {
	let mismatch = ChainMismatch { owner: proof.owner.clone(), next: proof.next.clone(), owner_slot, expected };
	warn!("{}", mismatch);
	mismatch
}
