//! Maps a payload onto a run of DNS labels whose canonical order is the payload order, and back.
//!
//! Every label has the same length and is built from a one-character tag, a fixed-width decimal
//! chunk index and the lowercase base32hex encoding of a fixed-size block. Because the tag and the
//! index lead the label and all labels are equally long, the canonical DNS ordering of the owner
//! names (which compares label octets) is exactly the index ordering, so the NSEC chain a signer
//! computes over the zone walks the chunks in order.
//!
//! The first label of the chain is a sentinel carrying the payload length and chunk size, letting
//! [`decode`] know how many chunks to expect and how much padding to strip.

use core::fmt;
use std::collections::BTreeMap;

use crate::base32;
use crate::error::{CodecError, CorruptReason};
use crate::rr::Name;

/// The number of decimal digits in a chunk index.
pub const INDEX_WIDTH: usize = 6;
/// The most chunks a payload can be split into, limited by [`INDEX_WIDTH`].
pub const MAX_CHUNKS: usize = 1_000_000;
/// The largest chunk size whose labels, and the gap labels derived from them, fit in 63 octets.
pub const MAX_CHUNK_SIZE: usize = 33;
/// The chunk size used when none is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 8;

// u32 payload length followed by a u16 chunk size
const SENTINEL_BLOCK: usize = 6;
const SENTINEL_TAG: u8 = b'a';
const CHUNK_TAG: u8 = b'c';
const MAX_LABEL_LEN: usize = 63;
// Gap labels append a marker and a variant digit to an owner label.
const GAP_SUFFIX_LEN: usize = 2;

/// A position in the chain: the sentinel, followed by the payload chunks in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Slot {
	/// The length-carrying label, sorting before every chunk.
	Sentinel,
	/// The payload chunk with the given zero-based index.
	Chunk(u32),
}
impl Slot {
	/// The numeric sequence index, with the sentinel at -1.
	pub fn index(&self) -> i64 {
		match self {
			Slot::Sentinel => -1,
			Slot::Chunk(idx) => *idx as i64,
		}
	}

	/// The slot which directly follows this one in the chain.
	pub fn successor(&self) -> Slot {
		match self {
			Slot::Sentinel => Slot::Chunk(0),
			Slot::Chunk(idx) => Slot::Chunk(idx + 1),
		}
	}

	/// Every slot of a chain with `chunk_count` chunks, in chain order.
	pub fn all(chunk_count: u32) -> impl Iterator<Item = Slot> {
		core::iter::once(Slot::Sentinel).chain((0..chunk_count).map(Slot::Chunk))
	}
}
impl fmt::Display for Slot {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Slot::Sentinel => f.write_str("sentinel"),
			Slot::Chunk(idx) => write!(f, "#{}", idx),
		}
	}
}
impl serde::Serialize for Slot {
	fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_i64(self.index())
	}
}

/// The sizes every label of a chain shares, derived from the chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
	chunk_size: usize,
}
impl Layout {
	/// Checks `chunk_size` produces labels within DNS limits.
	pub fn new(chunk_size: usize) -> Result<Layout, CodecError> {
		if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
			return Err(CodecError::InvalidChunkSize(chunk_size));
		}
		Ok(Layout { chunk_size })
	}

	/// The number of payload bytes per chunk.
	pub fn chunk_size(&self) -> usize { self.chunk_size }

	/// The number of bytes encoded in each label body.
	pub fn block_size(&self) -> usize { self.chunk_size.max(SENTINEL_BLOCK) }

	/// The length of every label of the chain.
	pub fn label_len(&self) -> usize { 1 + INDEX_WIDTH + base32::encoded_len(self.block_size()) }

	/// The length of the gap labels placed after each label.
	pub fn gap_label_len(&self) -> usize { self.label_len() + GAP_SUFFIX_LEN }

	/// The number of chunks a payload of `payload_len` bytes is split into.
	pub fn chunk_count(&self, payload_len: usize) -> usize {
		(payload_len + self.chunk_size - 1) / self.chunk_size
	}
}

/// What a gap name is used for. The two uses never share a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GapKind {
	/// The name queried to warm the resolver's cache.
	Prime,
	/// A name queried to check the cache answers by itself. The variant (taken modulo 32) lets
	/// repeated runs query names the resolver has never seen.
	Probe(u8),
}
impl GapKind {
	fn suffix(&self) -> [u8; GAP_SUFFIX_LEN] {
		// Markers lie outside the base32hex alphabet, so no gap label can parse as a chunk.
		match self {
			GapKind::Prime => [b'z', base32::ALPHABET[0]],
			GapKind::Probe(variant) => [b'y', base32::ALPHABET[(*variant % 32) as usize]],
		}
	}
}

/// One label of an encoded chain.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct EncodedLabel {
	/// The chain position this label occupies.
	pub slot: Slot,
	/// The label text, without any trailing dot.
	pub label: String,
}
impl EncodedLabel {
	/// The owner name of this label below `apex`.
	pub fn owner_name(&self, apex: &Name) -> Result<Name, CodecError> {
		place_below(apex, &self.label)
	}

	/// A label sorting after this one but before the label which follows it.
	pub fn gap_label(&self, kind: GapKind) -> String {
		let mut label = self.label.clone();
		label.extend(kind.suffix().iter().map(|c| *c as char));
		label
	}

	/// The absent name between this label's owner name and the next, whose NXDOMAIN proof is the
	/// NSEC record of this label.
	pub fn gap_name(&self, apex: &Name, kind: GapKind) -> Result<Name, CodecError> {
		place_below(apex, &self.gap_label(kind))
	}
}

fn place_below(apex: &Name, label: &str) -> Result<Name, CodecError> {
	apex.prepend_label(label)
		.map_err(|()| CodecError::NameTooLong { label: label.to_owned(), apex: apex.clone() })
}

fn make_label(tag: u8, index: u32, block: &[u8]) -> String {
	format!("{}{:0width$}{}", tag as char, index, base32::encode(block), width = INDEX_WIDTH)
}

/// Splits `payload` into chunks of `chunk_size` bytes and encodes each, preceded by the sentinel.
///
/// The returned labels are in chain order. An empty payload encodes to just the sentinel.
pub fn encode(payload: &[u8], chunk_size: usize) -> Result<Vec<EncodedLabel>, CodecError> {
	let layout = Layout::new(chunk_size)?;
	let chunks = layout.chunk_count(payload.len());
	if chunks > MAX_CHUNKS || payload.len() > u32::MAX as usize {
		return Err(CodecError::PayloadTooLarge { chunks });
	}

	let mut labels = Vec::with_capacity(chunks + 1);
	let mut block = vec![0; layout.block_size()];
	block[..4].copy_from_slice(&(payload.len() as u32).to_be_bytes());
	block[4..6].copy_from_slice(&(chunk_size as u16).to_be_bytes());
	labels.push(EncodedLabel { slot: Slot::Sentinel, label: make_label(SENTINEL_TAG, 0, &block) });

	for (idx, chunk) in payload.chunks(chunk_size).enumerate() {
		block.iter_mut().for_each(|b| *b = 0);
		block[..chunk.len()].copy_from_slice(chunk);
		labels.push(EncodedLabel {
			slot: Slot::Chunk(idx as u32),
			label: make_label(CHUNK_TAG, idx as u32, &block),
		});
	}
	Ok(labels)
}

/// Parses one label into its slot and raw (still padded) block.
///
/// This checks the label in isolation. Consistency with the rest of a chain is checked by
/// [`ChainDecoder`].
pub fn parse_label(label: &str) -> Result<(Slot, Vec<u8>), CodecError> {
	let corrupt = |reason| CodecError::CorruptChunk { label: label.to_owned(), reason };
	if !label.is_ascii() { return Err(corrupt(CorruptReason::Character)); }
	let min_len = 1 + INDEX_WIDTH + base32::encoded_len(SENTINEL_BLOCK);
	if label.len() < min_len || label.len() > MAX_LABEL_LEN {
		return Err(corrupt(CorruptReason::Length));
	}
	let (index, body) = label[1..].split_at(INDEX_WIDTH);
	if !index.bytes().all(|c| c.is_ascii_digit()) { return Err(corrupt(CorruptReason::Index)); }
	let index: u32 = index.parse().map_err(|_| corrupt(CorruptReason::Index))?;
	let slot = match label.as_bytes()[0] {
		SENTINEL_TAG if index == 0 => Slot::Sentinel,
		SENTINEL_TAG => return Err(corrupt(CorruptReason::Index)),
		CHUNK_TAG => Slot::Chunk(index),
		_ => return Err(corrupt(CorruptReason::Tag)),
	};
	if !body.bytes().all(base32::is_alphabet) { return Err(corrupt(CorruptReason::Character)); }
	let block = base32::decode(body).map_err(|()| corrupt(CorruptReason::Encoding))?;
	if block.len() < SENTINEL_BLOCK { return Err(corrupt(CorruptReason::Length)); }
	Ok((slot, block))
}

/// Whether `label` carries a chain tag and index, and so is meant to be part of the chain even if
/// it fails to parse. Other labels in the zone (the name server, for example) return false.
pub fn is_chain_label(label: &str) -> bool {
	let bytes = label.as_bytes();
	bytes.len() > 1 && (bytes[0] == SENTINEL_TAG || bytes[0] == CHUNK_TAG) && bytes[1].is_ascii_digit()
}

/// Whether a name with the given label directly below the apex sorts before or after every label
/// a chain could contain, so that adding it to the zone never splits the chain.
pub fn sorts_outside_chain(label: &str) -> bool {
	let label = label.to_ascii_lowercase();
	// Chain labels lie between "a000000" and "c999999" followed by alphabet characters, the last
	// of which is 'v'.
	label.as_bytes() < b"a000000".as_slice() || label.as_bytes() >= b"c999999w".as_slice()
}

/// The contents of the sentinel label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SentinelInfo {
	/// The exact length of the payload, before padding.
	pub payload_len: u32,
	/// The number of payload bytes per chunk.
	pub chunk_size: u16,
}
impl SentinelInfo {
	/// The number of chunks following the sentinel.
	pub fn chunk_count(&self) -> u32 {
		if self.chunk_size == 0 { return 0; }
		let size = self.chunk_size as u64;
		((self.payload_len as u64 + size - 1) / size) as u32
	}

	fn read(label: &str, block: &[u8]) -> Result<SentinelInfo, CodecError> {
		let corrupt = || CodecError::CorruptChunk { label: label.to_owned(), reason: CorruptReason::Sentinel };
		let mut len = [0; 4];
		len.copy_from_slice(&block[..4]);
		let info = SentinelInfo {
			payload_len: u32::from_be_bytes(len),
			chunk_size: u16::from_be_bytes([block[4], block[5]]),
		};
		let layout = Layout::new(info.chunk_size as usize).map_err(|_| corrupt())?;
		if layout.block_size() != block.len() { return Err(corrupt()); }
		if block[SENTINEL_BLOCK..].iter().any(|b| *b != 0) {
			return Err(CodecError::CorruptChunk { label: label.to_owned(), reason: CorruptReason::Padding });
		}
		if info.chunk_count() as usize > MAX_CHUNKS { return Err(corrupt()); }
		Ok(info)
	}
}

/// The outcome of decoding whatever labels were available.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartialDecode {
	/// The sentinel, if it was seen.
	pub sentinel: Option<SentinelInfo>,
	/// Chunk data by index. Padding is only stripped once the sentinel is known.
	pub chunks: BTreeMap<u32, Vec<u8>>,
	/// Every slot known to be missing, in order.
	pub missing: Vec<Slot>,
	/// Labels which could not be decoded.
	pub corrupt: Vec<CodecError>,
}
impl PartialDecode {
	/// Whether every chunk decoded.
	pub fn is_complete(&self) -> bool {
		self.sentinel.is_some() && self.missing.is_empty() && self.corrupt.is_empty()
	}

	/// The reassembled payload, if complete.
	pub fn payload(&self) -> Option<Vec<u8>> {
		if !self.is_complete() { return None; }
		Some(self.chunks.values().flatten().copied().collect())
	}
}

/// Collects labels in any order and reassembles the payload once enough have been seen.
///
/// Inserting the same label twice has no effect.
#[derive(Debug, Clone, Default)]
pub struct ChainDecoder {
	label_len: Option<usize>,
	sentinel: Option<(String, SentinelInfo)>,
	blocks: BTreeMap<u32, (String, Vec<u8>)>,
}
impl ChainDecoder {
	/// Creates an empty decoder.
	pub fn new() -> Self { Self::default() }

	/// Adds a label, returning the slot it occupies.
	///
	/// Fails with [`CodecError::CorruptChunk`] if the label is not a valid chunk, has a different
	/// length than labels already added, or conflicts with an earlier label for the same slot.
	pub fn insert(&mut self, label: &str) -> Result<Slot, CodecError> {
		let corrupt = |reason| CodecError::CorruptChunk { label: label.to_owned(), reason };
		let (slot, block) = parse_label(label)?;
		if self.label_len.map_or(false, |len| len != label.len()) {
			return Err(corrupt(CorruptReason::Length));
		}
		match slot {
			Slot::Sentinel => {
				let info = SentinelInfo::read(label, &block)?;
				match &self.sentinel {
					Some((existing, _)) if existing != label => return Err(corrupt(CorruptReason::ConflictingSlot)),
					Some(_) => {},
					None => self.sentinel = Some((label.to_owned(), info)),
				}
			},
			Slot::Chunk(idx) => {
				match self.blocks.get(&idx) {
					Some((existing, _)) if existing != label => return Err(corrupt(CorruptReason::ConflictingSlot)),
					Some(_) => {},
					None => { self.blocks.insert(idx, (label.to_owned(), block)); },
				}
			},
		}
		self.label_len = Some(label.len());
		Ok(slot)
	}

	/// The sentinel, if one has been inserted.
	pub fn sentinel(&self) -> Option<SentinelInfo> {
		self.sentinel.as_ref().map(|(_, info)| *info)
	}

	/// Every slot not yet seen. Without a sentinel only gaps below the highest chunk seen (and the
	/// sentinel itself) are known to be missing.
	pub fn missing(&self) -> Vec<Slot> {
		match self.sentinel() {
			Some(info) => (0..info.chunk_count())
				.filter(|idx| !self.blocks.contains_key(idx))
				.map(Slot::Chunk)
				.collect(),
			None => {
				let end = self.blocks.keys().next_back().map_or(0, |last| last + 1);
				core::iter::once(Slot::Sentinel)
					.chain((0..end).filter(|idx| !self.blocks.contains_key(idx)).map(Slot::Chunk))
					.collect()
			},
		}
	}

	/// Decodes whatever is available, without failing.
	pub fn partial(&self) -> PartialDecode {
		let mut res = PartialDecode { sentinel: self.sentinel(), missing: self.missing(), ..Default::default() };
		for (idx, (label, block)) in self.blocks.iter() {
			let data = match res.sentinel {
				Some(info) => chunk_data(&info, *idx, label, block),
				None => Ok(block.clone()),
			};
			match data {
				Ok(data) => { res.chunks.insert(*idx, data); },
				Err(e) => res.corrupt.push(e),
			}
		}
		res
	}

	/// Reassembles the payload, failing if any slot is missing or any chunk is inconsistent with
	/// the sentinel.
	pub fn finish(&self) -> Result<Vec<u8>, CodecError> {
		let partial = self.partial();
		if let Some(e) = partial.corrupt.into_iter().next() { return Err(e); }
		if !partial.missing.is_empty() {
			return Err(CodecError::IncompleteChain { missing: partial.missing });
		}
		Ok(partial.chunks.into_values().flatten().collect())
	}
}

fn chunk_data(info: &SentinelInfo, idx: u32, label: &str, block: &[u8]) -> Result<Vec<u8>, CodecError> {
	let corrupt = |reason| CodecError::CorruptChunk { label: label.to_owned(), reason };
	if idx >= info.chunk_count() { return Err(corrupt(CorruptReason::OutOfRange)); }
	let chunk_size = info.chunk_size as usize;
	let start = idx as usize * chunk_size;
	let take = chunk_size.min(info.payload_len as usize - start);
	if block[take..].iter().any(|b| *b != 0) { return Err(corrupt(CorruptReason::Padding)); }
	Ok(block[..take].to_vec())
}

/// Reassembles a payload from the complete set of its labels, in any order.
pub fn decode<I, S>(labels: I) -> Result<Vec<u8>, CodecError>
where I: IntoIterator<Item = S>, S: AsRef<str> {
	let mut decoder = ChainDecoder::new();
	for label in labels {
		decoder.insert(label.as_ref())?;
	}
	decoder.finish()
}

/// Decodes as much as possible from the given labels, reporting what is missing or corrupt.
pub fn decode_partial<I, S>(labels: I) -> PartialDecode
where I: IntoIterator<Item = S>, S: AsRef<str> {
	let mut decoder = ChainDecoder::new();
	let mut corrupt = Vec::new();
	for label in labels {
		if let Err(e) = decoder.insert(label.as_ref()) {
			corrupt.push(e);
		}
	}
	let mut res = decoder.partial();
	corrupt.append(&mut res.corrupt);
	res.corrupt = corrupt;
	res
}

#[cfg(fuzzing)]
/// Decodes newline-separated labels and checks a full decode survives re-encoding.
pub fn fuzz_labels(data: &[u8]) {
	let text = match core::str::from_utf8(data) { Ok(text) => text, Err(_) => return };
	let labels: Vec<&str> = text.split('\n').collect();
	let partial = decode_partial(&labels);
	if let (Some(payload), Some(info)) = (partial.payload(), partial.sentinel) {
		let encoded = encode(&payload, info.chunk_size as usize)
			.expect("SentinelInfo::read only accepts chunk sizes Layout::new accepts");
		assert_eq!(decode(encoded.iter().map(|l| &l.label)).ok(), Some(payload));
	}
}
