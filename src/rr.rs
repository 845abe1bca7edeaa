//! Resource Records are the fundamental type in the DNS - individual records mapping a name to
//! some data.
//!
//! This module holds the domain [`Name`] type, with the canonical ordering DNSSEC uses to build
//! NSEC chains, and the handful of records which appear in a denial-of-existence response.

use core::cmp::Ordering;

use crate::ser::*;

/// A valid domain name, in canonical (lowercase) form.
///
/// It must end with a ".", be no longer than 255 bytes, consist of only printable ASCII
/// characters and each label may be no longer than 63 bytes.
///
/// The derived [`Ord`] is a plain string ordering, useful for maps. Use [`Name::canonical_cmp`]
/// wherever DNSSEC ordering matters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(String);
impl Name {
	/// Gets the underlying human-readable domain name
	pub fn as_str(&self) -> &str { &self.0 }

	/// The root name, `.`.
	pub fn root() -> Name { Name(".".to_owned()) }

	/// Iterates the labels of this name from left (most specific) to right, excluding the
	/// empty root label.
	pub fn labels(&self) -> impl DoubleEndedIterator<Item = &str> {
		self.0.split('.').filter(|label| !label.is_empty())
	}

	/// The number of (non-root) labels in this name.
	pub fn label_count(&self) -> usize { self.labels().count() }

	/// Compares two names in DNSSEC canonical order (RFC 4034 section 6.1).
	///
	/// Labels are compared from the root down, each as a lowercase octet string where a label
	/// which is a prefix of another sorts first. If all shared labels are equal the name with
	/// fewer labels sorts first, which places a zone apex before everything below it.
	pub fn canonical_cmp(&self, other: &Name) -> Ordering {
		let mut ours = self.labels().rev();
		let mut theirs = other.labels().rev();
		loop {
			match (ours.next(), theirs.next()) {
				(None, None) => return Ordering::Equal,
				(None, Some(_)) => return Ordering::Less,
				(Some(_), None) => return Ordering::Greater,
				(Some(a), Some(b)) => match a.as_bytes().cmp(b.as_bytes()) {
					Ordering::Equal => continue,
					ne => return ne,
				},
			}
		}
	}

	/// Returns true if this name is `zone` or is below it.
	pub fn is_within(&self, zone: &Name) -> bool {
		if zone.as_str() == "." { return true; }
		self.0 == zone.0 || self.0.ends_with(&(".".to_owned() + &zone.0))
	}

	/// If this name is exactly one label below `zone`, returns that label.
	pub fn child_label_of(&self, zone: &Name) -> Option<&str> {
		let prefix = if zone.as_str() == "." {
			self.0.strip_suffix('.')?
		} else {
			self.0.strip_suffix(zone.as_str())?.strip_suffix('.')?
		};
		if prefix.is_empty() || prefix.contains('.') { None } else { Some(prefix) }
	}

	/// Builds the name `label.self`.
	pub fn prepend_label(&self, label: &str) -> Result<Name, ()> {
		if label.is_empty() || label.contains('.') { return Err(()); }
		if self.as_str() == "." {
			Name::try_from(label.to_owned() + ".")
		} else {
			Name::try_from(label.to_owned() + "." + &self.0)
		}
	}
}
impl core::ops::Deref for Name {
	type Target = str;
	fn deref(&self) -> &str { &self.0 }
}
impl core::fmt::Display for Name {
	fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result { f.write_str(&self.0) }
}
impl TryFrom<String> for Name {
	type Error = ();
	fn try_from(mut s: String) -> Result<Name, ()> {
		if s.is_empty() { return Err(()); }
		if *s.as_bytes().last().unwrap_or(&0) != b"."[0] { return Err(()); }
		if s.len() > 255 { return Err(()); }
		if s.chars().any(|c| !c.is_ascii_graphic() && c != '.' && c != '-') { return Err(()); }
		if s != "." {
			for label in s[..s.len() - 1].split('.') {
				if label.is_empty() || label.len() > 63 { return Err(()); }
			}
		}
		s.make_ascii_lowercase();
		Ok(Name(s))
	}
}
impl TryFrom<&str> for Name {
	type Error = ();
	fn try_from(s: &str) -> Result<Name, ()> {
		Self::try_from(s.to_owned())
	}
}
impl serde::Serialize for Name {
	fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&self.0)
	}
}
impl<'de> serde::Deserialize<'de> for Name {
	fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Name, D::Error> {
		let mut s = String::deserialize(d)?;
		if !s.ends_with('.') { s.push('.'); }
		Name::try_from(s).map_err(|()| serde::de::Error::custom("invalid domain name"))
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A Resource Record as read from a response.
///
/// Only the types which make up an NXDOMAIN + NSEC answer are understood, everything else is
/// carried as [`RR::Unknown`] so a response can still be walked.
pub enum RR {
	/// An IPv4 resource record
	A(A),
	/// A name server resource record
	NS(NS),
	/// A start of authority resource record
	Soa(Soa),
	/// A next secure resource record
	NSec(NSec),
	/// A Resource Record Signature record
	RRSig(RRSig),
	/// Any record of a type this crate does not interpret
	Unknown(Unknown),
}
impl RR {
	/// Gets the name this record refers to.
	pub fn name(&self) -> &Name {
		match self {
			RR::A(rr) => &rr.name,
			RR::NS(rr) => &rr.name,
			RR::Soa(rr) => &rr.name,
			RR::NSec(rr) => &rr.name,
			RR::RRSig(rr) => &rr.name,
			RR::Unknown(rr) => &rr.name,
		}
	}
	/// Gets the IANA type of this record.
	pub fn ty(&self) -> u16 {
		match self {
			RR::A(_) => A::TYPE,
			RR::NS(_) => NS::TYPE,
			RR::Soa(_) => Soa::TYPE,
			RR::NSec(_) => NSec::TYPE,
			RR::RRSig(_) => RRSig::TYPE,
			RR::Unknown(rr) => rr.ty,
		}
	}
	#[cfg(test)]
	pub(crate) fn write_u16_len_prefixed_data(&self, out: &mut Vec<u8>) {
		match self {
			RR::A(rr) => StaticRecord::write_u16_len_prefixed_data(rr, out),
			RR::NS(rr) => StaticRecord::write_u16_len_prefixed_data(rr, out),
			RR::Soa(rr) => StaticRecord::write_u16_len_prefixed_data(rr, out),
			RR::NSec(rr) => StaticRecord::write_u16_len_prefixed_data(rr, out),
			RR::RRSig(rr) => StaticRecord::write_u16_len_prefixed_data(rr, out),
			RR::Unknown(rr) => {
				out.extend_from_slice(&(rr.data.len() as u16).to_be_bytes());
				out.extend_from_slice(&rr.data);
			},
		}
	}
}
impl From<A> for RR { fn from(a: A) -> RR { RR::A(a) } }
impl From<NS> for RR { fn from(ns: NS) -> RR { RR::NS(ns) } }
impl From<Soa> for RR { fn from(soa: Soa) -> RR { RR::Soa(soa) } }
impl From<NSec> for RR { fn from(nsec: NSec) -> RR { RR::NSec(nsec) } }
impl From<RRSig> for RR { fn from(rrsig: RRSig) -> RR { RR::RRSig(rrsig) } }

pub(crate) trait StaticRecord : Sized {
	// http://www.iana.org/assignments/dns-parameters/dns-parameters.xhtml#dns-parameters-4
	const TYPE: u16;
	fn write_u16_len_prefixed_data(&self, out: &mut Vec<u8>);
	fn read_from_data(name: Name, data: &[u8], wire_packet: &[u8]) -> Result<Self, ()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A record of a type we do not interpret.
pub struct Unknown {
	/// The name this record is at.
	pub name: Name,
	/// The IANA record type.
	pub ty: u16,
	/// The raw record data. Names within it may still be compressed.
	pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// An IPv4 Address resource record
pub struct A {
	/// The name this record is at.
	pub name: Name,
	/// The bytes of the IPv4 address.
	pub address: [u8; 4],
}
impl StaticRecord for A {
	const TYPE: u16 = 1;
	fn read_from_data(name: Name, data: &[u8], _wire_packet: &[u8]) -> Result<Self, ()> {
		if data.len() != 4 { return Err(()); }
		let mut address = [0; 4];
		address.copy_from_slice(data);
		Ok(A { name, address })
	}
	fn write_u16_len_prefixed_data(&self, out: &mut Vec<u8>) {
		out.extend_from_slice(&4u16.to_be_bytes());
		out.extend_from_slice(&self.address);
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A Name Server resource record, which indicates the server responsible for handling queries for
/// a zone.
pub struct NS {
	/// The name this record is at.
	pub name: Name,
	/// The name of the server which is responsible for handling queries for the [`Self::name`]
	/// zone.
	pub name_server: Name,
}
impl StaticRecord for NS {
	const TYPE: u16 = 2;
	fn read_from_data(name: Name, mut data: &[u8], wire_packet: &[u8]) -> Result<Self, ()> {
		Ok(NS { name, name_server: read_wire_packet_name(&mut data, wire_packet)? })
	}
	fn write_u16_len_prefixed_data(&self, out: &mut Vec<u8>) {
		out.extend_from_slice(&name_len(&self.name_server).to_be_bytes());
		write_name(out, &self.name_server);
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A Start of Authority resource record, returned in the authority section of negative answers.
pub struct Soa {
	/// The name this record is at, the apex of the zone.
	pub name: Name,
	/// The primary name server of the zone.
	pub mname: Name,
	/// The mailbox of the zone administrator.
	pub rname: Name,
	/// The zone serial.
	pub serial: u32,
	/// Seconds between secondary refreshes.
	pub refresh: u32,
	/// Seconds between failed refresh retries.
	pub retry: u32,
	/// Seconds after which a secondary stops answering.
	pub expire: u32,
	/// The negative caching TTL (RFC 2308).
	pub minimum: u32,
}
impl StaticRecord for Soa {
	const TYPE: u16 = 6;
	fn read_from_data(name: Name, mut data: &[u8], wire_packet: &[u8]) -> Result<Self, ()> {
		Ok(Soa {
			name, mname: read_wire_packet_name(&mut data, wire_packet)?,
			rname: read_wire_packet_name(&mut data, wire_packet)?,
			serial: read_u32(&mut data)?, refresh: read_u32(&mut data)?,
			retry: read_u32(&mut data)?, expire: read_u32(&mut data)?,
			minimum: read_u32(&mut data)?,
		})
	}
	fn write_u16_len_prefixed_data(&self, out: &mut Vec<u8>) {
		let len = name_len(&self.mname) + name_len(&self.rname) + 4 * 5;
		out.extend_from_slice(&len.to_be_bytes());
		write_name(out, &self.mname);
		write_name(out, &self.rname);
		for v in [self.serial, self.refresh, self.retry, self.expire, self.minimum] {
			out.extend_from_slice(&v.to_be_bytes());
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A Next Secure resource record, proving that no names exist between [`Self::name`] and
/// [`Self::next_name`] in canonical zone order.
///
/// The last record of a zone's chain points back at the zone apex.
pub struct NSec {
	/// The name this record is at, the owner of the proven range.
	pub name: Name,
	/// The next name in the zone, the (exclusive) end of the proven range.
	pub next_name: Name,
	/// The record types which exist at [`Self::name`], from the type bitmap.
	pub types: Vec<u16>,
}
impl NSec {
	/// Returns true if `name` falls strictly inside the range this record covers, accounting for
	/// the wrap-around record at the end of the chain.
	pub fn covers(&self, name: &Name) -> bool {
		let after_owner = self.name.canonical_cmp(name) == Ordering::Less;
		let before_next = name.canonical_cmp(&self.next_name) == Ordering::Less;
		if self.name.canonical_cmp(&self.next_name) == Ordering::Less {
			after_owner && before_next
		} else {
			after_owner || before_next
		}
	}
}
impl StaticRecord for NSec {
	const TYPE: u16 = 47;
	fn read_from_data(name: Name, mut data: &[u8], wire_packet: &[u8]) -> Result<Self, ()> {
		let next_name = read_wire_packet_name(&mut data, wire_packet)?;
		let mut types = Vec::new();
		let mut last_window = None;
		while !data.is_empty() {
			let window = read_u8(&mut data)?;
			if last_window.map_or(false, |last| window <= last) { return Err(()); }
			last_window = Some(window);
			let len = read_u8(&mut data)? as usize;
			if len == 0 || len > 32 || data.len() < len { return Err(()); }
			for (byte_idx, byte) in data[..len].iter().enumerate() {
				for bit in 0..8 {
					if byte & (0x80 >> bit) != 0 {
						types.push(((window as u16) << 8) | (byte_idx as u16 * 8 + bit));
					}
				}
			}
			data = &data[len..];
		}
		Ok(NSec { name, next_name, types })
	}
	fn write_u16_len_prefixed_data(&self, out: &mut Vec<u8>) {
		let mut types = self.types.clone();
		types.sort_unstable();
		types.dedup();
		let mut bitmap = Vec::new();
		let mut idx = 0;
		while idx < types.len() {
			let window = (types[idx] >> 8) as u8;
			let mut bits = [0u8; 32];
			let mut used = 0;
			while idx < types.len() && (types[idx] >> 8) as u8 == window {
				let low = (types[idx] & 0xff) as usize;
				bits[low / 8] |= 0x80 >> (low % 8);
				used = low / 8 + 1;
				idx += 1;
			}
			bitmap.push(window);
			bitmap.push(used as u8);
			bitmap.extend_from_slice(&bits[..used]);
		}
		let len = name_len(&self.next_name) + bitmap.len() as u16;
		out.extend_from_slice(&len.to_be_bytes());
		write_name(out, &self.next_name);
		out.extend_from_slice(&bitmap);
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A Resource Record (set) Signature resource record. This contains a signature over all the
/// resources records of the given type at the given name.
///
/// Signatures are never checked here, validation is the resolver's job and is reported to us
/// through the AD bit. We only note which record sets came back signed.
pub struct RRSig {
	/// The name this record is at.
	pub name: Name,
	/// The resource record type which this [`RRSig`] is signing.
	pub ty: u16,
	/// The algorithm which is being used to sign.
	pub alg: u8,
	/// The number of labels in the name of the records that this signature is signing.
	pub labels: u8,
	/// The TTL of the records which this [`RRSig`] is signing.
	pub orig_ttl: u32,
	/// The expiration (as a UNIX timestamp) of this signature.
	pub expiration: u32,
	/// The time (as a UNIX timestamp) at which this signature becomes valid.
	pub inception: u32,
	/// A short tag which describes the signing key.
	pub key_tag: u16,
	/// The name of the zone whose key created this signature.
	pub key_name: Name,
	/// The signature itself.
	pub signature: Vec<u8>,
}
impl StaticRecord for RRSig {
	const TYPE: u16 = 46;
	fn read_from_data(name: Name, mut data: &[u8], wire_packet: &[u8]) -> Result<Self, ()> {
		let res = RRSig {
			name, ty: read_u16(&mut data)?, alg: read_u8(&mut data)?,
			labels: read_u8(&mut data)?, orig_ttl: read_u32(&mut data)?,
			expiration: read_u32(&mut data)?, inception: read_u32(&mut data)?,
			key_tag: read_u16(&mut data)?,
			key_name: read_wire_packet_name(&mut data, wire_packet)?,
			signature: data.to_vec(),
		};
		if res.signature.is_empty() { return Err(()); }
		Ok(res)
	}
	fn write_u16_len_prefixed_data(&self, out: &mut Vec<u8>) {
		let len = 2 + 1 + 1 + 4*3 + 2 + name_len(&self.key_name) + self.signature.len() as u16;
		out.extend_from_slice(&len.to_be_bytes());
		out.extend_from_slice(&self.ty.to_be_bytes());
		out.extend_from_slice(&self.alg.to_be_bytes());
		out.extend_from_slice(&self.labels.to_be_bytes());
		out.extend_from_slice(&self.orig_ttl.to_be_bytes());
		out.extend_from_slice(&self.expiration.to_be_bytes());
		out.extend_from_slice(&self.inception.to_be_bytes());
		out.extend_from_slice(&self.key_tag.to_be_bytes());
		write_name(out, &self.key_name);
		out.extend_from_slice(&self.signature);
	}
}
