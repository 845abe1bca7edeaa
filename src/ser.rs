//! Serialization/Deserialization logic lives here

use crate::rr::*;

pub(crate) fn read_u8(inp: &mut &[u8]) -> Result<u8, ()> {
	let res = *inp.first().ok_or(())?;
	*inp = &inp[1..];
	Ok(res)
}
pub(crate) fn read_u16(inp: &mut &[u8]) -> Result<u16, ()> {
	if inp.len() < 2 { return Err(()); }
	let mut bytes = [0; 2];
	bytes.copy_from_slice(&inp[..2]);
	*inp = &inp[2..];
	Ok(u16::from_be_bytes(bytes))
}
pub(crate) fn read_u32(inp: &mut &[u8]) -> Result<u32, ()> {
	if inp.len() < 4 { return Err(()); }
	let mut bytes = [0; 4];
	bytes.copy_from_slice(&inp[..4]);
	*inp = &inp[4..];
	Ok(u32::from_be_bytes(bytes))
}

// Every pointer hop must move strictly backwards, so loops are impossible, but no sane name needs
// more hops than this.
const MAX_POINTER_HOPS: usize = 64;

/// Reads a (possibly compressed) name, advancing `inp` past it.
///
/// Compression pointers are resolved against `wire_packet`, the full message `inp` points into.
pub(crate) fn read_wire_packet_name(inp: &mut &[u8], wire_packet: &[u8]) -> Result<Name, ()> {
	let orig: &[u8] = *inp;
	let mut name = String::with_capacity(256);
	let mut read: &[u8] = orig;
	// Bytes of `orig` taken up by the name, known once the first pointer or the root is reached
	let mut consumed = None;
	// Pointers may only refer to data before the name being read.
	let mut lowest_pointer = (orig.as_ptr() as usize).checked_sub(wire_packet.as_ptr() as usize)
		.filter(|pos| *pos <= wire_packet.len())
		.unwrap_or(wire_packet.len());
	let mut hops = 0;
	loop {
		let len = read_u8(&mut read)? as usize;
		if len & 0xc0 == 0xc0 {
			let offset = ((len & !0xc0) << 8) | read_u8(&mut read)? as usize;
			if consumed.is_none() { consumed = Some(orig.len() - read.len()); }
			hops += 1;
			if offset >= lowest_pointer || hops > MAX_POINTER_HOPS { return Err(()); }
			lowest_pointer = offset;
			read = &wire_packet[offset..];
			continue;
		}
		if len & 0xc0 != 0 { return Err(()); }
		if len == 0 {
			if name.is_empty() { name += "."; }
			break;
		}
		if read.len() < len { return Err(()); }
		name += core::str::from_utf8(&read[..len]).map_err(|_| ())?;
		name += ".";
		read = &read[len..];
		if name.len() > 255 { return Err(()); }
	}
	let consumed = consumed.unwrap_or(orig.len() - read.len());
	*inp = &orig[consumed..];
	name.try_into()
}

pub(crate) trait Writer { fn write(&mut self, buf: &[u8]); }
impl Writer for Vec<u8> { fn write(&mut self, buf: &[u8]) { self.extend_from_slice(buf); } }
pub(crate) fn write_name<W: Writer>(out: &mut W, name: &str) {
	let canonical_name = name.to_ascii_lowercase();
	if canonical_name == "." {
		out.write(&[0]);
	} else {
		for label in canonical_name.split('.') {
			out.write(&(label.len() as u8).to_be_bytes());
			out.write(label.as_bytes());
		}
	}
}
pub(crate) fn name_len(name: &Name) -> u16 {
	if name.as_str() == "." {
		1
	} else {
		let mut res = 0;
		for label in name.split('.') {
			res += 1 + label.len();
		}
		res as u16
	}
}

/// Parses a single resource record out of a message, returning it and its TTL.
pub(crate) fn parse_wire_packet_rr(inp: &mut &[u8], wire_packet: &[u8]) -> Result<(RR, u32), ()> {
	let name = read_wire_packet_name(inp, wire_packet)?;
	let ty = read_u16(inp)?;
	let class = read_u16(inp)?;
	if class != 1 { return Err(()); } // We only support the INternet
	let ttl = read_u32(inp)?;
	let data_len = read_u16(inp)? as usize;
	if inp.len() < data_len { return Err(()); }
	let data = &inp[..data_len];
	*inp = &inp[data_len..];

	let rr = match ty {
		A::TYPE => RR::A(A::read_from_data(name, data, wire_packet)?),
		NS::TYPE => RR::NS(NS::read_from_data(name, data, wire_packet)?),
		Soa::TYPE => RR::Soa(Soa::read_from_data(name, data, wire_packet)?),
		NSec::TYPE => RR::NSec(NSec::read_from_data(name, data, wire_packet)?),
		RRSig::TYPE => RR::RRSig(RRSig::read_from_data(name, data, wire_packet)?),
		_ => RR::Unknown(Unknown { name, ty, data: data.to_vec() }),
	};
	Ok((rr, ttl))
}

/// Writes a record in uncompressed wire form.
#[cfg(test)]
pub(crate) fn write_rr<W: Writer>(rr: &RR, ttl: u32, out: &mut W) {
	write_name(out, rr.name());
	out.write(&rr.ty().to_be_bytes());
	out.write(&1u16.to_be_bytes()); // INternet class
	out.write(&ttl.to_be_bytes());
	let mut data = Vec::new();
	rr.write_u16_len_prefixed_data(&mut data);
	out.write(&data);
}
