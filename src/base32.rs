// This is a modification of base32 from https://crates.io/crates/base32(v0.4.0),
// copied from rust-lightning.
// The original portions of this software are Copyright (c) 2015 The base32 Developers
// The remainder is copyright rust-lightning developers, as viewable in version control at
// https://github.com/lightningdevkit/rust-lightning/

// This file is licensed under either of
// Apache License, Version 2.0, (LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0) or
// MIT license (LICENSE-MIT or http://opensource.org/licenses/MIT) at your option.

//! Lowercase RFC 4648 "extended hex" base32, without padding.
//!
//! Unlike the standard base32 alphabet, the extended hex alphabet is in ASCII order, so for two
//! inputs of equal length the byte-wise order of the encodings matches the byte-wise order of the
//! inputs. DNS canonical ordering compares lowercased label octets, which makes this alphabet safe
//! to embed in owner names without disturbing the order of the data.

/// RFC4648 "extended hex" encoding table, lowercased for DNS canonical form
pub const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";

/// RFC4648 "extended hex" decoding table, indexed by `c - b'0'`
const INV_ALPHABET: [i8; 71] = [
	0, 1, 2, 3, 4, 5, 6, 7, 8, 9, -1, -1, -1, -1, -1, -1, -1,
	// Uppercase is not canonical and is rejected
	-1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1,
	-1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1, -1,
	-1, -1, -1, -1, -1, -1,
	10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31,
];

/// The number of characters [`encode`] emits for `len` bytes of input.
pub const fn encoded_len(len: usize) -> usize {
	// / 5 divides the data length by the number of bits per chunk (5),
	// + 4 rounds up to the nearest character.
	(len * 8 + 4) / 5
}

/// Returns true if `c` is part of the (lowercase) alphabet.
pub fn is_alphabet(c: u8) -> bool {
	matches!(c, b'0'..=b'9' | b'a'..=b'v')
}

/// Encode bytes into a lowercase base32hex string.
pub fn encode(data: &[u8]) -> String {
	let mut ret = encode_data(data);
	ret.truncate(encoded_len(data.len()));
	// Every byte pushed comes from `ALPHABET`
	ret.into_iter().map(char::from).collect()
}

/// Decode a lowercase base32hex string into a byte vector.
pub fn decode(data: &str) -> Result<Vec<u8>, ()> {
	let data = data.as_bytes();
	// If the string has more characters than are required to encode the number of bytes
	// decodable, treat the string as invalid.
	match data.len() % 8 { 1|3|6 => return Err(()), _ => {} }
	decode_data(data)
}

fn encode_data(data: &[u8]) -> Vec<u8> {
	// cap is calculated as follows:
	// / 5 divides the data length by the number of bits per chunk (5),
	// * 8 multiplies the result by the number of characters per chunk (8).
	// + 4 rounds up to the nearest character.
	let cap = (data.len() + 4) / 5 * 8;
	let mut ret = Vec::with_capacity(cap);
	for chunk in data.chunks(5) {
		let mut buf = [0u8; 5];
		buf[..chunk.len()].copy_from_slice(chunk);
		ret.push(ALPHABET[((buf[0] & 0xF8) >> 3) as usize]);
		ret.push(ALPHABET[(((buf[0] & 0x07) << 2) | ((buf[1] & 0xC0) >> 6)) as usize]);
		ret.push(ALPHABET[((buf[1] & 0x3E) >> 1) as usize]);
		ret.push(ALPHABET[(((buf[1] & 0x01) << 4) | ((buf[2] & 0xF0) >> 4)) as usize]);
		ret.push(ALPHABET[(((buf[2] & 0x0F) << 1) | (buf[3] >> 7)) as usize]);
		ret.push(ALPHABET[((buf[3] & 0x7C) >> 2) as usize]);
		ret.push(ALPHABET[(((buf[3] & 0x03) << 3) | ((buf[4] & 0xE0) >> 5)) as usize]);
		ret.push(ALPHABET[(buf[4] & 0x1F) as usize]);
	}
	ret
}

fn decode_data(data: &[u8]) -> Result<Vec<u8>, ()> {
	// cap is calculated as follows:
	// / 8 divides the data length by the number of characters per chunk (8),
	// * 5 multiplies the result by the number of bits per chunk (5),
	// + 7 rounds up to the nearest byte.
	let cap = (data.len() + 7) / 8 * 5;
	let mut ret = Vec::with_capacity(cap);
	for chunk in data.chunks(8) {
		let mut buf = [0u8; 8];
		for (i, &c) in chunk.iter().enumerate() {
			match INV_ALPHABET.get(c.wrapping_sub(b'0') as usize) {
				Some(&-1) | None => return Err(()),
				Some(&value) => buf[i] = value as u8,
			};
		}
		ret.push((buf[0] << 3) | (buf[1] >> 2));
		ret.push((buf[1] << 6) | (buf[2] << 1) | (buf[3] >> 4));
		ret.push((buf[3] << 4) | (buf[4] >> 1));
		ret.push((buf[4] << 7) | (buf[5] << 2) | (buf[6] >> 3));
		ret.push((buf[6] << 5) | buf[7]);
	}
	let output_length = data.len() * 5 / 8;
	for c in ret.drain(output_length..) {
		if c != 0 {
			// If the original string had any bits set at positions outside of the encoded data,
			// treat the string as invalid.
			return Err(());
		}
	}
	Ok(ret)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_encode_decode() {
		let mut bytes = [0u8; 256 * 5];
		for i in 0..=255 {
			bytes[i as usize + 256*0] = i;
			bytes[i as usize + 256*1] = i.wrapping_add(1);
			bytes[i as usize + 256*2] = i.wrapping_add(2);
			bytes[i as usize + 256*3] = i.wrapping_add(3);
			bytes[i as usize + 256*4] = i.wrapping_add(4);
		}
		assert_eq!(decode(&encode(&bytes)).unwrap(), bytes);
	}

	#[test]
	fn test_known_vectors() {
		// RFC 4648 section 10, lowercased and unpadded
		assert_eq!(encode(b""), "");
		assert_eq!(encode(b"f"), "co");
		assert_eq!(encode(b"fo"), "cpng");
		assert_eq!(encode(b"foo"), "cpnmu");
		assert_eq!(encode(b"foob"), "cpnmuog");
		assert_eq!(encode(b"fooba"), "cpnmuoj1");
		assert_eq!(encode(b"foobar"), "cpnmuoj1e8");
	}

	#[test]
	fn test_rejects_non_canonical() {
		assert!(decode("CPNMUOJ1").is_err());
		assert!(decode("cpnmuoj1w").is_err());
		assert!(decode("cpnmuozz").is_err());
		// Trailing bits set past the encoded data
		assert!(decode("cp").is_err());
	}

	#[test]
	fn test_order_preserving() {
		let mut inputs: Vec<[u8; 6]> = (0..200u32).map(|i| {
			let b = i.wrapping_mul(2_654_435_761).to_be_bytes();
			[b[0], b[1], b[2], b[3], b[1], b[0]]
		}).collect();
		let mut encoded: Vec<String> = inputs.iter().map(|i| encode(i)).collect();
		inputs.sort();
		encoded.sort();
		let resorted: Vec<String> = inputs.iter().map(|i| encode(i)).collect();
		assert_eq!(encoded, resorted);
	}

	#[test]
	fn test_lengths() {
		for len in 0..40 {
			assert_eq!(encode(&vec![0xa5; len]).len(), encoded_len(len));
		}
	}
}
