//! Queries a validating resolver and interprets its denial-of-existence answers.
//!
//! Queries ask for DNSSEC records (the DO bit) and for authenticated data (the AD bit), leaving
//! checking enabled (CD clear), so the resolver validates every answer before handing it over and
//! reports having done so in the response's AD bit. We never check signatures ourselves.
//!
//! With the `net` feature, [`Resolver`] abstracts the resolver under test and [`UdpResolver`]
//! implements it over UDP, retrying truncated answers over TCP.

use serde::Serialize;

#[cfg(feature = "net")]
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
#[cfg(feature = "net")]
use std::time::Duration;

#[cfg(feature = "net")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};
#[cfg(feature = "net")]
use tokio::net::{TcpStream, UdpSocket};

#[cfg(feature = "net")]
use crate::error::QueryError;
use crate::error::ValidationFailure;
use crate::rr::*;
use crate::ser::*;

/// The NOERROR response code.
pub const NOERROR: u8 = 0;
/// The SERVFAIL response code, which validating resolvers return for bogus answers.
pub const SERVFAIL: u8 = 2;
/// The NXDOMAIN response code.
pub const NXDOMAIN: u8 = 3;

/// The EDNS0 UDP payload size we advertise, per the DNS flag day 2020 recommendation.
pub const EDNS_UDP_PAYLOAD: u16 = 1232;

const FLAG_QR: u16 = 0b1000_0000_0000_0000;
const OPCODE_MASK: u16 = 0b0111_1000_0000_0000;
const FLAG_TC: u16 = 0b0000_0010_0000_0000;
const FLAG_AD: u16 = 0b0000_0000_0010_0000;
const RCODE_MASK: u16 = 0b0000_0000_0000_1111;

/// Builds a query for `name`, requesting DNSSEC records and validation.
pub fn build_query(id: u16, name: &Name, ty: u16) -> Vec<u8> {
	let mut query = Vec::with_capacity(12 + name.len() + 1 + 4 + 11);
	query.extend_from_slice(&id.to_be_bytes());
	query.extend_from_slice(&[0x01, 0x20]); // Flags: Recursive, Authenticated Data
	query.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 1]); // One question, One additional
	write_name(&mut query, name);
	query.extend_from_slice(&ty.to_be_bytes());
	query.extend_from_slice(&1u16.to_be_bytes()); // INternet class
	query.extend_from_slice(&[0, 0, 0x29]); // . OPT
	query.extend_from_slice(&EDNS_UDP_PAYLOAD.to_be_bytes());
	query.extend_from_slice(&[0, 0]); // EDNS version 0
	query.extend_from_slice(&0x8000u16.to_be_bytes()); // Accept DNSSEC RRs
	query.extend_from_slice(&0u16.to_be_bytes()); // No additional data
	query
}

/// A single NSEC (owner, next) pair, the only data-bearing part of a denial.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NsecProof {
	/// The NSEC owner name.
	pub owner: Name,
	/// The next name in the zone.
	pub next: Name,
}

impl From<&NSec> for NsecProof {
	fn from(nsec: &NSec) -> NsecProof {
		NsecProof { owner: nsec.name.clone(), next: nsec.next_name.clone() }
	}
}

/// A parsed response.
///
/// Truncated responses only carry the header and question, their records are not read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
	/// The transaction ID.
	pub id: u16,
	/// The response code.
	pub rcode: u8,
	/// Whether the resolver validated the answer (the AD bit).
	pub authenticated: bool,
	/// Whether the answer was truncated (the TC bit).
	pub truncated: bool,
	/// The name asked about.
	pub question: Name,
	/// The type asked about.
	pub question_type: u16,
	/// The answer section.
	pub answers: Vec<RR>,
	/// The authority section, where denials carry their NSEC records.
	pub authority: Vec<RR>,
}

impl Response {
	/// Whether this answers the query with the given ID, name and type.
	pub fn answers_query(&self, id: u16, name: &Name, ty: u16) -> bool {
		self.id == id && self.question == *name && self.question_type == ty
	}

	/// The NSEC records in the authority section.
	pub fn nsecs(&self) -> impl Iterator<Item = &NSec> {
		self.authority.iter().filter_map(|rr| if let RR::NSec(nsec) = rr { Some(nsec) } else { None })
	}

	/// Whether any NSEC record came with a signature over it.
	pub fn nsecs_signed(&self) -> bool {
		self.authority.iter().any(|rr| matches!(rr, RR::RRSig(sig) if sig.ty == NSec::TYPE))
	}

	/// Checks this is an authenticated NXDOMAIN carrying NSEC records, returning their proofs.
	pub fn check_denial(&self) -> Result<Vec<NsecProof>, ValidationFailure> {
		if self.rcode != NXDOMAIN {
			return Err(ValidationFailure::UnexpectedRcode { rcode: self.rcode });
		}
		if !self.authenticated { return Err(ValidationFailure::Unauthenticated); }
		let proofs: Vec<NsecProof> = self.nsecs().map(NsecProof::from).collect();
		if proofs.is_empty() { return Err(ValidationFailure::MissingNsec); }
		Ok(proofs)
	}
}

/// Parses a response message.
pub fn parse_response(resp: &[u8]) -> Result<Response, ()> {
	let mut read: &[u8] = resp;
	let id = read_u16(&mut read)?;
	let flags = read_u16(&mut read)?;
	if flags & FLAG_QR == 0 { return Err(()); }
	if flags & OPCODE_MASK != 0 { return Err(()); }
	let questions = read_u16(&mut read)?;
	if questions != 1 { return Err(()); }
	let answers = read_u16(&mut read)?;
	let authorities = read_u16(&mut read)?;
	let _additional = read_u16(&mut read)?;

	let question = read_wire_packet_name(&mut read, resp)?;
	let question_type = read_u16(&mut read)?;
	if read_u16(&mut read)? != 1 { return Err(()); }

	let mut res = Response {
		id, rcode: (flags & RCODE_MASK) as u8, authenticated: flags & FLAG_AD != 0,
		truncated: flags & FLAG_TC != 0, question, question_type,
		answers: Vec::new(), authority: Vec::new(),
	};
	if res.truncated { return Ok(res); }

	// The additional section holds only our OPT echo, which isn't of the IN class, so skip it.
	for _ in 0..answers {
		res.answers.push(parse_wire_packet_rr(&mut read, resp)?.0);
	}
	for _ in 0..authorities {
		res.authority.push(parse_wire_packet_rr(&mut read, resp)?.0);
	}
	Ok(res)
}

#[cfg(fuzzing)]
/// Read some input and parse it as if it came from a resolver, for fuzzing.
pub fn fuzz_response(response: &[u8]) {
	if let Ok(resp) = parse_response(response) {
		let _ = resp.check_denial();
	}
}

/// A validating resolver, queried one message at a time.
///
/// Implementations need not enforce a timeout, callers wrap queries with [`query_with_timeout`].
#[cfg(feature = "net")]
#[async_trait::async_trait]
pub trait Resolver: Send + Sync {
	/// Queries for `name`, returning the resolver's answer to exactly that question.
	async fn query(&self, name: &Name, ty: u16) -> Result<Response, QueryError>;
}

/// Queries `resolver`, giving up after `timeout`.
#[cfg(feature = "net")]
pub async fn query_with_timeout<R: Resolver + ?Sized>(resolver: &R, name: &Name, ty: u16, timeout: Duration)
-> Result<Response, QueryError> {
	match tokio::time::timeout(timeout, resolver.query(name, ty)).await {
		Ok(res) => res,
		Err(_) => Err(QueryError::Timeout),
	}
}

/// A [`Resolver`] speaking plain DNS over UDP, falling back to TCP for truncated answers.
#[cfg(feature = "net")]
#[derive(Debug, Clone)]
pub struct UdpResolver {
	addr: SocketAddr,
}

#[cfg(feature = "net")]
impl UdpResolver {
	/// Creates a resolver sending queries to `addr`.
	pub fn new(addr: SocketAddr) -> Self {
		UdpResolver { addr }
	}

	/// The address queries are sent to.
	pub fn addr(&self) -> SocketAddr { self.addr }

	async fn query_tcp(&self, query: &[u8], id: u16, name: &Name, ty: u16) -> Result<Response, QueryError> {
		let mut stream = TcpStream::connect(self.addr).await?;
		send_query(&mut stream, query).await?;
		let resp = read_response(&mut stream).await?;
		let resp = parse_response(&resp).map_err(|()| QueryError::InvalidResponse)?;
		if !resp.answers_query(id, name, ty) || resp.truncated { return Err(QueryError::InvalidResponse); }
		Ok(resp)
	}
}

#[cfg(feature = "net")]
async fn send_query(stream: &mut TcpStream, query: &[u8]) -> Result<(), std::io::Error> {
	stream.write_all(&(query.len() as u16).to_be_bytes()).await?;
	stream.write_all(query).await?;
	Ok(())
}

#[cfg(feature = "net")]
async fn read_response(stream: &mut TcpStream) -> Result<Vec<u8>, std::io::Error> {
	let mut len_bytes = [0; 2];
	stream.read_exact(&mut len_bytes).await?;
	let mut buf = vec![0; u16::from_be_bytes(len_bytes) as usize];
	stream.read_exact(&mut buf).await?;
	Ok(buf)
}

#[cfg(feature = "net")]
#[async_trait::async_trait]
impl Resolver for UdpResolver {
	async fn query(&self, name: &Name, ty: u16) -> Result<Response, QueryError> {
		let id: u16 = rand::random();
		let query = build_query(id, name, ty);
		let bind: SocketAddr = if self.addr.is_ipv4() {
			(Ipv4Addr::UNSPECIFIED, 0).into()
		} else {
			(Ipv6Addr::UNSPECIFIED, 0).into()
		};
		let socket = UdpSocket::bind(bind).await?;
		socket.connect(self.addr).await?;
		socket.send(&query).await?;

		let mut buf = vec![0; u16::MAX as usize];
		loop {
			let len = socket.recv(&mut buf).await?;
			match parse_response(&buf[..len]) {
				Ok(resp) if resp.answers_query(id, name, ty) => {
					if resp.truncated {
						tracing::debug!("{} answer truncated, retrying over TCP", name);
						return self.query_tcp(&query, id, name, ty).await;
					}
					return Ok(resp);
				},
				_ => tracing::debug!("Ignoring stray datagram of {} bytes from {}", len, self.addr),
			}
		}
	}
}

/// Builds a response message, for stub resolvers in tests.
#[cfg(test)]
pub(crate) fn compose_response(id: u16, question: &Name, question_type: u16, rcode: u8, authenticated: bool,
	truncated: bool, answers: &[RR], authority: &[RR]) -> Vec<u8> {
	let mut flags = FLAG_QR | 0x0180 | rcode as u16;
	if authenticated { flags |= FLAG_AD; }
	if truncated { flags |= FLAG_TC; }
	let mut resp = Vec::new();
	resp.extend_from_slice(&id.to_be_bytes());
	resp.extend_from_slice(&flags.to_be_bytes());
	resp.extend_from_slice(&1u16.to_be_bytes());
	resp.extend_from_slice(&(answers.len() as u16).to_be_bytes());
	resp.extend_from_slice(&(authority.len() as u16).to_be_bytes());
	resp.extend_from_slice(&1u16.to_be_bytes());
	write_name(&mut resp, question);
	resp.extend_from_slice(&question_type.to_be_bytes());
	resp.extend_from_slice(&1u16.to_be_bytes());
	for rr in answers.iter().chain(authority.iter()) {
		write_rr(rr, 60, &mut resp);
	}
	resp.extend_from_slice(&[0, 0, 0x29, 0x04, 0xd0, 0, 0, 0x80, 0, 0, 0]);
	resp
}

/// Builds a signed NXDOMAIN denial from `nsecs`, for stub resolvers in tests.
#[cfg(test)]
pub(crate) fn compose_denial(id: u16, question: &Name, authenticated: bool, nsecs: &[NSec]) -> Vec<u8> {
	let mut authority = Vec::new();
	for nsec in nsecs {
		authority.push(RR::NSec(nsec.clone()));
		authority.push(RR::RRSig(RRSig {
			name: nsec.name.clone(), ty: NSec::TYPE, alg: 13, labels: nsec.name.label_count() as u8,
			orig_ttl: 60, expiration: 1_900_000_000, inception: 1_700_000_000, key_tag: 12345,
			key_name: Name::root(),
			signature: vec![0x5a; 64],
		}));
	}
	compose_response(id, question, A::TYPE, NXDOMAIN, authenticated, false, &[], &authority)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn name(s: &str) -> Name { s.try_into().unwrap() }

	fn nsec(owner: &str, next: &str) -> NSec {
		NSec { name: name(owner), next_name: name(next), types: vec![A::TYPE, RRSig::TYPE, NSec::TYPE] }
	}

	#[test]
	fn test_build_query() {
		let query = build_query(0xbeef, &name("c000000x.zone.test."), A::TYPE);
		assert_eq!(&query[..12], &[0xbe, 0xef, 0x01, 0x20, 0, 1, 0, 0, 0, 0, 0, 1]);
		let mut read = &query[12..];
		assert_eq!(read_wire_packet_name(&mut read, &query).unwrap(), name("c000000x.zone.test."));
		assert_eq!(read_u16(&mut read).unwrap(), A::TYPE);
		assert_eq!(read_u16(&mut read).unwrap(), 1);
		// OPT: root name, type 41, payload size, extended rcode + version, DO set, no data
		assert_eq!(read, &[0, 0, 41, 0x04, 0xd0, 0, 0, 0x80, 0, 0, 0]);
	}

	#[test]
	fn test_parse_denial() {
		let question = name("c000000y0.zone.test.");
		let nsecs = [nsec("c000000.zone.test.", "c000001.zone.test."), nsec("zone.test.", "a000000.zone.test.")];
		let resp = parse_response(&compose_denial(7, &question, true, &nsecs)).unwrap();
		assert!(resp.answers_query(7, &question, A::TYPE));
		assert!(!resp.answers_query(8, &question, A::TYPE));
		assert_eq!(resp.rcode, NXDOMAIN);
		assert!(resp.authenticated);
		assert!(!resp.truncated);
		assert!(resp.nsecs_signed());
		assert_eq!(resp.nsecs().count(), 2);
		assert_eq!(resp.check_denial().unwrap(), vec![
			NsecProof { owner: name("c000000.zone.test."), next: name("c000001.zone.test.") },
			NsecProof { owner: name("zone.test."), next: name("a000000.zone.test.") },
		]);
	}

	#[test]
	fn test_denial_failures() {
		let question = name("c000000y0.zone.test.");
		let nsecs = [nsec("c000000.zone.test.", "c000001.zone.test.")];

		let resp = parse_response(&compose_denial(1, &question, false, &nsecs)).unwrap();
		assert_eq!(resp.check_denial(), Err(ValidationFailure::Unauthenticated));

		let resp = parse_response(&compose_denial(1, &question, true, &[])).unwrap();
		assert_eq!(resp.check_denial(), Err(ValidationFailure::MissingNsec));

		let resp = parse_response(&compose_response(1, &question, A::TYPE, SERVFAIL, false, false, &[], &[])).unwrap();
		assert_eq!(resp.check_denial(), Err(ValidationFailure::UnexpectedRcode { rcode: SERVFAIL }));

		let answer = RR::A(A { name: question.clone(), address: [192, 0, 2, 10] });
		let resp = parse_response(&compose_response(1, &question, A::TYPE, NOERROR, true, false, &[answer.clone()], &[])).unwrap();
		assert_eq!(resp.answers, vec![answer]);
		assert_eq!(resp.check_denial(), Err(ValidationFailure::UnexpectedRcode { rcode: NOERROR }));
	}

	#[test]
	fn test_parse_rejects() {
		let question = name("zone.test.");
		let good = compose_response(1, &question, Soa::TYPE, NOERROR, true, false, &[], &[]);
		assert!(parse_response(&good).is_ok());

		// A query, not a response
		assert!(parse_response(&build_query(1, &question, Soa::TYPE)).is_err());
		// Claims a record which isn't there
		let mut missing = good.clone();
		missing[7] = 1;
		assert!(parse_response(&missing).is_err());
		// Cut short
		assert!(parse_response(&good[..good.len() - 16]).is_err());
		assert!(parse_response(&[]).is_err());

		// Truncated answers aren't read past the question
		let mut truncated = compose_response(1, &question, Soa::TYPE, NOERROR, true, true, &[], &[]);
		truncated[7] = 5;
		let resp = parse_response(&truncated).unwrap();
		assert!(resp.truncated);
		assert!(resp.answers.is_empty());
	}

	#[cfg(feature = "net")]
	fn parse_query(query: &[u8]) -> (u16, Name) {
		let mut read = &query[12..];
		let name = read_wire_packet_name(&mut read, query).unwrap();
		(u16::from_be_bytes([query[0], query[1]]), name)
	}

	#[cfg(feature = "net")]
	#[tokio::test]
	async fn test_udp_query() {
		let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let addr = server.local_addr().unwrap();
		let serve = tokio::spawn(async move {
			let mut buf = [0; 512];
			let (len, peer) = server.recv_from(&mut buf).await.unwrap();
			let (id, question) = parse_query(&buf[..len]);
			let nsecs = [nsec("c000000.zone.test.", "c000001.zone.test.")];
			// A reply to some other query comes first and must be skipped
			server.send_to(&compose_denial(id.wrapping_add(1), &question, true, &nsecs), peer).await.unwrap();
			server.send_to(&compose_denial(id, &question, true, &nsecs), peer).await.unwrap();
		});

		let resolver = UdpResolver::new(addr);
		let question = name("c000000y0.zone.test.");
		let resp = query_with_timeout(&resolver, &question, A::TYPE, Duration::from_secs(5)).await.unwrap();
		assert_eq!(resp.question, question);
		assert_eq!(resp.check_denial().unwrap().len(), 1);
		serve.await.unwrap();
	}

	#[cfg(feature = "net")]
	#[tokio::test]
	async fn test_truncated_falls_back_to_tcp() {
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let server = UdpSocket::bind(addr).await.unwrap();
		let serve = tokio::spawn(async move {
			let mut buf = [0; 512];
			let (len, peer) = server.recv_from(&mut buf).await.unwrap();
			let (id, question) = parse_query(&buf[..len]);
			let truncated = compose_response(id, &question, A::TYPE, NXDOMAIN, true, true, &[], &[]);
			server.send_to(&truncated, peer).await.unwrap();

			let (mut stream, _) = listener.accept().await.unwrap();
			let mut len_bytes = [0; 2];
			stream.read_exact(&mut len_bytes).await.unwrap();
			let mut query = vec![0; u16::from_be_bytes(len_bytes) as usize];
			stream.read_exact(&mut query).await.unwrap();
			let (tcp_id, _) = parse_query(&query);
			assert_eq!(tcp_id, id);
			let full = compose_denial(id, &question, true, &[nsec("c000000.zone.test.", "c000001.zone.test.")]);
			send_query(&mut stream, &full).await.unwrap();
		});

		let resolver = UdpResolver::new(addr);
		let question = name("c000000y0.zone.test.");
		let resp = query_with_timeout(&resolver, &question, A::TYPE, Duration::from_secs(5)).await.unwrap();
		assert!(!resp.truncated);
		assert_eq!(resp.nsecs().count(), 1);
		serve.await.unwrap();
	}

	#[cfg(feature = "net")]
	#[tokio::test]
	async fn test_query_timeout() {
		// Nothing ever answers
		let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let resolver = UdpResolver::new(server.local_addr().unwrap());
		let res = query_with_timeout(&resolver, &name("zone.test."), Soa::TYPE, Duration::from_millis(200)).await;
		assert!(matches!(res, Err(QueryError::Timeout)));
	}
}
