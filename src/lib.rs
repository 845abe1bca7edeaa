//! A signed DNS zone's NSEC records link every name in the zone to the next one in canonical
//! order. If the names are chosen carefully that chain can carry arbitrary data, and a validating
//! resolver doing RFC 8198 aggressive negative caching will hold on to it.
//!
//! This crate encodes a payload into the names of a zone so the chain the signer builds runs
//! through the payload in order, then checks a resolver can hand the payload back using only the
//! NSEC records it has cached, without going back to the authoritative server.
//!
//! The work is split into phases:
//!  * [`codec`] turns a payload into fixed-length labels which sort in payload order, and back.
//!  * [`zone`] writes those labels into a zone file for an external signer.
//!  * [`primer`] warms the resolver's cache by querying names in each gap of the chain.
//!  * [`verifier`] queries fresh names in each gap and uses the authoritative server's query
//!    counter to tell cache-synthesized answers from authoritative round trips.
//!  * [`decoder`] reassembles the payload from the NSEC records the probes harvested.
//!  * [`report`] aggregates everything into a pass/fail verdict.
//!
//! The network phases, and [`run`] which drives them all, are built with the default `net`
//! feature. The `build_probe` feature further builds the `nsec_probe` binary.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

pub mod base32;
pub mod rr;
mod ser;
pub mod error;
pub mod codec;
pub mod config;
pub mod zone;
pub mod query;
pub mod record;
pub mod decoder;
pub mod report;

#[cfg(feature = "net")]
pub mod counter;
#[cfg(feature = "net")]
pub mod primer;
#[cfg(feature = "net")]
pub mod verifier;
#[cfg(feature = "net")]
pub mod run;

pub use error::{Error, ErrorKind, Result};
