//! `gossip-proto` — identifier and payload codecs for the Gossip engine.
//!
//! Everything in this crate is pure data: no I/O, no async, no crypto.
//! The engine crate (`gossip-core`) builds on these types; the relay and
//! any future platform adapters share them.

pub mod board;
pub mod ident;
pub mod payload;
