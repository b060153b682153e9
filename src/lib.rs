//! moongate - a multi-headed intercepting proxy for the Ultima Online
//! protocol.
//!
//! A game client connects to moongate instead of the real login server.
//! moongate holds exactly one upstream session per configured character and
//! fans the game stream out to any number of attached clients, each of
//! which may speak a different protocol revision. The upstream link is
//! rebuilt transparently after a drop, so attached clients never see the
//! disconnect.

pub mod command;
pub mod config;
pub mod downstream;
pub mod framing;
pub mod handshake;
pub mod proto;
pub mod registry;
pub mod server;
pub mod session;
pub mod upstream;
pub mod walk;
pub mod world;
