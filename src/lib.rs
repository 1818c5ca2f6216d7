//! A WebSocket broadcast relay.
//!
//! Clients connect to a single listening port; every text frame a client
//! sends is forwarded verbatim to every connection that is open at the
//! time, including the sender. The relay keeps no history, parses no
//! payloads, and makes no delivery guarantees beyond per-sender order.
//! Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for relay and client modes.
//! - [`relay`] accepts WebSocket connections, tracks them in a registry,
//!   and fans frames out over a Tokio `broadcast` channel.
//! - [`client`] connects to a relay, multiplexing stdin and incoming
//!   frames for a terminal user.
//!
//! Integration and unit tests use this crate directly to exercise the
//! relay's registry and fan-out behavior over real sockets.

pub mod cli;
pub mod client;
pub mod relay;
