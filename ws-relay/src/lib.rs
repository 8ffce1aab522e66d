//! WebSocket message relay.
//!
//! Every connection names a channel through its request path, and all
//! connections on the same channel form one relay group. Members address
//! each other by the numeric id the relay assigns on arrival, or everyone
//! at once with `*`, and hear `join`/`quit` events as the group changes.
//! See `README.md` for the wire format.
//!
//! - [`envelope`] parses inbound `<target> <payload>` messages and renders
//!   outbound `<source> <payload>` envelopes.
//! - [`endpoint`] is the contract a connection must satisfy for the relay.
//! - [`relay`] owns one channel's membership: admission, routing, fan-out
//!   and departure.
//! - [`registry`] maps channel names to live relays and drives each
//!   connection from admission through cleanup.
//! - [`server`] accepts WebSocket upgrades with axum and hands them to the
//!   registry.
//! - [`cli`] and [`client`] provide the command line and a terminal client.

pub mod cli;
pub mod client;
pub mod endpoint;
pub mod envelope;
pub mod registry;
pub mod relay;
pub mod server;
