//! RPC surfaces: the upstream node client and the outward game server.

pub mod client;
pub mod server;
