//! appdeploy library
//!
//! A small deployment agent. In server mode it accepts WebSocket
//! connections (optionally mutual TLS), stores uploaded files after digest
//! verification and runs shell commands. In client mode it performs one
//! upload or command against such a server.
//!
//! - [`transport`]: wire messages and the framed WebSocket session
//! - [`transfer`]: upload protocol for both sides
//! - [`executor`]: process execution behind the [`executor::Executor`] trait
//! - [`connection`] and [`server`]: the server side
//! - [`client`]: the client side

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod server;
pub mod transfer;
pub mod transport;

pub use error::DeployError;
