//! Line-oriented chat relay over TCP.
//!
//! Clients connect, send a nickname as their first line, and every line they
//! send afterwards is broadcast to everyone connected. A handful of literal
//! commands (`warning`, `stop client`, `stop all clients`, `stop server`)
//! get special treatment, and new joiners are replayed the last few
//! broadcasts.
//!
//! - [`protocol`] holds the command vocabulary, line formatting and the clock.
//! - [`history`] is the bounded replay buffer.
//! - [`registry`] tracks active sessions by nickname.
//! - [`relay`] ties the two together and fans lines out.
//! - [`session`] drives one connection through its lifecycle.
//! - [`server`] accepts TCP connections and spawns sessions.
//! - [`client`] is a small terminal client; [`cli`] parses both modes.
//!
//! Note that any connected client may send `stop server`, which ends the
//! process. There is no authentication in front of that.

pub mod cli;
pub mod client;
pub mod history;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
