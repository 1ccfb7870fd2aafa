#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! vnbridge library — the serial↔TCP PPP bridge behind the `vnbridge` binary.
//!
//! The building blocks:
//! - `endpoint` — one byte-stream contract over physical serial, Unix-socket
//!   and TCP pseudo-serial devices
//! - `transport` — dialing the VesperNet access concentrator
//! - `handshake` — credential exchange and `NEGOTIATE:` speed parsing
//! - `bridge` — the concurrent copy engine with escape/LCP sniffing
//! - `hayes` — AT command extraction and classification
//! - `modem` — the Hayes command/data state machine
//! - `codec` — optional deflate codec for the data stream
//! - `supervisor` — mode selection and top-level lifecycle
//! - `config` — TOML configuration loading

pub mod bridge;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod handshake;
pub mod hayes;
pub mod modem;
pub mod supervisor;
pub mod transport;

// Re-export key types at crate root for convenience.
pub use bridge::{BridgeOutcome, BridgeSettings};
pub use config::Config;
pub use endpoint::Endpoint;
pub use handshake::Negotiated;
pub use modem::HayesModem;
