//! # HAPI
//!
//! Broker-based RPC core between a monitoring server and its Arm plugins:
//! - Byte-exact little-endian wire codec for headers, records and tables
//! - Key-based handshake binding one server to one plugin
//! - Sequence-id correlation of commands and replies across threads
//! - One blocking receive loop per endpoint with explicit, interruptible exit
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Application / ArmPluginGate                  │
//! │          (handlers keyed by command code, callbacks)         │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                  PluginInterface (facade)                    │
//! │               receive thread + classification                │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │  Handshake  │          │ Correlator  │
//!   │ (key bind)  │          │ (seq ids)   │
//!   └─────────────┘          └──────┬──────┘
//!                                   │
//!                                   ▼
//!                           ┌─────────────┐
//!                           │  Transport  │
//!                           │  (broker)   │
//!                           └─────────────┘
//! ```
//!
//! `protocol` and `table` are pure codecs used by every layer above.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod protocol;
pub mod table;
pub mod transport;
pub mod handshake;
pub mod correlator;
pub mod plugin;
pub mod gate;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{HapiError, Result};
pub use config::{Config, Role};
pub use correlator::{on_outcome, CommandCallback, CommandOutcome, CommandRequest, MessagingContext};
pub use gate::{ArmPluginGate, EntityKind, EntityStore, MemoryEntityStore};
pub use plugin::{PluginInterface, PluginObserver};
pub use protocol::{CommandCode, MessageType, ResponseCode};
pub use table::{ItemData, ItemGroup, ItemTable, ItemType, ItemValue};
pub use transport::InMemoryBroker;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of the HAPI core
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
