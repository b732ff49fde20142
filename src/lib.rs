//! Per-tenant session engine for a multi-device messaging protocol.
//!
//! Each instance owns a persistent logical connection: the lifecycle
//! manager keeps the socket session alive (pairing, QR issuance,
//! reconnects), the ingestion pipeline normalizes the inbound event
//! stream into durable storage, and the fan-out layer forwards
//! normalized events to webhook/CRM/chatbot consumers. The wire protocol
//! itself is consumed through the [`protocol`] capability traits.

pub mod auth;
pub mod cache;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod group_cache;
pub mod http;
pub mod ingest;
pub mod protocol;
pub mod qrcode;
pub mod recovery;
pub mod store;
pub mod types;

pub mod test_utils;

pub use engine::{
    InstanceState, ProfileSnapshot, RegistrySignal, SessionEngine, SessionEngineOptions,
    StateConnection,
};
pub use error::{EngineError, StoreError};
