//! Core library entry point that wires together the AIR routing subsystems.
//!
//! Each module is intentionally kept lightweight so that the boundaries
//! between responsibilities remain obvious when exploring the codebase:
//! - [`classifier`] scores prompts against the routing rule table.
//! - [`dispatcher`] invokes the selected provider, with fallback, and
//!   normalises the reply before it is persisted.
//! - [`store`] owns conversation history and per-conversation turn gating.
//! - [`stream`] replays a completed reply as a cancellable increment stream.
//! - [`providers`] holds the provider registry and the outbound HTTP gateway.
//! - [`api`] exposes the versioned HTTP surface consumed by the UI.
//! - [`db`] initialises the SQLite database and applies migrations.
//! - [`errors`] keeps the central error catalogue with human friendly metadata.
//! - [`logging`] writes structured diagnostics to the event log table.

pub mod api;
pub mod classifier;
pub mod db;
pub mod dispatcher;
pub mod errors;
pub mod logging;
pub mod providers;
pub mod store;
pub mod stream;
