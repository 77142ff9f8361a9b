//! Versioned HTTP surface.
//!
//! Routes are grouped per version so wire contracts can evolve without
//! breaking existing clients.

pub mod v1;
