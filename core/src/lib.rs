//! Shared building blocks for skala services: wire types, the error envelope,
//! answer canonicalization, and token utilities.
//!
//! No HTTP or database types in here. The `skala-api` service composes these
//! into the actual endpoints.

pub mod answers;
pub mod attempt;
pub mod error;
pub mod identity;
pub mod progress;
pub mod report;
pub mod token;
