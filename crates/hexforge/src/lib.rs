//! Umbrella crate for Hexforge.
//!
//! This crate is intentionally small: it re-exports the engine and protocol crates
//! so downstream code can depend on a single crate name (`hexforge`).

pub use hexforge_engine as engine;
pub use hexforge_protocol as protocol;
