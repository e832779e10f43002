//! Decision history: append-only decision log and per-vendor allow counters.

pub mod record;
pub mod store;
