//! Concurrent, resizable cuckoo hash sets.
//!
//! Keys live in one of two tables, each cell holding a small probe
//! array; collisions evict a resident key to its alternate cell, and
//! sustained pressure doubles the table. Two locking strategies are
//! offered: [`StripedCuckooSet`] keeps a fixed array of lock stripes
//! per table and resizes behind a global barrier, while
//! [`RefinableCuckooSet`] grows its lock arrays with the table,
//! coordinated by a single-writer owner word.

mod bucket;
mod config;
mod hash;
pub mod refinable;
pub mod striped;

pub use crate::config::{Config, MAX_CAPACITY};
pub use crate::refinable::RefinableCuckooSet;
pub use crate::striped::StripedCuckooSet;
