//! Alto: a Singer-protocol data-integration task engine.
//!
//! A project declares taps, targets, and pipelines between them; Alto turns
//! that declaration into a DAG of build/config/catalog/run tasks ([`task`],
//! wired up in [`engine`]) backed by a content-addressed artifact cache
//! ([`cache`]), a catalog/selection engine ([`catalog`]), a state store
//! ([`state`]), and a reservoir for decoupling extraction from loading
//! ([`reservoir`]). [`pipeline`] is the process-spawning layer all of those
//! ultimately run through.

pub mod cache;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod fs;
pub mod pipeline;
pub mod reservoir;
pub mod singer;
pub mod state;
pub mod task;

pub use error::AltoError;
