//! raidpir-mirror — mirror service internals.
//!
//! Exposed as a library so the integration suite can run mirror sessions
//! in-process; the binary in `main.rs` is a thin CLI around these modules.

pub mod advertise;
pub mod batch;
pub mod service;

pub use service::MirrorService;
