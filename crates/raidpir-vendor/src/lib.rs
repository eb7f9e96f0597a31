//! raidpir-vendor — manifest distribution and mirror discovery.
//!
//! Exposed as a library so the integration suite can run the vendor
//! in-process; the binary in `main.rs` is a thin CLI around these modules.

pub mod registry;
pub mod service;

pub use registry::MirrorRegistry;
pub use service::VendorService;
