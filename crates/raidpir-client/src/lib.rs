//! raidpir-client — private block retrieval.
//!
//! The builder turns a batch of requested blocks into per-mirror query
//! queues whose joint XOR isolates the targets while any coalition below
//! the privacy threshold sees only uniform bits. The requestor drives k
//! mirror sessions, reassembles and hash-verifies blocks, and fails over to
//! backup mirrors on socket errors.

pub mod builder;
pub mod requestor;

pub use builder::{build_plan, BuilderError, QueryMode, QueryPlan};
pub use requestor::{retrieve_blocks, RequestorError};
