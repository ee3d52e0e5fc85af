//! Pure, deterministic pipeline logic.
//!
//! Nothing under `core/` touches the filesystem, the network, or a
//! subprocess. These modules define the stable contracts between pipeline
//! stages and must produce identical outputs for identical inputs.

pub mod changes;
pub mod edits;
pub mod plan;
pub mod requirements;
pub mod run_state;
pub mod types;
pub mod verdict;
