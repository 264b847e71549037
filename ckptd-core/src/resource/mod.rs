//! Per-worker registry of open OS resources and the machinery that drains,
//! checkpoints, refills, and rewires them across a checkpoint/restart.

mod connection;
mod drainer;
mod fdio;
mod registry;
mod rewirer;
mod shm;

pub use connection::*;
pub use drainer::*;
pub use registry::*;
pub use rewirer::*;
pub use shm::*;

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod connection_tests;

#[cfg(test)]
#[path = "tests/drainer_tests.rs"]
mod drainer_tests;

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod registry_tests;

#[cfg(test)]
#[path = "tests/rewirer_tests.rs"]
mod rewirer_tests;

#[cfg(test)]
#[path = "tests/shm_tests.rs"]
mod shm_tests;
