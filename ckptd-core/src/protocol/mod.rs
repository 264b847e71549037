//! Wire-level protocol types shared by the coordinator and workers.

mod message;
mod unique_pid;
mod worker_state;

pub use message::*;
pub use unique_pid::*;
pub use worker_state::*;

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
