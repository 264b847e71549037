//! Worker-process side: configuration, thread synchronization, the
//! coordinator client, and the checkpoint thread.

mod ckpt_thread;
mod client;
mod config;
mod runtime;
mod sync;

pub use ckpt_thread::*;
pub use client::*;
pub use config::*;
pub use runtime::*;
pub use sync::*;

#[cfg(test)]
#[path = "tests/worker_tests.rs"]
mod tests;
