//! Restart-time helpers that run before the application resumes.

mod env_file;

pub use env_file::*;

#[cfg(test)]
#[path = "tests/env_file_tests.rs"]
mod tests;
