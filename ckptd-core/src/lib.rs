//! # ckptd core
//!
//! Coordination core for distributed transparent process checkpointing.
//!
//! A computation is a group of worker processes driven through an ordered
//! barrier protocol by a central coordinator so that checkpoints of the whole
//! group are mutually consistent. This crate provides:
//!
//! - [`protocol`] — process identity ([`protocol::UniquePid`]), the per-worker
//!   barrier state ([`protocol::WorkerState`]), and the fixed-layout control
//!   message ([`protocol::Message`]) spoken on every coordinator link.
//! - [`link`] — framed message transport, blocking on the worker side and
//!   async on the coordinator side.
//! - [`coordinator`] — the barrier orchestrator, worker table, name service,
//!   and the coordinator daemon event loop.
//! - [`worker`] — the per-process worker runtime: configuration, thread
//!   suspension machinery, and the checkpoint thread.
//! - [`resource`] — the open-resource registry: connection records, kernel
//!   buffer draining, shared-memory areas, and restart-time socket rewiring.
//! - [`restart`] — restart-time environment rewriting.

pub mod coordinator;
pub mod link;
pub mod protocol;
pub mod resource;
pub mod restart;
pub mod worker;
