// Copyright (c) The Mirror Developers
// SPDX-License-Identifier: Apache-2.0

//! Integration-test harness and operational bootstrap for a distributed archive mirror.
//!
//! The mirror itself (storage, replayers, vault, web API, notification services) is an
//! external multi-service stack deployed on Docker Swarm. This crate drives it:
//!
//! - [`stack`] deploys the stack from a compose manifest and tears it down again,
//!   with bounded retries for the eventually-consistent parts of resource release;
//! - [`monitor`] blocks until a set of services reaches a target replica state and
//!   tails service logs for expected lines;
//! - [`walker`] lazily traverses the content-addressed object graph reachable from
//!   an origin through the mirror's REST API, verifying content payloads on the way;
//! - [`reconciler`] drains the per-origin statistics topic from the journal broker
//!   to obtain the ground truth the walker's counts are compared against.
//!
//! Everything is synchronous and single-threaded: the harness is the sole actor, and
//! all waiting happens through blocking I/O or explicit polling loops.

pub mod api;
pub mod control;
pub mod error;
pub mod model;
pub mod monitor;
pub mod reconciler;
pub mod retry;
pub mod stack;
pub mod walker;

#[cfg(test)]
mod test_support;
