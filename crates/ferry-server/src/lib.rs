//! # ferry-server
//!
//! WebSocket backend core. Two ingestion paths converge on one session
//! state machine:
//!
//! - the handoff listener adopts live sockets received as SCM_RIGHTS
//!   descriptors over a local Unix socket ([`handoff`]);
//! - the Axum server upgrades direct `/ws` connections ([`server`]).
//!
//! Every connection is tracked in a shared [`registry`] and driven by the
//! [`session`] handler: an inbound frame-dispatch loop and a periodic
//! outbound send loop over one shared transport, raced into a single
//! idempotent teardown. `/metrics` (Prometheus) and `/health` ride on the
//! same router; shutdown is coordinated via `CancellationToken`.

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod errors;
pub mod handoff;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod transport;
