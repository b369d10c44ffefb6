//! # depot-broker
//!
//! Order lifecycle and fulfillment engine for the depot lab-resource
//! reservation broker.
//!
//! Clients place orders describing the hardware or virtual items they need;
//! the broker holds each order open until it can be fulfilled in one piece
//! from available inventory, then atomically reserves the items. Elastic
//! item kinds grow on demand through provider farms and are destroyed again
//! once idle.
//!
//! ## Core Concepts
//!
//! - **Item**: one reservable unit of inventory (test pod, cluster node,
//!   cloud VM, IP address), tracked with a kind tag, an attribute map, and
//!   an exclusive holder
//! - **Order**: a request for a set of items keyed by client-chosen
//!   nicknames, mutated only through an append-only update log
//! - **Tab**: per-owner credit gating placement
//! - **Task**: a named, revocable unit of background work with per-kind
//!   synchronization (global, single-item, throttled)
//!
//! ## Guarantees
//!
//! - **Atomic reservation**: an order reserves everything it asked for in
//!   one transaction or nothing at all
//! - **Monotone state machines**: order and item transitions only move
//!   forward; the update log is the audit trail
//! - **Line order by row id**: synchronized tasks are admitted by
//!   auto-increment id, immune to clock drift between publishers
//! - **No stranded items**: the lifecycle sweep recovers items whose
//!   holders finished, failed, or were revoked

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod broker;
pub mod catalog;
pub mod error;
pub mod farm;
pub mod fulfillment;
pub mod ids;
pub mod item;
pub mod metrics;
pub mod order;
pub mod store;
pub mod surface;
pub mod sweeper;
pub mod tab;
pub mod tasks;
pub mod user;

pub use broker::{Broker, BrokerConfig};
pub use error::{Error, Result};
pub use surface::{BrokerSurface, OrderSnapshot, PlaceOrderRequest, Verbosity};
