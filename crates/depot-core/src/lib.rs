//! # depot-core
//!
//! Shared foundations for the depot lab-resource reservation broker:
//!
//! - **SIDs**: short opaque identifiers reversibly derived from integer
//!   primary keys ([`sid`])
//! - **Wire durations**: the `[DD] [HH:[MM:]]SS[.uuuuuu]` codec used for
//!   lease and expiration deltas ([`duration`])
//! - **Observability**: logging bootstrap and span constructors
//!   ([`observability`])

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod duration;
pub mod error;
pub mod observability;
pub mod sid;

pub use duration::{format_duration, parse_duration};
pub use error::{Error, Result};
pub use sid::SidCodec;
