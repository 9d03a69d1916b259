//! Relays messages from a source to a target through a chain of transformations.
//!
//! A batch read from the [source] is run through the [transformer] chain and delivered by the
//! [forwarder]: successful messages go to the primary [target], messages the target cannot take
//! are wrapped as bad rows by the [failure] target, and every outcome is reported to the
//! [observer].

pub use self::error::{Error, Result};

mod error;
pub use crate::error::{ErrorKind, MessageError};

/// Settings loaded once at startup.
pub mod config;

/// Reads batches and delivers them.
pub mod forwarder;
pub use crate::forwarder::run;

pub mod failure;
pub mod message;
pub mod metrics;
pub mod observer;
/// Snowplow enriched event parsing.
pub mod snowplow;
pub mod source;
pub mod statsreceiver;
pub mod target;
pub mod transformer;
