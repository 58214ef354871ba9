//! Shared types for the ring-matching relay.
//!
//! Everything that crosses a crate boundary lives here: orders and their
//! accounting state, ring projections, submission records, channel events
//! and the configuration schema helpers used by every backend factory.

pub mod events;
pub mod order;
pub mod rational;
pub mod ring;
pub mod transaction;
pub mod validation;

pub use events::*;
pub use order::*;
pub use rational::*;
pub use ring::*;
pub use transaction::*;
pub use validation::*;

pub use alloy::primitives::{Address, Bytes, B256, U256};
pub use num::BigRational;
