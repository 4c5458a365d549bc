//! # unicity-tests
//!
//! Integration tests for the Unicity P2P engine.
//!
//! This crate provides:
//! - A harness running full network services over in-memory links
//! - Connection lifecycle scenarios (handshake, self-connection, misbehavior, anchors)
//! - Block announcement scenarios
//! - Property-based tests for the codec and scoring invariants

pub mod harness;



#[cfg(test)]
mod property_tests;

pub use harness::*;
