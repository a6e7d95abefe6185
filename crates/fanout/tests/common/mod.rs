//! Shared test utilities for fanout integration tests.
//!
//! This module provides:
//! - `TestHarness`: an engine over an in-memory store, with or without a
//!   running worker pool
//! - `FakeCompletionClient`: a scriptable stand-in for the completion API

pub mod fakes;
pub mod harness;

pub use fakes::FakeCompletionClient;
pub use harness::TestHarness;
