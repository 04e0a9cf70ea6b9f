//! A2A protocol wire types: envelope + typed payloads.
//!
//! This crate defines the wire shape of one agent-to-agent message: an
//! [`Envelope`] tagged by [`MessageType`], carrying a JSON payload that is a
//! [`Task`], [`TaskResponse`], [`Review`], or free-form content depending on
//! the tag. It does not depend on the core; the core builds envelopes here
//! and routes them over its bus.

pub mod envelope;
pub mod review;
pub mod task;

pub use envelope::{Envelope, MessageType};
pub use review::Review;
pub use task::{Task, TaskPriority, TaskResponse, TaskStatus, TokenUsage};
