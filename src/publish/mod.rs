//! # Publishing
//!
//! Delivery of analysis results to the downstream durable queue.
//!
//! ## Key Components:
//! - **event**: The four-field JSON wire schema
//! - **publisher**: Per-event publish with isolated failure handling
//! - **sink**: Durable sink contract and the journal-backed implementation

pub mod event;
pub mod publisher;
pub mod sink;
