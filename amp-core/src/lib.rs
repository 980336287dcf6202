//! Per-client lifecycle orchestration: ties the remote-processor backend,
//! the shared-memory pool, the image loader and the resource table walker
//! together into one state machine per remote core.

pub mod client;

pub use client::{Client, ClientConfig, Error, State};
