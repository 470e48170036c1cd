//! Data-plane core of an LLM inference gateway filter.
//!
//! The crate implements the request-routing and inference-aware load
//! balancing engine that runs inside a reverse-proxy HTTP filter: model rule
//! resolution, prompt fingerprinting for KV-cache affinity, multi-signal host
//! scoring, the Metadata Center client with its fire-and-forget task queue,
//! protocol transcoding, and the per-request filter state machine.
//!
//! The proxy host integrates through [`filter::FilterFactory`], supplying the
//! parsed configuration, a [`metadata::MetadataCenter`] handle, and a
//! [`core::HostProvider`] with the resolved cluster membership.

pub mod config;
pub mod core;
pub mod filter;
pub mod hash;
pub mod metadata;
pub mod policies;
pub mod transcoder;
