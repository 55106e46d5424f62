//! # Threatintel Server
//!
//! Process wiring for the feed-job engine: configuration loading, store
//! selection and the entry points an external scheduler or operator invokes.

pub mod app;
pub mod config;
