//! RankAlpha BFF - cached dashboard reads with data-freshness propagation
//!
//! This library exposes the core modules for testing and reuse.

pub mod common;
pub mod config;
pub mod error;
pub mod monitor;
pub mod origin;
pub mod routes;
pub mod services;
