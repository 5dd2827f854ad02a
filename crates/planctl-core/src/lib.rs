//! Plan Package Model — shared types, on-disk layout, digests, config, and
//! credentials resolution used across the whole control plane.

pub mod acceptance;
pub mod config;
pub mod credentials;
pub mod dag;
pub mod digest;
pub mod error;
pub mod gpu_job;
pub mod ids;
pub mod layout;
pub mod node_session;
pub mod protocol;
pub mod window;

pub use error::{Error, Result};
