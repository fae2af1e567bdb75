//! Slicegate: model-to-G-code conversion service.

pub mod api;
pub mod artifact;
pub mod config;
pub mod engine;
pub mod error;
pub mod estimate;
pub mod job;
pub mod pipeline;
pub mod store;
pub mod toolpath;
pub mod validator;
pub mod workspace;
