//! Shared domain types for the generation job system.
//!
//! Everything here is free of I/O except the [`store::InMemoryJobStore`]:
//! job records and their status lifecycle, request payloads, the error
//! taxonomy, structured-output parsers, and the contracts the text and
//! image generation backends implement.

pub mod backend;
pub mod env;
pub mod error;
pub mod job;
pub mod parsing;
pub mod payload;
pub mod store;
pub mod types;
