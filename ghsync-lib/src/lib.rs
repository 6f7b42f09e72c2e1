#![doc(hidden)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Core library for ghsync
//!
//! This library consolidates all functionality for the ghsync tool, which pulls
//! paginated data from the GitHub REST API into a local store, paced so that the
//! server never has to reject a request, and resumable across runs.
//!
//! # Module Organization
//!
//! - [`commands`]: Command-line interface and orchestration
//! - [`collect`]: Rate governance, request execution, and the stateful collector
//! - [`store`]: Durable raw and tool-layer storage
//! - [`tasks`]: The GitHub sub-tasks and their work-item scopes
//! - [`extract`]: Decoding raw records into typed tool rows

pub type Result<T, E = ohno::AppError> = core::result::Result<T, E>;

#[cfg(any(debug_assertions, test))]
pub mod commands;
#[cfg(not(any(debug_assertions, test)))]
mod commands;

#[cfg(any(debug_assertions, test))]
pub mod collect;
#[cfg(not(any(debug_assertions, test)))]
mod collect;

#[cfg(any(debug_assertions, test))]
pub mod extract;
#[cfg(not(any(debug_assertions, test)))]
mod extract;

#[cfg(any(debug_assertions, test))]
pub mod store;
#[cfg(not(any(debug_assertions, test)))]
mod store;

#[cfg(any(debug_assertions, test))]
pub mod tasks;
#[cfg(not(any(debug_assertions, test)))]
mod tasks;

pub use crate::commands::{Host, run};
