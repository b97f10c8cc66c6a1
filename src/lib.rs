//! The Anchorite Library
//!
//! This crate contains all the moving parts of the Anchorite RPKI
//! relying-party validator. The application itself, via `main.rs`, is
//! only a very tiny frontend.
//!
//! Validation starts from a set of trust anchor locators – see
//! [`tal`] – and walks down through all the objects published under
//! them – see [`engine`]. Objects are fetched through a layered chain
//! assembled in [`fetch`] which leans on the durable [`store`] whenever
//! the remote side misbehaves. The current state of all trust anchors
//! lives in the shared memory image of [`anchors`].

pub use self::config::Config;
pub use self::error::{ExitError, Failed};
pub use self::operation::Operation;

pub mod anchors;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod log;
pub mod metrics;
pub mod objects;
pub mod operation;
pub mod origins;
pub mod output;
pub mod store;
pub mod tal;
pub mod validation;
