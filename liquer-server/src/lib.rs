//! HTTP facade and command line driver of liquer.
//!
//! The [api] router exposes query evaluation, the cache and the store over HTTP.
//! [presets] turns a configuration into a ready to use environment.
#[macro_use]
extern crate serde_derive;

pub mod api;
pub mod cache_handlers;
pub mod core_handlers;
pub mod environment;
pub mod presets;
pub mod store_handlers;
pub mod utils;
pub mod value;

pub use api::router;
pub use environment::{ServerEnvRef, ServerEnvironment};
