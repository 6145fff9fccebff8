//! Store configuration and additional store backends for liquer.
//!
//! - [config] reads a declarative list of stores and their mount points,
//! - [store_builder] turns it into a [MountPointStore](liquer_core::store::MountPointStore),
//! - [remote] provides a store backed by the store API of a liquer server.
#[macro_use]
extern crate serde_derive;

pub mod config;
pub mod remote;
pub mod store_builder;

pub use config::{StoreConfig, StoreRouterConfig};
pub use remote::{ApiResponse, ApiStatus, HttpTransport, RemoteStore};
pub use store_builder::{create_router_from_json, create_router_from_yaml, StoreRouterBuilder};
