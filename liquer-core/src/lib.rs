//!
//! # Liquer Core
//!
//! Liquer core defines the essential components of a liquer installation:
//! the query language, values and states, commands, caches, stores and the
//! evaluation machinery tying them together.
//!
//! ## Glossary
//!
//! **[Key](crate::query::Key)** - an identifier of a resource in a [store](crate::store).
//! A key consists of names separated by '/'. Keys can only point into a store, never to arbitrary
//! files of the file-system. Names that would clash with the query syntax (like names starting with '-')
//! are not valid keys.
//!
//! **[Query](crate::query::Query)** - a pipeline description, e.g. `value-1/add-2`.
//! A query is a sequence of segments. A transform segment is a sequence of actions separated by '/',
//! a resource segment (`-R/path/to/file`) loads data from a store.
//! Parameters may contain links (`~X~value-1~E`) which are evaluated as nested queries.
//!
//! **[Value](crate::value::Value)** - the basic data unit. It is an enum covering the types
//! a command can produce: none, numbers, text, bytes, lists and dictionaries.
//!
//! **[Metadata](crate::metadata::Metadata)** - everything known about a value: the query that produced it,
//! its [status](crate::metadata::Status), title, description, log, progress and type identifier.
//!
//! **[State](crate::state::State)** - a value together with its metadata. Evaluating a query produces a state.
//! A failed evaluation produces a state with status `error` and the error in the log.
//!
//! **[State type](crate::state_types::StateType)** - knows how to serialize a value to a given format
//! (file extension), how to deserialize it and how to characterize it.
//!
//! **[Command](crate::commands::Command)** - a function with [metadata](crate::command_metadata::CommandMetadata)
//! taking a state and parsed arguments and returning a value. Commands live in namespaces;
//! the `ns` action selects namespaces searched in the rest of a query.
//! A command invocation with its parameters is called an **action**.
//!
//! **[Context](crate::context::Context)** - the handle passed to a running command. It gives access
//! to the [environment](crate::context::Environment), allows logging, progress reporting,
//! variables and evaluation of nested queries.
//!
//! **[Cache](crate::cache::Cache)** - stores evaluated states by query, so that the longest
//! already computed prefix of a query does not need to be recomputed.
//!
//! **[Recipe](crate::recipes::Recipe)** - a description (usually a query) of how to create a resource.
//! A [recipe store](crate::recipes::RecipeSpecStore) presents resources defined in `recipes.yaml` files
//! as if they existed and creates them on first access.
//!
//! **[Pool](crate::pool::Pool)** - evaluates queries in the background with a fixed number of workers.
//!
//! **[Dependencies](crate::dependencies::Dependencies)** - versions of commands and recipes a result
//! was computed with; used to detect stale cached results.
extern crate serde;
#[macro_use]
extern crate serde_derive;

pub mod cache;
pub mod command_metadata;
pub mod commands;
pub mod config;
pub mod context;
pub mod dependencies;
pub mod error;
pub mod indexer;
pub mod media_type;
pub mod metadata;
pub mod parse;
pub mod pool;
pub mod query;
pub mod recipes;
pub mod state;
pub mod state_types;
pub mod store;
pub mod template;
pub mod value;
