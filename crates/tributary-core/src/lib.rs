//! # Tributary Core
//!
//! A fluent stream-processing DSL that compiles into an immutable processing
//! topology executed per-partition by an external runtime.
//!
//! This crate covers the compile-time half of the system:
//! - **Topology assembly**: every DSL call validates its arguments, derives
//!   the output codec, registers nodes and edges, and returns a new handle
//! - **Codec propagation**: key/value codecs flow through chained operators
//!   according to a fixed rule table, with explicit overrides winning
//! - **Repartition injection**: key-changing operators feeding key-sensitive
//!   consumers (joins, grouped aggregations) get a hidden intermediate topic
//! - **Join / branch / merge compilation**: windowed stream-stream joins,
//!   stream-table and stream-global-table joins, predicate fan-out, union
//!
//! Execution-time concerns (consumer/producer I/O, task assignment, state
//! store engines, checkpointing) belong to the external runtime. The
//! [`driver`] module ships a small in-process driver for exercising sealed
//! topologies in tests.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tributary_core::stream::StreamsBuilder;
//!
//! let builder = StreamsBuilder::new("orders-app")?;
//! let orders = builder.stream::<String, String>("orders")?;
//! orders
//!     .filter(|_, v| !v.is_empty())?
//!     .map_values(|_, v: &String| v.to_uppercase())?
//!     .to("orders-clean")?;
//! let topology = builder.build()?;
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod driver;
pub mod stream;
pub mod topology;

// Re-export key types
pub use stream::{MessageStream, StreamsBuilder};
pub use topology::Topology;

/// Result type for tributary-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for tributary-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Topology assembly errors
    #[error("Topology error: {0}")]
    Topology(#[from] topology::TopologyError),

    /// Codec errors
    #[error("Codec error: {0}")]
    Codec(#[from] codec::CodecError),

    /// Test driver errors
    #[error("Driver error: {0}")]
    Driver(#[from] driver::DriverError),
}
