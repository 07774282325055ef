//! # Processing topology
//!
//! Data structures for the compiled processing graph: an arena of Source,
//! Processor, and Sink nodes with parent-only adjacency, sealed into an
//! immutable [`Topology`] once assembly finishes.
//!
//! ## Key design principles
//!
//! 1. **Parents only** - nodes store upstream identities; the child index is
//!    derived at seal time, so no cyclic back-references exist
//! 2. **Grows then freezes** - nodes are immutable once created and never
//!    deleted; the graph only grows during assembly, then is sealed
//! 3. **Stable names** - user-supplied or sequential auto-generated, unique
//!    within one assembly session
//! 4. **Cycle detection** - verified at seal time via Kahn's algorithm

pub mod error;
pub mod graph;
pub mod names;
pub mod node;

// Re-export key types
pub use error::TopologyError;
pub use graph::{Node, NodeId, Topology, TopologyGraph};
pub use names::{NameSequencer, REPARTITION_TOPIC_SUFFIX};
pub use node::{
    JoinSide, JoinType, JoinWindows, NodeKind, OperatorKind, ProcessError, SinkTarget,
    TimestampPolicy, TopicSubscription,
};
