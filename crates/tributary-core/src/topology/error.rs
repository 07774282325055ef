//! Error types for topology assembly.

/// Errors raised synchronously during topology assembly.
///
/// Assembly-time errors are programmer errors, not transient faults: they
/// propagate immediately to the caller and the failed call leaves no
/// partially-wired node behind.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// A required argument (or a required collection reference) was absent.
    #[error("required argument '{0}' was absent")]
    ArgumentNull(&'static str),

    /// A collection argument contained an invalid element.
    #[error("argument '{param}' contained an invalid element at index {index}")]
    ArgumentInvalidElement {
        /// Name of the offending parameter.
        param: &'static str,
        /// Index of the invalid element.
        index: usize,
    },

    /// A structurally invalid call (e.g. zero predicates on branch).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An explicit override is incompatible with an upstream guarantee.
    #[error("configuration conflict: {0}")]
    ConfigurationConflict(String),

    /// A node with the same name already exists in this assembly session.
    #[error("duplicate node name: {0}")]
    DuplicateName(String),

    /// A parent reference points at a node that does not exist.
    #[error("node not found: {0}")]
    NodeNotFound(String),

    /// The graph contains a cycle involving the named node.
    #[error("cycle detected involving node: {0}")]
    CycleDetected(String),

    /// Sealing was requested on a graph with no nodes.
    #[error("empty topology: no nodes")]
    EmptyTopology,
}
