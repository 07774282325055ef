//! Stable auto-generated stage names.
//!
//! One [`NameSequencer`] is owned by each assembly session and threaded
//! through the assembler; it is never ambient global state. Generated names
//! are `{PREFIX}-{index:010}` with a single counter shared across all
//! prefixes, so names are unique and their numeric order reflects call
//! order.

/// Reserved suffix marking hidden re-partition topics.
pub const REPARTITION_TOPIC_SUFFIX: &str = "-repartition";

/// Stage-name prefixes, one per operator family.
pub mod prefix {
    /// Source nodes created by `stream()`.
    pub const SOURCE: &str = "STREAM-SOURCE";
    /// Sink nodes created by `to()` and `to_dynamic()`.
    pub const SINK: &str = "STREAM-SINK";
    /// `filter` / `filter_not`.
    pub const FILTER: &str = "STREAM-FILTER";
    /// `map`.
    pub const MAP: &str = "STREAM-MAP";
    /// `flat_map`.
    pub const FLATMAP: &str = "STREAM-FLATMAP";
    /// `map_values`.
    pub const MAPVALUES: &str = "STREAM-MAPVALUES";
    /// `flat_map_values`.
    pub const FLATMAPVALUES: &str = "STREAM-FLATMAPVALUES";
    /// `select_key`.
    pub const KEY_SELECT: &str = "STREAM-KEY-SELECT";
    /// `transform` / `flat_transform`.
    pub const TRANSFORM: &str = "STREAM-TRANSFORM";
    /// `transform_values` / `flat_transform_values`.
    pub const TRANSFORMVALUES: &str = "STREAM-TRANSFORMVALUES";
    /// `process`.
    pub const PROCESSOR: &str = "STREAM-PROCESSOR";
    /// `peek`.
    pub const PEEK: &str = "STREAM-PEEK";
    /// `foreach`.
    pub const FOREACH: &str = "STREAM-FOREACH";
    /// `print`.
    pub const PRINTER: &str = "STREAM-PRINTER";
    /// `branch` parent node.
    pub const BRANCH: &str = "STREAM-BRANCH";
    /// `branch` per-predicate children.
    pub const BRANCHCHILD: &str = "STREAM-BRANCHCHILD";
    /// `merge`.
    pub const MERGE: &str = "STREAM-MERGE";
    /// Stream-stream join base name (used for the window store pair).
    pub const JOIN: &str = "STREAM-JOIN";
    /// Stream-stream join, this-side store writer.
    pub const JOINTHIS: &str = "STREAM-JOINTHIS";
    /// Stream-stream join, other-side store writer.
    pub const JOINOTHER: &str = "STREAM-JOINOTHER";
    /// Stream-stream join output merge.
    pub const JOINMERGE: &str = "STREAM-JOINMERGE";
    /// Stream-table join.
    pub const TABLEJOIN: &str = "STREAM-TABLEJOIN";
    /// Stream-global-table join.
    pub const GLOBALTABLEJOIN: &str = "STREAM-GLOBALTABLEJOIN";
    /// `count` aggregation.
    pub const COUNT: &str = "STREAM-COUNT";
    /// Table source nodes created by `table()`.
    pub const TABLE_SOURCE: &str = "TABLE-SOURCE";
    /// Global table source nodes created by `global_table()`.
    pub const GLOBALTABLE_SOURCE: &str = "GLOBALTABLE-SOURCE";
    /// Hidden repartition sink.
    pub const REPARTITION_SINK: &str = "REPARTITION-SINK";
    /// Hidden repartition source.
    pub const REPARTITION_SOURCE: &str = "REPARTITION-SOURCE";
}

/// Issues sequential stage names for one assembly session.
#[derive(Debug, Default)]
pub struct NameSequencer {
    next: u32,
}

impl NameSequencer {
    /// Creates a sequencer starting at index 0.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next name for the given prefix, advancing the counter.
    pub fn next(&mut self, prefix: &str) -> String {
        let index = self.next;
        self.next += 1;
        format!("{prefix}-{index:010}")
    }
}
