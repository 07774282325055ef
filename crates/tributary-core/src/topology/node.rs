//! Node payloads and type-erased operator capabilities.
//!
//! Operators are a small closed set of tagged variants consumed by one
//! assembly routine per operator family. Functional arguments are
//! type-erased closures over [`DynValue`]; the typed DSL layer wraps user
//! closures and downcasts on entry. Suppliers are zero-argument factories
//! invoked once per runtime task instance.

use std::fmt;
use std::sync::Arc;

use crate::codec::{CodecPair, DynValue};

/// A type-erased key/value pair.
pub type KeyValue = (DynValue, DynValue);

/// Result type for type-erased record processing.
pub type ProcResult<T> = Result<T, ProcessError>;

/// Runtime failures inside type-erased operator closures.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// A record key or value held an unexpected runtime type.
    #[error("record component does not hold the expected type {expected}")]
    TypeMismatch {
        /// The type the operator expected.
        expected: &'static str,
    },

    /// A joiner was invoked without the side its variant requires.
    #[error("join side unexpectedly absent")]
    MissingJoinSide,
}

impl ProcessError {
    /// A mismatch error naming the expected type `T`.
    #[must_use]
    pub fn type_mismatch<T>() -> Self {
        Self::TypeMismatch {
            expected: std::any::type_name::<T>(),
        }
    }
}

/// Downcasts a record component to a concrete type.
///
/// # Errors
///
/// Returns [`ProcessError::TypeMismatch`] if the component holds another type.
pub fn downcast<T: Send + Sync + 'static>(value: &DynValue) -> ProcResult<&T> {
    value
        .downcast_ref::<T>()
        .ok_or_else(ProcessError::type_mismatch::<T>)
}

/// Per-record predicate.
pub type DynPredicate = Arc<dyn Fn(&DynValue, &DynValue) -> ProcResult<bool> + Send + Sync>;
/// Maps `(key, value)` to a new key.
pub type DynKeyMapper = Arc<dyn Fn(&DynValue, &DynValue) -> ProcResult<DynValue> + Send + Sync>;
/// Maps `(key, value)` to a new key/value pair.
pub type DynKeyValueMapper = Arc<dyn Fn(&DynValue, &DynValue) -> ProcResult<KeyValue> + Send + Sync>;
/// Maps `(key, value)` to zero or more key/value pairs.
pub type DynFlatKeyValueMapper =
    Arc<dyn Fn(&DynValue, &DynValue) -> ProcResult<Vec<KeyValue>> + Send + Sync>;
/// Maps `(key, value)` to a new value.
pub type DynValueMapper = Arc<dyn Fn(&DynValue, &DynValue) -> ProcResult<DynValue> + Send + Sync>;
/// Maps `(key, value)` to zero or more new values.
pub type DynFlatValueMapper =
    Arc<dyn Fn(&DynValue, &DynValue) -> ProcResult<Vec<DynValue>> + Send + Sync>;
/// Side-effecting per-record action.
pub type DynAction = Arc<dyn Fn(&DynValue, &DynValue) -> ProcResult<()> + Send + Sync>;
/// Computes a destination topic name per record.
pub type DynTopicExtractor = Arc<dyn Fn(&DynValue, &DynValue) -> ProcResult<String> + Send + Sync>;
/// Combines two join sides into an output value. Absent sides are `None`
/// for the left/outer variants.
pub type DynJoiner =
    Arc<dyn Fn(Option<&DynValue>, Option<&DynValue>) -> ProcResult<DynValue> + Send + Sync>;

/// A stateful transformer instance producing key/value pairs.
pub type DynTransformer = Box<dyn FnMut(&DynValue, &DynValue) -> ProcResult<Vec<KeyValue>> + Send>;
/// Factory producing one [`DynTransformer`] per runtime task.
pub type DynTransformerSupplier = Arc<dyn Fn() -> DynTransformer + Send + Sync>;
/// A stateful transformer instance producing values only.
pub type DynValueTransformer =
    Box<dyn FnMut(&DynValue, &DynValue) -> ProcResult<Vec<DynValue>> + Send>;
/// Factory producing one [`DynValueTransformer`] per runtime task.
pub type DynValueTransformerSupplier = Arc<dyn Fn() -> DynValueTransformer + Send + Sync>;
/// A terminal stateful processor instance.
pub type DynProcessor = Box<dyn FnMut(&DynValue, &DynValue) -> ProcResult<()> + Send>;
/// Factory producing one [`DynProcessor`] per runtime task.
pub type DynProcessorSupplier = Arc<dyn Fn() -> DynProcessor + Send + Sync>;

/// Stream-stream and stream-table join variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinType {
    /// Only emit matched pairs.
    #[default]
    Inner,
    /// Emit all this-side records, with the other side if present.
    Left,
    /// Emit all records from both sides (stream-stream only).
    Outer,
}

impl JoinType {
    /// Returns true if unmatched this-side records are emitted.
    #[must_use]
    pub fn emits_unmatched_this(&self) -> bool {
        matches!(self, JoinType::Left | JoinType::Outer)
    }

    /// Returns true if unmatched other-side records are emitted.
    #[must_use]
    pub fn emits_unmatched_other(&self) -> bool {
        matches!(self, JoinType::Outer)
    }
}

/// Identifies which side of a stream-stream join a processor serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSide {
    /// The stream the join was called on.
    This,
    /// The stream passed as the join argument.
    Other,
}

/// Window specification for stream-stream joins.
///
/// Two records join when their timestamps differ by at most the window
/// size. The grace period bounds out-of-order arrival; until it elapses a
/// window is not confirmed closed. Grace defaults to the window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinWindows {
    size_ms: i64,
    grace_ms: Option<i64>,
}

impl JoinWindows {
    /// A symmetric window of the given size in milliseconds.
    #[must_use]
    pub fn of_millis(size_ms: i64) -> Self {
        Self {
            size_ms,
            grace_ms: None,
        }
    }

    /// Overrides the out-of-order grace period.
    #[must_use]
    pub fn with_grace_millis(mut self, grace_ms: i64) -> Self {
        self.grace_ms = Some(grace_ms);
        self
    }

    /// Window size in milliseconds.
    #[must_use]
    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    /// Grace period in milliseconds, defaulting to the window size.
    #[must_use]
    pub fn grace_ms(&self) -> i64 {
        self.grace_ms.unwrap_or(self.size_ms)
    }
}

/// Record-timestamp policy attached to a Source node.
///
/// Injected repartition sources always fail fast on an invalid timestamp;
/// externally-sourced input defaults to no validation unless configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampPolicy {
    /// Pass record timestamps through unvalidated.
    #[default]
    Default,
    /// Reject records carrying an invalid (negative) timestamp.
    FailOnInvalid,
}

/// What a Source node subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicSubscription {
    /// A fixed list of topic names.
    Names(Vec<String>),
    /// A topic-name pattern, matched by the external runtime.
    Pattern(String),
}

impl TopicSubscription {
    /// Returns true if the subscription names this exact topic.
    ///
    /// Pattern subscriptions are resolved by the external runtime and never
    /// match here.
    #[must_use]
    pub fn contains(&self, topic: &str) -> bool {
        match self {
            TopicSubscription::Names(names) => names.iter().any(|n| n == topic),
            TopicSubscription::Pattern(_) => false,
        }
    }
}

/// Destination of a Sink node.
#[derive(Clone)]
pub enum SinkTarget {
    /// A fixed topic name.
    Static(String),
    /// A per-record topic-name function.
    Dynamic(DynTopicExtractor),
}

impl fmt::Debug for SinkTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(topic) => write!(f, "Static({topic})"),
            Self::Dynamic(_) => write!(f, "Dynamic(...)"),
        }
    }
}

/// The closed set of processor operator variants.
///
/// One variant per operator family; overload flexibility (naming, codec
/// overrides, flat vs. single output) lives in the DSL layer, not here.
#[derive(Clone)]
pub enum OperatorKind {
    /// Drops records failing (or, negated, passing) the predicate.
    Filter {
        /// The per-record predicate.
        predicate: DynPredicate,
        /// True for `filter_not`.
        negate: bool,
    },
    /// Replaces the record key.
    SelectKey {
        /// Derives the new key.
        mapper: DynKeyMapper,
    },
    /// Replaces key and value.
    Map {
        /// Derives the new pair.
        mapper: DynKeyValueMapper,
    },
    /// Replaces the record with zero or more pairs.
    FlatMap {
        /// Derives the new pairs.
        mapper: DynFlatKeyValueMapper,
    },
    /// Replaces the value, keeping the key.
    MapValues {
        /// Derives the new value.
        mapper: DynValueMapper,
    },
    /// Replaces the value with zero or more values, keeping the key.
    FlatMapValues {
        /// Derives the new values.
        mapper: DynFlatValueMapper,
    },
    /// Stateful transformation producing key/value pairs.
    Transform {
        /// Per-task transformer factory.
        supplier: DynTransformerSupplier,
    },
    /// Stateful transformation producing values only.
    TransformValues {
        /// Per-task transformer factory.
        supplier: DynValueTransformerSupplier,
    },
    /// Terminal stateful processor.
    Process {
        /// Per-task processor factory.
        supplier: DynProcessorSupplier,
    },
    /// Observes records and forwards them unchanged.
    Peek {
        /// The per-record action.
        action: DynAction,
    },
    /// Observes records without forwarding (terminal).
    Foreach {
        /// The per-record action.
        action: DynAction,
    },
    /// Logs records without forwarding (terminal).
    Print {
        /// Label prepended to each logged record.
        label: String,
    },
    /// Routes each record to the first matching predicate's child.
    Branch {
        /// Predicates evaluated in declaration order.
        predicates: Vec<DynPredicate>,
    },
    /// One fan-out leg of a branch, identified by predicate index.
    BranchChild {
        /// Index into the parent branch's predicate list.
        index: usize,
    },
    /// Binary union of two upstreams.
    Merge,
    /// One side of a windowed stream-stream join: writes its own window
    /// store and probes the other side's store for partners.
    WindowedJoinSide {
        /// Which side this processor serves.
        side: JoinSide,
        /// Join variant.
        join_type: JoinType,
        /// Window and grace specification.
        windows: JoinWindows,
        /// Combines matched (or half-matched) pairs.
        joiner: DynJoiner,
        /// Window store written by this side.
        this_store: String,
        /// Window store probed for partners.
        other_store: String,
        /// Codec used to key the window stores.
        codec: CodecPair,
    },
    /// Union of the two join-side outputs.
    JoinMerge,
    /// Stream-table join: per-record lookup into a materialized store.
    TableJoin {
        /// Join variant (inner or left).
        join_type: JoinType,
        /// The table's materialized store.
        store: String,
        /// Combines stream value and table value.
        joiner: DynJoiner,
    },
    /// Stream-global-table join: mapper-derived lookup key, no partition
    /// alignment required.
    GlobalTableJoin {
        /// Join variant (inner or left).
        join_type: JoinType,
        /// The global table's materialized store.
        store: String,
        /// Derives the lookup key per record.
        key_mapper: DynKeyMapper,
        /// Combines stream value and table value.
        joiner: DynJoiner,
    },
    /// Materializes a changelog topic into a key/value store.
    TableSource {
        /// The backing store.
        store: String,
        /// Codec used to key the store.
        codec: CodecPair,
    },
    /// Per-key record counting over a grouped stream.
    Count {
        /// The backing store.
        store: String,
        /// Codec used to key the store.
        codec: CodecPair,
    },
}

impl OperatorKind {
    /// Short variant name for diagnostics.
    #[must_use]
    pub fn variant(&self) -> &'static str {
        match self {
            Self::Filter { .. } => "Filter",
            Self::SelectKey { .. } => "SelectKey",
            Self::Map { .. } => "Map",
            Self::FlatMap { .. } => "FlatMap",
            Self::MapValues { .. } => "MapValues",
            Self::FlatMapValues { .. } => "FlatMapValues",
            Self::Transform { .. } => "Transform",
            Self::TransformValues { .. } => "TransformValues",
            Self::Process { .. } => "Process",
            Self::Peek { .. } => "Peek",
            Self::Foreach { .. } => "Foreach",
            Self::Print { .. } => "Print",
            Self::Branch { .. } => "Branch",
            Self::BranchChild { .. } => "BranchChild",
            Self::Merge => "Merge",
            Self::WindowedJoinSide { .. } => "WindowedJoinSide",
            Self::JoinMerge => "JoinMerge",
            Self::TableJoin { .. } => "TableJoin",
            Self::GlobalTableJoin { .. } => "GlobalTableJoin",
            Self::TableSource { .. } => "TableSource",
            Self::Count { .. } => "Count",
        }
    }
}

impl fmt::Debug for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.variant())
    }
}

/// Payload of a topology node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Consumes records from subscribed topics.
    Source {
        /// Subscribed topics or pattern.
        subscription: TopicSubscription,
        /// Codec used to decode consumed records.
        codec: CodecPair,
        /// Record-timestamp policy.
        timestamp_policy: TimestampPolicy,
        /// True for hidden repartition sources.
        internal: bool,
    },
    /// Transforms records.
    Processor {
        /// The operator variant.
        op: OperatorKind,
        /// Names of state stores bound to this processor.
        stores: Vec<String>,
    },
    /// Publishes records to a destination.
    Sink {
        /// Static topic or per-record topic function.
        target: SinkTarget,
        /// Codec used to encode published records.
        codec: CodecPair,
        /// True for hidden repartition sinks.
        internal: bool,
    },
}

impl NodeKind {
    /// Returns true for Source nodes.
    #[must_use]
    pub fn is_source(&self) -> bool {
        matches!(self, NodeKind::Source { .. })
    }

    /// Returns true for Sink nodes.
    #[must_use]
    pub fn is_sink(&self) -> bool {
        matches!(self, NodeKind::Sink { .. })
    }
}
