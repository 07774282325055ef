//! The fluent DSL and topology assembler.
//!
//! A [`StreamsBuilder`] owns one assembly session: the graph node store and
//! the name sequencer. Every operator call validates its arguments, derives
//! the output codec, asks the repartition injector whether a hidden stage is
//! needed, registers nodes and edges, and returns a new handle bound to the
//! new node. Failed calls leave the graph untouched.
//!
//! Assembly is single-threaded and synchronous: handles share the builder
//! core through `Rc<RefCell<_>>` and never cross threads. The sealed
//! [`Topology`] produced by [`StreamsBuilder::build`] is immutable and
//! freely shareable.

pub mod join;
pub(crate) mod repartition;
pub(crate) mod validate;

#[cfg(test)]
mod tests;

use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use crate::codec::propagation::{self, CodecInference};
use crate::codec::{erase, CodecPair, CodecRef, DynValue};
use crate::topology::names::prefix;
use crate::topology::node::{
    downcast, DynAction, DynFlatKeyValueMapper, DynFlatValueMapper, DynKeyMapper,
    DynKeyValueMapper, DynPredicate, DynProcessorSupplier, DynTopicExtractor,
    DynTransformerSupplier, DynValueMapper, DynValueTransformerSupplier,
};
use crate::topology::{
    NameSequencer, NodeId, NodeKind, OperatorKind, SinkTarget, TimestampPolicy, Topology,
    TopologyError, TopologyGraph, TopicSubscription,
};

pub use crate::topology::JoinWindows;
pub use join::Joined;

/// Shared assembly-session state behind every handle.
pub(crate) struct BuilderCore {
    pub(crate) app_id: String,
    pub(crate) graph: TopologyGraph,
    pub(crate) names: NameSequencer,
}

impl BuilderCore {
    /// Rejects a name already registered in the graph. Consumers that
    /// inject hidden stages check their own name first, so a rejected call
    /// commits nothing.
    pub(crate) fn ensure_available(&self, name: &str) -> Result<(), TopologyError> {
        if self.graph.contains_name(name) {
            return Err(TopologyError::DuplicateName(name.to_string()));
        }
        Ok(())
    }
}

/// Optional stage-name override accepted by most operators.
#[derive(Debug, Clone, Default)]
pub struct Named {
    pub(crate) name: Option<String>,
}

impl Named {
    /// A config overriding the auto-generated stage name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

/// Optional config for `to` / `through`: stage name and codec overrides.
#[derive(Debug, Clone, Default)]
pub struct Produced {
    pub(crate) name: Option<String>,
    pub(crate) codec: CodecPair,
}

impl Produced {
    /// An empty config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the sink stage name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Overrides the key codec.
    #[must_use]
    pub fn with_key_codec(mut self, codec: CodecRef) -> Self {
        self.codec.key = Some(codec);
        self
    }

    /// Overrides the value codec.
    #[must_use]
    pub fn with_value_codec(mut self, codec: CodecRef) -> Self {
        self.codec.value = Some(codec);
        self
    }
}

/// Optional config for `group_by` / `group_by_key`.
#[derive(Debug, Clone, Default)]
pub struct Grouped {
    pub(crate) name: Option<String>,
    pub(crate) codec: CodecPair,
}

impl Grouped {
    /// An empty config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the aggregation stage name (also used for the hidden
    /// repartition topic, when one is injected).
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Overrides the key codec of the grouped stream.
    #[must_use]
    pub fn with_key_codec(mut self, codec: CodecRef) -> Self {
        self.codec.key = Some(codec);
        self
    }

    /// Overrides the value codec of the grouped stream.
    #[must_use]
    pub fn with_value_codec(mut self, codec: CodecRef) -> Self {
        self.codec.value = Some(codec);
        self
    }
}

/// Boxed branch predicate, one per fan-out leg.
pub type BranchPredicate<K, V> = Box<dyn Fn(&K, &V) -> bool + Send + Sync>;

/// Top-level topology assembler.
///
/// Owns the graph node store and the name-uniqueness namespace for one
/// assembly session. Concurrent assembly of one builder is prevented by the
/// single-owner `Rc` discipline; handles are not `Send`.
pub struct StreamsBuilder {
    core: Rc<RefCell<BuilderCore>>,
}

impl StreamsBuilder {
    /// Creates a builder for the given application identity.
    ///
    /// The application id prefixes hidden repartition topic names.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if `app_id` is blank.
    pub fn new(app_id: impl Into<String>) -> Result<Self, TopologyError> {
        let app_id = app_id.into();
        validate::non_blank(&app_id, "applicationId")?;
        Ok(Self {
            core: Rc::new(RefCell::new(BuilderCore {
                app_id,
                graph: TopologyGraph::new(),
                names: NameSequencer::new(),
            })),
        })
    }

    /// Creates a stream over a topic with no codec attached.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if `topic` is blank.
    pub fn stream<K, V>(&self, topic: &str) -> Result<MessageStream<K, V>, TopologyError> {
        self.stream_with(topic, CodecPair::unspecified())
    }

    /// Creates a stream over a topic with an explicit codec pair.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if `topic` is blank.
    pub fn stream_with<K, V>(
        &self,
        topic: &str,
        codec: CodecPair,
    ) -> Result<MessageStream<K, V>, TopologyError> {
        validate::non_blank(topic, "topic")?;
        let subscription = TopicSubscription::Names(vec![topic.to_string()]);
        self.add_source(subscription, codec)
    }

    /// Creates a stream over several topics merged into one source.
    ///
    /// Records from all subscribed topics flow through the same node;
    /// relative order is preserved only per topic.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::InvalidArgument`] if `topics` is empty and
    /// [`TopologyError::ArgumentInvalidElement`] if an element is blank.
    pub fn stream_many<K, V>(
        &self,
        topics: &[&str],
        codec: CodecPair,
    ) -> Result<MessageStream<K, V>, TopologyError> {
        validate::topics(topics)?;
        let subscription =
            TopicSubscription::Names(topics.iter().map(|t| (*t).to_string()).collect());
        self.add_source(subscription, codec)
    }

    /// Creates a stream over all topics matching a name pattern.
    ///
    /// Pattern resolution is the external runtime's responsibility.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if `pattern` is blank.
    pub fn stream_pattern<K, V>(
        &self,
        pattern: &str,
    ) -> Result<MessageStream<K, V>, TopologyError> {
        validate::non_blank(pattern, "topicPattern")?;
        self.add_source(
            TopicSubscription::Pattern(pattern.to_string()),
            CodecPair::unspecified(),
        )
    }

    fn add_source<K, V>(
        &self,
        subscription: TopicSubscription,
        codec: CodecPair,
    ) -> Result<MessageStream<K, V>, TopologyError> {
        let mut core = self.core.borrow_mut();
        let name = core.names.next(prefix::SOURCE);
        let id = core.graph.add_node(
            name,
            NodeKind::Source {
                subscription,
                codec: codec.clone(),
                timestamp_policy: TimestampPolicy::Default,
                internal: false,
            },
            &[],
        )?;
        drop(core);
        Ok(MessageStream {
            core: Rc::clone(&self.core),
            node: id,
            codec,
            repartition_required: false,
            _types: PhantomData,
        })
    }

    /// Creates a table materialized from a changelog topic.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if `topic` is blank.
    pub fn table<K, V>(&self, topic: &str, codec: CodecPair) -> Result<Table<K, V>, TopologyError> {
        validate::non_blank(topic, "topic")?;
        self.add_table(topic, codec, prefix::TABLE_SOURCE)
    }

    /// Creates a global table, fully replicated to every processing unit.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if `topic` is blank.
    pub fn global_table<K, V>(
        &self,
        topic: &str,
        codec: CodecPair,
    ) -> Result<GlobalTable<K, V>, TopologyError> {
        validate::non_blank(topic, "topic")?;
        let table = self.add_table(topic, codec, prefix::GLOBALTABLE_SOURCE)?;
        Ok(GlobalTable { inner: table })
    }

    fn add_table<K, V>(
        &self,
        topic: &str,
        codec: CodecPair,
        source_prefix: &str,
    ) -> Result<Table<K, V>, TopologyError> {
        let mut core = self.core.borrow_mut();
        let source_name = core.names.next(source_prefix);
        let processor_name = core.names.next(prefix::TABLE_SOURCE);
        let store = format!("{processor_name}-store");
        let source = core.graph.add_node(
            source_name,
            NodeKind::Source {
                subscription: TopicSubscription::Names(vec![topic.to_string()]),
                codec: codec.clone(),
                timestamp_policy: TimestampPolicy::Default,
                internal: false,
            },
            &[],
        )?;
        let node = core.graph.add_node(
            processor_name,
            NodeKind::Processor {
                op: OperatorKind::TableSource {
                    store: store.clone(),
                    codec: codec.clone(),
                },
                stores: vec![store.clone()],
            },
            &[source],
        )?;
        drop(core);
        Ok(Table {
            core: Rc::clone(&self.core),
            node,
            store,
            codec,
            _types: PhantomData,
        })
    }

    /// Number of nodes registered so far. Useful for asserting that failed
    /// calls are side-effect-free.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.core.borrow().graph.node_count()
    }

    /// Seals the accumulated graph into an immutable [`Topology`].
    ///
    /// The builder must not be used after sealing.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::EmptyTopology`] if no operators were added
    /// and [`TopologyError::CycleDetected`] if the graph contains a cycle.
    pub fn build(self) -> Result<Topology, TopologyError> {
        let graph = std::mem::take(&mut self.core.borrow_mut().graph);
        graph.seal()
    }
}

/// A typed handle onto one node of the graph under assembly.
///
/// Lightweight: a node id, the codec pair attached to the node's output,
/// and the key-dirty flag consulted lazily by key-sensitive consumers.
pub struct MessageStream<K, V> {
    pub(crate) core: Rc<RefCell<BuilderCore>>,
    pub(crate) node: NodeId,
    pub(crate) codec: CodecPair,
    pub(crate) repartition_required: bool,
    pub(crate) _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for MessageStream<K, V> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
            node: self.node,
            codec: self.codec.clone(),
            repartition_required: self.repartition_required,
            _types: PhantomData,
        }
    }
}

impl<K, V> MessageStream<K, V> {
    /// The graph node this handle is bound to.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// The codec pair attached to this node's output.
    #[must_use]
    pub fn codec(&self) -> &CodecPair {
        &self.codec
    }

    /// Whether the record key may have changed since the last
    /// re-partitioning point.
    #[must_use]
    pub fn repartition_required(&self) -> bool {
        self.repartition_required
    }

    pub(crate) fn child<K2, V2>(
        &self,
        node: NodeId,
        codec: CodecPair,
        repartition_required: bool,
    ) -> MessageStream<K2, V2> {
        MessageStream {
            core: Rc::clone(&self.core),
            node,
            codec,
            repartition_required,
            _types: PhantomData,
        }
    }

    /// Registers one processor node downstream of this handle.
    ///
    /// Callers validate arguments before invoking this; once called, the
    /// node is committed.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn append(
        &self,
        name_prefix: &str,
        named: Option<&Named>,
        op: OperatorKind,
        stores: Vec<String>,
        inference: CodecInference,
        override_pair: Option<&CodecPair>,
        marks_dirty: bool,
    ) -> Result<(NodeId, CodecPair, bool), TopologyError> {
        let mut core = self.core.borrow_mut();
        let name = match named.and_then(|n| n.name.clone()) {
            Some(name) => name,
            None => core.names.next(name_prefix),
        };
        let codec = propagation::infer(inference, &self.codec, override_pair);
        let id = core
            .graph
            .add_node(name, NodeKind::Processor { op, stores }, &[self.node])?;
        Ok((id, codec, marks_dirty || self.repartition_required))
    }
}

impl<K, V> MessageStream<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Keeps records for which the predicate holds.
    ///
    /// # Errors
    ///
    /// Fails if a downstream naming conflict occurs; the graph is unchanged.
    pub fn filter<F>(&self, predicate: F) -> Result<MessageStream<K, V>, TopologyError>
    where
        F: Fn(&K, &V) -> bool + Send + Sync + 'static,
    {
        self.filter_impl(predicate, false, None)
    }

    /// [`Self::filter`] with a stage-name override.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `named` name is blank.
    pub fn filter_named<F>(
        &self,
        named: Named,
        predicate: F,
    ) -> Result<MessageStream<K, V>, TopologyError>
    where
        F: Fn(&K, &V) -> bool + Send + Sync + 'static,
    {
        self.filter_impl(predicate, false, Some(named))
    }

    /// Drops records for which the predicate holds.
    ///
    /// # Errors
    ///
    /// Fails if a downstream naming conflict occurs; the graph is unchanged.
    pub fn filter_not<F>(&self, predicate: F) -> Result<MessageStream<K, V>, TopologyError>
    where
        F: Fn(&K, &V) -> bool + Send + Sync + 'static,
    {
        self.filter_impl(predicate, true, None)
    }

    /// [`Self::filter_not`] with a stage-name override.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `named` name is blank.
    pub fn filter_not_named<F>(
        &self,
        named: Named,
        predicate: F,
    ) -> Result<MessageStream<K, V>, TopologyError>
    where
        F: Fn(&K, &V) -> bool + Send + Sync + 'static,
    {
        self.filter_impl(predicate, true, Some(named))
    }

    fn filter_impl<F>(
        &self,
        predicate: F,
        negate: bool,
        named: Option<Named>,
    ) -> Result<MessageStream<K, V>, TopologyError>
    where
        F: Fn(&K, &V) -> bool + Send + Sync + 'static,
    {
        validate::named(named.as_ref())?;
        let (id, codec, dirty) = self.append(
            prefix::FILTER,
            named.as_ref(),
            OperatorKind::Filter {
                predicate: erase_predicate(predicate),
                negate,
            },
            Vec::new(),
            CodecInference::Inherit,
            None,
            false,
        )?;
        Ok(self.child(id, codec, dirty))
    }

    /// Replaces the record key; clears the key codec and marks the stream
    /// key-dirty.
    ///
    /// # Errors
    ///
    /// Fails if a downstream naming conflict occurs; the graph is unchanged.
    pub fn select_key<K2, F>(&self, mapper: F) -> Result<MessageStream<K2, V>, TopologyError>
    where
        K2: Send + Sync + 'static,
        F: Fn(&K, &V) -> K2 + Send + Sync + 'static,
    {
        self.select_key_impl(mapper, None)
    }

    /// [`Self::select_key`] with a stage-name override.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `named` name is blank.
    pub fn select_key_named<K2, F>(
        &self,
        named: Named,
        mapper: F,
    ) -> Result<MessageStream<K2, V>, TopologyError>
    where
        K2: Send + Sync + 'static,
        F: Fn(&K, &V) -> K2 + Send + Sync + 'static,
    {
        self.select_key_impl(mapper, Some(named))
    }

    fn select_key_impl<K2, F>(
        &self,
        mapper: F,
        named: Option<Named>,
    ) -> Result<MessageStream<K2, V>, TopologyError>
    where
        K2: Send + Sync + 'static,
        F: Fn(&K, &V) -> K2 + Send + Sync + 'static,
    {
        validate::named(named.as_ref())?;
        let (id, codec, dirty) = self.append(
            prefix::KEY_SELECT,
            named.as_ref(),
            OperatorKind::SelectKey {
                mapper: erase_key_mapper(mapper),
            },
            Vec::new(),
            CodecInference::ClearKey,
            None,
            true,
        )?;
        Ok(self.child(id, codec, dirty))
    }

    /// Replaces key and value; clears both codecs and marks the stream
    /// key-dirty.
    ///
    /// # Errors
    ///
    /// Fails if a downstream naming conflict occurs; the graph is unchanged.
    pub fn map<K2, V2, F>(&self, mapper: F) -> Result<MessageStream<K2, V2>, TopologyError>
    where
        K2: Send + Sync + 'static,
        V2: Send + Sync + 'static,
        F: Fn(&K, &V) -> (K2, V2) + Send + Sync + 'static,
    {
        self.map_impl(mapper, None)
    }

    /// [`Self::map`] with a stage-name override.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `named` name is blank.
    pub fn map_named<K2, V2, F>(
        &self,
        named: Named,
        mapper: F,
    ) -> Result<MessageStream<K2, V2>, TopologyError>
    where
        K2: Send + Sync + 'static,
        V2: Send + Sync + 'static,
        F: Fn(&K, &V) -> (K2, V2) + Send + Sync + 'static,
    {
        self.map_impl(mapper, Some(named))
    }

    fn map_impl<K2, V2, F>(
        &self,
        mapper: F,
        named: Option<Named>,
    ) -> Result<MessageStream<K2, V2>, TopologyError>
    where
        K2: Send + Sync + 'static,
        V2: Send + Sync + 'static,
        F: Fn(&K, &V) -> (K2, V2) + Send + Sync + 'static,
    {
        validate::named(named.as_ref())?;
        let (id, codec, dirty) = self.append(
            prefix::MAP,
            named.as_ref(),
            OperatorKind::Map {
                mapper: erase_kv_mapper(mapper),
            },
            Vec::new(),
            CodecInference::ClearBoth,
            None,
            true,
        )?;
        Ok(self.child(id, codec, dirty))
    }

    /// Replaces each record with zero or more key/value pairs; clears both
    /// codecs and marks the stream key-dirty.
    ///
    /// # Errors
    ///
    /// Fails if a downstream naming conflict occurs; the graph is unchanged.
    pub fn flat_map<K2, V2, F>(&self, mapper: F) -> Result<MessageStream<K2, V2>, TopologyError>
    where
        K2: Send + Sync + 'static,
        V2: Send + Sync + 'static,
        F: Fn(&K, &V) -> Vec<(K2, V2)> + Send + Sync + 'static,
    {
        self.flat_map_impl(mapper, None)
    }

    /// [`Self::flat_map`] with a stage-name override.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `named` name is blank.
    pub fn flat_map_named<K2, V2, F>(
        &self,
        named: Named,
        mapper: F,
    ) -> Result<MessageStream<K2, V2>, TopologyError>
    where
        K2: Send + Sync + 'static,
        V2: Send + Sync + 'static,
        F: Fn(&K, &V) -> Vec<(K2, V2)> + Send + Sync + 'static,
    {
        self.flat_map_impl(mapper, Some(named))
    }

    fn flat_map_impl<K2, V2, F>(
        &self,
        mapper: F,
        named: Option<Named>,
    ) -> Result<MessageStream<K2, V2>, TopologyError>
    where
        K2: Send + Sync + 'static,
        V2: Send + Sync + 'static,
        F: Fn(&K, &V) -> Vec<(K2, V2)> + Send + Sync + 'static,
    {
        validate::named(named.as_ref())?;
        let (id, codec, dirty) = self.append(
            prefix::FLATMAP,
            named.as_ref(),
            OperatorKind::FlatMap {
                mapper: erase_flat_kv_mapper(mapper),
            },
            Vec::new(),
            CodecInference::ClearBoth,
            None,
            true,
        )?;
        Ok(self.child(id, codec, dirty))
    }

    /// Replaces the value, keeping the key; preserves the key codec and
    /// clears the value codec.
    ///
    /// # Errors
    ///
    /// Fails if a downstream naming conflict occurs; the graph is unchanged.
    pub fn map_values<V2, F>(&self, mapper: F) -> Result<MessageStream<K, V2>, TopologyError>
    where
        V2: Send + Sync + 'static,
        F: Fn(&K, &V) -> V2 + Send + Sync + 'static,
    {
        self.map_values_impl(mapper, None, None)
    }

    /// [`Self::map_values`] with a stage-name override.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `named` name is blank.
    pub fn map_values_named<V2, F>(
        &self,
        named: Named,
        mapper: F,
    ) -> Result<MessageStream<K, V2>, TopologyError>
    where
        V2: Send + Sync + 'static,
        F: Fn(&K, &V) -> V2 + Send + Sync + 'static,
    {
        self.map_values_impl(mapper, Some(named), None)
    }

    /// [`Self::map_values`] with an explicit codec override, which wins over
    /// the derived pair exactly.
    ///
    /// # Errors
    ///
    /// Fails if a downstream naming conflict occurs; the graph is unchanged.
    pub fn map_values_with<V2, F>(
        &self,
        mapper: F,
        override_pair: CodecPair,
    ) -> Result<MessageStream<K, V2>, TopologyError>
    where
        V2: Send + Sync + 'static,
        F: Fn(&K, &V) -> V2 + Send + Sync + 'static,
    {
        self.map_values_impl(mapper, None, Some(override_pair))
    }

    fn map_values_impl<V2, F>(
        &self,
        mapper: F,
        named: Option<Named>,
        override_pair: Option<CodecPair>,
    ) -> Result<MessageStream<K, V2>, TopologyError>
    where
        V2: Send + Sync + 'static,
        F: Fn(&K, &V) -> V2 + Send + Sync + 'static,
    {
        validate::named(named.as_ref())?;
        let (id, codec, dirty) = self.append(
            prefix::MAPVALUES,
            named.as_ref(),
            OperatorKind::MapValues {
                mapper: erase_value_mapper(mapper),
            },
            Vec::new(),
            CodecInference::ClearValue,
            override_pair.as_ref(),
            false,
        )?;
        Ok(self.child(id, codec, dirty))
    }

    /// Replaces the value with zero or more values, keeping the key.
    ///
    /// # Errors
    ///
    /// Fails if a downstream naming conflict occurs; the graph is unchanged.
    pub fn flat_map_values<V2, F>(&self, mapper: F) -> Result<MessageStream<K, V2>, TopologyError>
    where
        V2: Send + Sync + 'static,
        F: Fn(&K, &V) -> Vec<V2> + Send + Sync + 'static,
    {
        self.flat_map_values_impl(mapper, None)
    }

    /// [`Self::flat_map_values`] with a stage-name override.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `named` name is blank.
    pub fn flat_map_values_named<V2, F>(
        &self,
        named: Named,
        mapper: F,
    ) -> Result<MessageStream<K, V2>, TopologyError>
    where
        V2: Send + Sync + 'static,
        F: Fn(&K, &V) -> Vec<V2> + Send + Sync + 'static,
    {
        self.flat_map_values_impl(mapper, Some(named))
    }

    fn flat_map_values_impl<V2, F>(
        &self,
        mapper: F,
        named: Option<Named>,
    ) -> Result<MessageStream<K, V2>, TopologyError>
    where
        V2: Send + Sync + 'static,
        F: Fn(&K, &V) -> Vec<V2> + Send + Sync + 'static,
    {
        validate::named(named.as_ref())?;
        let (id, codec, dirty) = self.append(
            prefix::FLATMAPVALUES,
            named.as_ref(),
            OperatorKind::FlatMapValues {
                mapper: erase_flat_value_mapper(mapper),
            },
            Vec::new(),
            CodecInference::ClearValue,
            None,
            false,
        )?;
        Ok(self.child(id, codec, dirty))
    }

    /// Stateful transformation producing one key/value pair per record.
    /// Clears both codecs and marks the stream key-dirty. The supplier is
    /// invoked once per runtime task instance.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentInvalidElement`] if a store name is
    /// blank.
    pub fn transform<K2, V2, T, S>(
        &self,
        supplier: S,
        store_names: &[&str],
    ) -> Result<MessageStream<K2, V2>, TopologyError>
    where
        K2: Send + Sync + 'static,
        V2: Send + Sync + 'static,
        T: FnMut(&K, &V) -> (K2, V2) + Send + 'static,
        S: Fn() -> T + Send + Sync + 'static,
    {
        self.transform_impl(supplier, store_names, None)
    }

    /// [`Self::transform`] with a stage-name override.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `named` name is blank.
    pub fn transform_named<K2, V2, T, S>(
        &self,
        named: Named,
        supplier: S,
        store_names: &[&str],
    ) -> Result<MessageStream<K2, V2>, TopologyError>
    where
        K2: Send + Sync + 'static,
        V2: Send + Sync + 'static,
        T: FnMut(&K, &V) -> (K2, V2) + Send + 'static,
        S: Fn() -> T + Send + Sync + 'static,
    {
        self.transform_impl(supplier, store_names, Some(named))
    }

    fn transform_impl<K2, V2, T, S>(
        &self,
        supplier: S,
        store_names: &[&str],
        named: Option<Named>,
    ) -> Result<MessageStream<K2, V2>, TopologyError>
    where
        K2: Send + Sync + 'static,
        V2: Send + Sync + 'static,
        T: FnMut(&K, &V) -> (K2, V2) + Send + 'static,
        S: Fn() -> T + Send + Sync + 'static,
    {
        validate::named(named.as_ref())?;
        validate::store_names(store_names)?;
        let erased: DynTransformerSupplier = Arc::new(move || {
            let mut transform = supplier();
            Box::new(move |k: &DynValue, v: &DynValue| {
                let (k2, v2) = transform(downcast::<K>(k)?, downcast::<V>(v)?);
                Ok(vec![(erase(k2), erase(v2))])
            })
        });
        let (id, codec, dirty) = self.append(
            prefix::TRANSFORM,
            named.as_ref(),
            OperatorKind::Transform { supplier: erased },
            to_owned_names(store_names),
            CodecInference::ClearBoth,
            None,
            true,
        )?;
        Ok(self.child(id, codec, dirty))
    }

    /// Stateful transformation producing zero or more key/value pairs per
    /// record. Clears both codecs and marks the stream key-dirty.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentInvalidElement`] if a store name is
    /// blank.
    pub fn flat_transform<K2, V2, T, S>(
        &self,
        supplier: S,
        store_names: &[&str],
    ) -> Result<MessageStream<K2, V2>, TopologyError>
    where
        K2: Send + Sync + 'static,
        V2: Send + Sync + 'static,
        T: FnMut(&K, &V) -> Vec<(K2, V2)> + Send + 'static,
        S: Fn() -> T + Send + Sync + 'static,
    {
        self.flat_transform_impl(supplier, store_names, None)
    }

    /// [`Self::flat_transform`] with a stage-name override.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `named` name is blank.
    pub fn flat_transform_named<K2, V2, T, S>(
        &self,
        named: Named,
        supplier: S,
        store_names: &[&str],
    ) -> Result<MessageStream<K2, V2>, TopologyError>
    where
        K2: Send + Sync + 'static,
        V2: Send + Sync + 'static,
        T: FnMut(&K, &V) -> Vec<(K2, V2)> + Send + 'static,
        S: Fn() -> T + Send + Sync + 'static,
    {
        self.flat_transform_impl(supplier, store_names, Some(named))
    }

    fn flat_transform_impl<K2, V2, T, S>(
        &self,
        supplier: S,
        store_names: &[&str],
        named: Option<Named>,
    ) -> Result<MessageStream<K2, V2>, TopologyError>
    where
        K2: Send + Sync + 'static,
        V2: Send + Sync + 'static,
        T: FnMut(&K, &V) -> Vec<(K2, V2)> + Send + 'static,
        S: Fn() -> T + Send + Sync + 'static,
    {
        validate::named(named.as_ref())?;
        validate::store_names(store_names)?;
        let erased: DynTransformerSupplier = Arc::new(move || {
            let mut transform = supplier();
            Box::new(move |k: &DynValue, v: &DynValue| {
                let out = transform(downcast::<K>(k)?, downcast::<V>(v)?);
                Ok(out
                    .into_iter()
                    .map(|(k2, v2)| (erase(k2), erase(v2)))
                    .collect())
            })
        });
        let (id, codec, dirty) = self.append(
            prefix::TRANSFORM,
            named.as_ref(),
            OperatorKind::Transform { supplier: erased },
            to_owned_names(store_names),
            CodecInference::ClearBoth,
            None,
            true,
        )?;
        Ok(self.child(id, codec, dirty))
    }

    /// Stateful value transformation, keeping the key. Preserves the key
    /// codec, clears the value codec.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentInvalidElement`] if a store name is
    /// blank.
    pub fn transform_values<V2, T, S>(
        &self,
        supplier: S,
        store_names: &[&str],
    ) -> Result<MessageStream<K, V2>, TopologyError>
    where
        V2: Send + Sync + 'static,
        T: FnMut(&K, &V) -> V2 + Send + 'static,
        S: Fn() -> T + Send + Sync + 'static,
    {
        self.transform_values_impl(supplier, store_names, None)
    }

    /// [`Self::transform_values`] with a stage-name override.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `named` name is blank.
    pub fn transform_values_named<V2, T, S>(
        &self,
        named: Named,
        supplier: S,
        store_names: &[&str],
    ) -> Result<MessageStream<K, V2>, TopologyError>
    where
        V2: Send + Sync + 'static,
        T: FnMut(&K, &V) -> V2 + Send + 'static,
        S: Fn() -> T + Send + Sync + 'static,
    {
        self.transform_values_impl(supplier, store_names, Some(named))
    }

    fn transform_values_impl<V2, T, S>(
        &self,
        supplier: S,
        store_names: &[&str],
        named: Option<Named>,
    ) -> Result<MessageStream<K, V2>, TopologyError>
    where
        V2: Send + Sync + 'static,
        T: FnMut(&K, &V) -> V2 + Send + 'static,
        S: Fn() -> T + Send + Sync + 'static,
    {
        validate::named(named.as_ref())?;
        validate::store_names(store_names)?;
        let erased: DynValueTransformerSupplier = Arc::new(move || {
            let mut transform = supplier();
            Box::new(move |k: &DynValue, v: &DynValue| {
                Ok(vec![erase(transform(downcast::<K>(k)?, downcast::<V>(v)?))])
            })
        });
        let (id, codec, dirty) = self.append(
            prefix::TRANSFORMVALUES,
            named.as_ref(),
            OperatorKind::TransformValues { supplier: erased },
            to_owned_names(store_names),
            CodecInference::ClearValue,
            None,
            false,
        )?;
        Ok(self.child(id, codec, dirty))
    }

    /// Stateful value transformation producing zero or more values per
    /// record, keeping the key.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentInvalidElement`] if a store name is
    /// blank.
    pub fn flat_transform_values<V2, T, S>(
        &self,
        supplier: S,
        store_names: &[&str],
    ) -> Result<MessageStream<K, V2>, TopologyError>
    where
        V2: Send + Sync + 'static,
        T: FnMut(&K, &V) -> Vec<V2> + Send + 'static,
        S: Fn() -> T + Send + Sync + 'static,
    {
        self.flat_transform_values_impl(supplier, store_names, None)
    }

    /// [`Self::flat_transform_values`] with a stage-name override.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `named` name is blank.
    pub fn flat_transform_values_named<V2, T, S>(
        &self,
        named: Named,
        supplier: S,
        store_names: &[&str],
    ) -> Result<MessageStream<K, V2>, TopologyError>
    where
        V2: Send + Sync + 'static,
        T: FnMut(&K, &V) -> Vec<V2> + Send + 'static,
        S: Fn() -> T + Send + Sync + 'static,
    {
        self.flat_transform_values_impl(supplier, store_names, Some(named))
    }

    fn flat_transform_values_impl<V2, T, S>(
        &self,
        supplier: S,
        store_names: &[&str],
        named: Option<Named>,
    ) -> Result<MessageStream<K, V2>, TopologyError>
    where
        V2: Send + Sync + 'static,
        T: FnMut(&K, &V) -> Vec<V2> + Send + 'static,
        S: Fn() -> T + Send + Sync + 'static,
    {
        validate::named(named.as_ref())?;
        validate::store_names(store_names)?;
        let erased: DynValueTransformerSupplier = Arc::new(move || {
            let mut transform = supplier();
            Box::new(move |k: &DynValue, v: &DynValue| {
                let out = transform(downcast::<K>(k)?, downcast::<V>(v)?);
                Ok(out.into_iter().map(erase).collect())
            })
        });
        let (id, codec, dirty) = self.append(
            prefix::TRANSFORMVALUES,
            named.as_ref(),
            OperatorKind::TransformValues { supplier: erased },
            to_owned_names(store_names),
            CodecInference::ClearValue,
            None,
            false,
        )?;
        Ok(self.child(id, codec, dirty))
    }

    /// Terminal stateful processor. The supplier is invoked once per
    /// runtime task instance.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentInvalidElement`] if a store name is
    /// blank.
    pub fn process<T, S>(&self, supplier: S, store_names: &[&str]) -> Result<(), TopologyError>
    where
        T: FnMut(&K, &V) + Send + 'static,
        S: Fn() -> T + Send + Sync + 'static,
    {
        self.process_impl(supplier, store_names, None)
    }

    /// [`Self::process`] with a stage-name override.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `named` name is blank.
    pub fn process_named<T, S>(
        &self,
        named: Named,
        supplier: S,
        store_names: &[&str],
    ) -> Result<(), TopologyError>
    where
        T: FnMut(&K, &V) + Send + 'static,
        S: Fn() -> T + Send + Sync + 'static,
    {
        self.process_impl(supplier, store_names, Some(named))
    }

    fn process_impl<T, S>(
        &self,
        supplier: S,
        store_names: &[&str],
        named: Option<Named>,
    ) -> Result<(), TopologyError>
    where
        T: FnMut(&K, &V) + Send + 'static,
        S: Fn() -> T + Send + Sync + 'static,
    {
        validate::named(named.as_ref())?;
        validate::store_names(store_names)?;
        let erased: DynProcessorSupplier = Arc::new(move || {
            let mut process = supplier();
            Box::new(move |k: &DynValue, v: &DynValue| {
                process(downcast::<K>(k)?, downcast::<V>(v)?);
                Ok(())
            })
        });
        self.append(
            prefix::PROCESSOR,
            named.as_ref(),
            OperatorKind::Process { supplier: erased },
            to_owned_names(store_names),
            CodecInference::Inherit,
            None,
            false,
        )?;
        Ok(())
    }

    /// Observes each record and forwards it unchanged.
    ///
    /// # Errors
    ///
    /// Fails if a downstream naming conflict occurs; the graph is unchanged.
    pub fn peek<F>(&self, action: F) -> Result<MessageStream<K, V>, TopologyError>
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        self.peek_impl(action, None)
    }

    /// [`Self::peek`] with a stage-name override.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `named` name is blank.
    pub fn peek_named<F>(
        &self,
        named: Named,
        action: F,
    ) -> Result<MessageStream<K, V>, TopologyError>
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        self.peek_impl(action, Some(named))
    }

    fn peek_impl<F>(
        &self,
        action: F,
        named: Option<Named>,
    ) -> Result<MessageStream<K, V>, TopologyError>
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        validate::named(named.as_ref())?;
        let (id, codec, dirty) = self.append(
            prefix::PEEK,
            named.as_ref(),
            OperatorKind::Peek {
                action: erase_action(action),
            },
            Vec::new(),
            CodecInference::Inherit,
            None,
            false,
        )?;
        Ok(self.child(id, codec, dirty))
    }

    /// Terminal per-record action.
    ///
    /// # Errors
    ///
    /// Fails if a downstream naming conflict occurs; the graph is unchanged.
    pub fn foreach<F>(&self, action: F) -> Result<(), TopologyError>
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        self.foreach_impl(action, None)
    }

    /// [`Self::foreach`] with a stage-name override.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `named` name is blank.
    pub fn foreach_named<F>(&self, named: Named, action: F) -> Result<(), TopologyError>
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        self.foreach_impl(action, Some(named))
    }

    fn foreach_impl<F>(&self, action: F, named: Option<Named>) -> Result<(), TopologyError>
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        validate::named(named.as_ref())?;
        self.append(
            prefix::FOREACH,
            named.as_ref(),
            OperatorKind::Foreach {
                action: erase_action(action),
            },
            Vec::new(),
            CodecInference::Inherit,
            None,
            false,
        )?;
        Ok(())
    }

    /// Terminal logging stage.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if `label` is blank.
    pub fn print(&self, label: &str) -> Result<(), TopologyError> {
        validate::non_blank(label, "label")?;
        self.append(
            prefix::PRINTER,
            None,
            OperatorKind::Print {
                label: label.to_string(),
            },
            Vec::new(),
            CodecInference::Inherit,
            None,
            false,
        )?;
        Ok(())
    }

    /// Fans the stream out: each record is routed to the output of the
    /// first predicate (in declaration order) that matches; records
    /// matching no predicate are dropped. Returns one handle per
    /// predicate, in order, all sharing this node's codec.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::InvalidArgument`] if `predicates` is empty.
    pub fn branch(
        &self,
        predicates: Vec<BranchPredicate<K, V>>,
    ) -> Result<Vec<MessageStream<K, V>>, TopologyError> {
        self.branch_impl(predicates, None)
    }

    /// [`Self::branch`] with a stage-name override for the branch node.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `named` name is blank
    /// and [`TopologyError::InvalidArgument`] if `predicates` is empty.
    pub fn branch_named(
        &self,
        named: Named,
        predicates: Vec<BranchPredicate<K, V>>,
    ) -> Result<Vec<MessageStream<K, V>>, TopologyError> {
        self.branch_impl(predicates, Some(named))
    }

    fn branch_impl(
        &self,
        predicates: Vec<BranchPredicate<K, V>>,
        named: Option<Named>,
    ) -> Result<Vec<MessageStream<K, V>>, TopologyError> {
        validate::named(named.as_ref())?;
        validate::predicates(&predicates)?;

        let erased: Vec<DynPredicate> = predicates
            .into_iter()
            .map(|p| -> DynPredicate {
                Arc::new(move |k: &DynValue, v: &DynValue| {
                    Ok(p(downcast::<K>(k)?, downcast::<V>(v)?))
                })
            })
            .collect();
        let leg_count = erased.len();

        let (branch_id, codec, dirty) = self.append(
            prefix::BRANCH,
            named.as_ref(),
            OperatorKind::Branch { predicates: erased },
            Vec::new(),
            CodecInference::Inherit,
            None,
            false,
        )?;

        let mut legs = Vec::with_capacity(leg_count);
        let mut core = self.core.borrow_mut();
        for index in 0..leg_count {
            let name = core.names.next(prefix::BRANCHCHILD);
            let id = core.graph.add_node(
                name,
                NodeKind::Processor {
                    op: OperatorKind::BranchChild { index },
                    stores: Vec::new(),
                },
                &[branch_id],
            )?;
            legs.push(self.child(id, codec.clone(), dirty));
        }
        Ok(legs)
    }

    /// Unions this stream with another from the same builder. The merged
    /// codec is unspecified (codecs are not proven compatible), and
    /// relative order is preserved only within each upstream.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::InvalidArgument`] if the streams belong to
    /// different builders.
    pub fn merge(&self, other: &MessageStream<K, V>) -> Result<MessageStream<K, V>, TopologyError> {
        self.merge_impl(other, None)
    }

    /// [`Self::merge`] with a stage-name override.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `named` name is blank,
    /// plus the [`Self::merge`] errors.
    pub fn merge_named(
        &self,
        named: Named,
        other: &MessageStream<K, V>,
    ) -> Result<MessageStream<K, V>, TopologyError> {
        self.merge_impl(other, Some(named))
    }

    fn merge_impl(
        &self,
        other: &MessageStream<K, V>,
        named: Option<Named>,
    ) -> Result<MessageStream<K, V>, TopologyError> {
        validate::named(named.as_ref())?;
        if !Rc::ptr_eq(&self.core, &other.core) {
            return Err(TopologyError::InvalidArgument(
                "merge requires streams from the same builder".to_string(),
            ));
        }
        let mut core = self.core.borrow_mut();
        let name = match named.and_then(|n| n.name) {
            Some(name) => name,
            None => core.names.next(prefix::MERGE),
        };
        let id = core.graph.add_node(
            name,
            NodeKind::Processor {
                op: OperatorKind::Merge,
                stores: Vec::new(),
            },
            &[self.node, other.node],
        )?;
        drop(core);
        Ok(self.child(
            id,
            CodecPair::unspecified(),
            self.repartition_required || other.repartition_required,
        ))
    }

    /// Publishes the stream to a static topic.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if `topic` is blank.
    pub fn to(&self, topic: &str) -> Result<(), TopologyError> {
        self.to_with(topic, Produced::new())
    }

    /// [`Self::to`] with stage-name and codec overrides.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if `topic` or the configured
    /// name is blank.
    pub fn to_with(&self, topic: &str, produced: Produced) -> Result<(), TopologyError> {
        validate::non_blank(topic, "topic")?;
        validate::produced(&produced)?;
        self.add_sink(
            SinkTarget::Static(topic.to_string()),
            produced,
            /* internal */ false,
        )
    }

    /// Publishes each record to a per-record computed topic name.
    ///
    /// # Errors
    ///
    /// Fails if a downstream naming conflict occurs; the graph is unchanged.
    pub fn to_dynamic<F>(&self, extractor: F) -> Result<(), TopologyError>
    where
        F: Fn(&K, &V) -> String + Send + Sync + 'static,
    {
        self.add_sink(
            SinkTarget::Dynamic(erase_topic_extractor(extractor)),
            Produced::new(),
            /* internal */ false,
        )
    }

    fn add_sink(
        &self,
        target: SinkTarget,
        produced: Produced,
        internal: bool,
    ) -> Result<(), TopologyError> {
        let codec = self.codec.overlay(&produced.codec);
        let mut core = self.core.borrow_mut();
        let name = match produced.name {
            Some(name) => name,
            None => core.names.next(prefix::SINK),
        };
        core.graph.add_node(
            name,
            NodeKind::Sink {
                target,
                codec,
                internal,
            },
            &[self.node],
        )?;
        Ok(())
    }

    /// Re-publishes the stream through an explicit intermediate topic and
    /// continues from it. The continuation keeps this stream's codec (or
    /// the override) and is a re-partitioning point: the key-dirty flag is
    /// cleared, and the re-consume source fails fast on invalid timestamps
    /// since every record on the topic was produced by this application.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if `topic` is blank.
    pub fn through(&self, topic: &str) -> Result<MessageStream<K, V>, TopologyError> {
        self.through_with(topic, Produced::new())
    }

    /// [`Self::through`] with codec overrides.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if `topic` or the configured
    /// name is blank.
    pub fn through_with(
        &self,
        topic: &str,
        produced: Produced,
    ) -> Result<MessageStream<K, V>, TopologyError> {
        validate::non_blank(topic, "topic")?;
        validate::produced(&produced)?;
        let codec = self.codec.overlay(&produced.codec);
        self.add_sink(SinkTarget::Static(topic.to_string()), produced, false)?;

        let mut core = self.core.borrow_mut();
        let name = core.names.next(prefix::SOURCE);
        let id = core.graph.add_node(
            name,
            NodeKind::Source {
                subscription: TopicSubscription::Names(vec![topic.to_string()]),
                codec: codec.clone(),
                timestamp_policy: TimestampPolicy::FailOnInvalid,
                internal: false,
            },
            &[],
        )?;
        drop(core);
        Ok(self.child(id, codec, false))
    }

    /// Groups the stream by its current key, preserving both codecs unless
    /// a later [`Grouped`] override is supplied via
    /// [`Self::group_by_key_with`].
    #[must_use]
    pub fn group_by_key(&self) -> GroupedStream<K, V> {
        GroupedStream {
            core: Rc::clone(&self.core),
            node: self.node,
            codec: self.codec.clone(),
            repartition_required: self.repartition_required,
            name: None,
            _types: PhantomData,
        }
    }

    /// [`Self::group_by_key`] with codec and name overrides.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the `grouped` name is
    /// blank.
    pub fn group_by_key_with(&self, grouped: Grouped) -> Result<GroupedStream<K, V>, TopologyError> {
        validate::grouped(&grouped)?;
        Ok(GroupedStream {
            core: Rc::clone(&self.core),
            node: self.node,
            codec: self.codec.overlay(&grouped.codec),
            repartition_required: self.repartition_required,
            name: grouped.name,
            _types: PhantomData,
        })
    }

    /// Groups the stream by a derived key. Clears the key codec (unless
    /// overridden) and always marks the grouping key-dirty.
    ///
    /// # Errors
    ///
    /// Fails if a downstream naming conflict occurs; the graph is unchanged.
    pub fn group_by<K2, F>(&self, selector: F) -> Result<GroupedStream<K2, V>, TopologyError>
    where
        K2: Send + Sync + 'static,
        F: Fn(&K, &V) -> K2 + Send + Sync + 'static,
    {
        self.group_by_with(selector, Grouped::new())
    }

    /// [`Self::group_by`] with codec and name overrides.
    ///
    /// # Errors
    ///
    /// Fails if a downstream naming conflict occurs; the graph is unchanged.
    pub fn group_by_with<K2, F>(
        &self,
        selector: F,
        grouped: Grouped,
    ) -> Result<GroupedStream<K2, V>, TopologyError>
    where
        K2: Send + Sync + 'static,
        F: Fn(&K, &V) -> K2 + Send + Sync + 'static,
    {
        validate::grouped(&grouped)?;
        let (id, codec, _) = self.append(
            prefix::KEY_SELECT,
            None,
            OperatorKind::SelectKey {
                mapper: erase_key_mapper(selector),
            },
            Vec::new(),
            CodecInference::ClearKey,
            Some(&grouped.codec),
            true,
        )?;
        Ok(GroupedStream {
            core: Rc::clone(&self.core),
            node: id,
            codec,
            repartition_required: true,
            name: grouped.name,
            _types: PhantomData,
        })
    }
}

/// A stream grouped by key, ready for aggregation.
///
/// Grouping registers no node by itself; the aggregation call does, and it
/// consults the key-dirty flag to decide whether a hidden repartition stage
/// must precede it.
pub struct GroupedStream<K, V> {
    pub(crate) core: Rc<RefCell<BuilderCore>>,
    pub(crate) node: NodeId,
    pub(crate) codec: CodecPair,
    pub(crate) repartition_required: bool,
    pub(crate) name: Option<String>,
    pub(crate) _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> GroupedStream<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Counts records per key into a materialized store, repartitioning
    /// first if the grouping key is dirty. The count value codec defaults
    /// to the builtin `i64` codec.
    ///
    /// # Errors
    ///
    /// Fails if a downstream naming conflict occurs; the graph is unchanged.
    pub fn count(&self) -> Result<Table<K, i64>, TopologyError> {
        let count_name = match &self.name {
            Some(name) => name.clone(),
            None => self.core.borrow_mut().names.next(prefix::COUNT),
        };
        let store = format!("{count_name}-store");

        // Claim the name before any hidden stages attach to it; a duplicate
        // must not leave orphan repartition nodes behind.
        self.core.borrow().ensure_available(&count_name)?;

        let (parent, codec, _) = repartition::maybe_repartition(
            &self.core,
            self.node,
            &self.codec,
            self.repartition_required,
            &count_name,
        )?;

        let store_codec = CodecPair {
            key: codec.key.clone(),
            value: Some(Arc::new(crate::codec::I64Codec)),
        };

        let mut core = self.core.borrow_mut();
        let id = core.graph.add_node(
            count_name,
            NodeKind::Processor {
                op: OperatorKind::Count {
                    store: store.clone(),
                    codec: store_codec.clone(),
                },
                stores: vec![store.clone()],
            },
            &[parent],
        )?;
        drop(core);
        Ok(Table {
            core: Rc::clone(&self.core),
            node: id,
            store,
            codec: store_codec,
            _types: PhantomData,
        })
    }
}

/// The materialized, continuously-updated view of the latest value per key.
pub struct Table<K, V> {
    pub(crate) core: Rc<RefCell<BuilderCore>>,
    pub(crate) node: NodeId,
    pub(crate) store: String,
    pub(crate) codec: CodecPair,
    pub(crate) _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Table<K, V> {
    /// The graph node materializing this table.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Name of the backing state store.
    #[must_use]
    pub fn store_name(&self) -> &str {
        &self.store
    }

    /// The codec pair keying the backing store.
    #[must_use]
    pub fn codec(&self) -> &CodecPair {
        &self.codec
    }
}

/// A table fully replicated to every processing unit, enabling lookups
/// without key-based partition alignment.
pub struct GlobalTable<K, V> {
    pub(crate) inner: Table<K, V>,
}

impl<K, V> GlobalTable<K, V> {
    /// Name of the backing state store.
    #[must_use]
    pub fn store_name(&self) -> &str {
        self.inner.store_name()
    }

    /// The codec pair keying the backing store.
    #[must_use]
    pub fn codec(&self) -> &CodecPair {
        self.inner.codec()
    }
}

// ---- closure erasure helpers ----

fn to_owned_names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| (*n).to_string()).collect()
}

fn erase_predicate<K, V, F>(f: F) -> DynPredicate
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    F: Fn(&K, &V) -> bool + Send + Sync + 'static,
{
    Arc::new(move |k: &DynValue, v: &DynValue| Ok(f(downcast::<K>(k)?, downcast::<V>(v)?)))
}

fn erase_key_mapper<K, V, K2, F>(f: F) -> DynKeyMapper
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    K2: Send + Sync + 'static,
    F: Fn(&K, &V) -> K2 + Send + Sync + 'static,
{
    Arc::new(move |k: &DynValue, v: &DynValue| Ok(erase(f(downcast::<K>(k)?, downcast::<V>(v)?))))
}

fn erase_kv_mapper<K, V, K2, V2, F>(f: F) -> DynKeyValueMapper
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    K2: Send + Sync + 'static,
    V2: Send + Sync + 'static,
    F: Fn(&K, &V) -> (K2, V2) + Send + Sync + 'static,
{
    Arc::new(move |k: &DynValue, v: &DynValue| {
        let (k2, v2) = f(downcast::<K>(k)?, downcast::<V>(v)?);
        Ok((erase(k2), erase(v2)))
    })
}

fn erase_flat_kv_mapper<K, V, K2, V2, F>(f: F) -> DynFlatKeyValueMapper
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    K2: Send + Sync + 'static,
    V2: Send + Sync + 'static,
    F: Fn(&K, &V) -> Vec<(K2, V2)> + Send + Sync + 'static,
{
    Arc::new(move |k: &DynValue, v: &DynValue| {
        let out = f(downcast::<K>(k)?, downcast::<V>(v)?);
        Ok(out
            .into_iter()
            .map(|(k2, v2)| (erase(k2), erase(v2)))
            .collect())
    })
}

fn erase_value_mapper<K, V, V2, F>(f: F) -> DynValueMapper
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    V2: Send + Sync + 'static,
    F: Fn(&K, &V) -> V2 + Send + Sync + 'static,
{
    Arc::new(move |k: &DynValue, v: &DynValue| Ok(erase(f(downcast::<K>(k)?, downcast::<V>(v)?))))
}

fn erase_flat_value_mapper<K, V, V2, F>(f: F) -> DynFlatValueMapper
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    V2: Send + Sync + 'static,
    F: Fn(&K, &V) -> Vec<V2> + Send + Sync + 'static,
{
    Arc::new(move |k: &DynValue, v: &DynValue| {
        let out = f(downcast::<K>(k)?, downcast::<V>(v)?);
        Ok(out.into_iter().map(erase).collect())
    })
}

fn erase_action<K, V, F>(f: F) -> DynAction
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    F: Fn(&K, &V) + Send + Sync + 'static,
{
    Arc::new(move |k: &DynValue, v: &DynValue| {
        f(downcast::<K>(k)?, downcast::<V>(v)?);
        Ok(())
    })
}

fn erase_topic_extractor<K, V, F>(f: F) -> DynTopicExtractor
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    F: Fn(&K, &V) -> String + Send + Sync + 'static,
{
    Arc::new(move |k: &DynValue, v: &DynValue| Ok(f(downcast::<K>(k)?, downcast::<V>(v)?)))
}
