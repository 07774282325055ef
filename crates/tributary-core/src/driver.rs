//! In-process driver for exercising sealed topologies.
//!
//! Executes a [`Topology`] synchronously against piped records: no consumer
//! or producer I/O, no task assignment, no persistence. Records published to
//! a topic that a Source in the same topology subscribes to are fed back
//! through the codec encode/decode path, so hidden repartition stages are
//! exercised exactly like external topics. Stateful stage instances are
//! created once, when the driver is built.
//!
//! Stream time is the maximum record timestamp seen so far. Windowed join
//! sides buffer records per window store; unmatched left/outer records are
//! emitted when [`TopologyTestDriver::advance_stream_time`] moves stream
//! time past their window plus grace.

use std::collections::VecDeque;
use std::sync::Arc;

use fxhash::FxHashMap;

use crate::codec::{erase, CodecError, CodecPair, CodecRef, DynValue};
use crate::topology::node::{DynProcessor, DynTransformer, DynValueTransformer};
use crate::topology::{
    JoinSide, JoinType, Node, NodeId, NodeKind, OperatorKind, ProcessError, SinkTarget,
    TimestampPolicy, Topology,
};

/// Errors raised while piping records through a driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// No Source node subscribes to the piped topic.
    #[error("no source subscribes to topic '{0}'")]
    UnknownTopic(String),

    /// A record crossed a topic boundary with no codec and no driver
    /// default for one of its components.
    #[error("no {role} codec available at node '{node}'")]
    MissingCodec {
        /// `"key"` or `"value"`.
        role: &'static str,
        /// Name of the node that needed the codec.
        node: String,
    },

    /// A record carried an invalid timestamp into a fail-fast Source.
    #[error("record timestamp {0} is invalid")]
    InvalidTimestamp(i64),

    /// A codec failed to encode or decode.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// An operator closure failed at runtime.
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// A record captured at a Sink.
struct OutputRecord {
    key: DynValue,
    value: DynValue,
    ts: i64,
}

/// One buffered record in a join window store.
struct WindowEntry {
    key_bytes: Vec<u8>,
    key: DynValue,
    value: DynValue,
    ts: i64,
    matched: bool,
}

struct WindowStore {
    key_codec: Option<CodecRef>,
    entries: Vec<WindowEntry>,
}

struct KvStore {
    key_codec: Option<CodecRef>,
    map: FxHashMap<Vec<u8>, DynValue>,
}

/// A stateful stage instance, created once per driver.
enum StageInstance {
    Transformer(DynTransformer),
    ValueTransformer(DynValueTransformer),
    Processor(DynProcessor),
}

/// Synchronous in-process executor for a sealed [`Topology`].
pub struct TopologyTestDriver {
    topology: Arc<Topology>,
    default_codec: CodecPair,
    kv_stores: FxHashMap<String, KvStore>,
    window_stores: FxHashMap<String, WindowStore>,
    instances: FxHashMap<NodeId, StageInstance>,
    outputs: FxHashMap<String, VecDeque<OutputRecord>>,
    stream_time: i64,
}

impl TopologyTestDriver {
    /// Builds a driver over a sealed topology.
    ///
    /// The default codec pair fills in for unspecified components whenever a
    /// record crosses a topic boundary or is keyed into a store.
    #[must_use]
    pub fn new(topology: Topology, default_codec: CodecPair) -> Self {
        let mut kv_stores = FxHashMap::default();
        let mut window_stores = FxHashMap::default();
        let mut instances = FxHashMap::default();

        for node in topology.nodes() {
            let NodeKind::Processor { op, .. } = &node.kind else {
                continue;
            };
            match op {
                OperatorKind::Transform { supplier } => {
                    instances.insert(node.id, StageInstance::Transformer(supplier()));
                }
                OperatorKind::TransformValues { supplier } => {
                    instances.insert(node.id, StageInstance::ValueTransformer(supplier()));
                }
                OperatorKind::Process { supplier } => {
                    instances.insert(node.id, StageInstance::Processor(supplier()));
                }
                OperatorKind::TableSource { store, codec }
                | OperatorKind::Count { store, codec } => {
                    kv_stores.insert(
                        store.clone(),
                        KvStore {
                            key_codec: codec.key.clone(),
                            map: FxHashMap::default(),
                        },
                    );
                }
                OperatorKind::WindowedJoinSide {
                    this_store, codec, ..
                } => {
                    window_stores.insert(
                        this_store.clone(),
                        WindowStore {
                            key_codec: codec.key.clone(),
                            entries: Vec::new(),
                        },
                    );
                }
                _ => {}
            }
        }

        Self {
            topology: Arc::new(topology),
            default_codec,
            kv_stores,
            window_stores,
            instances,
            outputs: FxHashMap::default(),
            stream_time: i64::MIN,
        }
    }

    /// Pipes one record into every Source subscribed to `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::UnknownTopic`] if nothing subscribes to the
    /// topic and [`DriverError::InvalidTimestamp`] if a fail-fast Source
    /// (anywhere along the record's path) rejects the timestamp.
    pub fn pipe<K, V>(&mut self, topic: &str, key: K, value: V, ts: i64) -> Result<(), DriverError>
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let topology = Arc::clone(&self.topology);
        let sources: Vec<NodeId> = topology.sources_for_topic(topic).map(|n| n.id).collect();
        if sources.is_empty() {
            return Err(DriverError::UnknownTopic(topic.to_string()));
        }

        let key = erase(key);
        let value = erase(value);
        self.stream_time = self.stream_time.max(ts);
        for id in sources {
            if topology.timestamp_policy(id) == Some(TimestampPolicy::FailOnInvalid) && ts < 0 {
                return Err(DriverError::InvalidTimestamp(ts));
            }
            self.forward_children(&topology, id, &key, &value, ts)?;
        }
        Ok(())
    }

    /// Advances stream time and emits unmatched left/outer join records
    /// whose window (plus grace) has closed.
    ///
    /// # Errors
    ///
    /// Propagates joiner and downstream processing failures.
    pub fn advance_stream_time(&mut self, ts: i64) -> Result<(), DriverError> {
        self.stream_time = self.stream_time.max(ts);
        self.flush_closed_windows()
    }

    /// Pops the oldest record captured at a Sink publishing to `topic`.
    #[must_use]
    pub fn read_output<K, V>(&mut self, topic: &str) -> Option<(K, V, i64)>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let record = self.outputs.get_mut(topic)?.pop_front()?;
        let key = record.key.downcast_ref::<K>()?.clone();
        let value = record.value.downcast_ref::<V>()?.clone();
        Some((key, value, record.ts))
    }

    /// Number of unread records captured for `topic`.
    #[must_use]
    pub fn output_len(&self, topic: &str) -> usize {
        self.outputs.get(topic).map_or(0, VecDeque::len)
    }

    /// Reads the current value for `key` from a materialized store.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::MissingCodec`] if the store key cannot be
    /// encoded.
    pub fn store_value<K, V>(&self, store: &str, key: &K) -> Result<Option<V>, DriverError>
    where
        K: Clone + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        let Some(kv) = self.kv_stores.get(store) else {
            return Ok(None);
        };
        let key = erase(key.clone());
        let bytes = self.encode(kv.key_codec.as_ref(), &key, "key", store)?;
        Ok(kv
            .map
            .get(&bytes)
            .and_then(|v| v.downcast_ref::<V>())
            .cloned())
    }

    // ---- record flow ----

    fn process_node(
        &mut self,
        id: NodeId,
        key: &DynValue,
        value: &DynValue,
        ts: i64,
    ) -> Result<(), DriverError> {
        let topology = Arc::clone(&self.topology);
        let Some(node) = topology.node(id) else {
            return Ok(());
        };
        match &node.kind {
            NodeKind::Source { .. } => self.forward_children(&topology, id, key, value, ts),
            NodeKind::Sink { target, codec, .. } => {
                self.deliver(&topology, node, target, codec, key, value, ts)
            }
            NodeKind::Processor { op, .. } => self.apply(&topology, node, op, key, value, ts),
        }
    }

    fn forward_children(
        &mut self,
        topology: &Topology,
        id: NodeId,
        key: &DynValue,
        value: &DynValue,
        ts: i64,
    ) -> Result<(), DriverError> {
        for child in topology.children(id) {
            self.process_node(*child, key, value, ts)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments, clippy::too_many_lines)]
    fn apply(
        &mut self,
        topology: &Topology,
        node: &Node,
        op: &OperatorKind,
        key: &DynValue,
        value: &DynValue,
        ts: i64,
    ) -> Result<(), DriverError> {
        match op {
            OperatorKind::Filter { predicate, negate } => {
                if predicate(key, value)? != *negate {
                    self.forward_children(topology, node.id, key, value, ts)?;
                }
            }
            OperatorKind::SelectKey { mapper } => {
                let key = mapper(key, value)?;
                self.forward_children(topology, node.id, &key, value, ts)?;
            }
            OperatorKind::Map { mapper } => {
                let (key, value) = mapper(key, value)?;
                self.forward_children(topology, node.id, &key, &value, ts)?;
            }
            OperatorKind::FlatMap { mapper } => {
                for (key, value) in mapper(key, value)? {
                    self.forward_children(topology, node.id, &key, &value, ts)?;
                }
            }
            OperatorKind::MapValues { mapper } => {
                let value = mapper(key, value)?;
                self.forward_children(topology, node.id, key, &value, ts)?;
            }
            OperatorKind::FlatMapValues { mapper } => {
                for value in mapper(key, value)? {
                    self.forward_children(topology, node.id, key, &value, ts)?;
                }
            }
            OperatorKind::Transform { .. } => {
                // Moved out of the map for the call to satisfy the borrow
                // checker; reinserted before the result is inspected.
                let Some(StageInstance::Transformer(mut transform)) =
                    self.instances.remove(&node.id)
                else {
                    return Ok(());
                };
                let out = transform(key, value);
                self.instances
                    .insert(node.id, StageInstance::Transformer(transform));
                for (key, value) in out? {
                    self.forward_children(topology, node.id, &key, &value, ts)?;
                }
            }
            OperatorKind::TransformValues { .. } => {
                let Some(StageInstance::ValueTransformer(mut transform)) =
                    self.instances.remove(&node.id)
                else {
                    return Ok(());
                };
                let out = transform(key, value);
                self.instances
                    .insert(node.id, StageInstance::ValueTransformer(transform));
                for value in out? {
                    self.forward_children(topology, node.id, key, &value, ts)?;
                }
            }
            OperatorKind::Process { .. } => {
                let Some(StageInstance::Processor(mut process)) = self.instances.remove(&node.id)
                else {
                    return Ok(());
                };
                let out = process(key, value);
                self.instances
                    .insert(node.id, StageInstance::Processor(process));
                out?;
            }
            OperatorKind::Peek { action } => {
                action(key, value)?;
                self.forward_children(topology, node.id, key, value, ts)?;
            }
            OperatorKind::Foreach { action } => {
                action(key, value)?;
            }
            OperatorKind::Print { label } => {
                tracing::info!(label = %label, ts, "record");
            }
            OperatorKind::Branch { predicates } => {
                let mut selected = None;
                for (index, predicate) in predicates.iter().enumerate() {
                    if predicate(key, value)? {
                        selected = Some(index);
                        break;
                    }
                }
                let Some(selected) = selected else {
                    return Ok(());
                };
                for child in topology.children(node.id) {
                    let is_leg = topology.node(*child).is_some_and(|n| {
                        matches!(
                            &n.kind,
                            NodeKind::Processor {
                                op: OperatorKind::BranchChild { index },
                                ..
                            } if *index == selected
                        )
                    });
                    if is_leg {
                        self.forward_children(topology, *child, key, value, ts)?;
                    }
                }
            }
            OperatorKind::BranchChild { .. }
            | OperatorKind::Merge
            | OperatorKind::JoinMerge => {
                self.forward_children(topology, node.id, key, value, ts)?;
            }
            OperatorKind::WindowedJoinSide {
                side,
                windows,
                joiner,
                this_store,
                other_store,
                codec,
                ..
            } => {
                self.stream_time = self.stream_time.max(ts);
                let key_codec = codec.key.clone();
                let key_bytes = self.encode(key_codec.as_ref(), key, "key", &node.name)?;

                let mut matched = false;
                let mut results: Vec<(DynValue, i64)> = Vec::new();
                if let Some(store) = self.window_stores.get_mut(other_store) {
                    for entry in &mut store.entries {
                        if entry.key_bytes == key_bytes
                            && (entry.ts - ts).abs() <= windows.size_ms()
                        {
                            entry.matched = true;
                            matched = true;
                            let out = match side {
                                JoinSide::This => joiner(Some(value), Some(&entry.value))?,
                                JoinSide::Other => joiner(Some(&entry.value), Some(value))?,
                            };
                            results.push((out, ts.max(entry.ts)));
                        }
                    }
                }
                if let Some(store) = self.window_stores.get_mut(this_store) {
                    store.entries.push(WindowEntry {
                        key_bytes,
                        key: key.clone(),
                        value: value.clone(),
                        ts,
                        matched,
                    });
                }
                for (out, out_ts) in results {
                    self.forward_children(topology, node.id, key, &out, out_ts)?;
                }
            }
            OperatorKind::TableJoin {
                join_type,
                store,
                joiner,
            } => {
                let row = self.kv_lookup(store, key)?;
                let out = match (&row, join_type) {
                    (Some(row), _) => Some(joiner(Some(value), Some(row))?),
                    (None, JoinType::Left) => Some(joiner(Some(value), None)?),
                    (None, _) => None,
                };
                if let Some(out) = out {
                    self.forward_children(topology, node.id, key, &out, ts)?;
                }
            }
            OperatorKind::GlobalTableJoin {
                join_type,
                store,
                key_mapper,
                joiner,
            } => {
                let lookup_key = key_mapper(key, value)?;
                let row = self.kv_lookup(store, &lookup_key)?;
                let out = match (&row, join_type) {
                    (Some(row), _) => Some(joiner(Some(value), Some(row))?),
                    (None, JoinType::Left) => Some(joiner(Some(value), None)?),
                    (None, _) => None,
                };
                if let Some(out) = out {
                    self.forward_children(topology, node.id, key, &out, ts)?;
                }
            }
            OperatorKind::TableSource { store, .. } => {
                let bytes = self.store_key_bytes(store, key)?;
                if let Some(kv) = self.kv_stores.get_mut(store) {
                    kv.map.insert(bytes, value.clone());
                }
            }
            OperatorKind::Count { store, .. } => {
                let bytes = self.store_key_bytes(store, key)?;
                if let Some(kv) = self.kv_stores.get_mut(store) {
                    let current = kv
                        .map
                        .get(&bytes)
                        .and_then(|v| v.downcast_ref::<i64>())
                        .copied()
                        .unwrap_or(0);
                    kv.map.insert(bytes, erase(current + 1));
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn deliver(
        &mut self,
        topology: &Topology,
        node: &Node,
        target: &SinkTarget,
        codec: &CodecPair,
        key: &DynValue,
        value: &DynValue,
        ts: i64,
    ) -> Result<(), DriverError> {
        let topic = match target {
            SinkTarget::Static(topic) => topic.clone(),
            SinkTarget::Dynamic(extractor) => extractor(key, value)?,
        };
        let subscribers: Vec<NodeId> = topology.sources_for_topic(&topic).map(|n| n.id).collect();

        // A record a fail-fast subscriber rejects never lands on the topic.
        for id in &subscribers {
            if topology.timestamp_policy(*id) == Some(TimestampPolicy::FailOnInvalid) && ts < 0 {
                return Err(DriverError::InvalidTimestamp(ts));
            }
        }

        self.outputs
            .entry(topic.clone())
            .or_default()
            .push_back(OutputRecord {
                key: key.clone(),
                value: value.clone(),
                ts,
            });
        if subscribers.is_empty() {
            return Ok(());
        }

        // The loop-back path goes through real bytes, exactly like an
        // external topic would.
        let key_bytes = self.encode(codec.key.as_ref(), key, "key", &node.name)?;
        let value_bytes = self.encode(codec.value.as_ref(), value, "value", &node.name)?;
        for id in subscribers {
            let Some(source) = topology.node(id) else {
                continue;
            };
            let NodeKind::Source {
                codec: source_codec,
                ..
            } = &source.kind
            else {
                continue;
            };
            let key = self.decode(source_codec.key.as_ref(), &key_bytes, "key", &source.name)?;
            let value = self.decode(
                source_codec.value.as_ref(),
                &value_bytes,
                "value",
                &source.name,
            )?;
            self.forward_children(topology, id, &key, &value, ts)?;
        }
        Ok(())
    }

    fn flush_closed_windows(&mut self) -> Result<(), DriverError> {
        let topology = Arc::clone(&self.topology);
        for node in topology.nodes() {
            let NodeKind::Processor {
                op:
                    OperatorKind::WindowedJoinSide {
                        side,
                        join_type,
                        windows,
                        joiner,
                        this_store,
                        ..
                    },
                ..
            } = &node.kind
            else {
                continue;
            };

            let stream_time = self.stream_time;
            let close_after = windows.size_ms() + windows.grace_ms();
            let expired: Vec<WindowEntry> = match self.window_stores.get_mut(this_store) {
                Some(store) => {
                    let (dead, live) = store
                        .entries
                        .drain(..)
                        .partition(|e| e.ts + close_after < stream_time);
                    store.entries = live;
                    dead
                }
                None => continue,
            };

            let emits = match side {
                JoinSide::This => join_type.emits_unmatched_this(),
                JoinSide::Other => join_type.emits_unmatched_other(),
            };
            if !emits {
                continue;
            }
            for entry in expired.into_iter().filter(|e| !e.matched) {
                let out = match side {
                    JoinSide::This => joiner(Some(&entry.value), None)?,
                    JoinSide::Other => joiner(None, Some(&entry.value))?,
                };
                self.forward_children(&topology, node.id, &entry.key, &out, entry.ts)?;
            }
        }
        Ok(())
    }

    // ---- codec plumbing ----

    fn resolve<'a>(
        &'a self,
        specific: Option<&'a CodecRef>,
        role: &'static str,
        node: &str,
    ) -> Result<&'a CodecRef, DriverError> {
        let default = match role {
            "key" => self.default_codec.key.as_ref(),
            _ => self.default_codec.value.as_ref(),
        };
        specific
            .or(default)
            .ok_or_else(|| DriverError::MissingCodec {
                role,
                node: node.to_string(),
            })
    }

    fn encode(
        &self,
        specific: Option<&CodecRef>,
        value: &DynValue,
        role: &'static str,
        node: &str,
    ) -> Result<Vec<u8>, DriverError> {
        Ok(self.resolve(specific, role, node)?.encode(value)?)
    }

    fn decode(
        &self,
        specific: Option<&CodecRef>,
        bytes: &[u8],
        role: &'static str,
        node: &str,
    ) -> Result<DynValue, DriverError> {
        Ok(self.resolve(specific, role, node)?.decode(bytes)?)
    }

    fn store_key_bytes(&self, store: &str, key: &DynValue) -> Result<Vec<u8>, DriverError> {
        let codec = self.kv_stores.get(store).and_then(|s| s.key_codec.clone());
        self.encode(codec.as_ref(), key, "key", store)
    }

    fn kv_lookup(&self, store: &str, key: &DynValue) -> Result<Option<DynValue>, DriverError> {
        let Some(kv) = self.kv_stores.get(store) else {
            return Ok(None);
        };
        let bytes = self.encode(kv.key_codec.as_ref(), key, "key", store)?;
        Ok(kv.map.get(&bytes).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecPair, StringCodec};
    use crate::stream::{Grouped, JoinWindows, Joined, StreamsBuilder};

    fn string_pair() -> CodecPair {
        CodecPair::new(Arc::new(StringCodec), Arc::new(StringCodec))
    }

    fn driver_for(builder: StreamsBuilder) -> TopologyTestDriver {
        TopologyTestDriver::new(builder.build().unwrap(), string_pair())
    }

    #[test]
    fn test_unknown_topic_rejected() {
        let builder = StreamsBuilder::new("app").unwrap();
        let stream = builder.stream::<String, String>("in").unwrap();
        stream.to("out").unwrap();
        let mut driver = driver_for(builder);

        let result = driver.pipe("nope", "k".to_string(), "v".to_string(), 0);
        assert!(matches!(result, Err(DriverError::UnknownTopic(_))));
    }

    #[test]
    fn test_filter_map_to_end_to_end() {
        let builder = StreamsBuilder::new("app").unwrap();
        let stream = builder
            .stream_with::<String, String>("in", string_pair())
            .unwrap();
        stream
            .filter(|_, v: &String| !v.is_empty())
            .unwrap()
            .map_values(|_, v: &String| v.to_uppercase())
            .unwrap()
            .to("out")
            .unwrap();
        let mut driver = driver_for(builder);

        driver.pipe("in", "a".to_string(), String::new(), 0).unwrap();
        driver.pipe("in", "b".to_string(), "hi".to_string(), 1).unwrap();

        assert_eq!(
            driver.read_output::<String, String>("out"),
            Some(("b".to_string(), "HI".to_string(), 1))
        );
        assert!(driver.read_output::<String, String>("out").is_none());
    }

    #[test]
    fn test_to_delivers_same_key_value_timestamp() {
        let builder = StreamsBuilder::new("app").unwrap();
        let stream = builder
            .stream_with::<String, String>("topic", string_pair())
            .unwrap();
        stream.to("to-topic").unwrap();
        let mut driver = driver_for(builder);

        driver.pipe("topic", "e".to_string(), "f".to_string(), 0).unwrap();

        assert_eq!(
            driver.read_output::<String, String>("to-topic"),
            Some(("e".to_string(), "f".to_string(), 0))
        );
        assert!(driver.read_output::<String, String>("to-topic").is_none());
    }

    #[test]
    fn test_dynamic_topic_routing() {
        let builder = StreamsBuilder::new("app").unwrap();
        let stream = builder
            .stream_with::<String, String>("in", string_pair())
            .unwrap();
        stream
            .to_dynamic(|k: &String, v: &String| {
                format!("topic-{k}-{}", &v[..1])
            })
            .unwrap();
        let mut driver = driver_for(builder);

        driver.pipe("in", "a".to_string(), "v1".to_string(), 0).unwrap();
        driver.pipe("in", "a".to_string(), "v2".to_string(), 1).unwrap();
        driver.pipe("in", "b".to_string(), "v1".to_string(), 2).unwrap();

        // Same key and value prefix share a derived topic, in arrival order.
        assert_eq!(driver.output_len("topic-a-v"), 2);
        assert_eq!(driver.output_len("topic-b-v"), 1);
        assert_eq!(
            driver.read_output::<String, String>("topic-a-v").map(|r| r.1),
            Some("v1".to_string())
        );
        assert_eq!(
            driver.read_output::<String, String>("topic-a-v").map(|r| r.1),
            Some("v2".to_string())
        );
    }

    #[test]
    fn test_branch_routes_to_first_match_only() {
        let builder = StreamsBuilder::new("app").unwrap();
        let stream = builder
            .stream_with::<String, String>("in", string_pair())
            .unwrap();
        let legs = stream
            .branch(vec![
                Box::new(|k: &String, _: &String| k.starts_with('a')),
                Box::new(|_: &String, _: &String| true),
            ])
            .unwrap();
        legs[0].to("first").unwrap();
        legs[1].to("rest").unwrap();
        let mut driver = driver_for(builder);

        // "apple" matches both predicates; only the first leg receives it.
        driver
            .pipe("in", "apple".to_string(), "1".to_string(), 0)
            .unwrap();
        driver
            .pipe("in", "pear".to_string(), "2".to_string(), 0)
            .unwrap();

        assert_eq!(driver.output_len("first"), 1);
        assert_eq!(driver.output_len("rest"), 1);
        assert_eq!(
            driver.read_output::<String, String>("rest"),
            Some(("pear".to_string(), "2".to_string(), 0))
        );
    }

    #[test]
    fn test_merge_preserves_per_upstream_order() {
        let builder = StreamsBuilder::new("app").unwrap();
        let a = builder
            .stream_with::<String, String>("a", string_pair())
            .unwrap();
        let b = builder
            .stream_with::<String, String>("b", string_pair())
            .unwrap();
        a.merge(&b).unwrap().to("out").unwrap();
        let mut driver = driver_for(builder);

        driver.pipe("a", "k".to_string(), "a1".to_string(), 0).unwrap();
        driver.pipe("b", "k".to_string(), "b1".to_string(), 0).unwrap();
        driver.pipe("a", "k".to_string(), "a2".to_string(), 0).unwrap();

        let values: Vec<String> = std::iter::from_fn(|| {
            driver
                .read_output::<String, String>("out")
                .map(|(_, v, _)| v)
        })
        .collect();
        assert_eq!(values, vec!["a1", "b1", "a2"]);
    }

    #[test]
    fn test_windowed_inner_join_matches_within_window() {
        let builder = StreamsBuilder::new("app").unwrap();
        let left = builder
            .stream_with::<String, String>("l", string_pair())
            .unwrap();
        let right = builder
            .stream_with::<String, String>("r", string_pair())
            .unwrap();
        left.join_with(
            &right,
            |a: &String, b: &String| format!("{a}+{b}"),
            JoinWindows::of_millis(100),
            Joined::new().with_key_codec(Arc::new(StringCodec)),
        )
        .unwrap()
        .to("out")
        .unwrap();
        let mut driver = driver_for(builder);

        driver.pipe("l", "k".to_string(), "L".to_string(), 0).unwrap();
        driver.pipe("r", "k".to_string(), "R".to_string(), 50).unwrap();
        assert_eq!(
            driver.read_output::<String, String>("out"),
            Some(("k".to_string(), "L+R".to_string(), 50))
        );

        // Outside the window: no match.
        driver.pipe("r", "k".to_string(), "Z".to_string(), 300).unwrap();
        assert!(driver.read_output::<String, String>("out").is_none());

        // Different key inside the window: no match.
        driver.pipe("l", "x".to_string(), "L2".to_string(), 310).unwrap();
        driver.pipe("r", "y".to_string(), "R2".to_string(), 320).unwrap();
        assert!(driver.read_output::<String, String>("out").is_none());
    }

    #[test]
    fn test_left_join_emits_unmatched_after_window_closes() {
        let builder = StreamsBuilder::new("app").unwrap();
        let left = builder
            .stream_with::<String, String>("l", string_pair())
            .unwrap();
        let right = builder
            .stream_with::<String, String>("r", string_pair())
            .unwrap();
        left.left_join(
            &right,
            |a: &String, b: Option<&String>| {
                format!("{a}+{}", b.map_or("none", String::as_str))
            },
            JoinWindows::of_millis(100).with_grace_millis(10),
        )
        .unwrap()
        .to("out")
        .unwrap();
        let mut driver = driver_for(builder);

        driver.pipe("l", "k".to_string(), "L".to_string(), 0).unwrap();
        // Window still open: nothing emitted yet.
        driver.advance_stream_time(100).unwrap();
        assert!(driver.read_output::<String, String>("out").is_none());

        driver.advance_stream_time(111).unwrap();
        assert_eq!(
            driver.read_output::<String, String>("out"),
            Some(("k".to_string(), "L+none".to_string(), 0))
        );
    }

    #[test]
    fn test_outer_join_emits_unmatched_from_both_sides() {
        let builder = StreamsBuilder::new("app").unwrap();
        let left = builder
            .stream_with::<String, String>("l", string_pair())
            .unwrap();
        let right = builder
            .stream_with::<String, String>("r", string_pair())
            .unwrap();
        left.outer_join(
            &right,
            |a: Option<&String>, b: Option<&String>| {
                format!(
                    "{}+{}",
                    a.map_or("none", String::as_str),
                    b.map_or("none", String::as_str)
                )
            },
            JoinWindows::of_millis(10).with_grace_millis(0),
        )
        .unwrap()
        .to("out")
        .unwrap();
        let mut driver = driver_for(builder);

        driver.pipe("l", "a".to_string(), "L".to_string(), 0).unwrap();
        driver.pipe("r", "b".to_string(), "R".to_string(), 5).unwrap();
        driver.advance_stream_time(1000).unwrap();

        let mut values = Vec::new();
        while let Some((_, v, _)) = driver.read_output::<String, String>("out") {
            values.push(v);
        }
        values.sort();
        assert_eq!(values, vec!["L+none", "none+R"]);
    }

    #[test]
    fn test_stream_table_join_looks_up_latest_row() {
        let builder = StreamsBuilder::new("app").unwrap();
        let stream = builder
            .stream_with::<String, String>("in", string_pair())
            .unwrap();
        let table = builder
            .table::<String, String>("changelog", string_pair())
            .unwrap();
        stream
            .join_table(&table, |v: &String, t: &String| format!("{v}@{t}"))
            .unwrap()
            .to("out")
            .unwrap();
        let mut driver = driver_for(builder);

        // No row yet: inner join drops the record.
        driver.pipe("in", "k".to_string(), "v1".to_string(), 0).unwrap();
        assert!(driver.read_output::<String, String>("out").is_none());

        driver
            .pipe("changelog", "k".to_string(), "row1".to_string(), 1)
            .unwrap();
        driver.pipe("in", "k".to_string(), "v2".to_string(), 2).unwrap();
        assert_eq!(
            driver.read_output::<String, String>("out"),
            Some(("k".to_string(), "v2@row1".to_string(), 2))
        );
    }

    #[test]
    fn test_global_table_join_uses_mapped_lookup_key() {
        let builder = StreamsBuilder::new("app").unwrap();
        let stream = builder
            .stream_with::<String, String>("in", string_pair())
            .unwrap();
        let table = builder
            .global_table::<String, String>("reference", string_pair())
            .unwrap();
        stream
            .left_join_global(
                &table,
                |_, v: &String| v.clone(),
                |v: &String, g: Option<&String>| {
                    format!("{v}:{}", g.map_or("missing", String::as_str))
                },
            )
            .unwrap()
            .to("out")
            .unwrap();
        let mut driver = driver_for(builder);

        driver
            .pipe("reference", "ref-1".to_string(), "gold".to_string(), 0)
            .unwrap();
        // The record value, not its key, selects the table row.
        driver
            .pipe("in", "k".to_string(), "ref-1".to_string(), 1)
            .unwrap();
        driver
            .pipe("in", "k".to_string(), "ref-9".to_string(), 2)
            .unwrap();

        assert_eq!(
            driver.read_output::<String, String>("out"),
            Some(("k".to_string(), "ref-1:gold".to_string(), 1))
        );
        assert_eq!(
            driver.read_output::<String, String>("out"),
            Some(("k".to_string(), "ref-9:missing".to_string(), 2))
        );
    }

    #[test]
    fn test_count_through_injected_repartition() {
        let builder = StreamsBuilder::new("app").unwrap();
        let stream = builder
            .stream_with::<String, String>("in", string_pair())
            .unwrap();
        let table = stream
            .select_key(|_, v: &String| v.clone())
            .unwrap()
            .group_by_key()
            .count()
            .unwrap();
        let store = table.store_name().to_string();
        let mut driver = driver_for(builder);

        driver.pipe("in", "a".to_string(), "x".to_string(), 0).unwrap();
        driver.pipe("in", "b".to_string(), "x".to_string(), 1).unwrap();
        driver.pipe("in", "c".to_string(), "y".to_string(), 2).unwrap();

        assert_eq!(
            driver.store_value::<String, i64>(&store, &"x".to_string()).unwrap(),
            Some(2)
        );
        assert_eq!(
            driver.store_value::<String, i64>(&store, &"y".to_string()).unwrap(),
            Some(1)
        );
        assert_eq!(
            driver.store_value::<String, i64>(&store, &"z".to_string()).unwrap(),
            None
        );
    }

    #[test]
    fn test_negative_timestamp_rejected_at_injected_source() {
        let builder = StreamsBuilder::new("app").unwrap();
        let stream = builder
            .stream_with::<String, String>("in", string_pair())
            .unwrap();
        stream
            .select_key(|_, v: &String| v.clone())
            .unwrap()
            .group_by_key()
            .count()
            .unwrap();
        let mut driver = driver_for(builder);

        // The external source accepts the record; the repartition source
        // fails it.
        let result = driver.pipe("in", "a".to_string(), "x".to_string(), -5);
        assert!(matches!(result, Err(DriverError::InvalidTimestamp(-5))));
    }

    #[test]
    fn test_rejected_record_leaves_no_output_on_internal_topic() {
        let builder = StreamsBuilder::new("app").unwrap();
        let stream = builder
            .stream_with::<String, String>("in", string_pair())
            .unwrap();
        stream
            .select_key(|_, v: &String| v.clone())
            .unwrap()
            .group_by_key_with(Grouped::new().with_name("tally"))
            .unwrap()
            .count()
            .unwrap();
        let mut driver = driver_for(builder);

        let result = driver.pipe("in", "a".to_string(), "x".to_string(), -5);
        assert!(matches!(result, Err(DriverError::InvalidTimestamp(-5))));
        assert_eq!(driver.output_len("app-tally-repartition"), 0);
    }

    #[test]
    fn test_multi_topic_stream_merges_both_topics() {
        let builder = StreamsBuilder::new("app").unwrap();
        let stream = builder
            .stream_many::<String, String>(&["t1", "t2"], string_pair())
            .unwrap();
        stream.to("out").unwrap();
        let mut driver = driver_for(builder);

        driver.pipe("t1", "k".to_string(), "a".to_string(), 0).unwrap();
        driver.pipe("t2", "k".to_string(), "b".to_string(), 1).unwrap();

        assert_eq!(
            driver.read_output::<String, String>("out").map(|r| r.1),
            Some("a".to_string())
        );
        assert_eq!(
            driver.read_output::<String, String>("out").map(|r| r.1),
            Some("b".to_string())
        );
    }

    #[test]
    fn test_transform_instance_keeps_state_across_records() {
        let builder = StreamsBuilder::new("app").unwrap();
        let stream = builder
            .stream_with::<String, String>("in", string_pair())
            .unwrap();
        stream
            .transform_values(
                || {
                    let mut seen = 0_i64;
                    move |_: &String, _: &String| {
                        seen += 1;
                        seen
                    }
                },
                &["counter-store"],
            )
            .unwrap()
            .map_values(|_, n: &i64| n.to_string())
            .unwrap()
            .to("out")
            .unwrap();
        let mut driver = driver_for(builder);

        driver.pipe("in", "k".to_string(), "a".to_string(), 0).unwrap();
        driver.pipe("in", "k".to_string(), "b".to_string(), 1).unwrap();

        assert_eq!(
            driver.read_output::<String, String>("out").map(|r| r.1),
            Some("1".to_string())
        );
        assert_eq!(
            driver.read_output::<String, String>("out").map(|r| r.1),
            Some("2".to_string())
        );
    }
}
