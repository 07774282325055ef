//! Hidden re-partition stage injection.
//!
//! Key-changing operators only mark the stream key-dirty; the cost of a
//! re-partition is paid lazily, here, when a key-sensitive consumer
//! (aggregation or a join side) attaches. The injected stage is a hidden
//! internal Sink feeding a hidden internal Source through a synthesized
//! topic named `{application_id}-{consumer_name}-repartition`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::codec::CodecPair;
use crate::topology::names::{prefix, REPARTITION_TOPIC_SUFFIX};
use crate::topology::{
    NodeId, NodeKind, SinkTarget, TimestampPolicy, TopologyError, TopicSubscription,
};

use super::BuilderCore;

/// Injects a re-partition stage upstream of a key-sensitive consumer when
/// the stream is key-dirty; a no-op otherwise.
///
/// Returns the node the consumer should attach to, the codec carried across
/// the stage, and the cleared dirty flag. The injected Source fails fast on
/// invalid record timestamps, since every record crossing it was produced
/// by this same application.
pub(crate) fn maybe_repartition(
    core: &Rc<RefCell<BuilderCore>>,
    node: NodeId,
    codec: &CodecPair,
    repartition_required: bool,
    consumer_name: &str,
) -> Result<(NodeId, CodecPair, bool), TopologyError> {
    if !repartition_required {
        return Ok((node, codec.clone(), false));
    }

    let mut core = core.borrow_mut();
    let topic = format!(
        "{}-{consumer_name}{REPARTITION_TOPIC_SUFFIX}",
        core.app_id
    );

    let sink_name = core.names.next(prefix::REPARTITION_SINK);
    core.graph.add_node(
        sink_name,
        NodeKind::Sink {
            target: SinkTarget::Static(topic.clone()),
            codec: codec.clone(),
            internal: true,
        },
        &[node],
    )?;

    let source_name = core.names.next(prefix::REPARTITION_SOURCE);
    let source = core.graph.add_node(
        source_name,
        NodeKind::Source {
            subscription: TopicSubscription::Names(vec![topic.clone()]),
            codec: codec.clone(),
            timestamp_policy: TimestampPolicy::FailOnInvalid,
            internal: true,
        },
        &[],
    )?;

    tracing::debug!(topic = %topic, consumer = consumer_name, "injected repartition stage");
    Ok((source, codec.clone(), false))
}
