use std::sync::Arc;

use super::*;
use crate::codec::{CodecRegistry, I64Codec, StringCodec};
use crate::topology::{NodeKind, TimestampPolicy, TopologyError};

fn string_pair() -> CodecPair {
    CodecPair::new(Arc::new(StringCodec), Arc::new(StringCodec))
}

#[test]
fn test_builder_rejects_blank_app_id() {
    assert!(matches!(
        StreamsBuilder::new("  "),
        Err(TopologyError::ArgumentNull("applicationId"))
    ));
}

#[test]
fn test_stream_rejects_blank_topic_without_side_effects() {
    let builder = StreamsBuilder::new("app").unwrap();
    let result = builder.stream::<String, String>("");
    assert!(matches!(
        result,
        Err(TopologyError::ArgumentNull("topic"))
    ));
    assert_eq!(builder.node_count(), 0);
}

#[test]
fn test_auto_names_follow_call_order() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder.stream::<String, String>("in").unwrap();
    let filtered = stream.filter(|_, v: &String| !v.is_empty()).unwrap();
    filtered.to("out").unwrap();

    let topology = builder.build().unwrap();
    assert!(topology.node_by_name("STREAM-SOURCE-0000000000").is_some());
    assert!(topology.node_by_name("STREAM-FILTER-0000000001").is_some());
    assert!(topology.node_by_name("STREAM-SINK-0000000002").is_some());
}

#[test]
fn test_duplicate_explicit_name_rejected_without_side_effects() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder.stream::<String, String>("in").unwrap();
    stream
        .filter_named(Named::new("keep"), |_, _: &String| true)
        .unwrap();
    let before = builder.node_count();
    let result = stream.filter_named(Named::new("keep"), |_, _: &String| true);
    assert!(matches!(result, Err(TopologyError::DuplicateName(_))));
    assert_eq!(builder.node_count(), before);
}

#[test]
fn test_blank_named_config_rejected() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder.stream::<String, String>("in").unwrap();
    let result = stream.filter_named(Named::new("   "), |_, _: &String| true);
    assert!(matches!(
        result,
        Err(TopologyError::ArgumentNull("named"))
    ));
    let result = stream.flat_map_named(Named::new(" "), |k: &String, v: &String| {
        vec![(k.clone(), v.clone())]
    });
    assert!(matches!(
        result,
        Err(TopologyError::ArgumentNull("named"))
    ));
    let result = stream.process_named(Named::new(" "), || |_: &String, _: &String| {}, &[]);
    assert!(matches!(
        result,
        Err(TopologyError::ArgumentNull("named"))
    ));
    assert_eq!(builder.node_count(), 1);
}

#[test]
fn test_filter_preserves_codec_and_clean_key() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    let filtered = stream.filter(|_, _: &String| true).unwrap();
    assert_eq!(filtered.codec().key_name(), Some("string"));
    assert_eq!(filtered.codec().value_name(), Some("string"));
    assert!(!filtered.repartition_required());
}

#[test]
fn test_select_key_clears_key_codec_and_marks_dirty() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    let rekeyed = stream.select_key(|_, v: &String| v.len() as i64).unwrap();
    assert_eq!(rekeyed.codec().key_name(), None);
    assert_eq!(rekeyed.codec().value_name(), Some("string"));
    assert!(rekeyed.repartition_required());
}

#[test]
fn test_map_clears_both_codecs_and_marks_dirty() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    let mapped = stream
        .map(|k: &String, v: &String| (k.len() as i64, v.len() as i64))
        .unwrap();
    assert_eq!(mapped.codec().key_name(), None);
    assert_eq!(mapped.codec().value_name(), None);
    assert!(mapped.repartition_required());
}

#[test]
fn test_map_values_keeps_key_codec_and_clean_key() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    let mapped = stream.map_values(|_, v: &String| v.len() as i64).unwrap();
    assert_eq!(mapped.codec().key_name(), Some("string"));
    assert_eq!(mapped.codec().value_name(), None);
    assert!(!mapped.repartition_required());
}

#[test]
fn test_map_values_override_wins_over_inference() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    let registry = CodecRegistry::with_defaults();
    let override_pair = CodecPair {
        key: None,
        value: registry.lookup::<i64>(),
    };
    let mapped = stream
        .map_values_with(|_, v: &String| v.len() as i64, override_pair)
        .unwrap();
    assert_eq!(mapped.codec().key_name(), Some("string"));
    assert_eq!(mapped.codec().value_name(), Some("i64"));
}

#[test]
fn test_merge_clears_codec_and_combines_dirty_flags() {
    let builder = StreamsBuilder::new("app").unwrap();
    let a = builder
        .stream_with::<String, String>("a", string_pair())
        .unwrap();
    let b = builder.stream::<String, String>("b").unwrap();
    let rekeyed = b.select_key(|k: &String, _| k.clone()).unwrap();

    let merged = a.merge(&rekeyed).unwrap();
    assert_eq!(merged.codec().key_name(), None);
    assert_eq!(merged.codec().value_name(), None);
    assert!(merged.repartition_required());
}

#[test]
fn test_branch_returns_one_handle_per_predicate() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    let legs = stream
        .branch(vec![
            Box::new(|k: &String, _: &String| k.starts_with('a')),
            Box::new(|k: &String, _: &String| k.starts_with('b')),
            Box::new(|_: &String, _: &String| true),
        ])
        .unwrap();
    assert_eq!(legs.len(), 3);
    for leg in &legs {
        assert_eq!(leg.codec().key_name(), Some("string"));
    }
}

#[test]
fn test_branch_rejects_empty_predicates_without_side_effects() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder.stream::<String, String>("in").unwrap();
    let before = builder.node_count();
    let result = stream.branch(Vec::new());
    assert!(matches!(result, Err(TopologyError::InvalidArgument(_))));
    assert_eq!(builder.node_count(), before);
}

#[test]
fn test_transform_rejects_blank_store_name() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder.stream::<String, String>("in").unwrap();
    let result = stream.transform(
        || |k: &String, v: &String| (k.clone(), v.clone()),
        &["good-store", " "],
    );
    assert!(matches!(
        result,
        Err(TopologyError::ArgumentInvalidElement {
            param: "stateStoreNames",
            index: 1,
        })
    ));
    assert_eq!(builder.node_count(), 1);
}

#[test]
fn test_key_change_then_count_injects_one_repartition_stage() {
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

    let topology = builder.build().unwrap();
    let internal = topology.internal_topics();
    assert_eq!(internal.len(), 1);
    assert!(internal[0].starts_with("app-"));
    assert!(internal[0].ends_with("-repartition"));

    // The injected source fails fast on invalid timestamps.
    let policies: Vec<TimestampPolicy> = topology
        .sources()
        .iter()
        .filter(|id| {
            matches!(
                topology.node(**id).map(|n| &n.kind),
                Some(NodeKind::Source { internal: true, .. })
            )
        })
        .filter_map(|id| topology.timestamp_policy(*id))
        .collect();
    assert_eq!(policies, vec![TimestampPolicy::FailOnInvalid]);
}

#[test]
fn test_clean_key_count_injects_nothing() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    stream.group_by_key().count().unwrap();

    let topology = builder.build().unwrap();
    assert!(topology.internal_topics().is_empty());
}

#[test]
fn test_group_by_always_marks_dirty() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    stream
        .group_by(|_, v: &String| v.clone())
        .unwrap()
        .count()
        .unwrap();

    let topology = builder.build().unwrap();
    assert_eq!(topology.internal_topics().len(), 1);
}

#[test]
fn test_through_is_a_repartition_point() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    let continued = stream
        .select_key(|_, v: &String| v.clone())
        .unwrap()
        .through("intermediate")
        .unwrap();
    assert!(!continued.repartition_required());

    continued.group_by_key().count().unwrap();
    let topology = builder.build().unwrap();
    assert!(topology.internal_topics().is_empty());
}

#[test]
fn test_count_store_and_i64_value_codec() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    let table = stream.group_by_key().count().unwrap();
    assert!(table.store_name().ends_with("-store"));
    assert_eq!(table.codec().key_name(), Some("string"));
    assert_eq!(table.codec().value_name(), Some("i64"));

    let topology = builder.build().unwrap();
    assert!(topology
        .store_names()
        .contains(&table.store_name().to_string()));
}

#[test]
fn test_windowed_join_builds_side_pair_and_merge() {
    let builder = StreamsBuilder::new("app").unwrap();
    let left = builder
        .stream_with::<String, String>("l", string_pair())
        .unwrap();
    let right = builder
        .stream_with::<String, String>("r", string_pair())
        .unwrap();
    let joined = left
        .join_with(
            &right,
            |a: &String, b: &String| format!("{a}+{b}"),
            JoinWindows::of_millis(100),
            Joined::new().with_name("orders-join"),
        )
        .unwrap();

    assert_eq!(joined.codec().key_name(), None);
    assert_eq!(joined.codec().value_name(), None);
    assert!(!joined.repartition_required());

    let topology = builder.build().unwrap();
    let this_side = topology.node_by_name("orders-join-this").unwrap();
    let other_side = topology.node_by_name("orders-join-other").unwrap();
    let merge = topology.node_by_name("orders-join-merge").unwrap();

    match &this_side.kind {
        NodeKind::Processor { stores, .. } => {
            assert_eq!(
                stores,
                &vec![
                    "orders-join-this-store".to_string(),
                    "orders-join-other-store".to_string(),
                ]
            );
        }
        other => panic!("unexpected node kind: {other:?}"),
    }
    assert_eq!(merge.parents.as_slice(), &[this_side.id, other_side.id]);
}

#[test]
fn test_join_key_override_survives_into_output() {
    let builder = StreamsBuilder::new("app").unwrap();
    let left = builder.stream::<i64, String>("l").unwrap();
    let right = builder.stream::<i64, String>("r").unwrap();
    let joined = left
        .join_with(
            &right,
            |a: &String, b: &String| format!("{a}+{b}"),
            JoinWindows::of_millis(100),
            Joined::new().with_key_codec(Arc::new(I64Codec)),
        )
        .unwrap();
    assert_eq!(joined.codec().key_name(), Some("i64"));
    assert_eq!(joined.codec().value_name(), None);
}

#[test]
fn test_join_repartitions_only_dirty_sides() {
    let builder = StreamsBuilder::new("app").unwrap();
    let left = builder
        .stream_with::<String, String>("l", string_pair())
        .unwrap();
    let right = builder
        .stream_with::<String, String>("r", string_pair())
        .unwrap();
    let rekeyed = left.select_key(|_, v: &String| v.clone()).unwrap();
    rekeyed
        .join(
            &right,
            |a: &String, b: &String| format!("{a}+{b}"),
            JoinWindows::of_millis(100),
        )
        .unwrap();

    let topology = builder.build().unwrap();
    assert_eq!(topology.internal_topics().len(), 1);
}

#[test]
fn test_join_rejects_non_positive_window() {
    let builder = StreamsBuilder::new("app").unwrap();
    let left = builder.stream::<String, String>("l").unwrap();
    let right = builder.stream::<String, String>("r").unwrap();
    let before = builder.node_count();
    let result = left.join(
        &right,
        |a: &String, _: &String| a.clone(),
        JoinWindows::of_millis(0),
    );
    assert!(matches!(result, Err(TopologyError::InvalidArgument(_))));
    assert_eq!(builder.node_count(), before);
}

#[test]
fn test_global_join_never_repartitions() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    let table = builder
        .global_table::<String, String>("reference", string_pair())
        .unwrap();

    let rekeyed = stream.select_key(|_, v: &String| v.clone()).unwrap();
    let joined = rekeyed
        .join_global(
            &table,
            |_, v: &String| v.clone(),
            |v: &String, g: &String| format!("{v}:{g}"),
        )
        .unwrap();

    // The key-dirty flag survives a global join untouched.
    assert!(joined.repartition_required());
    let topology = builder.build().unwrap();
    assert!(topology.internal_topics().is_empty());
}

#[test]
fn test_table_join_repartitions_dirty_stream_side() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    let table = builder
        .table::<String, String>("changelog", string_pair())
        .unwrap();

    let rekeyed = stream.select_key(|_, v: &String| v.clone()).unwrap();
    let joined = rekeyed
        .join_table(&table, |v: &String, t: &String| format!("{v}:{t}"))
        .unwrap();
    assert!(!joined.repartition_required());

    let topology = builder.build().unwrap();
    assert_eq!(topology.internal_topics().len(), 1);
    assert!(topology
        .store_names()
        .contains(&table.store_name().to_string()));
}

#[test]
fn test_sink_codec_overlay() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    stream
        .to_with(
            "out",
            Produced::new()
                .with_name("my-sink")
                .with_value_codec(Arc::new(I64Codec)),
        )
        .unwrap();

    let topology = builder.build().unwrap();
    let sink = topology.node_by_name("my-sink").unwrap();
    match &sink.kind {
        NodeKind::Sink { codec, .. } => {
            assert_eq!(codec.key_name(), Some("string"));
            assert_eq!(codec.value_name(), Some("i64"));
        }
        other => panic!("unexpected node kind: {other:?}"),
    }
}

#[test]
fn test_multi_topic_stream_registers_single_source() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_many::<String, String>(&["t1", "t2"], string_pair())
        .unwrap();
    stream.to("out").unwrap();

    let topology = builder.build().unwrap();
    assert_eq!(topology.sources().len(), 1);
    assert!(topology.sources_for_topic("t1").next().is_some());
    assert!(topology.sources_for_topic("t2").next().is_some());
}

#[test]
fn test_multi_topic_stream_rejects_bad_topic_lists() {
    let builder = StreamsBuilder::new("app").unwrap();
    let result = builder.stream_many::<String, String>(&["t1", " "], string_pair());
    assert!(matches!(
        result,
        Err(TopologyError::ArgumentInvalidElement {
            param: "topics",
            index: 1,
        })
    ));
    let result = builder.stream_many::<String, String>(&[], string_pair());
    assert!(matches!(result, Err(TopologyError::InvalidArgument(_))));
    assert_eq!(builder.node_count(), 0);
}

#[test]
fn test_through_source_fails_fast_on_invalid_timestamp() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    stream.through("mid").unwrap().to("out").unwrap();

    let topology = builder.build().unwrap();
    let policies: Vec<TimestampPolicy> = topology
        .sources_for_topic("mid")
        .filter_map(|n| topology.timestamp_policy(n.id))
        .collect();
    assert_eq!(policies, vec![TimestampPolicy::FailOnInvalid]);

    // External sources keep the default policy.
    let external: Vec<TimestampPolicy> = topology
        .sources_for_topic("in")
        .filter_map(|n| topology.timestamp_policy(n.id))
        .collect();
    assert_eq!(external, vec![TimestampPolicy::Default]);
}

#[test]
fn test_blank_grouped_name_rejected() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    let result = stream.group_by_key_with(Grouped::new().with_name("   "));
    assert!(matches!(
        result,
        Err(TopologyError::ArgumentNull("grouped"))
    ));

    let before = builder.node_count();
    let result = stream.group_by_with(|_, v: &String| v.clone(), Grouped::new().with_name(" "));
    assert!(matches!(
        result,
        Err(TopologyError::ArgumentNull("grouped"))
    ));
    assert_eq!(builder.node_count(), before);
}

#[test]
fn test_duplicate_count_name_fails_without_partial_nodes() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    let rekeyed = stream.select_key(|_, v: &String| v.clone()).unwrap();
    rekeyed
        .group_by_key_with(Grouped::new().with_name("tally"))
        .unwrap()
        .count()
        .unwrap();

    let before = builder.node_count();
    let result = rekeyed
        .group_by_key_with(Grouped::new().with_name("tally"))
        .unwrap()
        .count();
    assert!(matches!(result, Err(TopologyError::DuplicateName(_))));
    assert_eq!(builder.node_count(), before);
}

#[test]
fn test_duplicate_join_name_fails_without_partial_nodes() {
    let builder = StreamsBuilder::new("app").unwrap();
    let left = builder
        .stream_with::<String, String>("l", string_pair())
        .unwrap();
    let right = builder
        .stream_with::<String, String>("r", string_pair())
        .unwrap();
    let rekeyed = left.select_key(|_, v: &String| v.clone()).unwrap();
    rekeyed
        .join_with(
            &right,
            |a: &String, b: &String| format!("{a}+{b}"),
            JoinWindows::of_millis(100),
            Joined::new().with_name("j"),
        )
        .unwrap();

    let before = builder.node_count();
    let result = rekeyed.join_with(
        &right,
        |a: &String, b: &String| format!("{a}+{b}"),
        JoinWindows::of_millis(100),
        Joined::new().with_name("j"),
    );
    assert!(matches!(result, Err(TopologyError::DuplicateName(_))));
    assert_eq!(builder.node_count(), before);
}

#[test]
fn test_named_overrides_cover_remaining_operators() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    let exploded = stream
        .flat_map_named(Named::new("explode"), |k: &String, v: &String| {
            vec![(k.clone(), v.clone())]
        })
        .unwrap();
    let observed = exploded
        .peek_named(Named::new("observe"), |_, _: &String| {})
        .unwrap();
    let merged = observed.merge_named(Named::new("union"), &stream).unwrap();
    let tallied = merged
        .transform_values_named(
            Named::new("tally"),
            || {
                let mut seen = 0_i64;
                move |_: &String, _: &String| {
                    seen += 1;
                    seen
                }
            },
            &[],
        )
        .unwrap();
    tallied
        .foreach_named(Named::new("drain"), |_, _: &i64| {})
        .unwrap();

    let topology = builder.build().unwrap();
    for name in ["explode", "observe", "union", "tally", "drain"] {
        assert!(topology.node_by_name(name).is_some(), "missing node {name}");
    }
}

#[test]
fn test_terminal_operators_register_nodes() {
    let builder = StreamsBuilder::new("app").unwrap();
    let stream = builder
        .stream_with::<String, String>("in", string_pair())
        .unwrap();
    stream.foreach(|_, _: &String| {}).unwrap();
    stream.print("audit").unwrap();
    stream
        .process(|| |_: &String, _: &String| {}, &["side-store"])
        .unwrap();

    let topology = builder.build().unwrap();
    assert_eq!(topology.node_count(), 4);
    assert!(topology.store_names().contains(&"side-store".to_string()));
}
