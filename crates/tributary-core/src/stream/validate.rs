//! Argument validation shared by the DSL operators.
//!
//! Every check runs before any graph mutation, so a failed operator call is
//! observable as a no-op.

use crate::topology::TopologyError;

use super::{Grouped, Named, Produced};

/// Rejects blank string arguments.
pub(crate) fn non_blank(value: &str, param: &'static str) -> Result<(), TopologyError> {
    if value.trim().is_empty() {
        return Err(TopologyError::ArgumentNull(param));
    }
    Ok(())
}

/// Rejects a [`Named`] config carrying a blank name.
pub(crate) fn named(named: Option<&Named>) -> Result<(), TopologyError> {
    match named.and_then(|n| n.name.as_deref()) {
        Some(name) => non_blank(name, "named"),
        None => Ok(()),
    }
}

/// Rejects a [`Produced`] config carrying a blank name.
pub(crate) fn produced(produced: &Produced) -> Result<(), TopologyError> {
    match produced.name.as_deref() {
        Some(name) => non_blank(name, "produced"),
        None => Ok(()),
    }
}

/// Rejects a [`Grouped`] config carrying a blank name.
pub(crate) fn grouped(grouped: &Grouped) -> Result<(), TopologyError> {
    match grouped.name.as_deref() {
        Some(name) => non_blank(name, "grouped"),
        None => Ok(()),
    }
}

/// Rejects an empty topic list or a blank topic element.
pub(crate) fn topics(topics: &[&str]) -> Result<(), TopologyError> {
    if topics.is_empty() {
        return Err(TopologyError::InvalidArgument(
            "subscription requires at least one topic".to_string(),
        ));
    }
    for (index, topic) in topics.iter().enumerate() {
        if topic.trim().is_empty() {
            return Err(TopologyError::ArgumentInvalidElement {
                param: "topics",
                index,
            });
        }
    }
    Ok(())
}

/// Rejects blank state-store names, reporting the offending index.
pub(crate) fn store_names(names: &[&str]) -> Result<(), TopologyError> {
    for (index, name) in names.iter().enumerate() {
        if name.trim().is_empty() {
            return Err(TopologyError::ArgumentInvalidElement {
                param: "stateStoreNames",
                index,
            });
        }
    }
    Ok(())
}

/// Rejects an empty branch predicate list.
pub(crate) fn predicates<P>(predicates: &[P]) -> Result<(), TopologyError> {
    if predicates.is_empty() {
        return Err(TopologyError::InvalidArgument(
            "branch requires at least one predicate".to_string(),
        ));
    }
    Ok(())
}
