//! Codec propagation across chained operators.
//!
//! Each operator family maps to one [`CodecInference`] rule describing what
//! its transformation does to the upstream codec pair. The derived pair is
//! never user-specified per edge; an explicit override supplied as part of
//! the call wins component-wise over the derived value.
//!
//! Rule table (K/V = upstream codecs, `-` = unspecified):
//!
//! | Operator family | Rule | Output |
//! |---|---|---|
//! | filter / filter_not / peek / group_by_key | `Inherit` | K, V |
//! | select_key / group_by | `ClearKey` | -, V |
//! | map_values / flat_map_values / transform_values / table-side joins | `ClearValue` | K, - |
//! | map / flat_map / transform / merge / stream-stream join | `ClearBoth` | -, - |

use super::CodecPair;

/// What an operator's transformation does to the upstream codec pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecInference {
    /// Key and value pass through untouched (filter, peek).
    Inherit,
    /// The key may change; its codec is cleared (`select_key`, `group_by`).
    ClearKey,
    /// The value may change; its codec is cleared (`map_values`).
    ClearValue,
    /// Both may change; both codecs are cleared (map, transform, merge).
    ClearBoth,
}

/// Derives the codec pair attached to an operator's output.
///
/// Applies the inference rule to the upstream pair, then overlays the
/// explicit override (if any) component-wise. An unspecified component in
/// the result is not an error.
#[must_use]
pub fn infer(
    inference: CodecInference,
    upstream: &CodecPair,
    override_pair: Option<&CodecPair>,
) -> CodecPair {
    let derived = match inference {
        CodecInference::Inherit => upstream.clone(),
        CodecInference::ClearKey => CodecPair {
            key: None,
            value: upstream.value.clone(),
        },
        CodecInference::ClearValue => CodecPair {
            key: upstream.key.clone(),
            value: None,
        },
        CodecInference::ClearBoth => CodecPair::unspecified(),
    };

    match override_pair {
        Some(over) => derived.overlay(over),
        None => derived,
    }
}
