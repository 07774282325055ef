//! Join assembly: stream-stream, stream-table, and stream-global-table.
//!
//! Stream-stream joins compile into a three-node cluster (one store-writing
//! processor per side plus an output merge) over a pair of window stores.
//! Both sides must be co-partitioned by the join key, so each key-dirty
//! side gets a hidden repartition stage before its processor attaches.
//! Global-table joins look up by a mapper-derived key instead and never
//! repartition.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::codec::{erase, CodecPair, CodecRef, DynValue};
use crate::topology::names::prefix;
use crate::topology::node::{downcast, DynJoiner, DynKeyMapper, JoinSide, ProcessError};
use crate::topology::{JoinType, JoinWindows, NodeKind, OperatorKind, TopologyError};

use super::{repartition, validate, GlobalTable, MessageStream, Table};

/// Optional config for stream-stream joins: base name and codec overrides
/// for the join key and each side's value.
#[derive(Clone, Default)]
pub struct Joined {
    pub(crate) name: Option<String>,
    pub(crate) key: Option<CodecRef>,
    pub(crate) this_value: Option<CodecRef>,
    pub(crate) other_value: Option<CodecRef>,
}

impl Joined {
    /// An empty config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the join base name, used for the stage names, the window
    /// store pair, and any repartition topics.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Overrides the join key codec on both sides and the output.
    #[must_use]
    pub fn with_key_codec(mut self, codec: CodecRef) -> Self {
        self.key = Some(codec);
        self
    }

    /// Overrides the value codec of the stream the join is called on.
    #[must_use]
    pub fn with_this_value_codec(mut self, codec: CodecRef) -> Self {
        self.this_value = Some(codec);
        self
    }

    /// Overrides the value codec of the stream passed as the argument.
    #[must_use]
    pub fn with_other_value_codec(mut self, codec: CodecRef) -> Self {
        self.other_value = Some(codec);
        self
    }
}

impl fmt::Debug for Joined {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Joined")
            .field("name", &self.name)
            .field("key", &self.key.as_ref().map(|c| c.name()))
            .field("this_value", &self.this_value.as_ref().map(|c| c.name()))
            .field("other_value", &self.other_value.as_ref().map(|c| c.name()))
            .finish()
    }
}

fn validate_windows(windows: JoinWindows) -> Result<(), TopologyError> {
    if windows.size_ms() <= 0 {
        return Err(TopologyError::InvalidArgument(
            "join window size must be positive".to_string(),
        ));
    }
    if windows.grace_ms() < 0 {
        return Err(TopologyError::InvalidArgument(
            "join grace period cannot be negative".to_string(),
        ));
    }
    Ok(())
}

impl<K, V> MessageStream<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Windowed inner join with another stream on the shared key.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::InvalidArgument`] if the streams belong to
    /// different builders or the window spec is invalid.
    pub fn join<VO, VR, F>(
        &self,
        other: &MessageStream<K, VO>,
        joiner: F,
        windows: JoinWindows,
    ) -> Result<MessageStream<K, VR>, TopologyError>
    where
        VO: Send + Sync + 'static,
        VR: Send + Sync + 'static,
        F: Fn(&V, &VO) -> VR + Send + Sync + 'static,
    {
        self.join_with(other, joiner, windows, Joined::new())
    }

    /// [`Self::join`] with name and codec overrides.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the configured name is
    /// blank, plus the [`Self::join`] errors.
    pub fn join_with<VO, VR, F>(
        &self,
        other: &MessageStream<K, VO>,
        joiner: F,
        windows: JoinWindows,
        joined: Joined,
    ) -> Result<MessageStream<K, VR>, TopologyError>
    where
        VO: Send + Sync + 'static,
        VR: Send + Sync + 'static,
        F: Fn(&V, &VO) -> VR + Send + Sync + 'static,
    {
        self.windowed_join_impl(
            other,
            erase_inner_joiner::<V, VO, VR, F>(joiner),
            windows,
            JoinType::Inner,
            joined,
        )
    }

    /// Windowed left join: every this-side record is emitted, with its
    /// partner if one arrives inside the window, or `None` once the window
    /// closes unmatched.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::InvalidArgument`] if the streams belong to
    /// different builders or the window spec is invalid.
    pub fn left_join<VO, VR, F>(
        &self,
        other: &MessageStream<K, VO>,
        joiner: F,
        windows: JoinWindows,
    ) -> Result<MessageStream<K, VR>, TopologyError>
    where
        VO: Send + Sync + 'static,
        VR: Send + Sync + 'static,
        F: Fn(&V, Option<&VO>) -> VR + Send + Sync + 'static,
    {
        self.left_join_with(other, joiner, windows, Joined::new())
    }

    /// [`Self::left_join`] with name and codec overrides.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the configured name is
    /// blank, plus the [`Self::left_join`] errors.
    pub fn left_join_with<VO, VR, F>(
        &self,
        other: &MessageStream<K, VO>,
        joiner: F,
        windows: JoinWindows,
        joined: Joined,
    ) -> Result<MessageStream<K, VR>, TopologyError>
    where
        VO: Send + Sync + 'static,
        VR: Send + Sync + 'static,
        F: Fn(&V, Option<&VO>) -> VR + Send + Sync + 'static,
    {
        self.windowed_join_impl(
            other,
            erase_left_joiner::<V, VO, VR, F>(joiner),
            windows,
            JoinType::Left,
            joined,
        )
    }

    /// Windowed outer join: unmatched records from either side are emitted
    /// once their window closes.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::InvalidArgument`] if the streams belong to
    /// different builders or the window spec is invalid.
    pub fn outer_join<VO, VR, F>(
        &self,
        other: &MessageStream<K, VO>,
        joiner: F,
        windows: JoinWindows,
    ) -> Result<MessageStream<K, VR>, TopologyError>
    where
        VO: Send + Sync + 'static,
        VR: Send + Sync + 'static,
        F: Fn(Option<&V>, Option<&VO>) -> VR + Send + Sync + 'static,
    {
        self.outer_join_with(other, joiner, windows, Joined::new())
    }

    /// [`Self::outer_join`] with name and codec overrides.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::ArgumentNull`] if the configured name is
    /// blank, plus the [`Self::outer_join`] errors.
    pub fn outer_join_with<VO, VR, F>(
        &self,
        other: &MessageStream<K, VO>,
        joiner: F,
        windows: JoinWindows,
        joined: Joined,
    ) -> Result<MessageStream<K, VR>, TopologyError>
    where
        VO: Send + Sync + 'static,
        VR: Send + Sync + 'static,
        F: Fn(Option<&V>, Option<&VO>) -> VR + Send + Sync + 'static,
    {
        self.windowed_join_impl(
            other,
            erase_outer_joiner::<V, VO, VR, F>(joiner),
            windows,
            JoinType::Outer,
            joined,
        )
    }

    fn windowed_join_impl<VO, VR>(
        &self,
        other: &MessageStream<K, VO>,
        joiner: DynJoiner,
        windows: JoinWindows,
        join_type: JoinType,
        joined: Joined,
    ) -> Result<MessageStream<K, VR>, TopologyError> {
        if !Rc::ptr_eq(&self.core, &other.core) {
            return Err(TopologyError::InvalidArgument(
                "join requires streams from the same builder".to_string(),
            ));
        }
        if let Some(name) = joined.name.as_deref() {
            validate::non_blank(name, "joined")?;
        }
        validate_windows(windows)?;

        // Side codecs: the Joined overrides win over each handle's pair.
        let this_codec = CodecPair {
            key: joined.key.clone().or_else(|| self.codec.key.clone()),
            value: joined
                .this_value
                .clone()
                .or_else(|| self.codec.value.clone()),
        };
        let other_codec = CodecPair {
            key: joined.key.clone().or_else(|| other.codec.key.clone()),
            value: joined
                .other_value
                .clone()
                .or_else(|| other.codec.value.clone()),
        };

        let (base, this_name, other_name, merge_name) = {
            let mut core = self.core.borrow_mut();
            match joined.name {
                Some(base) => {
                    let this_name = format!("{base}-this");
                    let other_name = format!("{base}-other");
                    let merge_name = format!("{base}-merge");
                    (base, this_name, other_name, merge_name)
                }
                None => (
                    core.names.next(prefix::JOIN),
                    core.names.next(prefix::JOINTHIS),
                    core.names.next(prefix::JOINOTHER),
                    core.names.next(prefix::JOINMERGE),
                ),
            }
        };
        let this_store = format!("{base}-this-store");
        let other_store = format!("{base}-other-store");

        // Claim all three node names before any hidden stages attach to
        // them; a duplicate must not leave orphan repartition nodes behind.
        {
            let core = self.core.borrow();
            core.ensure_available(&this_name)?;
            core.ensure_available(&other_name)?;
            core.ensure_available(&merge_name)?;
        }

        let (this_parent, this_codec, _) = repartition::maybe_repartition(
            &self.core,
            self.node,
            &this_codec,
            self.repartition_required,
            &this_name,
        )?;
        let (other_parent, other_codec, _) = repartition::maybe_repartition(
            &self.core,
            other.node,
            &other_codec,
            other.repartition_required,
            &other_name,
        )?;

        let mut core = self.core.borrow_mut();
        let this_id = core.graph.add_node(
            this_name,
            NodeKind::Processor {
                op: OperatorKind::WindowedJoinSide {
                    side: JoinSide::This,
                    join_type,
                    windows,
                    joiner: Arc::clone(&joiner),
                    this_store: this_store.clone(),
                    other_store: other_store.clone(),
                    codec: this_codec,
                },
                stores: vec![this_store.clone(), other_store.clone()],
            },
            &[this_parent],
        )?;
        let other_id = core.graph.add_node(
            other_name,
            NodeKind::Processor {
                op: OperatorKind::WindowedJoinSide {
                    side: JoinSide::Other,
                    join_type,
                    windows,
                    joiner,
                    this_store: other_store.clone(),
                    other_store: this_store.clone(),
                    codec: other_codec,
                },
                stores: vec![other_store, this_store],
            },
            &[other_parent],
        )?;
        let merge_id = core.graph.add_node(
            merge_name,
            NodeKind::Processor {
                op: OperatorKind::JoinMerge,
                stores: Vec::new(),
            },
            &[this_id, other_id],
        )?;
        drop(core);

        // Output value type is the joiner's invention; only an explicit key
        // override survives into the output pair.
        let out_codec = CodecPair {
            key: joined.key,
            value: None,
        };
        Ok(self.child(merge_id, out_codec, false))
    }

    /// Inner join against a table: each stream record looks up the current
    /// table row for its key and is dropped if none exists.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::InvalidArgument`] if the stream and table
    /// belong to different builders.
    pub fn join_table<VT, VR, F>(
        &self,
        table: &Table<K, VT>,
        joiner: F,
    ) -> Result<MessageStream<K, VR>, TopologyError>
    where
        VT: Send + Sync + 'static,
        VR: Send + Sync + 'static,
        F: Fn(&V, &VT) -> VR + Send + Sync + 'static,
    {
        self.table_join_impl(table, erase_inner_joiner::<V, VT, VR, F>(joiner), JoinType::Inner)
    }

    /// Left join against a table: stream records with no current table row
    /// are emitted with `None`.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::InvalidArgument`] if the stream and table
    /// belong to different builders.
    pub fn left_join_table<VT, VR, F>(
        &self,
        table: &Table<K, VT>,
        joiner: F,
    ) -> Result<MessageStream<K, VR>, TopologyError>
    where
        VT: Send + Sync + 'static,
        VR: Send + Sync + 'static,
        F: Fn(&V, Option<&VT>) -> VR + Send + Sync + 'static,
    {
        self.table_join_impl(table, erase_left_joiner::<V, VT, VR, F>(joiner), JoinType::Left)
    }

    fn table_join_impl<VT, VR>(
        &self,
        table: &Table<K, VT>,
        joiner: DynJoiner,
        join_type: JoinType,
    ) -> Result<MessageStream<K, VR>, TopologyError> {
        if !Rc::ptr_eq(&self.core, &table.core) {
            return Err(TopologyError::InvalidArgument(
                "join requires a table from the same builder".to_string(),
            ));
        }

        let name = self.core.borrow_mut().names.next(prefix::TABLEJOIN);
        self.core.borrow().ensure_available(&name)?;
        let (parent, codec, _) = repartition::maybe_repartition(
            &self.core,
            self.node,
            &self.codec,
            self.repartition_required,
            &name,
        )?;

        let mut core = self.core.borrow_mut();
        let id = core.graph.add_node(
            name,
            NodeKind::Processor {
                op: OperatorKind::TableJoin {
                    join_type,
                    store: table.store.clone(),
                    joiner,
                },
                stores: vec![table.store.clone()],
            },
            &[parent],
        )?;
        drop(core);

        let out_codec = CodecPair {
            key: codec.key,
            value: None,
        };
        Ok(self.child(id, out_codec, false))
    }

    /// Inner join against a global table, looking up by a mapper-derived
    /// key. Never repartitions and never clears the key-dirty flag.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::InvalidArgument`] if the stream and table
    /// belong to different builders.
    pub fn join_global<GK, GV, VR, KF, F>(
        &self,
        table: &GlobalTable<GK, GV>,
        key_mapper: KF,
        joiner: F,
    ) -> Result<MessageStream<K, VR>, TopologyError>
    where
        GK: Send + Sync + 'static,
        GV: Send + Sync + 'static,
        VR: Send + Sync + 'static,
        KF: Fn(&K, &V) -> GK + Send + Sync + 'static,
        F: Fn(&V, &GV) -> VR + Send + Sync + 'static,
    {
        self.global_join_impl(
            table,
            erase_lookup_mapper::<K, V, GK, KF>(key_mapper),
            erase_inner_joiner::<V, GV, VR, F>(joiner),
            JoinType::Inner,
        )
    }

    /// Left join against a global table: records whose lookup key has no
    /// row are emitted with `None`.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::InvalidArgument`] if the stream and table
    /// belong to different builders.
    pub fn left_join_global<GK, GV, VR, KF, F>(
        &self,
        table: &GlobalTable<GK, GV>,
        key_mapper: KF,
        joiner: F,
    ) -> Result<MessageStream<K, VR>, TopologyError>
    where
        GK: Send + Sync + 'static,
        GV: Send + Sync + 'static,
        VR: Send + Sync + 'static,
        KF: Fn(&K, &V) -> GK + Send + Sync + 'static,
        F: Fn(&V, Option<&GV>) -> VR + Send + Sync + 'static,
    {
        self.global_join_impl(
            table,
            erase_lookup_mapper::<K, V, GK, KF>(key_mapper),
            erase_left_joiner::<V, GV, VR, F>(joiner),
            JoinType::Left,
        )
    }

    fn global_join_impl<GK, GV, VR>(
        &self,
        table: &GlobalTable<GK, GV>,
        key_mapper: DynKeyMapper,
        joiner: DynJoiner,
        join_type: JoinType,
    ) -> Result<MessageStream<K, VR>, TopologyError> {
        if !Rc::ptr_eq(&self.core, &table.inner.core) {
            return Err(TopologyError::InvalidArgument(
                "join requires a global table from the same builder".to_string(),
            ));
        }

        let mut core = self.core.borrow_mut();
        let name = core.names.next(prefix::GLOBALTABLEJOIN);
        let id = core.graph.add_node(
            name,
            NodeKind::Processor {
                op: OperatorKind::GlobalTableJoin {
                    join_type,
                    store: table.inner.store.clone(),
                    key_mapper,
                    joiner,
                },
                stores: vec![table.inner.store.clone()],
            },
            &[self.node],
        )?;
        drop(core);

        let out_codec = CodecPair {
            key: self.codec.key.clone(),
            value: None,
        };
        Ok(self.child(id, out_codec, self.repartition_required))
    }
}

// ---- joiner erasure ----

fn erase_inner_joiner<V, VO, VR, F>(f: F) -> DynJoiner
where
    V: Send + Sync + 'static,
    VO: Send + Sync + 'static,
    VR: Send + Sync + 'static,
    F: Fn(&V, &VO) -> VR + Send + Sync + 'static,
{
    Arc::new(move |this: Option<&DynValue>, other: Option<&DynValue>| {
        let this = this.ok_or(ProcessError::MissingJoinSide)?;
        let other = other.ok_or(ProcessError::MissingJoinSide)?;
        Ok(erase(f(downcast::<V>(this)?, downcast::<VO>(other)?)))
    })
}

fn erase_left_joiner<V, VO, VR, F>(f: F) -> DynJoiner
where
    V: Send + Sync + 'static,
    VO: Send + Sync + 'static,
    VR: Send + Sync + 'static,
    F: Fn(&V, Option<&VO>) -> VR + Send + Sync + 'static,
{
    Arc::new(move |this: Option<&DynValue>, other: Option<&DynValue>| {
        let this = this.ok_or(ProcessError::MissingJoinSide)?;
        let other = other.map(downcast::<VO>).transpose()?;
        Ok(erase(f(downcast::<V>(this)?, other)))
    })
}

fn erase_outer_joiner<V, VO, VR, F>(f: F) -> DynJoiner
where
    V: Send + Sync + 'static,
    VO: Send + Sync + 'static,
    VR: Send + Sync + 'static,
    F: Fn(Option<&V>, Option<&VO>) -> VR + Send + Sync + 'static,
{
    Arc::new(move |this: Option<&DynValue>, other: Option<&DynValue>| {
        let this = this.map(downcast::<V>).transpose()?;
        let other = other.map(downcast::<VO>).transpose()?;
        Ok(erase(f(this, other)))
    })
}

fn erase_lookup_mapper<K, V, GK, F>(f: F) -> DynKeyMapper
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
    GK: Send + Sync + 'static,
    F: Fn(&K, &V) -> GK + Send + Sync + 'static,
{
    Arc::new(move |k: &DynValue, v: &DynValue| Ok(erase(f(downcast::<K>(k)?, downcast::<V>(v)?))))
}
