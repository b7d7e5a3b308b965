/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under both the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree and the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree.
 */

//! Typed metadata derived from target nodes, cached independently of the rule index.

use std::any::type_name;
use std::any::Any;
use std::any::TypeId;
use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use dashmap::DashMap;
use dupe::Dupe;
use once_cell::sync::OnceCell;

use crate::target::label::TargetLabel;

/// The type of metadata being requested: a `TypeId` plus its name for error messages.
#[derive(Clone, Copy, Dupe)]
pub struct MetadataType {
    type_id: TypeId,
    name: &'static str,
}

impl MetadataType {
    pub fn of<T: Any>() -> MetadataType {
        MetadataType {
            type_id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    pub(crate) fn from_parts(type_id: TypeId, name: &'static str) -> MetadataType {
        MetadataType { type_id, name }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl PartialEq for MetadataType {
    fn eq(&self, other: &MetadataType) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for MetadataType {}

impl Hash for MetadataType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state)
    }
}

impl Debug for MetadataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "MetadataType({})", self.name)
    }
}

impl Display for MetadataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A metadata value of some [`MetadataType`].
#[derive(Clone, Dupe)]
pub struct MetadataValue {
    value: Arc<dyn Any + Send + Sync>,
    metadata_type: MetadataType,
}

impl MetadataValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> MetadataValue {
        Self::from_arc(Arc::new(value))
    }

    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> MetadataValue {
        MetadataValue {
            value,
            metadata_type: MetadataType::of::<T>(),
        }
    }

    pub(crate) fn from_erased(
        value: Arc<dyn Any + Send + Sync>,
        metadata_type: MetadataType,
    ) -> MetadataValue {
        MetadataValue {
            value,
            metadata_type,
        }
    }

    pub fn metadata_type(&self) -> MetadataType {
        self.metadata_type
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.dupe().downcast::<T>().ok()
    }
}

impl Debug for MetadataValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetadataValue")
            .field("type", &self.metadata_type)
            .finish_non_exhaustive()
    }
}

type MetadataSlot = Arc<OnceCell<Option<MetadataValue>>>;

/// Insert-once map from `(label, metadata type)` to the derived value, absence included.
///
/// Each key owns a slot which is created under the map's shard lock but filled outside of it,
/// so derivations may re-enter the cache for other keys. Concurrent requests for the same key
/// wait for the first derivation instead of repeating it. A failed derivation leaves the slot
/// empty and the next request derives again.
#[derive(Default)]
pub(crate) struct MetadataCache {
    slots: DashMap<(TargetLabel, MetadataType), MetadataSlot>,
}

impl MetadataCache {
    pub(crate) fn get_or_try_compute(
        &self,
        label: &TargetLabel,
        metadata_type: MetadataType,
        compute: impl FnOnce() -> anyhow::Result<Option<MetadataValue>>,
    ) -> anyhow::Result<Option<MetadataValue>> {
        let slot: MetadataSlot = self
            .slots
            .entry((label.dupe(), metadata_type))
            .or_default()
            .value()
            .dupe();
        let value = slot.get_or_try_init(compute)?;
        Ok(value.clone())
    }

    /// Number of keys whose derivation has completed.
    pub(crate) fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.value().get().is_some())
            .count()
    }
}
