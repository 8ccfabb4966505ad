//! User tags: a string-keyed map of values attached to an OID.

use std::collections::BTreeMap;

use kiln_options::Options;
use kiln_registry::{DispatchError, DispatchResult};
use kiln_store::ArtifactKey;
use kiln_types::{Oid, Value};
use tracing::info;

use crate::dispatcher::Dispatcher;
use crate::sources::TAGS;

impl Dispatcher {
    /// Set `tag` on `oid`, replacing any previous value.
    pub fn tag_set(&self, oid: &Oid, tag: &str, value: Value) -> DispatchResult<()> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(DispatchError::BadInput("tag name is empty".into()));
        }
        if self.source_of(oid)?.is_none() {
            return Err(DispatchError::bad_oid_list(TAGS, format!("{oid} has no known source")));
        }
        let key = ArtifactKey::plain(TAGS, *oid);
        self.store_ref().update(&key, &mut |current| {
            let mut tags = match current {
                Some(v @ Value::Map(_)) => v,
                _ => Value::map(),
            };
            tags.insert(tag, value.clone());
            tags
        })?;
        info!(%oid, tag, "tag set");
        Ok(())
    }

    /// Every tag on `oid`.
    pub fn tag_get(&self, oid: &Oid) -> DispatchResult<BTreeMap<String, Value>> {
        Ok(match self.load(TAGS, oid, &Options::new())? {
            Some(Value::Map(tags)) => tags,
            _ => BTreeMap::new(),
        })
    }

    /// Remove `tag` from `oid`. Returns whether it was present.
    pub fn tag_remove(&self, oid: &Oid, tag: &str) -> DispatchResult<bool> {
        let key = ArtifactKey::plain(TAGS, *oid);
        if !self.store_ref().exists(&key)? {
            return Ok(false);
        }
        let mut removed = false;
        let next = self.store_ref().update(&key, &mut |current| {
            let mut tags = match current {
                Some(Value::Map(tags)) => tags,
                _ => BTreeMap::new(),
            };
            removed = tags.remove(tag).is_some();
            Value::Map(tags)
        })?;
        if next.as_map().is_some_and(BTreeMap::is_empty) {
            self.store_ref().delete(&key)?;
        }
        if removed {
            info!(%oid, tag, "tag removed");
        }
        Ok(removed)
    }

    /// OIDs carrying `tag`, sorted.
    pub fn tagged(&self, tag: &str) -> DispatchResult<Vec<Oid>> {
        let mut out = Vec::new();
        for oid in self.store_ref().list_oids(TAGS)? {
            if self.tag_get(&oid)?.contains_key(tag) {
                out.push(oid);
            }
        }
        Ok(out)
    }
}
