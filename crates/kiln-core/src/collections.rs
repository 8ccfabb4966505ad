//! Named, content-addressed sets of OIDs.
//!
//! A collection's id is derived from its members, so any membership change
//! deletes the old collection and creates a new one. Names live in the
//! `collections_meta` source and are unique; every mutation holds the
//! collection index lock so two callers cannot claim the same name.

use std::collections::BTreeSet;

use kiln_options::Options;
use kiln_registry::{DispatchError, DispatchResult};
use kiln_store::{ArtifactKey, LockGuard, LockMode};
use kiln_types::{Oid, Value};
use serde::Serialize;
use tracing::info;

use crate::dispatcher::Dispatcher;
use crate::sources::{COLLECTIONS, COLLECTIONS_META, FILES};

/// Display metadata of one collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CollectionInfo {
    pub cid: Oid,
    pub name: String,
    pub notes: String,
    pub num_members: usize,
}

impl CollectionInfo {
    fn to_value(&self) -> Value {
        let mut v = Value::map();
        v.insert("name", self.name.as_str());
        v.insert("notes", self.notes.as_str());
        v.insert("num_members", self.num_members);
        v
    }

    fn from_value(cid: Oid, v: &Value) -> Option<Self> {
        Some(Self {
            cid,
            name: v.get("name")?.as_str()?.to_string(),
            notes: v
                .get("notes")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            num_members: v
                .get("num_members")
                .and_then(Value::as_i64)
                .and_then(|n| usize::try_from(n).ok())
                .unwrap_or_default(),
        })
    }
}

fn members_to_value(members: &BTreeSet<Oid>) -> Value {
    Value::Set(members.iter().map(|oid| Value::Str(oid.to_hex())).collect())
}

fn members_from_value(v: &Value) -> Vec<Oid> {
    let items: Vec<&Value> = match v {
        Value::Set(items) => items.iter().collect(),
        Value::List(items) => items.iter().collect(),
        _ => Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| item.as_str().and_then(|s| Oid::from_hex(s).ok()))
        .collect()
}

impl Dispatcher {
    fn collection_index_lock(&self) -> DispatchResult<LockGuard<'_>> {
        let key = ArtifactKey::plain(COLLECTIONS_META, Oid::from_bytes(b"kiln collection index"));
        Ok(self.store_ref().lock(&key, LockMode::Write)?)
    }

    /// Create a collection named `name` over `oids`.
    ///
    /// Repeating a create with the same name and members returns the same
    /// id. Fails with `BadInput` for an empty member list, a taken name, or a
    /// name that is a file OID, and with `BadOidList` for members that are
    /// unknown or are themselves collections.
    pub fn create_collection(&self, name: &str, oids: &[Oid], notes: &str) -> DispatchResult<Oid> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DispatchError::BadInput("collection name is empty".into()));
        }
        let members: BTreeSet<Oid> = oids.iter().copied().collect();
        if members.is_empty() {
            return Err(DispatchError::BadInput(format!("collection '{name}' has no members")));
        }
        self.check_name_is_not_a_file(name)?;
        for oid in &members {
            match self.source_of(oid)?.as_deref() {
                None => {
                    return Err(DispatchError::bad_oid_list(
                        COLLECTIONS,
                        format!("{oid} has no known source"),
                    ))
                }
                Some(COLLECTIONS) => {
                    return Err(DispatchError::bad_oid_list(
                        COLLECTIONS,
                        format!("{oid} is a collection; collections cannot nest"),
                    ))
                }
                Some(_) => {}
            }
        }

        let cid = Oid::from_members(&members);
        let _index = self.collection_index_lock()?;
        if let Some(existing) = self.collection_by_name(name)? {
            if existing == cid {
                return Ok(cid);
            }
            return Err(DispatchError::BadInput(format!("collection name '{name}' is taken")));
        }
        if let Some(other) = self.collection_info(&cid)? {
            return Err(DispatchError::BadInput(format!(
                "collection '{}' already has these members",
                other.name
            )));
        }

        let meta = CollectionInfo {
            cid,
            name: name.to_string(),
            notes: notes.to_string(),
            num_members: members.len(),
        };
        self.write_collection(&meta, &members)?;
        info!(%cid, name, members = members.len(), "collection created");
        Ok(cid)
    }

    /// Delete the collection called `name`, returning its id.
    pub fn delete_collection(&self, name: &str) -> DispatchResult<Oid> {
        let _index = self.collection_index_lock()?;
        let cid = self.require_collection(name)?;
        self.remove_collection(&cid)?;
        info!(%cid, name, "collection deleted");
        Ok(cid)
    }

    /// Rename a collection. Its id does not change.
    pub fn rename_collection(&self, old: &str, new: &str) -> DispatchResult<Oid> {
        let new = new.trim();
        if new.is_empty() {
            return Err(DispatchError::BadInput("collection name is empty".into()));
        }
        self.check_name_is_not_a_file(new)?;
        let _index = self.collection_index_lock()?;
        let cid = self.require_collection(old)?;
        if old == new {
            return Ok(cid);
        }
        if self.collection_by_name(new)?.is_some() {
            return Err(DispatchError::BadInput(format!("collection name '{new}' is taken")));
        }
        let mut meta = self
            .collection_info(&cid)?
            .ok_or_else(|| DispatchError::BadInput(format!("no collection named '{old}'")))?;
        meta.name = new.to_string();
        self.store(COLLECTIONS_META, &cid, &Options::new(), &meta.to_value())?;
        info!(%cid, old, new, "collection renamed");
        Ok(cid)
    }

    /// Remove `remove` from the collection called `name`.
    ///
    /// Returns the new id, or `None` when no members remain and the
    /// collection was deleted. When the remaining members already form
    /// another collection, the pruned one folds into it: its name and notes
    /// are dropped and the existing collection's id is returned.
    pub fn prune_collection(&self, name: &str, remove: &[Oid]) -> DispatchResult<Option<Oid>> {
        let _index = self.collection_index_lock()?;
        let cid = self.require_collection(name)?;
        self.prune_collection_by_id(&cid, remove)
    }

    pub(crate) fn prune_collection_by_id(&self, cid: &Oid, remove: &[Oid]) -> DispatchResult<Option<Oid>> {
        let _index = self.collection_index_lock()?;
        let Some(meta) = self.collection_info(cid)? else {
            return Ok(None);
        };
        let members = self.collection_members(cid)?.unwrap_or_default();
        let remaining: BTreeSet<Oid> = members
            .iter()
            .filter(|oid| !remove.contains(oid))
            .copied()
            .collect();
        if remaining.len() == members.len() {
            return Ok(Some(*cid));
        }
        if remaining.is_empty() {
            self.remove_collection(cid)?;
            info!(%cid, name = %meta.name, "collection emptied and deleted");
            return Ok(None);
        }

        let new_cid = Oid::from_members(&remaining);
        if let Some(existing) = self.collection_info(&new_cid)? {
            self.remove_collection(cid)?;
            info!(old = %cid, into = %new_cid, name = %meta.name, existing = %existing.name,
                "pruned collection folded into existing one");
            return Ok(Some(new_cid));
        }

        // The new collection is written before the old one goes away, so a
        // failure leaves the old collection intact.
        let pruned = CollectionInfo {
            cid: new_cid,
            num_members: remaining.len(),
            ..meta
        };
        self.write_collection(&pruned, &remaining)?;
        self.remove_collection(cid)?;
        info!(old = %cid, new = %new_cid, name = %pruned.name, "collection pruned");
        Ok(Some(new_cid))
    }

    /// Members of collection `cid`, or `None` if it does not exist.
    pub fn collection_members(&self, cid: &Oid) -> DispatchResult<Option<Vec<Oid>>> {
        Ok(self
            .load(COLLECTIONS, cid, &Options::new())?
            .map(|v| members_from_value(&v)))
    }

    pub fn collection_info(&self, cid: &Oid) -> DispatchResult<Option<CollectionInfo>> {
        Ok(self
            .load(COLLECTIONS_META, cid, &Options::new())?
            .and_then(|v| CollectionInfo::from_value(*cid, &v)))
    }

    pub fn collection_by_name(&self, name: &str) -> DispatchResult<Option<Oid>> {
        Ok(self
            .list_collections()?
            .into_iter()
            .find(|c| c.name == name)
            .map(|c| c.cid))
    }

    /// Every collection, sorted by name.
    pub fn list_collections(&self) -> DispatchResult<Vec<CollectionInfo>> {
        let mut out = Vec::new();
        for cid in self.store_ref().list_oids(COLLECTIONS_META)? {
            if let Some(meta) = self.collection_info(&cid)? {
                out.push(meta);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Ids of every collection that has `oid` as a member.
    pub fn collections_containing(&self, oid: &Oid) -> DispatchResult<Vec<Oid>> {
        let mut out = Vec::new();
        for cid in self.store_ref().list_oids(COLLECTIONS)? {
            if let Some(members) = self.collection_members(&cid)? {
                if members.contains(oid) {
                    out.push(cid);
                }
            }
        }
        Ok(out)
    }

    fn require_collection(&self, name: &str) -> DispatchResult<Oid> {
        self.collection_by_name(name)?
            .ok_or_else(|| DispatchError::BadInput(format!("no collection named '{name}'")))
    }

    fn write_collection(&self, meta: &CollectionInfo, members: &BTreeSet<Oid>) -> DispatchResult<()> {
        let none = Options::new();
        self.store(COLLECTIONS, &meta.cid, &none, &members_to_value(members))?;
        self.store(COLLECTIONS_META, &meta.cid, &none, &meta.to_value())
    }

    fn remove_collection(&self, cid: &Oid) -> DispatchResult<()> {
        self.store_ref().delete(&ArtifactKey::plain(COLLECTIONS, *cid))?;
        self.store_ref().delete(&ArtifactKey::plain(COLLECTIONS_META, *cid))?;
        Ok(())
    }

    fn check_name_is_not_a_file(&self, name: &str) -> DispatchResult<()> {
        if let Ok(oid) = Oid::from_hex(name) {
            if self.store_ref().exists(&ArtifactKey::plain(FILES, oid))? {
                return Err(DispatchError::BadInput(format!(
                    "collection name '{name}' is a file OID"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::dispatcher;
    use proptest::prelude::*;

    fn import_all(d: &Dispatcher, n: usize) -> Vec<Oid> {
        (0..n)
            .map(|i| d.import_bytes(&format!("f{i}"), format!("file {i}").as_bytes()).unwrap())
            .collect()
    }

    #[test]
    fn create_is_order_insensitive_and_idempotent() {
        let (_dir, d) = dispatcher(1);
        let o = import_all(&d, 3);
        let cid = d.create_collection("C", &[o[0], o[1], o[2]], "").unwrap();
        let again = d.create_collection("C", &[o[2], o[0], o[1], o[0]], "").unwrap();
        assert_eq!(cid, again);
        assert_eq!(cid, Oid::from_members(&o));
        assert_eq!(d.list_collections().unwrap().len(), 1);
        assert_eq!(d.source_of(&cid).unwrap().as_deref(), Some(COLLECTIONS));
    }

    #[test]
    fn rename_keeps_id() {
        let (_dir, d) = dispatcher(1);
        let o = import_all(&d, 3);
        let cid = d.create_collection("C", &o, "notes").unwrap();
        assert_eq!(d.rename_collection("C", "C2").unwrap(), cid);
        assert_eq!(d.collection_by_name("C").unwrap(), None);
        assert_eq!(d.collection_by_name("C2").unwrap(), Some(cid));
        assert_eq!(d.collection_info(&cid).unwrap().unwrap().notes, "notes");
    }

    #[test]
    fn rename_onto_taken_name_fails() {
        let (_dir, d) = dispatcher(1);
        let o = import_all(&d, 2);
        d.create_collection("a", &o[..1], "").unwrap();
        d.create_collection("b", &o[1..], "").unwrap();
        assert!(matches!(d.rename_collection("a", "b"), Err(DispatchError::BadInput(_))));
        assert!(matches!(d.rename_collection("zzz", "c"), Err(DispatchError::BadInput(_))));
    }

    #[test]
    fn empty_collection_is_bad_input() {
        let (_dir, d) = dispatcher(1);
        assert!(matches!(d.create_collection("empty", &[], ""), Err(DispatchError::BadInput(_))));
    }

    #[test]
    fn taken_name_with_other_members_fails() {
        let (_dir, d) = dispatcher(1);
        let o = import_all(&d, 2);
        d.create_collection("C", &o[..1], "").unwrap();
        assert!(matches!(d.create_collection("C", &o, ""), Err(DispatchError::BadInput(_))));
    }

    #[test]
    fn name_colliding_with_file_oid_fails() {
        let (_dir, d) = dispatcher(1);
        let o = import_all(&d, 1);
        let err = d.create_collection(&o[0].to_hex(), &o, "").unwrap_err();
        assert!(matches!(err, DispatchError::BadInput(_)));
    }

    #[test]
    fn unknown_and_nested_members_fail() {
        let (_dir, d) = dispatcher(1);
        let o = import_all(&d, 1);
        let ghost = Oid::from_bytes(b"never imported");
        assert!(matches!(
            d.create_collection("g", &[ghost], ""),
            Err(DispatchError::BadOidList { .. })
        ));
        let cid = d.create_collection("inner", &o, "").unwrap();
        assert!(matches!(
            d.create_collection("outer", &[cid], ""),
            Err(DispatchError::BadOidList { .. })
        ));
    }

    #[test]
    fn prune_recreates_then_deletes() {
        let (_dir, d) = dispatcher(1);
        let o = import_all(&d, 2);
        let cid = d.create_collection("C", &o, "n").unwrap();
        let pruned = d.prune_collection("C", &o[..1]).unwrap().unwrap();
        assert_ne!(pruned, cid);
        assert_eq!(d.collection_members(&pruned).unwrap(), Some(vec![o[1]]));
        assert_eq!(d.collection_members(&cid).unwrap(), None);
        assert_eq!(d.collection_info(&pruned).unwrap().unwrap().notes, "n");

        assert_eq!(d.prune_collection("C", &o[1..]).unwrap(), None);
        assert!(d.list_collections().unwrap().is_empty());
    }

    #[test]
    fn prune_onto_existing_members_folds_into_that_collection() {
        let (_dir, d) = dispatcher(1);
        let o = import_all(&d, 2);
        let both = d.create_collection("both", &o, "").unwrap();
        let only_y = d.create_collection("only_y", &o[1..], "kept").unwrap();

        assert_eq!(d.prune_collection("both", &o[..1]).unwrap(), Some(only_y));
        assert_eq!(d.collection_members(&both).unwrap(), None);
        assert_eq!(d.collection_by_name("both").unwrap(), None);
        let info = d.collection_info(&only_y).unwrap().unwrap();
        assert_eq!(info.name, "only_y");
        assert_eq!(info.notes, "kept");
        assert_eq!(d.list_collections().unwrap().len(), 1);
    }

    #[test]
    fn negative_member_count_reads_as_zero() {
        let mut v = Value::map();
        v.insert("name", "c");
        v.insert("num_members", -3i64);
        let info = CollectionInfo::from_value(Oid::from_bytes(b"c"), &v).unwrap();
        assert_eq!(info.num_members, 0);
    }

    #[test]
    fn delete_and_containing() {
        let (_dir, d) = dispatcher(1);
        let o = import_all(&d, 3);
        let a = d.create_collection("a", &o[..2], "").unwrap();
        let b = d.create_collection("b", &o[1..], "").unwrap();
        let mut containing = d.collections_containing(&o[1]).unwrap();
        containing.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(containing, expected);

        assert_eq!(d.delete_collection("a").unwrap(), a);
        assert_eq!(d.collections_containing(&o[1]).unwrap(), vec![b]);
        assert!(d.delete_collection("a").is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn id_ignores_order_and_duplicates(picks in proptest::collection::vec(0usize..4, 1..10)) {
            let (_dir, d) = dispatcher(1);
            let o = import_all(&d, 4);
            let members: Vec<Oid> = picks.iter().map(|i| o[*i]).collect();
            let cid = d.create_collection("p", &members, "").unwrap();
            let mut sorted = members.clone();
            sorted.sort();
            sorted.dedup();
            let concat: String = sorted.iter().map(Oid::to_hex).collect();
            prop_assert_eq!(cid, Oid::from_bytes(concat.as_bytes()));
        }
    }
}
