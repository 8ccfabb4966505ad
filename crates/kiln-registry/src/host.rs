use std::slice;

use kiln_options::Options;
use kiln_types::{Oid, Value};

use crate::error::DispatchResult;

/// The dispatcher as seen from inside a module body.
///
/// Modules receive a `&dyn Host` on every call instead of reaching a global
/// dispatcher, so module crates never depend on the crate that drives them.
pub trait Host: Send + Sync {
    /// Retrieve `module`'s result for `oids`, computing it on a miss.
    fn retrieve(&self, module: &str, oids: &[Oid], opts: &Options)
        -> DispatchResult<Option<Value>>;

    /// Persist `value` as `module`'s artifact for `oid`.
    ///
    /// `opts` are the module's validated options; their mangle subset picks
    /// the storage key.
    fn store(&self, module: &str, oid: &Oid, opts: &Options, value: Value) -> DispatchResult<()>;

    /// Read a stored artifact without computing.
    fn load(&self, module: &str, oid: &Oid, opts: &Options) -> DispatchResult<Option<Value>>;

    /// The source module that owns `oid`, if any.
    fn source_of(&self, oid: &Oid) -> DispatchResult<Option<String>>;

    fn retrieve_one(
        &self,
        module: &str,
        oid: &Oid,
        opts: &Options,
    ) -> DispatchResult<Option<Value>> {
        self.retrieve(module, slice::from_ref(oid), opts)
    }

    /// Bytes of a file OID, read through the `files` source.
    fn file_bytes(&self, oid: &Oid) -> DispatchResult<Option<Vec<u8>>> {
        let value = self.retrieve_one("files", oid, &Options::new())?;
        Ok(value.and_then(|v| match v {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }))
    }
}
