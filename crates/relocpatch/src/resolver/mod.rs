//! Identifier → address resolution.
//!
//! The version database itself lives outside this crate; [`AddressResolver`]
//! is the interface the patcher consumes and [`OffsetDatabase`] is an
//! in-memory adapter loaded from JSON.

mod database;

pub use database::{DatabaseEntry, DatabaseFile, OffsetDatabase, load_database, save_database};

pub trait AddressResolver {
    /// Load address of the module identifiers are relative to.
    fn base_address(&self) -> usize;

    /// Absolute address of `id`, or `None` if this host version does not have it.
    fn lookup(&self, id: u64) -> Option<usize>;

    /// Whether module offset `known_offset` maps back to `id`.
    ///
    /// Diagnostic only; resolvers without a reverse index accept everything.
    fn verify(&self, known_offset: usize, id: u64) -> bool {
        let _ = (known_offset, id);
        true
    }
}

impl<T: AddressResolver + ?Sized> AddressResolver for &T {
    fn base_address(&self) -> usize {
        (**self).base_address()
    }

    fn lookup(&self, id: u64) -> Option<usize> {
        (**self).lookup(id)
    }

    fn verify(&self, known_offset: usize, id: u64) -> bool {
        (**self).verify(known_offset, id)
    }
}
