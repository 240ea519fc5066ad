//! Output slots and lazily resolved patch locations.

use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use crate::descriptor::{Action, PatchDescriptor};
use crate::error::{Error, Result};
use crate::install::CodeWriter;
use crate::memory::layout::x86::NOP;
use crate::resolver::AddressResolver;

/// An externally owned address cell, written at most once.
///
/// `#[repr(transparent)]` over a `usize` so hook wrappers written in
/// assembly can read a return trampoline straight out of the static.
/// Zero means "not yet written".
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct OutputSlot(AtomicUsize);

impl OutputSlot {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    /// Store `address`. Fails if the slot already holds one.
    ///
    /// Zero is the unset marker, so it can never be published.
    pub fn publish(&self, name: &str, address: usize) -> Result<()> {
        if address == 0 {
            return Err(Error::NullAddress {
                name: name.to_string(),
            });
        }
        self.0
            .compare_exchange(0, address, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|existing| Error::SlotAlreadySet {
                name: name.to_string(),
                existing,
            })
    }

    pub fn get(&self) -> Option<usize> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            address => Some(address),
        }
    }

    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }

    /// Raw pointer to the cell, for code that reads it without Rust.
    pub fn as_ptr(&self) -> *mut usize {
        self.0.as_ptr()
    }
}

/// Where a descriptor's site is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Unresolved { id: u64, offset: isize },
    Resolved { address: usize },
}

/// One descriptor's site: resolved at most once, applied at most once.
#[derive(Debug)]
pub struct RelocatableSlot<'a> {
    descriptor: &'a PatchDescriptor<'a>,
    location: Location,
    applied: bool,
}

impl<'a> RelocatableSlot<'a> {
    pub fn new(descriptor: &'a PatchDescriptor<'a>) -> Self {
        Self {
            descriptor,
            location: Location::Unresolved {
                id: descriptor.id,
                offset: descriptor.offset,
            },
            applied: false,
        }
    }

    pub fn descriptor(&self) -> &'a PatchDescriptor<'a> {
        self.descriptor
    }

    pub fn location(&self) -> Location {
        self.location
    }

    /// The resolved address, without resolving.
    pub fn address(&self) -> Option<usize> {
        match self.location {
            Location::Resolved { address } => Some(address),
            Location::Unresolved { .. } => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// Absolute address of the site. Queries the resolver only the first time.
    pub fn resolve<R: AddressResolver + ?Sized>(&mut self, resolver: &R) -> Result<usize> {
        let (id, offset) = match self.location {
            Location::Resolved { address } => return Ok(address),
            Location::Unresolved { id, offset } => (id, offset),
        };

        let name = self.descriptor.name;
        let base = resolver.lookup(id).ok_or_else(|| Error::IdNotFound {
            name: name.to_string(),
            id,
        })?;
        let address = base
            .checked_add_signed(offset)
            .ok_or_else(|| Error::AddressOverflow {
                name: name.to_string(),
                base,
                offset,
            })?;

        debug!("Resolved {} to {:#x}", self.descriptor, address);
        self.location = Location::Resolved { address };
        Ok(address)
    }

    /// Address execution continues at after the redirection.
    pub fn return_address<R: AddressResolver + ?Sized>(&mut self, resolver: &R) -> Result<usize> {
        let address = self.resolve(resolver)?;
        past(self.descriptor.name, address, self.descriptor.kind.size())
    }

    /// Write the descriptor's patch. Legal exactly once per slot.
    ///
    /// The return slot is filled before the redirection is written, and the
    /// rest of the window is padded with no-ops afterwards.
    pub fn apply<R, W>(&mut self, resolver: &R, writer: &mut W) -> Result<()>
    where
        R: AddressResolver + ?Sized,
        W: CodeWriter + ?Sized,
    {
        let address = self.resolve(resolver)?;
        let descriptor = self.descriptor;
        let name = descriptor.name;

        if self.applied {
            return Err(Error::AlreadyApplied {
                name: name.to_string(),
            });
        }

        let action = descriptor.validate()?;
        let size = descriptor.kind.size();
        let return_address = past(name, address, size)?;
        let write_failed = |source| Error::WriteFailed {
            name: name.to_string(),
            address,
            source,
        };

        match action {
            Action::Publish { result } => {
                result.publish(name, address)?;
            }
            Action::Fill => {}
            Action::Redirect {
                form,
                target,
                return_slot,
            } => {
                if let Some(slot) = return_slot {
                    slot.publish(name, return_address)?;
                }
                form.install(writer, address, target).map_err(write_failed)?;
            }
        }

        let padding = descriptor.patch_size - size;
        if padding > 0 {
            writer.fill(return_address, NOP, padding).map_err(write_failed)?;
        }

        self.applied = true;
        Ok(())
    }
}

/// `address + len`, failing instead of wrapping past the address space.
fn past(name: &str, address: usize, len: usize) -> Result<usize> {
    address.checked_add(len).ok_or_else(|| Error::AddressOverflow {
        name: name.to_string(),
        base: address,
        offset: len as isize,
    })
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::descriptor::HookTarget;
    use crate::hook::HookKind;
    use crate::install::{TrampolineArena, X86Writer};
    use crate::memory::{MemoryImage, ReadMemory};
    use crate::resolver::OffsetDatabase;

    const CODE: usize = 0x1000;

    /// Maps every id to `CODE + id` and counts lookups.
    #[derive(Default)]
    struct CountingResolver {
        lookups: Cell<usize>,
    }

    impl AddressResolver for CountingResolver {
        fn base_address(&self) -> usize {
            CODE
        }

        fn lookup(&self, id: u64) -> Option<usize> {
            self.lookups.set(self.lookups.get() + 1);
            (id < 0x100).then(|| CODE + id as usize)
        }
    }

    fn writer() -> X86Writer<MemoryImage> {
        let image = MemoryImage::new().with_region(CODE, vec![0xCC; 0x200]).unwrap();
        X86Writer::new(image, TrampolineArena::empty())
    }

    #[test]
    fn test_output_slot_single_assignment() {
        let slot = OutputSlot::new();
        assert_eq!(slot.get(), None);
        slot.publish("GetLevel", 0x1234).unwrap();
        assert_eq!(slot.get(), Some(0x1234));
        assert!(matches!(
            slot.publish("GetLevel", 0x5678),
            Err(Error::SlotAlreadySet { existing: 0x1234, .. })
        ));
        assert_eq!(slot.get(), Some(0x1234));
    }

    #[test]
    fn test_resolve_is_memoized() {
        let d = PatchDescriptor::nop("Nop", 0x10, 2).with_offset(-4);
        let resolver = CountingResolver::default();
        let mut slot = RelocatableSlot::new(&d);

        assert_eq!(slot.address(), None);
        assert_eq!(slot.resolve(&resolver).unwrap(), CODE + 0x0C);
        assert_eq!(slot.resolve(&resolver).unwrap(), CODE + 0x0C);
        assert_eq!(resolver.lookups.get(), 1);
        assert_eq!(slot.location(), Location::Resolved { address: CODE + 0x0C });
    }

    #[test]
    fn test_resolve_unknown_id() {
        let d = PatchDescriptor::nop("Missing", 0x999, 2);
        let mut slot = RelocatableSlot::new(&d);
        assert!(matches!(
            slot.resolve(&CountingResolver::default()),
            Err(Error::IdNotFound { id: 0x999, .. })
        ));
        assert!(matches!(slot.location(), Location::Unresolved { id: 0x999, .. }));
    }

    #[test]
    fn test_return_address() {
        let target = HookTarget::Address(CODE);
        let d = PatchDescriptor::patch("Call", HookKind::DirectCall, target, 0x20, 8);
        let mut slot = RelocatableSlot::new(&d);
        let resolver = CountingResolver::default();
        assert_eq!(slot.return_address(&resolver).unwrap(), CODE + 0x25);
    }

    #[test]
    fn test_return_address_overflow() {
        let db = OffsetDatabase::new("v", usize::MAX - 0x10)
            .with_entry(1, 0xE)
            .unwrap();
        let target = HookTarget::Address(CODE);
        let d = PatchDescriptor::patch("AtTheEnd", HookKind::DirectCall, target, 1, 5);
        let mut slot = RelocatableSlot::new(&d);

        assert_eq!(slot.resolve(&db).unwrap(), usize::MAX - 2);
        assert!(matches!(
            slot.return_address(&db),
            Err(Error::AddressOverflow { offset: 5, .. })
        ));

        let mut w = writer();
        assert!(matches!(
            slot.apply(&db, &mut w),
            Err(Error::AddressOverflow { .. })
        ));
        assert!(!slot.is_applied());
        assert!(w.memory().writes().is_empty());
    }

    #[test]
    fn test_null_address_never_published() {
        let slot = OutputSlot::new();
        assert!(matches!(
            slot.publish("AtZero", 0),
            Err(Error::NullAddress { .. })
        ));
        assert!(!slot.is_set());

        slot.publish("AtZero", 0x10).unwrap();
        assert_eq!(slot.get(), Some(0x10));
    }

    #[test]
    fn test_apply_implicitly_resolves_and_pads() {
        let d = PatchDescriptor::patch(
            "Jump",
            HookKind::DirectJump,
            HookTarget::Address(CODE + 0x100),
            0x40,
            7,
        );
        let resolver = CountingResolver::default();
        let mut w = writer();
        let mut slot = RelocatableSlot::new(&d);

        slot.apply(&resolver, &mut w).unwrap();

        assert!(slot.is_applied());
        assert_eq!(resolver.lookups.get(), 1);
        let window = w.read_bytes(CODE + 0x40, 8).unwrap();
        assert_eq!(window[0], 0xE9);
        assert_eq!(&window[5..], &[NOP, NOP, 0xCC]);
    }

    #[test]
    fn test_apply_twice_fails() {
        let d = PatchDescriptor::nop("Twice", 0x30, 2);
        let resolver = CountingResolver::default();
        let mut w = writer();
        let mut slot = RelocatableSlot::new(&d);

        slot.apply(&resolver, &mut w).unwrap();
        let writes = w.memory().writes().len();
        assert!(matches!(
            slot.apply(&resolver, &mut w),
            Err(Error::AlreadyApplied { .. })
        ));
        assert_eq!(w.memory().writes().len(), writes);
    }

    #[test]
    fn test_failed_install_is_not_marked_applied() {
        // near branch needs a trampoline cell and the arena is empty
        let target = HookTarget::Address(0x10);
        let d = PatchDescriptor::patch("NoRoom", HookKind::Branch6, target, 0x50, 6);
        let resolver = CountingResolver::default();
        let mut w = writer();
        let mut slot = RelocatableSlot::new(&d);

        assert!(matches!(
            slot.apply(&resolver, &mut w),
            Err(Error::WriteFailed { address: 0x1050, .. })
        ));
        assert!(!slot.is_applied());
        assert!(w.memory().writes().is_empty());
    }
}
