//! End-to-end patch application against an in-memory image.

use std::cell::Cell;
use std::collections::HashMap;

use relocpatch::install::WriteResult;
use relocpatch::{
    AddressResolver, CodeWriter, Error, ErrorCategory, HookKind, HookTarget, MemoryImage,
    OutputSlot, PatchDescriptor, Patcher, ReadMemory, RelocatableSlot, Result, TrampolineArena,
    X86Writer,
};

const TRAMPOLINE: usize = 0x8000;
const HOOK: usize = 0x9000;
const TARGET: HookTarget = HookTarget::Address(HOOK);
const FILLER: u8 = 0xCC;

/// Fixed id → address map that counts lookups.
#[derive(Default)]
struct MapResolver {
    addresses: HashMap<u64, usize>,
    lookups: Cell<usize>,
}

impl MapResolver {
    fn with(mut self, id: u64, address: usize) -> Self {
        self.addresses.insert(id, address);
        self
    }
}

impl AddressResolver for MapResolver {
    fn base_address(&self) -> usize {
        0
    }

    fn lookup(&self, id: u64) -> Option<usize> {
        self.lookups.set(self.lookups.get() + 1);
        self.addresses.get(&id).copied()
    }
}

fn writer() -> X86Writer<MemoryImage> {
    let image = MemoryImage::new()
        .with_region(0x1000, vec![FILLER; 0x3000])
        .unwrap()
        .with_region(TRAMPOLINE, vec![0; 0x100])
        .unwrap();
    X86Writer::new(image, TrampolineArena::new(TRAMPOLINE, 0x100))
}

/// Records what a return slot held when each redirection was written.
struct Observing<'a> {
    inner: X86Writer<MemoryImage>,
    slot: &'a OutputSlot,
    seen: Vec<Option<usize>>,
}

impl ReadMemory for Observing<'_> {
    fn read_bytes(&self, address: usize, size: usize) -> Result<Vec<u8>> {
        self.inner.read_bytes(address, size)
    }
}

impl CodeWriter for Observing<'_> {
    fn write_short_branch(&mut self, at: usize, target: usize) -> WriteResult {
        self.seen.push(self.slot.get());
        self.inner.write_short_branch(at, target)
    }

    fn write_near_branch(&mut self, at: usize, target: usize) -> WriteResult {
        self.seen.push(self.slot.get());
        self.inner.write_near_branch(at, target)
    }

    fn write_short_call(&mut self, at: usize, target: usize) -> WriteResult {
        self.seen.push(self.slot.get());
        self.inner.write_short_call(at, target)
    }

    fn write_near_call(&mut self, at: usize, target: usize) -> WriteResult {
        self.seen.push(self.slot.get());
        self.inner.write_near_call(at, target)
    }

    fn write_direct_call(&mut self, at: usize, target: usize) -> WriteResult {
        self.seen.push(self.slot.get());
        self.inner.write_direct_call(at, target)
    }

    fn write_direct_jump(&mut self, at: usize, target: usize) -> WriteResult {
        self.seen.push(self.slot.get());
        self.inner.write_direct_jump(at, target)
    }

    fn fill(&mut self, at: usize, value: u8, count: usize) -> WriteResult {
        self.inner.fill(at, value, count)
    }
}

#[test]
fn test_near_branch_fills_whole_window() {
    let d = PatchDescriptor::patch("NearBranch", HookKind::Branch6, TARGET, 100, 6);
    let resolver = MapResolver::default().with(100, 0x1000);
    let mut w = writer();
    let mut slot = RelocatableSlot::new(&d);

    slot.apply(&resolver, &mut w).unwrap();

    assert_eq!(slot.return_address(&resolver).unwrap(), 0x1006);
    let site = w.read_bytes(0x1000, 7).unwrap();
    assert_eq!(&site[..2], &[0xFF, 0x25]);
    let disp = i32::from_le_bytes([site[2], site[3], site[4], site[5]]);
    let cell = (0x1006_i64 + disp as i64) as usize;
    assert_eq!(cell, TRAMPOLINE);
    assert_eq!(w.read_u64(cell).unwrap(), HOOK as u64);
    // no padding past the window
    assert_eq!(site[6], FILLER);
}

#[test]
fn test_short_call_publishes_return_before_writing() {
    let ret = OutputSlot::new();
    let d = PatchDescriptor::patch("ShortCall", HookKind::Call5, TARGET, 200, 9)
        .with_offset(0x10)
        .with_return_slot(&ret);
    let resolver = MapResolver::default().with(200, 0x2000);
    let mut w = Observing {
        inner: writer(),
        slot: &ret,
        seen: Vec::new(),
    };
    let mut slot = RelocatableSlot::new(&d);

    slot.apply(&resolver, &mut w).unwrap();

    assert_eq!(slot.address(), Some(0x2010));
    assert_eq!(ret.get(), Some(0x2015));
    assert_eq!(w.seen, vec![Some(0x2015)]);

    let window = w.read_bytes(0x2010, 10).unwrap();
    assert_eq!(window[0], 0xE8);
    assert_eq!(&window[5..9], &[0x90; 4]);
    assert_eq!(window[9], FILLER);
}

#[test]
fn test_discovery_writes_nothing() {
    let result = OutputSlot::new();
    let table = [PatchDescriptor::discovery("Discovery", 300, &result)];
    let resolver = MapResolver::default().with(300, 0x3000);

    let mut patcher = Patcher::new(&resolver, writer());
    let report = patcher.apply_all(&table).unwrap();

    assert_eq!(result.get(), Some(0x3000));
    assert_eq!(report.patches[0].address, 0x3000);
    let w = patcher.into_writer();
    assert!(w.memory().writes().is_empty());
    assert_eq!(w.trampoline().used(), 0);
}

#[test]
fn test_missing_target_rejected_before_lookup() {
    let mut d = PatchDescriptor::patch("NoTarget", HookKind::Branch5, TARGET, 400, 5);
    d.target = None;
    let resolver = MapResolver::default().with(400, 0x1400);

    let mut patcher = Patcher::new(&resolver, writer());
    let err = patcher.apply_all(&[d]).unwrap_err();

    assert!(matches!(err, Error::InvalidDescriptor { .. }));
    assert_eq!(resolver.lookups.get(), 0);
    assert!(patcher.writer().memory().writes().is_empty());
}

#[test]
fn test_unknown_identifier_aborts_without_writes() {
    let table = [
        PatchDescriptor::patch("Unknown", HookKind::DirectJump, TARGET, 500, 5),
    ];
    let resolver = MapResolver::default();

    let mut patcher = Patcher::new(&resolver, writer());
    let err = patcher.apply_all(&table).unwrap_err();

    assert!(matches!(err, Error::IdNotFound { id: 500, .. }));
    assert_eq!(err.category(), ErrorCategory::Resolution);
    assert!(patcher.writer().memory().writes().is_empty());
}

#[test]
fn test_table_stops_at_first_failure() {
    let ret = OutputSlot::new();
    let table = [
        PatchDescriptor::nop("First", 100, 3),
        PatchDescriptor::nop("Broken", 100, 2).with_return_slot(&ret),
        PatchDescriptor::nop("Never", 200, 2),
    ];
    let resolver = MapResolver::default().with(100, 0x1000).with(200, 0x2000);

    let mut patcher = Patcher::new(&resolver, writer());
    assert!(patcher.apply_all(&table).is_err());

    let w = patcher.into_writer();
    assert_eq!(w.read_bytes(0x1000, 3).unwrap(), vec![0x90; 3]);
    assert_eq!(w.read_bytes(0x2000, 2).unwrap(), vec![FILLER; 2]);
    assert!(!ret.is_set());
}
