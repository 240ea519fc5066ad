//! Applies a patch table to the host image.
//!
//! Every descriptor is validated, resolved, checked and applied in table
//! order. The first failure stops the run: later patches may rely on earlier
//! ones having redirected control flow, so there is nothing safe to continue
//! with.

use std::collections::HashSet;

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use tracing::{debug, error, info};

use crate::config::PatcherConfig;
use crate::descriptor::PatchDescriptor;
use crate::error::{Error, Result};
use crate::hook::HookKind;
use crate::install::CodeWriter;
use crate::memory::ReadMemory;
use crate::resolver::AddressResolver;
use crate::signature::{self, format_bytes};
use crate::slot::RelocatableSlot;

fn as_hex<S: Serializer>(value: &usize, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format!("0x{:X}", value))
}

fn as_hex_bytes<S: Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format_bytes(bytes))
}

/// One descriptor as it ended up in memory.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedPatch {
    pub name: String,
    pub kind: HookKind,
    pub id: u64,
    pub offset: isize,
    #[serde(serialize_with = "as_hex")]
    pub address: usize,
    /// Address relative to the module base
    #[serde(serialize_with = "as_hex")]
    pub rva: usize,
    pub patch_size: usize,
    /// Window contents read back right after application
    #[serde(serialize_with = "as_hex_bytes")]
    pub window: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatchReport {
    pub generated_at: DateTime<Local>,
    pub patches: Vec<AppliedPatch>,
}

impl PatchReport {
    fn new() -> Self {
        Self {
            generated_at: Local::now(),
            patches: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&AppliedPatch> {
        self.patches.iter().find(|p| p.name == name)
    }

    /// Check that no window was rewritten since it was applied.
    ///
    /// Other code modifying the host can clobber our patches after the fact;
    /// every clobbered window is logged and the first one is returned.
    pub fn verify<M: ReadMemory + ?Sized>(&self, memory: &M) -> Result<()> {
        let mut first = None;
        for patch in self.patches.iter().filter(|p| !p.window.is_empty()) {
            let current = memory.read_bytes(patch.address, patch.window.len())?;
            if current == patch.window {
                continue;
            }

            error!(
                "Patch {} at {:#x} has been clobbered: expected {{ {} }}, found {{ {} }}",
                patch.name,
                patch.address,
                format_bytes(&patch.window),
                format_bytes(&current)
            );
            first.get_or_insert_with(|| Error::Clobbered {
                name: patch.name.clone(),
                address: patch.address,
            });
        }

        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A patch window claimed by an applied descriptor.
#[derive(Debug)]
struct Claim {
    name: String,
    start: usize,
    end: usize,
}

/// Descriptor identity for double-apply detection: name, id and offset.
type SiteKey = (String, u64, isize);

fn site_key(descriptor: &PatchDescriptor<'_>) -> SiteKey {
    (descriptor.name.to_string(), descriptor.id, descriptor.offset)
}

/// Every check a descriptor passes before its first write.
///
/// Validates, rejects descriptors that were already applied, resolves,
/// cross-checks and claims the patch window. [`Patcher`] runs it in front of
/// every write; on its own it is a dry run over a table.
#[derive(Debug)]
pub struct Preflight<R> {
    resolver: R,
    config: PatcherConfig,
    claims: Vec<Claim>,
    applied: HashSet<SiteKey>,
}

impl<R: AddressResolver> Preflight<R> {
    pub fn new(resolver: R, config: PatcherConfig) -> Self {
        Self {
            resolver,
            config,
            claims: Vec::new(),
            applied: HashSet::new(),
        }
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn config(&self) -> &PatcherConfig {
        &self.config
    }

    /// Run the checks and hand back the resolved slot, ready to apply.
    pub fn check<'d>(
        &mut self,
        descriptor: &'d PatchDescriptor<'d>,
    ) -> Result<RelocatableSlot<'d>> {
        descriptor.validate()?;

        if self.applied.contains(&site_key(descriptor)) {
            return Err(Error::AlreadyApplied {
                name: descriptor.name.to_string(),
            });
        }

        let mut slot = RelocatableSlot::new(descriptor);
        let address = slot.resolve(&self.resolver)?;

        if self.config.cross_check {
            self.cross_check(descriptor)?;
        }

        if self.config.check_overlaps && descriptor.patch_size > 0 {
            let end = address.saturating_add(descriptor.patch_size);
            self.claim(descriptor.name, address, end)?;
        }

        Ok(slot)
    }

    /// Record `descriptor` as written. A later [`check`](Self::check) of it
    /// fails with [`Error::AlreadyApplied`].
    pub fn mark_applied(&mut self, descriptor: &PatchDescriptor<'_>) {
        self.applied.insert(site_key(descriptor));
    }

    /// Module offset of an absolute address.
    pub fn rva(&self, address: usize) -> usize {
        address.wrapping_sub(self.resolver.base_address())
    }

    fn cross_check(&self, descriptor: &PatchDescriptor<'_>) -> Result<()> {
        let Some(known_offset) = descriptor.known_offset else {
            return Ok(());
        };

        if !self.resolver.verify(known_offset, descriptor.id) {
            return Err(Error::CrossCheckMismatch {
                name: descriptor.name.to_string(),
                id: descriptor.id,
                known_offset,
            });
        }
        debug!("Cross-check of {} passed", descriptor);
        Ok(())
    }

    fn claim(&mut self, name: &str, start: usize, end: usize) -> Result<()> {
        if let Some(other) = self
            .claims
            .iter()
            .find(|c| start < c.end && c.start < end)
        {
            return Err(Error::OverlappingWindow {
                name: name.to_string(),
                other: other.name.clone(),
                start,
                end,
            });
        }

        self.claims.push(Claim {
            name: name.to_string(),
            start,
            end,
        });
        Ok(())
    }
}

pub struct Patcher<R, W> {
    preflight: Preflight<R>,
    writer: W,
}

impl<R: AddressResolver, W: CodeWriter> Patcher<R, W> {
    pub fn new(resolver: R, writer: W) -> Self {
        Self::with_config(resolver, writer, PatcherConfig::default())
    }

    pub fn with_config(resolver: R, writer: W, config: PatcherConfig) -> Self {
        Self {
            preflight: Preflight::new(resolver, config),
            writer,
        }
    }

    pub fn resolver(&self) -> &R {
        self.preflight.resolver()
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    pub fn into_writer(self) -> W {
        self.writer
    }

    /// Apply every descriptor in `table`, in order, stopping at the first error.
    ///
    /// Descriptors applied by an earlier call fail with
    /// [`Error::AlreadyApplied`] before anything is written.
    pub fn apply_all(&mut self, table: &[PatchDescriptor<'_>]) -> Result<PatchReport> {
        info!("Applying {} patches...", table.len());

        let mut report = PatchReport::new();
        for descriptor in table {
            let applied = self.apply_one(descriptor)?;
            report.patches.push(applied);
        }

        info!("Finished applying patches!");
        Ok(report)
    }

    /// [`apply_all`](Self::apply_all) for host initialization, where a failed
    /// patch leaves the process in an unknown state and it must not continue.
    pub fn apply_or_abort(&mut self, table: &[PatchDescriptor<'_>]) -> PatchReport {
        match self.apply_all(table) {
            Ok(report) => report,
            Err(e) => {
                error!("[{}] {}", e.category(), e);
                error!("Aborting: the host binary layout is not what the patch table expects");
                std::process::abort();
            }
        }
    }

    fn apply_one(&mut self, descriptor: &PatchDescriptor<'_>) -> Result<AppliedPatch> {
        let mut slot = self.preflight.check(descriptor)?;
        let resolver = self.preflight.resolver();
        let address = slot.resolve(resolver)?;

        if self.preflight.config().verify_signatures {
            if let Some(pattern) = descriptor.pattern()? {
                signature::check(&self.writer, descriptor.name, address, &pattern)?;
                debug!("Signature of {} matched", descriptor);
            }
        }

        slot.apply(resolver, &mut self.writer)?;
        self.preflight.mark_applied(descriptor);

        let rva = self.preflight.rva(address);
        info!("{} is at offset {:#x}", descriptor, rva);

        let window = if descriptor.patch_size > 0 {
            self.writer.read_bytes(address, descriptor.patch_size)?
        } else {
            Vec::new()
        };

        Ok(AppliedPatch {
            name: descriptor.name.to_string(),
            kind: descriptor.kind,
            id: descriptor.id,
            offset: descriptor.offset,
            address,
            rva,
            patch_size: descriptor.patch_size,
            window,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::HookTarget;
    use crate::error::ErrorCategory;
    use crate::install::{TrampolineArena, X86Writer};
    use crate::memory::layout::x86::NOP;
    use crate::memory::{MemoryImage, WriteMemory};
    use crate::resolver::OffsetDatabase;
    use crate::slot::OutputSlot;

    const BASE: usize = 0x1_4000_0000;
    const TRAMPOLINE: usize = BASE + 0x1000;

    fn patcher(config: PatcherConfig) -> Patcher<OffsetDatabase, X86Writer<MemoryImage>> {
        let db = OffsetDatabase::new("test", BASE)
            .with_entry(100, 0x100)
            .unwrap()
            .with_entry(200, 0x200)
            .unwrap()
            .with_entry(300, 0x300)
            .unwrap();
        let image = MemoryImage::new()
            .with_region(BASE, vec![0xCC; 0x1000])
            .unwrap()
            .with_region(TRAMPOLINE, vec![0; 0x100])
            .unwrap();
        let writer = X86Writer::new(image, TrampolineArena::new(TRAMPOLINE, 0x100));
        Patcher::with_config(db, writer, config)
    }

    #[test]
    fn test_apply_all_reports_each_site() {
        static PLAYER: OutputSlot = OutputSlot::new();
        let table = [
            PatchDescriptor::discovery("g_thePlayer", 300, &PLAYER),
            PatchDescriptor::nop("AllowAllAttrImproveCarryWeight", 100, 2).with_offset(0x9A),
        ];

        let mut p = patcher(PatcherConfig::default());
        let report = p.apply_all(&table).unwrap();

        assert_eq!(report.patches.len(), 2);
        assert_eq!(PLAYER.get(), Some(BASE + 0x300));
        let nop = report.get("AllowAllAttrImproveCarryWeight").unwrap();
        assert_eq!(nop.rva, 0x19A);
        assert_eq!(nop.window, vec![NOP, NOP]);
        assert!(report.get("g_thePlayer").unwrap().window.is_empty());
    }

    #[test]
    fn test_first_failure_stops_the_run() {
        let table = [
            PatchDescriptor::nop("First", 100, 2),
            PatchDescriptor::nop("Missing", 999, 2),
            PatchDescriptor::nop("Never", 200, 2),
        ];

        let mut p = patcher(PatcherConfig::default());
        let err = p.apply_all(&table).unwrap_err();

        assert!(matches!(err, Error::IdNotFound { id: 999, .. }));
        let image = p.writer().memory();
        assert_eq!(image.read_bytes(BASE + 0x100, 2).unwrap(), vec![NOP, NOP]);
        assert_eq!(image.read_bytes(BASE + 0x200, 2).unwrap(), vec![0xCC, 0xCC]);
    }

    #[test]
    fn test_invalid_descriptor_rejected_before_writes() {
        let mut bad = PatchDescriptor::nop("Bad", 100, 2);
        bad.target = Some(HookTarget::Address(BASE));

        let mut p = patcher(PatcherConfig::default());
        assert!(matches!(
            p.apply_all(&[bad]),
            Err(Error::InvalidDescriptor { .. })
        ));
        assert!(p.writer().memory().writes().is_empty());
    }

    #[test]
    fn test_cross_check() {
        let good = PatchDescriptor::nop("Good", 100, 2).with_known_offset(0x100);
        let bad = PatchDescriptor::nop("Bad", 200, 2).with_known_offset(0x100);

        let config = PatcherConfig::builder().cross_check(true).build();
        let mut p = patcher(config);
        assert!(p.apply_all(&[good]).is_ok());
        assert!(matches!(
            p.apply_all(&[bad]),
            Err(Error::CrossCheckMismatch { id: 200, known_offset: 0x100, .. })
        ));

        // disabled: known offsets are ignored
        let config = PatcherConfig::builder().cross_check(false).build();
        assert!(patcher(config).apply_all(&[bad]).is_ok());
    }

    #[test]
    fn test_overlapping_windows_rejected() {
        let table = [
            PatchDescriptor::nop("Wide", 100, 8),
            PatchDescriptor::nop("Inside", 100, 2).with_offset(6),
        ];

        let mut p = patcher(PatcherConfig::default());
        match p.apply_all(&table) {
            Err(Error::OverlappingWindow { name, other, .. }) => {
                assert_eq!(name, "Inside");
                assert_eq!(other, "Wide");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_second_run_is_already_applied() {
        let table = [
            PatchDescriptor::patch(
                "ShortJump",
                HookKind::Branch5,
                HookTarget::Address(BASE + 0x800),
                100,
                5,
            ),
            PatchDescriptor::nop("Nop", 200, 2),
        ];

        let config = PatcherConfig::builder().check_overlaps(false).build();
        let mut p = patcher(config);
        p.apply_all(&table).unwrap();
        let used = p.writer().trampoline().used();
        let writes = p.writer().memory().writes().len();

        let err = p.apply_all(&table).unwrap_err();
        assert!(matches!(&err, Error::AlreadyApplied { name } if name == "ShortJump"));
        assert_eq!(err.category(), ErrorCategory::DoubleApply);
        assert_eq!(p.writer().trampoline().used(), used);
        assert_eq!(p.writer().memory().writes().len(), writes);

        // the same answer when overlap claims would also have caught it
        let mut p = patcher(PatcherConfig::default());
        p.apply_all(&table[1..]).unwrap();
        assert!(matches!(
            p.apply_all(&table[1..]),
            Err(Error::AlreadyApplied { .. })
        ));
    }

    #[test]
    fn test_discovery_at_null_address() {
        static AT_ZERO: OutputSlot = OutputSlot::new();
        let db = OffsetDatabase::new("v", 0).with_entry(1, 0).unwrap();
        let image = MemoryImage::new().with_region(0x1000, vec![0; 0x10]).unwrap();
        let mut p = Patcher::new(db, X86Writer::new(image, TrampolineArena::empty()));

        let table = [PatchDescriptor::discovery("AtZero", 1, &AT_ZERO)];
        assert!(matches!(
            p.apply_all(&table),
            Err(Error::NullAddress { .. })
        ));
        assert!(!AT_ZERO.is_set());
    }

    #[test]
    fn test_preflight_dry_run() {
        let db = OffsetDatabase::new("test", BASE).with_entry(100, 0x100).unwrap();
        let table = [
            PatchDescriptor::nop("Wide", 100, 8),
            PatchDescriptor::nop("Inside", 100, 2).with_offset(6),
        ];

        let mut preflight = Preflight::new(db, PatcherConfig::default());
        let slot = preflight.check(&table[0]).unwrap();
        assert_eq!(slot.address(), Some(BASE + 0x100));
        assert_eq!(preflight.rva(BASE + 0x100), 0x100);
        assert!(matches!(
            preflight.check(&table[1]),
            Err(Error::OverlappingWindow { .. })
        ));

        preflight.mark_applied(&table[0]);
        assert!(matches!(
            preflight.check(&table[0]),
            Err(Error::AlreadyApplied { .. })
        ));
    }

    #[test]
    fn test_signature_mismatch_blocks_write() {
        let table = [PatchDescriptor::nop("Sig", 100, 2).with_signature("74 34")];

        let mut p = patcher(PatcherConfig::default());
        assert!(matches!(
            p.apply_all(&table),
            Err(Error::SignatureMismatch { .. })
        ));
        assert!(p.writer().memory().writes().is_empty());

        let config = PatcherConfig::builder().verify_signatures(false).build();
        assert!(patcher(config).apply_all(&table).is_ok());
    }

    #[test]
    fn test_report_verify_detects_clobber() {
        let table = [
            PatchDescriptor::patch(
                "Jump",
                HookKind::DirectJump,
                HookTarget::Address(BASE + 0x800),
                200,
                6,
            ),
        ];

        let mut p = patcher(PatcherConfig::default());
        let report = p.apply_all(&table).unwrap();
        let mut image = p.into_writer().into_inner();
        assert!(report.verify(&image).is_ok());

        image.write_bytes(BASE + 0x205, &[0xC3]).unwrap();
        assert!(matches!(
            report.verify(&image),
            Err(Error::Clobbered { address, .. }) if address == BASE + 0x200
        ));
    }

    #[test]
    fn test_report_serializes_hex() {
        let table = [PatchDescriptor::nop("Nop", 100, 2)];
        let report = patcher(PatcherConfig::default()).apply_all(&table).unwrap();

        let json = serde_json::to_value(&report).unwrap();
        let patch = &json["patches"][0];
        assert_eq!(patch["rva"], "0x100");
        assert_eq!(patch["window"], "90 90");
        assert_eq!(patch["kind"], "nop");
    }
}
