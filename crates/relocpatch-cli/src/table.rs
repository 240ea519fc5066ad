//! Patch tables loaded from TOML.
//!
//! ```toml
//! [config]
//! verify_signatures = true
//!
//! [[patch]]
//! name = "ImprovePlayerSkillPoints"
//! kind = "branch6"
//! id = 41561
//! patch_size = 6
//! offset = 0x62
//! target = "0x140F00000"
//! return_slot = "skill_points_return"
//! ```
//!
//! Slots named by entries are owned by a [`SlotSet`] so descriptors can
//! borrow them for the duration of a run.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use relocpatch::{HookKind, HookTarget, OutputSlot, PatchDescriptor, PatcherConfig};
use serde::{Deserialize, Deserializer, de};

use crate::commands::hex_utils::parse_hex_address;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PatchEntry {
    pub name: String,
    #[serde(deserialize_with = "kind_by_name")]
    pub kind: HookKind,
    pub id: u64,
    #[serde(default)]
    pub patch_size: usize,
    #[serde(default)]
    pub offset: isize,
    /// Absolute hook target (hex)
    pub target: Option<String>,
    pub return_slot: Option<String>,
    pub result_slot: Option<String>,
    pub known_offset: Option<usize>,
    pub signature: Option<String>,
}

/// Hook kinds are matched case-insensitively (`branch6`, `Branch6`, `DIRECT_JUMP`).
fn kind_by_name<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<HookKind, D::Error> {
    let name = String::deserialize(d)?;
    name.parse()
        .map_err(|_| de::Error::custom(format!("unknown hook kind {:?}", name)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableFile {
    pub config: Option<PatcherConfig>,
    #[serde(default)]
    pub patch: Vec<PatchEntry>,
}

/// Named output slots referenced by a table.
#[derive(Debug, Default)]
pub struct SlotSet(BTreeMap<String, OutputSlot>);

impl SlotSet {
    pub fn get(&self, name: &str) -> Option<&OutputSlot> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OutputSlot)> {
        self.0.iter().map(|(name, slot)| (name.as_str(), slot))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TableFile {
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read patch table {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid patch table {}", path.display()))
    }

    pub fn config(&self) -> PatcherConfig {
        self.config.unwrap_or_default()
    }

    /// One empty slot per distinct slot name in the table.
    pub fn slots(&self) -> SlotSet {
        let names = self
            .patch
            .iter()
            .flat_map(|e| [e.return_slot.as_ref(), e.result_slot.as_ref()])
            .flatten();

        SlotSet(
            names
                .map(|name| (name.clone(), OutputSlot::new()))
                .collect(),
        )
    }

    /// Build descriptors in table order. Descriptor invariants are not
    /// checked here; that is [`PatchDescriptor::validate`]'s job.
    pub fn descriptors<'a>(&'a self, slots: &'a SlotSet) -> Result<Vec<PatchDescriptor<'a>>> {
        let slot = move |name: &Option<String>| -> Result<Option<&'a OutputSlot>> {
            match name {
                None => Ok(None),
                Some(name) => match slots.get(name) {
                    Some(slot) => Ok(Some(slot)),
                    None => bail!("Unknown slot {:?}", name),
                },
            }
        };

        let mut descriptors = Vec::with_capacity(self.patch.len());
        for entry in &self.patch {
            let target = entry
                .target
                .as_deref()
                .map(parse_hex_address)
                .transpose()
                .with_context(|| format!("Bad target for {}", entry.name))?
                .map(HookTarget::Address);

            descriptors.push(PatchDescriptor {
                name: &entry.name,
                kind: entry.kind,
                target,
                id: entry.id,
                patch_size: entry.patch_size,
                offset: entry.offset,
                return_slot: slot(&entry.return_slot)?,
                result_slot: slot(&entry.result_slot)?,
                known_offset: entry.known_offset,
                signature: entry.signature.as_deref(),
            });
        }
        Ok(descriptors)
    }
}
