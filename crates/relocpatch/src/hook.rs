//! Hook kinds and the size of the instruction each one writes.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::error::{Error, Result};
use crate::memory::layout::x86;

/// The form of redirection written at a patch site.
///
/// `None` only discovers an address; `Nop` overwrites the window with no-ops
/// and redirects nowhere.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[repr(u8)]
pub enum HookKind {
    None = 0,
    Branch5 = 1,
    Branch6 = 2,
    Call5 = 3,
    Call6 = 4,
    DirectCall = 5,
    DirectJump = 6,
    Nop = 7,
}

impl HookKind {
    /// Number of bytes the encoded redirection occupies at the patch site.
    pub const fn size(self) -> usize {
        match self {
            HookKind::None | HookKind::Nop => 0,
            HookKind::Branch5 | HookKind::Call5 => x86::REL32_SIZE,
            HookKind::Branch6 | HookKind::Call6 => x86::INDIRECT_SIZE,
            HookKind::DirectCall | HookKind::DirectJump => x86::REL32_SIZE,
        }
    }

    /// Whether this kind writes a control-flow transfer and so needs a target.
    pub const fn redirects(self) -> bool {
        !matches!(self, HookKind::None | HookKind::Nop)
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => HookKind::None,
            1 => HookKind::Branch5,
            2 => HookKind::Branch6,
            3 => HookKind::Call5,
            4 => HookKind::Call6,
            5 => HookKind::DirectCall,
            6 => HookKind::DirectJump,
            7 => HookKind::Nop,
            _ => return Err(Error::InvalidHookTag(tag)),
        })
    }
}

impl TryFrom<u8> for HookKind {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        Self::from_tag(tag)
    }
}
