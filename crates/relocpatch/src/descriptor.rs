//! Patch descriptors.
//!
//! A [`PatchDescriptor`] is one row of a fixed patch table: where a site is
//! (identifier + offset), what to write there, and which output slots to
//! fill. Tables are usually `static`, built with the `const fn`
//! constructors:
//!
//! ```ignore
//! static PERK_POOL_RETURN: OutputSlot = OutputSlot::new();
//!
//! static PATCHES: [PatchDescriptor<'static>; 2] = [
//!     PatchDescriptor::discovery("g_thePlayer", 403521, &PLAYER),
//!     PatchDescriptor::patch("ModifyPerkPool", HookKind::Branch6, PERK_POOL_HOOK, 52538, 7)
//!         .with_offset(0x62)
//!         .with_return_slot(&PERK_POOL_RETURN),
//! ];
//! ```
//!
//! The descriptor shape is flat so tables stay declarative; [`validate`]
//! turns it into a closed [`Action`] before anything is resolved or written.
//!
//! [`validate`]: PatchDescriptor::validate

use std::fmt;

use thiserror::Error;

use crate::error::{Error, Result};
use crate::hook::HookKind;
use crate::install::Redirect;
use crate::signature::{Pattern, parse_pattern};
use crate::slot::OutputSlot;

/// Code a redirecting hook transfers control to.
#[derive(Debug, Clone, Copy)]
pub enum HookTarget {
    Address(usize),
    Function(unsafe extern "C" fn()),
}

impl HookTarget {
    pub fn address(self) -> usize {
        match self {
            HookTarget::Address(address) => address,
            HookTarget::Function(f) => f as usize,
        }
    }
}

/// Why a descriptor was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorFault {
    #[error("{kind} hook needs {size} bytes but the patch window is {patch_size}")]
    SizeExceedsWindow {
        kind: HookKind,
        size: usize,
        patch_size: usize,
    },

    #[error("{0} hook has no target")]
    MissingTarget(HookKind),

    #[error("{0} hook must not have a target")]
    UnexpectedTarget(HookKind),

    #[error("{0} hook cannot fill a return trampoline")]
    UnexpectedReturnSlot(HookKind),

    #[error("{0} hook cannot publish a result")]
    UnexpectedResultSlot(HookKind),

    #[error("discovery has no result slot")]
    MissingResultSlot,

    #[error("discovery cannot claim a patch window ({0} bytes)")]
    WindowOnDiscovery(usize),

    #[error("bad signature: {0}")]
    BadSignature(String),

    #[error("signature covers {len} bytes but the patch window is {patch_size}")]
    SignatureLength { len: usize, patch_size: usize },
}

/// What applying a validated descriptor does.
#[derive(Debug, Clone, Copy)]
pub enum Action<'a> {
    /// Write nothing; publish the resolved address.
    Publish { result: &'a OutputSlot },
    /// Overwrite the whole window with no-ops.
    Fill,
    /// Write a redirection, then pad the rest of the window.
    Redirect {
        form: Redirect,
        target: usize,
        return_slot: Option<&'a OutputSlot>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct PatchDescriptor<'a> {
    pub name: &'a str,
    pub kind: HookKind,
    pub target: Option<HookTarget>,
    pub id: u64,
    pub patch_size: usize,
    pub offset: isize,
    pub return_slot: Option<&'a OutputSlot>,
    pub result_slot: Option<&'a OutputSlot>,
    /// Module offset the site is known to have on one host version.
    pub known_offset: Option<usize>,
    /// Expected bytes of the window, see [`crate::signature`].
    pub signature: Option<&'a str>,
}

impl<'a> PatchDescriptor<'a> {
    /// A code patch redirecting to `target`.
    pub const fn patch(
        name: &'a str,
        kind: HookKind,
        target: HookTarget,
        id: u64,
        patch_size: usize,
    ) -> Self {
        Self {
            name,
            kind,
            target: Some(target),
            id,
            patch_size,
            offset: 0,
            return_slot: None,
            result_slot: None,
            known_offset: None,
            signature: None,
        }
    }

    /// Overwrites `patch_size` bytes with no-ops.
    pub const fn nop(name: &'a str, id: u64, patch_size: usize) -> Self {
        Self {
            name,
            kind: HookKind::Nop,
            target: None,
            id,
            patch_size,
            offset: 0,
            return_slot: None,
            result_slot: None,
            known_offset: None,
            signature: None,
        }
    }

    /// Finds an address without modifying code.
    pub const fn discovery(name: &'a str, id: u64, result: &'a OutputSlot) -> Self {
        Self {
            name,
            kind: HookKind::None,
            target: None,
            id,
            patch_size: 0,
            offset: 0,
            return_slot: None,
            result_slot: Some(result),
            known_offset: None,
            signature: None,
        }
    }

    pub const fn with_offset(mut self, offset: isize) -> Self {
        self.offset = offset;
        self
    }

    pub const fn with_return_slot(mut self, slot: &'a OutputSlot) -> Self {
        self.return_slot = Some(slot);
        self
    }

    pub const fn with_known_offset(mut self, known_offset: usize) -> Self {
        self.known_offset = Some(known_offset);
        self
    }

    pub const fn with_signature(mut self, signature: &'a str) -> Self {
        self.signature = Some(signature);
        self
    }

    fn fault(&self, reason: DescriptorFault) -> Error {
        Error::InvalidDescriptor {
            name: self.name.to_string(),
            reason,
        }
    }

    /// Parsed signature, if the descriptor carries one.
    pub fn pattern(&self) -> Result<Option<Pattern>> {
        let Some(signature) = self.signature else {
            return Ok(None);
        };

        let pattern =
            parse_pattern(signature).map_err(|e| self.fault(DescriptorFault::BadSignature(e)))?;
        if pattern.len() != self.patch_size {
            return Err(self.fault(DescriptorFault::SignatureLength {
                len: pattern.len(),
                patch_size: self.patch_size,
            }));
        }
        Ok(Some(pattern))
    }

    /// Check every descriptor invariant and decide what applying it does.
    ///
    /// Touches neither the resolver nor memory.
    pub fn validate(&self) -> Result<Action<'a>> {
        let kind = self.kind;
        let size = kind.size();

        if size > self.patch_size {
            return Err(self.fault(DescriptorFault::SizeExceedsWindow {
                kind,
                size,
                patch_size: self.patch_size,
            }));
        }

        match (kind.redirects(), self.target) {
            (true, None) => return Err(self.fault(DescriptorFault::MissingTarget(kind))),
            (false, Some(_)) => return Err(self.fault(DescriptorFault::UnexpectedTarget(kind))),
            _ => {}
        }

        if self.return_slot.is_some() && !kind.redirects() {
            return Err(self.fault(DescriptorFault::UnexpectedReturnSlot(kind)));
        }

        if self.result_slot.is_some() && kind != HookKind::None {
            return Err(self.fault(DescriptorFault::UnexpectedResultSlot(kind)));
        }

        self.pattern()?;

        let action = match (kind, self.target) {
            (HookKind::None, _) => {
                if self.patch_size != 0 {
                    return Err(self.fault(DescriptorFault::WindowOnDiscovery(self.patch_size)));
                }
                let result = self
                    .result_slot
                    .ok_or_else(|| self.fault(DescriptorFault::MissingResultSlot))?;
                Action::Publish { result }
            }
            (HookKind::Nop, _) => Action::Fill,
            (HookKind::Branch5, Some(target)) => self.redirect(Redirect::ShortBranch, target),
            (HookKind::Branch6, Some(target)) => self.redirect(Redirect::NearBranch, target),
            (HookKind::Call5, Some(target)) => self.redirect(Redirect::ShortCall, target),
            (HookKind::Call6, Some(target)) => self.redirect(Redirect::NearCall, target),
            (HookKind::DirectCall, Some(target)) => self.redirect(Redirect::DirectCall, target),
            (HookKind::DirectJump, Some(target)) => self.redirect(Redirect::DirectJump, target),
            (_, None) => return Err(self.fault(DescriptorFault::MissingTarget(kind))),
        };

        Ok(action)
    }

    fn redirect(&self, form: Redirect, target: HookTarget) -> Action<'a> {
        Action::Redirect {
            form,
            target: target.address(),
            return_slot: self.return_slot,
        }
    }
}

impl fmt::Display for PatchDescriptor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.offset == 0 {
            return write!(f, "{} [ID: {}]", self.name, self.id);
        }

        let sign = if self.offset < 0 { '-' } else { '+' };
        write!(
            f,
            "{} ([ID: {}] {} {:#x})",
            self.name,
            self.id,
            sign,
            self.offset.unsigned_abs()
        )
    }
}
