//! Patcher configuration.

use serde::{Deserialize, Serialize};

/// Optional checks run by the [`Patcher`](crate::Patcher) before each write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatcherConfig {
    /// Check `known_offset` against the resolver's reverse index
    pub cross_check: bool,
    /// Compare live code against descriptor signatures
    pub verify_signatures: bool,
    /// Reject descriptors whose windows overlap an earlier one
    pub check_overlaps: bool,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            cross_check: cfg!(feature = "debug-tools"),
            verify_signatures: true,
            check_overlaps: true,
        }
    }
}

impl PatcherConfig {
    /// Create a new configuration builder
    pub fn builder() -> PatcherConfigBuilder {
        PatcherConfigBuilder::default()
    }
}

/// Builder for PatcherConfig
#[derive(Debug, Clone, Default)]
pub struct PatcherConfigBuilder {
    cross_check: Option<bool>,
    verify_signatures: Option<bool>,
    check_overlaps: Option<bool>,
}

impl PatcherConfigBuilder {
    pub fn cross_check(mut self, enabled: bool) -> Self {
        self.cross_check = Some(enabled);
        self
    }

    pub fn verify_signatures(mut self, enabled: bool) -> Self {
        self.verify_signatures = Some(enabled);
        self
    }

    pub fn check_overlaps(mut self, enabled: bool) -> Self {
        self.check_overlaps = Some(enabled);
        self
    }

    pub fn build(self) -> PatcherConfig {
        let default = PatcherConfig::default();
        PatcherConfig {
            cross_check: self.cross_check.unwrap_or(default.cross_check),
            verify_signatures: self.verify_signatures.unwrap_or(default.verify_signatures),
            check_overlaps: self.check_overlaps.unwrap_or(default.check_overlaps),
        }
    }
}
