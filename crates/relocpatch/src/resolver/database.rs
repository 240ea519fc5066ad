use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::AddressResolver;
use crate::error::{Error, Result};

/// On-disk form of an offset database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseFile {
    /// Host version the offsets belong to (e.g. "1.6.640.0")
    pub version: String,
    pub entries: Vec<DatabaseEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub id: u64,
    /// Offset from the module base
    pub offset: u64,
}

/// Identifier → module offset table for one host version, bound to the
/// module's load address.
#[derive(Debug, Clone)]
pub struct OffsetDatabase {
    version: String,
    base: usize,
    by_id: HashMap<u64, usize>,
    by_offset: HashMap<usize, u64>,
}

impl OffsetDatabase {
    pub fn new(version: impl Into<String>, base: usize) -> Self {
        Self {
            version: version.into(),
            base,
            by_id: HashMap::new(),
            by_offset: HashMap::new(),
        }
    }

    /// Build the lookup tables, rejecting duplicate ids or offsets.
    pub fn from_file(file: DatabaseFile, base: usize) -> Result<Self> {
        if file.version.trim().is_empty() {
            return Err(Error::InvalidDatabase("version is empty".to_string()));
        }

        let mut db = Self::new(file.version, base);
        for entry in file.entries {
            db.insert(entry)?;
        }

        debug!(
            "Offset database {}: {} entries, base {:#x}",
            db.version,
            db.len(),
            base
        );
        Ok(db)
    }

    pub fn insert(&mut self, entry: DatabaseEntry) -> Result<()> {
        let offset = usize::try_from(entry.offset).map_err(|_| {
            Error::InvalidDatabase(format!("offset {:#x} does not fit", entry.offset))
        })?;
        if self.base.checked_add(offset).is_none() {
            return Err(Error::InvalidDatabase(format!(
                "id {}: offset {:#x} overflows base {:#x}",
                entry.id, offset, self.base
            )));
        }

        if self.by_id.contains_key(&entry.id) {
            return Err(Error::InvalidDatabase(format!("duplicate id {}", entry.id)));
        }
        if let Some(other) = self.by_offset.get(&offset) {
            return Err(Error::InvalidDatabase(format!(
                "offset {:#x} claimed by ids {} and {}",
                offset, other, entry.id
            )));
        }

        self.by_id.insert(entry.id, offset);
        self.by_offset.insert(offset, entry.id);
        Ok(())
    }

    pub fn with_entry(mut self, id: u64, offset: u64) -> Result<Self> {
        self.insert(DatabaseEntry { id, offset })?;
        Ok(self)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn offset_of(&self, id: u64) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    pub fn id_of(&self, offset: usize) -> Option<u64> {
        self.by_offset.get(&offset).copied()
    }

    /// Entries sorted by id.
    pub fn to_file(&self) -> DatabaseFile {
        let mut entries: Vec<DatabaseEntry> = self
            .by_id
            .iter()
            .map(|(&id, &offset)| DatabaseEntry {
                id,
                offset: offset as u64,
            })
            .collect();
        entries.sort_by_key(|e| e.id);

        DatabaseFile {
            version: self.version.clone(),
            entries,
        }
    }
}

impl AddressResolver for OffsetDatabase {
    fn base_address(&self) -> usize {
        self.base
    }

    fn lookup(&self, id: u64) -> Option<usize> {
        self.offset_of(id).and_then(|offset| self.base.checked_add(offset))
    }

    fn verify(&self, known_offset: usize, id: u64) -> bool {
        self.id_of(known_offset) == Some(id)
    }
}

pub fn load_database<P: AsRef<Path>>(path: P, base: usize) -> Result<OffsetDatabase> {
    let content = fs::read_to_string(&path)?;
    let file: DatabaseFile = serde_json::from_str(&content)?;
    let db = OffsetDatabase::from_file(file, base)?;
    info!(
        "Loaded offset database {} ({} entries) from {}",
        db.version(),
        db.len(),
        path.as_ref().display()
    );
    Ok(db)
}

pub fn save_database<P: AsRef<Path>>(path: P, file: &DatabaseFile) -> Result<()> {
    let content = serde_json::to_string_pretty(file)?;
    fs::write(path, content)?;
    Ok(())
}
