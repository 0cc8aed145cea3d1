//! The aggregated multi-family blockhash store.
//!
//! Every ingested report contributes its (hash, size, function) triples,
//! tagged with a dense family id and sample id. The index grows
//! append-only, is snapshotted to a single JSON document, and is
//! immutable while serving matches.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use picblocks_core::BlockhashReport;

use crate::error::DbError;
use crate::time::utc_now;

/// One stored occurrence of a (hash, size) pair:
/// `(family_id, sample_id, function_id, is_library)`.
///
/// Serializes as a four-element JSON array. Duplicates of the same tuple
/// are permitted and preserved; they represent multiple functions sharing
/// the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry(pub u32, pub u32, pub u32, pub bool);

impl IndexEntry {
    #[must_use]
    pub fn family_id(&self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn sample_id(&self) -> u32 {
        self.1
    }

    #[must_use]
    pub fn function_id(&self) -> u32 {
        self.2
    }

    #[must_use]
    pub fn is_library(&self) -> bool {
        self.3
    }
}

/// Statistics over the whole index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    /// Families appearing at least once with a non-library entry.
    pub num_families: usize,
    /// Families appearing at least once with a library entry; a mixed
    /// family counts in both figures.
    pub num_libraries: usize,
    pub num_files: usize,
    /// Distinct (sample, function) pairs observed.
    pub num_functions: usize,
    /// Distinct block hash values.
    pub num_hashes: usize,
    /// Distinct (block hash, size) pairs.
    pub num_hash_and_sizes: usize,
    /// Sum of sizes over all stored entries.
    pub num_bytes: u64,
    /// Sum of sizes over distinct (block hash, size) pairs.
    pub num_bytes_unique: u64,
    /// Histogram: how many hashes carry 1, 2, ... distinct sizes.
    pub hash_size_counts: BTreeMap<usize, u64>,
}

/// The corpus database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockHashIndex {
    timestamp: String,
    pub(crate) family_to_id: BTreeMap<String, u32>,
    pub(crate) family_id_to_family: BTreeMap<u32, String>,
    pub(crate) sample_id_to_sample: BTreeMap<u32, String>,
    pub(crate) blockhashes: BTreeMap<u32, BTreeMap<u32, Vec<IndexEntry>>>,
}

impl BlockHashIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            timestamp: utc_now(),
            ..Self::default()
        }
    }

    /// When the database was last written (or created), ISO-8601 UTC.
    #[must_use]
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    #[must_use]
    pub fn num_families(&self) -> usize {
        self.family_to_id.len()
    }

    #[must_use]
    pub fn num_samples(&self) -> usize {
        self.sample_id_to_sample.len()
    }

    #[must_use]
    pub fn num_blockhashes(&self) -> usize {
        self.blockhashes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blockhashes.is_empty()
    }

    #[must_use]
    pub fn family_name(&self, family_id: u32) -> Option<&str> {
        self.family_id_to_family
            .get(&family_id)
            .map(String::as_str)
    }

    /// Append one report. A new family id is allocated iff the family is
    /// unseen; a new sample id is always allocated. Returns the sample id.
    pub fn ingest(&mut self, report: &BlockhashReport) -> u32 {
        let next_family_id = self.family_to_id.len() as u32;
        let family_id = *self
            .family_to_id
            .entry(report.family.clone())
            .or_insert(next_family_id);
        self.family_id_to_family
            .entry(family_id)
            .or_insert_with(|| report.family.clone());
        let sample_id = self.sample_id_to_sample.len() as u32;
        self.sample_id_to_sample
            .insert(sample_id, report.filename.clone());
        for (&block_hash, by_size) in &report.blockhashes {
            let slot = self.blockhashes.entry(block_hash).or_default();
            for (&size, fids) in by_size {
                let entries = slot.entry(size).or_default();
                for &fid in fids {
                    entries.push(IndexEntry(family_id, sample_id, fid, report.is_library));
                }
            }
        }
        sample_id
    }

    /// Parse a `.blocks` file and ingest it. The document is parsed in
    /// full before the index is touched, so a malformed file leaves the
    /// index unchanged.
    pub fn ingest_report_file(&mut self, path: &Path) -> Result<u32, DbError> {
        let content = fs::read_to_string(path)?;
        let report = BlockhashReport::from_json(&content)
            .map_err(|err| DbError::CorruptDb(format!("{}: {err}", path.display())))?;
        Ok(self.ingest(&report))
    }

    /// Restore an index from a database file.
    pub fn load(path: &Path) -> Result<Self, DbError> {
        let content = fs::read_to_string(path)?;
        let index: Self = serde_json::from_str(&content)
            .map_err(|err| DbError::CorruptDb(format!("{}: {err}", path.display())))?;
        index.validate()?;
        Ok(index)
    }

    /// Write the index as a single JSON document, refreshing the
    /// timestamp. The document goes to a temporary sibling first and is
    /// renamed into place on success.
    pub fn save(&mut self, path: &Path) -> Result<(), DbError> {
        self.timestamp = utc_now();
        let json = serde_json::to_string(self).map_err(|err| DbError::CorruptDb(err.to_string()))?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Compute statistics for the current index contents.
    #[must_use]
    pub fn stats(&self) -> IndexStats {
        let mut family_ids: BTreeSet<u32> = BTreeSet::new();
        let mut library_ids: BTreeSet<u32> = BTreeSet::new();
        let mut function_ids: BTreeSet<(u32, u32)> = BTreeSet::new();
        let mut num_hash_and_sizes = 0usize;
        let mut num_bytes = 0u64;
        let mut num_bytes_unique = 0u64;
        let mut hash_size_counts: BTreeMap<usize, u64> = BTreeMap::new();
        for by_size in self.blockhashes.values() {
            *hash_size_counts.entry(by_size.len()).or_default() += 1;
            for (&size, entries) in by_size {
                num_hash_and_sizes += 1;
                num_bytes_unique += u64::from(size);
                for entry in entries {
                    function_ids.insert((entry.sample_id(), entry.function_id()));
                    num_bytes += u64::from(size);
                    if entry.is_library() {
                        library_ids.insert(entry.family_id());
                    } else {
                        family_ids.insert(entry.family_id());
                    }
                }
            }
        }
        IndexStats {
            num_families: family_ids.len(),
            num_libraries: library_ids.len(),
            num_files: self.sample_id_to_sample.len(),
            num_functions: function_ids.len(),
            num_hashes: self.blockhashes.len(),
            num_hash_and_sizes,
            num_bytes,
            num_bytes_unique,
            hash_size_counts,
        }
    }

    // Every id referenced from blockhashes must resolve; a dangling id
    // would otherwise surface as a wrong answer during matching.
    fn validate(&self) -> Result<(), DbError> {
        for (block_hash, by_size) in &self.blockhashes {
            for entries in by_size.values() {
                for entry in entries {
                    if !self.family_id_to_family.contains_key(&entry.family_id()) {
                        return Err(DbError::CorruptDb(format!(
                            "hash {block_hash} references unknown family id {}",
                            entry.family_id()
                        )));
                    }
                    if !self.sample_id_to_sample.contains_key(&entry.sample_id()) {
                        return Err(DbError::CorruptDb(format!(
                            "hash {block_hash} references unknown sample id {}",
                            entry.sample_id()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
