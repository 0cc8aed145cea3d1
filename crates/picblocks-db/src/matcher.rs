//! Four-view scoring of a blockhash report against the index.
//!
//! Each (hash, size) pair of the input is looked up once per function id
//! listed for it and scored under four views:
//! - direct: every match counts
//! - library-excluded: zeroed whenever any indexed entry for the pair is
//!   flagged as library code
//! - frequency-adjusted: damped by `1 + ⌊log2 N⌋` once N ≥ 3 families
//!   share the pair
//! - unique: only pairs whose indexed entries all belong to one family

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use picblocks_core::BlockhashReport;

use crate::index::{BlockHashIndex, IndexEntry};

/// Scores for one family under the four views, plus its rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilyMatch {
    /// 1-based rank by direct bytescore.
    pub index: usize,
    pub family: String,
    pub direct_bytes: u64,
    pub direct_blocks: u64,
    pub direct_perc: f64,
    pub nonlib_bytes: u64,
    pub nonlib_blocks: u64,
    pub nonlib_perc: f64,
    pub freq_bytes: u64,
    pub freq_blocks: f64,
    pub freq_perc: f64,
    pub uniq_bytes: u64,
    pub uniq_blocks: u64,
    pub uniq_perc: f64,
}

/// Result of matching one blockhash report against the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchReport {
    pub num_families: usize,
    pub num_samples: usize,
    pub num_blockhashes: usize,
    pub bitness: u32,
    pub sha256: String,
    pub input_filename: String,
    pub input_block_bytes: u64,
    pub input_block_hashes: usize,
    /// Bytes of the input that found no indexed (hash, size) pair.
    pub unmatched_score: u64,
    /// Input lookups whose block hash is absent altogether; a miss on
    /// size alone does not count here.
    pub unmatched_blocks: u64,
    pub family_matches: Vec<FamilyMatch>,
}

#[derive(Debug, Default, Clone, Copy)]
struct FamilyScore {
    direct_bytes: u64,
    direct_blocks: u64,
    nonlib_bytes: u64,
    nonlib_blocks: u64,
    adj_bytes: f64,
    adj_blocks: f64,
    uniq_bytes: u64,
    uniq_blocks: u64,
}

impl BlockHashIndex {
    /// Score a report against the index. Pure with respect to the index
    /// and the input; never fails on well-formed reports.
    #[must_use]
    pub fn match_blockhashes(&self, report: &BlockhashReport) -> MatchReport {
        self.match_with_samples(report).0
    }

    /// Like [`match_blockhashes`](Self::match_blockhashes), but also
    /// returns the per-sample byte scores, which statistics tooling uses
    /// and the match report deliberately omits.
    #[must_use]
    pub fn match_with_samples(
        &self,
        report: &BlockhashReport,
    ) -> (MatchReport, BTreeMap<u32, u64>) {
        // First-touch order decides how ties rank later.
        let mut positions: BTreeMap<u32, usize> = BTreeMap::new();
        let mut touched: Vec<u32> = Vec::new();
        let mut scores: Vec<FamilyScore> = Vec::new();
        let mut sample_matches: BTreeMap<u32, u64> = BTreeMap::new();
        let mut unmatched_score = 0u64;
        let mut unmatched_blocks = 0u64;

        for (block_hash, by_size) in &report.blockhashes {
            let indexed_hash = self.blockhashes.get(block_hash);
            for (&size, fids) in by_size {
                let indexed_entries = indexed_hash.and_then(|sizes| sizes.get(&size));
                for _fid in fids {
                    let Some(entries) = indexed_entries else {
                        unmatched_score += u64::from(size);
                        if indexed_hash.is_none() {
                            unmatched_blocks += 1;
                        }
                        continue;
                    };
                    let families: BTreeSet<u32> =
                        entries.iter().map(IndexEntry::family_id).collect();
                    let has_library = entries.iter().any(IndexEntry::is_library);
                    let adjustment = frequency_adjustment(families.len());
                    let unique = families.len() == 1;
                    let mut seen_families: BTreeSet<u32> = BTreeSet::new();
                    let mut seen_samples: BTreeSet<u32> = BTreeSet::new();
                    for entry in entries {
                        let family_id = entry.family_id();
                        if seen_families.insert(family_id) {
                            let position = match positions.get(&family_id) {
                                Some(&position) => position,
                                None => {
                                    positions.insert(family_id, scores.len());
                                    touched.push(family_id);
                                    scores.push(FamilyScore::default());
                                    scores.len() - 1
                                }
                            };
                            let score = &mut scores[position];
                            score.direct_bytes += u64::from(size);
                            score.direct_blocks += 1;
                            if !has_library {
                                score.nonlib_bytes += u64::from(size);
                                score.nonlib_blocks += 1;
                                score.adj_bytes += f64::from(size) / adjustment;
                                score.adj_blocks += 1.0 / adjustment;
                                if unique {
                                    score.uniq_bytes += u64::from(size);
                                    score.uniq_blocks += 1;
                                }
                            }
                        }
                        if seen_samples.insert(entry.sample_id()) {
                            *sample_matches.entry(entry.sample_id()).or_default() +=
                                u64::from(size);
                        }
                    }
                }
            }
        }

        let block_bytes = report.block_bytes;
        let percentage = |bytes: f64| {
            if block_bytes == 0 {
                0.0
            } else {
                100.0 * bytes / block_bytes as f64
            }
        };

        let mut ranked: Vec<usize> = (0..scores.len()).collect();
        ranked.sort_by(|&a, &b| scores[b].direct_bytes.cmp(&scores[a].direct_bytes));

        let family_matches = ranked
            .iter()
            .enumerate()
            .map(|(rank, &position)| {
                let score = &scores[position];
                let family = self
                    .family_name(touched[position])
                    .unwrap_or_default()
                    .to_string();
                FamilyMatch {
                    index: rank + 1,
                    family,
                    direct_bytes: score.direct_bytes,
                    direct_blocks: score.direct_blocks,
                    direct_perc: percentage(score.direct_bytes as f64),
                    nonlib_bytes: score.nonlib_bytes,
                    nonlib_blocks: score.nonlib_blocks,
                    nonlib_perc: percentage(score.nonlib_bytes as f64),
                    freq_bytes: score.adj_bytes as u64,
                    freq_blocks: score.adj_blocks,
                    freq_perc: percentage(score.adj_bytes),
                    uniq_bytes: score.uniq_bytes,
                    uniq_blocks: score.uniq_blocks,
                    uniq_perc: percentage(score.uniq_bytes as f64),
                }
            })
            .collect();

        let match_report = MatchReport {
            num_families: self.num_families(),
            num_samples: self.num_samples(),
            num_blockhashes: self.num_blockhashes(),
            bitness: report.bitness,
            sha256: report.sha256.clone(),
            input_filename: report.filename.clone(),
            input_block_bytes: report.block_bytes,
            input_block_hashes: report.blockhashes.len(),
            unmatched_score,
            unmatched_blocks,
            family_matches,
        };
        (match_report, sample_matches)
    }
}

/// Damping divisor: 1 below three sharing families, else `1 + ⌊log2 N⌋`
/// computed over integers to keep N = 8 at exactly 4.
fn frequency_adjustment(num_families: usize) -> f64 {
    if num_families < 3 {
        1.0
    } else {
        f64::from(1 + (num_families as u32).ilog2())
    }
}
