//! Plain-text rendering of match reports.

use std::fmt::Write;

use picblocks_db::MatchReport;

/// Ranked family table. Shows the top `limit` rows plus every family
/// below the cutoff that still has unique matches.
#[must_use]
pub fn family_table(report: &MatchReport, limit: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "input: {} ({} hashes, {} bytes)",
        report.input_filename, report.input_block_hashes, report.input_block_bytes
    );
    let _ = writeln!(
        out,
        "unmatched: {} blocks, {} bytes",
        report.unmatched_blocks, report.unmatched_score
    );
    let rule = "-".repeat(88);
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(
        out,
        "{:>4}  {:>30} | {:>9} | {:>6} | {:>6} | {:>6} | {:>6}",
        "#", "family", "bytescore", "%", "nolib%", "adj%", "uniq%"
    );
    for entry in &report.family_matches {
        if entry.index > limit && entry.uniq_bytes == 0 {
            continue;
        }
        let _ = writeln!(
            out,
            "{:>4}  {:>30} | {:>9} | {:>6.2} | {:>6.2} | {:>6.2} | {:>6.2}",
            entry.index,
            entry.family,
            entry.direct_bytes,
            entry.direct_perc,
            entry.nonlib_perc,
            entry.freq_perc,
            entry.uniq_perc
        );
    }
    let _ = writeln!(out, "{rule}");
    out
}
