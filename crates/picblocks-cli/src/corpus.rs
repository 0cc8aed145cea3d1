//! Batch corpus processing: walk a tree of disassembly reports, hash
//! each in a worker pool, then aggregate everything into one database.
//!
//! Hashing is embarrassingly parallel per sample; aggregation stays
//! single-writer. Workers drain a shared queue and the main thread
//! ingests the finished `.blocks` reports in lexicographic order, so
//! family and sample ids come out reproducible for a given tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;

use parking_lot::Mutex;

use picblocks_core::{BlockHasher, DisasmReport};
use picblocks_db::BlockHashIndex;

use crate::error::CliError;
use crate::structured_log::{LogEmitter, LogEntry, LogLevel};

/// One file queued for hashing, with labels derived from the tree layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusJob {
    pub path: PathBuf,
    pub family: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct CorpusConfig {
    pub root: PathBuf,
    pub reports_dir: PathBuf,
    pub db_path: PathBuf,
    pub jobs: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CorpusSummary {
    pub hashed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub ingested: usize,
}

/// Worker count when the caller does not pin one: all cores but two.
#[must_use]
pub fn default_jobs() -> usize {
    thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        .saturating_sub(2)
        .max(1)
}

/// Collect hashable disassembly reports under `root`, sorted by path for
/// reproducible downstream id assignment.
pub fn collect_jobs(root: &Path) -> io::Result<Vec<CorpusJob>> {
    let mut jobs = Vec::new();
    walk(root, root, &mut jobs)?;
    jobs.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(jobs)
}

fn walk(root: &Path, dir: &Path, jobs: &mut Vec<CorpusJob>) -> io::Result<()> {
    let mut entries: Vec<fs::DirEntry> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    entries.sort_by_key(fs::DirEntry::path);
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            if path.file_name().is_some_and(|name| name == ".git") {
                continue;
            }
            walk(root, &path, jobs)?;
        } else if is_disasm_report(&path) {
            let (family, version) = labels_from_layout(root, &path);
            jobs.push(CorpusJob {
                path,
                family,
                version,
            });
        }
    }
    Ok(())
}

fn is_disasm_report(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("json" | "smda")
    )
}

/// Family is the first directory under the corpus root; version is the
/// innermost directory between family and file (empty when flat).
#[must_use]
pub fn labels_from_layout(root: &Path, path: &Path) -> (String, String) {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let dirs: Vec<String> = relative
        .parent()
        .map(|parent| {
            parent
                .components()
                .map(|component| component.as_os_str().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    let family = dirs.first().cloned().unwrap_or_default();
    let version = if dirs.len() >= 2 {
        dirs.last().cloned().unwrap_or_default()
    } else {
        String::new()
    };
    (family, version)
}

/// Path of the `.blocks` report written for a corpus file.
#[must_use]
pub fn blocks_output_path(reports_dir: &Path, source: &Path) -> PathBuf {
    let name = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    reports_dir.join(format!("{name}.blocks"))
}

/// Hash every corpus file into `reports_dir`, then aggregate all reports
/// into a database at `db_path`.
pub fn run(config: &CorpusConfig, emitter: &Mutex<LogEmitter>) -> Result<CorpusSummary, CliError> {
    fs::create_dir_all(&config.reports_dir)?;
    let jobs = collect_jobs(&config.root)?;
    let queue: Mutex<Vec<CorpusJob>> = Mutex::new(jobs);
    let summary: Mutex<CorpusSummary> = Mutex::new(CorpusSummary::default());
    let workers = config.jobs.max(1);

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                let hasher = BlockHasher::new();
                loop {
                    let job = queue.lock().pop();
                    let Some(job) = job else { break };
                    let output = blocks_output_path(&config.reports_dir, &job.path);
                    if output.exists() {
                        summary.lock().skipped += 1;
                        let _ = emitter.lock().emit(
                            &LogEntry::new(LogLevel::Debug, "sample_skipped")
                                .with_sample(job.path.display().to_string()),
                        );
                        continue;
                    }
                    match hash_one(&hasher, &job, &output) {
                        Ok(()) => {
                            summary.lock().hashed += 1;
                            let _ = emitter.lock().emit(
                                &LogEntry::new(LogLevel::Info, "sample_hashed")
                                    .with_sample(job.path.display().to_string())
                                    .with_family(job.family.clone()),
                            );
                        }
                        Err(err) => {
                            // Failed samples are logged and skipped, never
                            // retried.
                            summary.lock().failed += 1;
                            let _ = emitter.lock().emit(
                                &LogEntry::new(LogLevel::Error, "sample_failed")
                                    .with_sample(job.path.display().to_string())
                                    .with_details(err.to_string()),
                            );
                        }
                    }
                }
            });
        }
    });

    let (mut index, ingested, _failed) = aggregate_reports(&config.reports_dir, emitter)?;
    index.save(&config.db_path)?;
    let _ = emitter.lock().emit(
        &LogEntry::new(LogLevel::Info, "db_saved")
            .with_details(config.db_path.display().to_string()),
    );

    let mut summary = summary.into_inner();
    summary.ingested = ingested;
    Ok(summary)
}

fn hash_one(hasher: &BlockHasher, job: &CorpusJob, output: &Path) -> Result<(), CliError> {
    let mut disasm = DisasmReport::from_file(&job.path)?;
    if !job.family.is_empty() {
        disasm.family = job.family.clone();
    }
    if !job.version.is_empty() {
        disasm.version = job.version.clone();
    }
    disasm.filename = job
        .path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let report = hasher.process_disasm(&disasm)?;
    report.write_file(output)?;
    Ok(())
}

/// Ingest every `*.blocks` file under `dir` (lexicographic order) into a
/// fresh index. Malformed reports are logged and skipped; the count of
/// failures comes back alongside the ingested count.
pub fn aggregate_reports(
    dir: &Path,
    emitter: &Mutex<LogEmitter>,
) -> Result<(BlockHashIndex, usize, usize), CliError> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .collect::<io::Result<Vec<_>>>()?
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "blocks")
        })
        .collect();
    paths.sort();

    let mut index = BlockHashIndex::new();
    let mut ingested = 0usize;
    let mut failed = 0usize;
    for path in paths {
        match index.ingest_report_file(&path) {
            Ok(_) => ingested += 1,
            Err(err) => {
                failed += 1;
                let _ = emitter.lock().emit(
                    &LogEntry::new(LogLevel::Error, "report_rejected")
                        .with_sample(path.display().to_string())
                        .with_details(err.to_string()),
                );
            }
        }
    }
    Ok((index, ingested, failed))
}

/// Load the cached database if it exists, otherwise aggregate
/// `blocks_dir` and save the result to `db_path`.
pub fn ensure_db(
    blocks_dir: &Path,
    db_path: &Path,
    emitter: &Mutex<LogEmitter>,
) -> Result<BlockHashIndex, CliError> {
    if db_path.exists() {
        let index = BlockHashIndex::load(db_path)?;
        let _ = emitter.lock().emit(
            &LogEntry::new(LogLevel::Info, "db_loaded")
                .with_details(db_path.display().to_string()),
        );
        return Ok(index);
    }
    let (mut index, _, _) = aggregate_reports(blocks_dir, emitter)?;
    index.save(db_path)?;
    let _ = emitter.lock().emit(
        &LogEntry::new(LogLevel::Info, "db_saved").with_details(db_path.display().to_string()),
    );
    Ok(index)
}
