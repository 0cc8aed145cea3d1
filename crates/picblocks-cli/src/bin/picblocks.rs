//! CLI entrypoint for the picblocks toolchain.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use parking_lot::Mutex;

use picblocks_cli::CliError;
use picblocks_cli::corpus::{self, CorpusConfig};
use picblocks_cli::render;
use picblocks_cli::structured_log::{LogEmitter, LogEntry, LogLevel};
use picblocks_core::{BlockHasher, BlockhashReport, DEFAULT_MIN_BLOCK_SIZE, DisasmReport, ReportError};
use picblocks_db::BlockHashIndex;

/// Code-similarity attribution of binaries against a malware corpus.
#[derive(Debug, Parser)]
#[command(name = "picblocks")]
#[command(about = "Position-independent block hashing and family matching")]
struct Cli {
    /// Write JSONL logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Hash one disassembly report into a .blocks file.
    Hash {
        /// Disassembly report (JSON) to hash.
        input: PathBuf,
        /// Output directory for the .blocks file.
        #[arg(long, default_value = ".")]
        output: PathBuf,
        /// Minimum instruction count for a block to be hashed.
        #[arg(long, default_value_t = DEFAULT_MIN_BLOCK_SIZE)]
        min_block_size: usize,
    },
    /// Aggregate .blocks reports into a new database.
    Build {
        /// Directory containing .blocks files.
        blocks_dir: PathBuf,
        /// Database output path.
        #[arg(long, default_value = "db/picblocksdb.json")]
        db: PathBuf,
    },
    /// Match a target against the database, building it first if needed.
    Match {
        /// Directory containing .blocks files (used when no cached
        /// database exists yet).
        blocks_dir: PathBuf,
        /// Target to attribute: a disassembly report (JSON) or a
        /// pre-hashed .blocks file.
        target: PathBuf,
        /// Database path.
        #[arg(long, default_value = "db/picblocksdb.json")]
        db: PathBuf,
        /// Write the full match report JSON here.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print statistics for a database.
    Stats {
        /// Database path.
        #[arg(long, default_value = "db/picblocksdb.json")]
        db: PathBuf,
    },
    /// Hash a corpus tree of disassembly reports and aggregate it into a
    /// database.
    Corpus {
        /// Corpus root; family and version labels come from the layout
        /// <root>/<family>/[<version>/]<sample>.
        root: PathBuf,
        /// Directory for the per-sample .blocks reports.
        #[arg(long, default_value = "block-reports")]
        reports: PathBuf,
        /// Database output path.
        #[arg(long, default_value = "db/picblocksdb.json")]
        db: PathBuf,
        /// Worker threads (defaults to available cores minus two).
        #[arg(long)]
        jobs: Option<usize>,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    let emitter = match &cli.log_file {
        Some(path) => LogEmitter::file(path),
        None => Ok(LogEmitter::stderr()),
    };
    let emitter = match emitter {
        Ok(emitter) => Mutex::new(emitter),
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(1);
        }
    };
    match dispatch(cli.command, &emitter) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

fn dispatch(command: Command, emitter: &Mutex<LogEmitter>) -> Result<(), CliError> {
    match command {
        Command::Hash {
            input,
            output,
            min_block_size,
        } => run_hash(&input, &output, min_block_size),
        Command::Build { blocks_dir, db } => run_build(&blocks_dir, &db, emitter),
        Command::Match {
            blocks_dir,
            target,
            db,
            output,
        } => run_match(&blocks_dir, &target, &db, output.as_deref(), emitter),
        Command::Stats { db } => run_stats(&db),
        Command::Corpus {
            root,
            reports,
            db,
            jobs,
        } => run_corpus(&root, &reports, &db, jobs, emitter),
    }
}

fn run_hash(input: &Path, output: &Path, min_block_size: usize) -> Result<(), CliError> {
    let mut disasm = DisasmReport::from_file(input)?;
    if disasm.filename.is_empty() {
        disasm.filename = file_name(input);
    }
    let report = BlockHasher::with_min_block_size(min_block_size).process_disasm(&disasm)?;
    std::fs::create_dir_all(output)?;
    let path = output.join(format!("{}.blocks", file_name(input)));
    report.write_file(&path)?;
    println!(
        "#> hashed {}: {} hashes covering {} bytes.",
        input.display(),
        report.num_hashes,
        report.block_bytes
    );
    println!("wrote {}", path.display());
    Ok(())
}

fn run_build(blocks_dir: &Path, db_path: &Path, emitter: &Mutex<LogEmitter>) -> Result<(), CliError> {
    let (mut index, ingested, failed) = corpus::aggregate_reports(blocks_dir, emitter)?;
    index.save(db_path)?;
    let _ = emitter.lock().emit(
        &LogEntry::new(LogLevel::Info, "db_saved").with_details(db_path.display().to_string()),
    );
    println!(
        "aggregated {ingested} reports ({failed} rejected) into {}",
        db_path.display()
    );
    Ok(())
}

fn run_match(
    blocks_dir: &Path,
    target: &Path,
    db_path: &Path,
    output: Option<&Path>,
    emitter: &Mutex<LogEmitter>,
) -> Result<(), CliError> {
    let index = corpus::ensure_db(blocks_dir, db_path, emitter)?;
    let report = load_target(target)?;
    if report.block_bytes == 0 {
        return Err(CliError::Usage(format!(
            "{} contains no hashable blocks",
            target.display()
        )));
    }
    println!(
        "#> hashed input file: {} hashes covering {} bytes.",
        report.num_hashes, report.block_bytes
    );
    let matched = index.match_blockhashes(&report);
    print!("{}", render::family_table(&matched, 20));
    let _ = emitter.lock().emit(
        &LogEntry::new(LogLevel::Info, "match_completed")
            .with_sample(report.filename.clone())
            .with_details(format!("{} family matches", matched.family_matches.len())),
    );
    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&matched).map_err(ReportError::Json)?;
        std::fs::write(path, json)?;
        println!("wrote {}", path.display());
    }
    Ok(())
}

fn run_stats(db_path: &Path) -> Result<(), CliError> {
    let index = BlockHashIndex::load(db_path)?;
    let stats = index.stats();
    let json = serde_json::to_string_pretty(&stats).map_err(ReportError::Json)?;
    println!("{json}");
    Ok(())
}

fn run_corpus(
    root: &Path,
    reports: &Path,
    db_path: &Path,
    jobs: Option<usize>,
    emitter: &Mutex<LogEmitter>,
) -> Result<(), CliError> {
    let config = CorpusConfig {
        root: root.to_path_buf(),
        reports_dir: reports.to_path_buf(),
        db_path: db_path.to_path_buf(),
        jobs: jobs.unwrap_or_else(corpus::default_jobs),
    };
    let summary = corpus::run(&config, emitter)?;
    println!(
        "hashed {} samples ({} skipped, {} failed), ingested {} reports into {}",
        summary.hashed,
        summary.skipped,
        summary.failed,
        summary.ingested,
        db_path.display()
    );
    Ok(())
}

/// The target is either a pre-hashed .blocks report or a disassembly
/// report that still needs hashing.
fn load_target(target: &Path) -> Result<BlockhashReport, CliError> {
    let is_blocks = target
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext == "blocks");
    if is_blocks {
        return Ok(BlockhashReport::from_file(target)?);
    }
    let mut disasm = DisasmReport::from_file(target)?;
    if disasm.filename.is_empty() {
        disasm.filename = file_name(target);
    }
    Ok(BlockHasher::new().process_disasm(&disasm)?)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
