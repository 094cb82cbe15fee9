//! Command-line argument parsing.

use std::path::PathBuf;
use storyloom_core::BatchOperation;

/// What the user asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Batch analyze, rewrite or polish a range of chapters.
    Batch(BatchOperation),
    /// Write one chapter through the hybrid flow.
    Write,
    /// Check planned text against memory without writing.
    Check,
    /// Project the cost of a whole manuscript.
    Estimate,
    /// Dump the seeded memory as JSON.
    Export,
    Help,
}

impl Command {
    fn parse(s: &str) -> Option<Self> {
        if let Some(op) = BatchOperation::parse(s) {
            return Some(Self::Batch(op));
        }
        match s.to_lowercase().as_str() {
            "write" => Some(Self::Write),
            "check" => Some(Self::Check),
            "estimate" => Some(Self::Estimate),
            "export" => Some(Self::Export),
            "help" | "--help" | "-h" => Some(Self::Help),
            _ => None,
        }
    }
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq)]
pub struct CliConfig {
    pub command: Command,
    pub project: Option<PathBuf>,
    /// Memory export to restore before running.
    pub memory: Option<PathBuf>,
    /// Where to save memory after running.
    pub save_memory: Option<PathBuf>,
    /// Output file for prose, the rewritten project or an export.
    pub output: Option<PathBuf>,
    pub chapter: u32,
    pub start: u32,
    pub end: Option<u32>,
    pub batch_size: Option<usize>,
    pub instruction: Option<String>,
    pub words: Option<u32>,
    pub chapters: Option<u32>,
    pub auto_fix: bool,
    pub double_check: bool,
    pub sampled: bool,
    pub json: bool,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            command: Command::Help,
            project: None,
            memory: None,
            save_memory: None,
            output: None,
            chapter: 1,
            start: 1,
            end: None,
            batch_size: None,
            instruction: None,
            words: None,
            chapters: None,
            auto_fix: false,
            double_check: false,
            sampled: false,
            json: false,
        }
    }
}

/// Parse `storyloom <command> [--flag value ...]`.
///
/// Unknown flags are ignored; unparseable numbers keep their defaults.
pub fn parse_args(args: &[String]) -> Result<CliConfig, String> {
    let mut config = CliConfig::default();

    let Some(command) = args.get(1) else {
        return Ok(config);
    };
    config.command = Command::parse(command).ok_or_else(|| format!("Unknown command: {command}"))?;

    let mut i = 2;
    while i < args.len() {
        let value = args.get(i + 1);
        let mut takes_value = true;
        match args[i].as_str() {
            "--project" | "-p" => config.project = value.map(PathBuf::from),
            "--memory" => config.memory = value.map(PathBuf::from),
            "--save-memory" => config.save_memory = value.map(PathBuf::from),
            "--output" | "-o" => config.output = value.map(PathBuf::from),
            "--chapter" | "-c" => {
                if let Some(n) = value.and_then(|v| v.parse().ok()) {
                    config.chapter = n;
                }
            }
            "--start" => {
                if let Some(n) = value.and_then(|v| v.parse().ok()) {
                    config.start = n;
                }
            }
            "--end" => config.end = value.and_then(|v| v.parse().ok()),
            "--batch-size" => config.batch_size = value.and_then(|v| v.parse().ok()),
            "--instruction" | "-i" => config.instruction = value.cloned(),
            "--words" => config.words = value.and_then(|v| v.parse().ok()),
            "--chapters" => config.chapters = value.and_then(|v| v.parse().ok()),
            "--auto-fix" => {
                config.auto_fix = true;
                takes_value = false;
            }
            "--double-check" => {
                config.double_check = true;
                takes_value = false;
            }
            "--sampled" => {
                config.sampled = true;
                takes_value = false;
            }
            "--json" => {
                config.json = true;
                takes_value = false;
            }
            "--help" | "-h" => {
                config.command = Command::Help;
                takes_value = false;
            }
            _ => takes_value = false,
        }
        i += if takes_value { 2 } else { 1 };
    }

    Ok(config)
}

pub fn print_help() {
    println!("storyloom - continuity-aware novel writing");
    println!();
    println!("USAGE:");
    println!("    storyloom <COMMAND> --project <FILE> [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    analyze     Analyze chapters in batches for cross-chapter problems");
    println!("    rewrite     Analyze, then rewrite flagged chapters");
    println!("    polish      Analyze, then polish flagged chapters");
    println!("    write       Write one chapter (--chapter, --instruction)");
    println!("    check       Check --instruction text against story memory");
    println!("    estimate    Project the cost of writing the whole manuscript");
    println!("    export      Print or save the story memory as JSON");
    println!();
    println!("OPTIONS:");
    println!("    -p, --project <FILE>      Project JSON file");
    println!("        --memory <FILE>       Restore a memory export before running");
    println!("        --save-memory <FILE>  Save the memory export afterwards");
    println!("    -o, --output <FILE>       Write results here instead of stdout");
    println!("    -c, --chapter <N>         Chapter to write or check (default 1)");
    println!("        --start <N>           First chapter of a batch run (default 1)");
    println!("        --end <N>             Last chapter of a batch run");
    println!("        --batch-size <N>      Chapters per batch (default 5)");
    println!("    -i, --instruction <TEXT>  What the chapter should do");
    println!("        --words <N>           Target chapter length");
    println!("        --chapters <N>        Chapter count for estimate");
    println!("        --auto-fix            Fold continuity fixes into the instruction");
    println!("        --double-check        Audit the written chapter afterwards");
    println!("        --sampled             Skip checks the cost optimizer deems unnecessary");
    println!("        --json                Print results as JSON");
    println!();
    println!("ENVIRONMENT:");
    println!("    ANTHROPIC_API_KEY   Required for oracle calls (a .env file is read)");
    println!("    RUST_LOG            Log filter, e.g. storyloom_core=debug");
}
