use std::collections::BTreeMap;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sombra_pagelog::config::Config;
use sombra_pagelog::logging::init_logging;
use sombra_pagelog::primitives::io::{FileIo, StdFileIo};
use sombra_pagelog::primitives::wal::OpLogIterator;
use sombra_pagelog::{OperationType, PageOperation};

#[derive(Parser, Debug)]
#[command(
    name = "sombra-oplog",
    version,
    about = "Inspect Sombra page operation logs"
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help = "Config file supplying the expected log salt"
    )]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Expected log salt (overrides --config)")]
    salt: Option<u64>,

    #[arg(
        long,
        global = true,
        env = "SOMBRA_LOG",
        default_value = "warn",
        help = "Tracing filter directive"
    )]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every record in the log
    Dump {
        #[arg(value_name = "LOG")]
        path: PathBuf,
        #[arg(long, help = "Stop after this many records")]
        limit: Option<usize>,
    },
    /// Decode every frame and report the intact prefix
    Verify {
        #[arg(value_name = "LOG")]
        path: PathBuf,
    },
    /// Count records by type
    Stats {
        #[arg(value_name = "LOG")]
        path: PathBuf,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let expected_salt = match (cli.salt, &cli.config) {
        (Some(salt), _) => Some(salt),
        (None, Some(path)) => Some(Config::load(path)?.log.salt),
        (None, None) => None,
    };

    match cli.command {
        Command::Dump { path, limit } => {
            let (_, mut iter) = open_log(&path, expected_salt)?;
            cmd_dump(&mut iter, limit)
        }
        Command::Verify { path } => {
            let (len, mut iter) = open_log(&path, expected_salt)?;
            cmd_verify(&path, len, &mut iter)
        }
        Command::Stats { path } => {
            let (_, mut iter) = open_log(&path, expected_salt)?;
            cmd_stats(&mut iter)
        }
    }
}

fn open_log(
    path: &Path,
    expected_salt: Option<u64>,
) -> Result<(u64, OpLogIterator), Box<dyn Error>> {
    if !path.exists() {
        return Err(format!("log file not found: {}", path.display()).into());
    }
    let io = StdFileIo::open(path)?;
    let len = io.len()?;
    let iter = OpLogIterator::open(Arc::new(io))?;
    if let Some(salt) = expected_salt {
        if iter.salt() != salt {
            return Err(format!("salt mismatch: log has {}, expected {salt}", iter.salt()).into());
        }
    }
    Ok((len, iter))
}

fn print_header(title: &str) {
    println!();
    println!("── {title} {}", "─".repeat(50usize.saturating_sub(title.len())));
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {:.<30} {}", name, value);
}

fn cmd_dump(iter: &mut OpLogIterator, limit: Option<usize>) -> Result<(), Box<dyn Error>> {
    let mut shown = 0usize;
    while let Some(record) = iter.next_record()? {
        if limit.is_some_and(|limit| shown >= limit) {
            break;
        }
        println!("{:>10}  {}", record.lsn, record.op);
        shown += 1;
    }
    Ok(())
}

fn cmd_verify(path: &Path, len: u64, iter: &mut OpLogIterator) -> Result<(), Box<dyn Error>> {
    let mut records = 0u64;
    let mut first = None;
    while let Some(frame) = iter.next_frame()? {
        if let Err(err) = PageOperation::decode(&frame.payload) {
            return Err(format!("record at lsn {} does not decode: {err}", frame.lsn).into());
        }
        first.get_or_insert(frame.lsn);
        records += 1;
    }
    let valid = iter.valid_up_to();

    print_header("VERIFY");
    print_field("Log", path.display());
    print_field("Salt", iter.salt());
    print_field("Start LSN", iter.start_lsn());
    print_field("Records", records);
    if let (Some(first), Some(last)) = (first, iter.last_lsn()) {
        print_field("LSN range", format!("{first}..={last}"));
    }
    print_field("Valid prefix", format!("{valid} of {len} bytes"));
    if valid < len {
        print_field("Torn tail", format!("{} bytes", len - valid));
    } else {
        print_field("Status", "ok");
    }
    Ok(())
}

fn cmd_stats(iter: &mut OpLogIterator) -> Result<(), Box<dyn Error>> {
    let mut by_type: BTreeMap<OperationType, (u64, u64)> = BTreeMap::new();
    let mut total = 0u64;
    while let Some(frame) = iter.next_frame()? {
        let op = PageOperation::decode(&frame.payload)?;
        let entry = by_type.entry(op.operation_type()).or_default();
        entry.0 += 1;
        entry.1 += frame.payload.len() as u64;
        total += 1;
    }

    print_header("RECORDS BY TYPE");
    for ty in OperationType::ALL {
        if let Some((count, bytes)) = by_type.get(&ty) {
            print_field(ty.name(), format!("{count} ({bytes} bytes)"));
        }
    }
    print_field("total", total);
    Ok(())
}
