use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use reftable::block_source::FileBlockSource;
use reftable::options::WriteOptions;
use reftable::reader::Reader;
use reftable::stack::Stack;

#[derive(Parser)]
#[command(name = "reftable-dump", version = "1.0.0", about = "Inspect and maintain reftable files and stacks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump every ref and log record in a single table file
    Dump {
        #[arg(short = 't', long = "table")]
        table: PathBuf,
    },
    /// List the tables currently in a stack directory's manifest
    StackList {
        dir: PathBuf,
    },
    /// Merge every table in a stack directory into one
    StackCompact {
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Dump { table } => dump_table(&table),
        Commands::StackList { dir } => stack_list(&dir),
        Commands::StackCompact { dir } => stack_compact(&dir),
    };

    match result {
        Ok(()) => ExitCode::from(0),
        Err(CliError::Engine(e)) => {
            eprintln!("reftable-dump: {e}");
            ExitCode::from(1)
        }
        Err(CliError::Usage(msg)) => {
            eprintln!("reftable-dump: {msg}");
            ExitCode::from(2)
        }
    }
}

enum CliError {
    Engine(reftable::Error),
    Usage(String),
}

impl From<reftable::Error> for CliError {
    fn from(e: reftable::Error) -> Self {
        CliError::Engine(e)
    }
}

/// Mirrors `dump_table`'s two-pass ref-then-log scan of a single table.
fn dump_table(path: &PathBuf) -> Result<(), CliError> {
    if !path.is_file() {
        return Err(CliError::Usage(format!("not a file: {}", path.display())));
    }
    let src = FileBlockSource::open(path)?;
    let reader = Reader::open(Box::new(src))?;

    let mut refs = reader.seek_ref("")?;
    while let Some(rec) = refs.next_ref()? {
        println!("ref {{{}}} update_index {} {:?}", rec.ref_name, rec.update_index, rec.value);
    }

    let mut logs = reader.seek_log("")?;
    while let Some(rec) = logs.next_log()? {
        println!(
            "log {{{}}} update_index {} {} <{}> {}",
            rec.ref_name, rec.update_index, rec.name, rec.email, rec.message
        );
    }

    Ok(())
}

fn stack_list(dir: &PathBuf) -> Result<(), CliError> {
    let stack = Stack::open(dir, WriteOptions::default())?;
    println!("next_update_index: {}", stack.next_update_index());
    Ok(())
}

fn stack_compact(dir: &PathBuf) -> Result<(), CliError> {
    let mut stack = Stack::open(dir, WriteOptions::default())?;
    stack.compact_all()?;
    println!("compacted {}", dir.display());
    Ok(())
}
