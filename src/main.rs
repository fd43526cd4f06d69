use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Local};
use clap::{Parser, Subcommand};
use colored::*;
use miette::{Context, IntoDiagnostic, Result};
use tracing_subscriber::EnvFilter;

use slottable::{
    data_path, meta_path, DeleteMode, Error, Generation, InsertMode, NumTable, OpenMode, StrTable,
    TableOptions,
};

#[derive(Parser, Debug)]
#[command(name = "slottable", version, about, long_about = None)]
struct Cli {
    /// Base path of the table files (defaults to $HOME/.slottable/db)
    #[arg(global = true, short, long)]
    db: Option<PathBuf>,

    /// Address the integer keyed table; keys must parse as u32
    #[arg(global = true, short, long)]
    num: bool,

    /// Keep data and index files resident in RAM while working
    #[arg(global = true, long)]
    ram: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Insert or overwrite a key-value pair
    #[command(alias = "p")]
    Put { key: String, value: String },

    /// Insert a key-value pair only if the key is absent
    Add { key: String, value: String },

    /// Overwrite the value of an existing key
    #[command(alias = "u")]
    Update { key: String, value: String },

    /// Get a value by key
    #[command(alias = "g")]
    Get { key: String },

    /// Check whether a key exists
    Probe { key: String },

    /// Remove a key-value pair
    #[command(alias = "remove")]
    Rm {
        key: String,
        /// Fail if the key does not exist
        #[arg(long)]
        strict: bool,
    },

    /// Print every live entry
    #[command(alias = "ls")]
    List,

    /// Drop deleted records and rewrite the table into the other generation
    Optimize,

    /// Show counters and file sizes
    Stats,

    /// Scan the index for inconsistencies
    Check,
}

impl Command {
    fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::Put { .. }
                | Self::Add { .. }
                | Self::Update { .. }
                | Self::Rm { .. }
                | Self::Optimize
        )
    }
}

/// Either table flavour behind one set of CLI operations.
enum Table {
    Str(StrTable),
    Num(NumTable),
}

impl Table {
    fn open(path: &Path, num: bool, options: &TableOptions) -> slottable::Result<Self> {
        if num {
            options.open_num(path).map(Self::Num)
        } else {
            options.open_str(path).map(Self::Str)
        }
    }

    fn insert(&mut self, key: &str, value: &str, mode: InsertMode) -> Result<()> {
        let result = match self {
            Self::Str(table) => table.insert(key.as_bytes(), value.as_bytes(), mode),
            Self::Num(table) => table.insert(parse_index(key)?, value.as_bytes(), mode),
        };
        result.into_diagnostic()
    }

    fn get(&mut self, key: &str) -> Result<Option<String>> {
        let found = match self {
            Self::Str(table) => table.read(key.as_bytes()).map(lossy),
            Self::Num(table) => table.read(parse_index(key)?).map(lossy),
        };
        match found {
            Ok(value) => Ok(Some(value)),
            Err(Error::KeyNotExists) => Ok(None),
            Err(err) => Err(err).into_diagnostic(),
        }
    }

    fn contains(&mut self, key: &str) -> Result<bool> {
        let result = match self {
            Self::Str(table) => table.contains(key.as_bytes()),
            Self::Num(table) => table.contains(parse_index(key)?),
        };
        result.into_diagnostic()
    }

    fn delete(&mut self, key: &str, mode: DeleteMode) -> Result<()> {
        let result = match self {
            Self::Str(table) => table.delete(key.as_bytes(), mode),
            Self::Num(table) => table.delete(parse_index(key)?, mode),
        };
        result.into_diagnostic()
    }

    fn list(&mut self) -> slottable::Result<Vec<(String, String)>> {
        let mut entries = Vec::new();
        match self {
            Self::Str(table) => {
                table.for_each(|key, value| entries.push((lossy(key), lossy(value))))?
            }
            Self::Num(table) => {
                table.for_each(|index, value| entries.push((index.to_string(), lossy(value))))?
            }
        }
        Ok(entries)
    }

    fn optimize(&mut self) -> slottable::Result<()> {
        match self {
            Self::Str(table) => table.optimize(),
            Self::Num(table) => table.optimize(),
        }
    }

    fn check(&mut self) -> slottable::Result<slottable::CheckReport> {
        match self {
            Self::Str(table) => table.check(),
            Self::Num(table) => table.check(),
        }
    }

    fn stats(&self) -> slottable::Result<Stats> {
        Ok(match self {
            Self::Str(table) => Stats {
                count: table.count()?,
                delcount: Some(table.delcount()?),
                table_size: table.table_size()?,
                file_size: table.file_size()?,
                used_size: table.used_size()?,
                generation: table.generation()?,
            },
            Self::Num(table) => Stats {
                count: table.count()?,
                delcount: None,
                table_size: table.table_size()?,
                file_size: table.file_size()?,
                used_size: table.used_size()?,
                generation: table.generation()?,
            },
        })
    }

    fn close(&mut self) -> slottable::Result<()> {
        match self {
            Self::Str(table) => table.close(),
            Self::Num(table) => table.close(),
        }
    }
}

struct Stats {
    count: u32,
    delcount: Option<u32>,
    table_size: u32,
    file_size: u64,
    used_size: u32,
    generation: Generation,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let db_path = cli.db.unwrap_or_else(default_db_path);
    let mut table = open_table(&db_path, cli.num, cli.ram, cli.command.is_mutation())?;

    match cli.command {
        Command::Put { key, value } => {
            table
                .insert(&key, &value, InsertMode::Always)
                .wrap_err_with(|| format!("failed to put key={key}"))?;
            success(&format!("put: {key} = {value}"));
        }
        Command::Add { key, value } => {
            table
                .insert(&key, &value, InsertMode::OnlyIfAbsent)
                .wrap_err_with(|| format!("failed to add key={key}"))?;
            success(&format!("add: {key} = {value}"));
        }
        Command::Update { key, value } => {
            table
                .insert(&key, &value, InsertMode::OnlyIfExisting)
                .wrap_err_with(|| format!("failed to update key={key}"))?;
            success(&format!("update: {key} = {value}"));
        }
        Command::Get { key } => match table
            .get(&key)
            .wrap_err_with(|| format!("failed to get key={key}"))?
        {
            Some(value) => info(&format!("{key} = {value}")),
            None => warn(&format!("key not found: {key}")),
        },
        Command::Probe { key } => {
            if table
                .contains(&key)
                .wrap_err_with(|| format!("failed to probe key={key}"))?
            {
                info(&format!("present: {key}"));
            } else {
                warn(&format!("key not found: {key}"));
            }
        }
        Command::Rm { key, strict } => {
            let mode = if strict {
                DeleteMode::OnlyIfExisting
            } else {
                DeleteMode::Always
            };
            table
                .delete(&key, mode)
                .wrap_err_with(|| format!("failed to remove key={key}"))?;
            success(&format!("removed: {key}"));
        }
        Command::List => {
            let entries = table
                .list()
                .into_diagnostic()
                .wrap_err("failed to list entries")?;
            if entries.is_empty() {
                warn("table is empty");
            }
            for (key, value) in entries {
                info(&format!("{key} = {value}"));
            }
        }
        Command::Optimize => {
            let before = table.stats().into_diagnostic()?.file_size;
            table
                .optimize()
                .into_diagnostic()
                .wrap_err("failed to optimize table")?;
            let after = table.stats().into_diagnostic()?.file_size;
            success(&format!("optimized: {before} -> {after} bytes"));
        }
        Command::Stats => {
            let stats = table
                .stats()
                .into_diagnostic()
                .wrap_err("failed to read table stats")?;
            print_stats(&db_path, &stats);
        }
        Command::Check => {
            let report = table
                .check()
                .into_diagnostic()
                .wrap_err_with(|| format!("table at {:?} is inconsistent", db_path))?;
            success(&format!(
                "ok: {} live, {} tombstones, {} empty, records end at {}",
                report.live, report.tombstones, report.empty, report.data_end
            ));
        }
    }

    table
        .close()
        .into_diagnostic()
        .wrap_err("failed to close table")?;

    Ok(())
}

/// Opens the table, creating it on first mutation.
fn open_table(path: &Path, num: bool, ram: bool, writable: bool) -> Result<Table> {
    let options = TableOptions::new()
        .mode(if writable {
            OpenMode::ReadWrite
        } else {
            OpenMode::Read
        })
        .ram_data(ram)
        .ram_meta(ram);

    let opened = match Table::open(path, num, &options) {
        Err(Error::Open { .. }) if writable && !exists(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .into_diagnostic()
                    .wrap_err_with(|| format!("could not create directory {:?}", parent))?;
            }
            info(&format!("creating table at {:?}", path));
            Table::open(path, num, &options.clone().mode(OpenMode::Create))
        }
        other => other,
    };
    opened
        .into_diagnostic()
        .wrap_err_with(|| format!("could not open table at {:?}", path))
}

/// True when any generation of the table has an index file.
fn exists(path: &Path) -> bool {
    Generation::BOTH
        .into_iter()
        .any(|generation| meta_path(path, generation).exists())
}

fn print_stats(path: &Path, stats: &Stats) {
    let data = data_path(path, stats.generation);
    info(&format!("data file: {}", data.display()));
    info(&format!("entries: {}", stats.count));
    if let Some(delcount) = stats.delcount {
        info(&format!("tombstones: {delcount}"));
    }
    info(&format!("index cells: {}", stats.table_size));
    info(&format!("data size: {} bytes", stats.file_size));
    info(&format!("live payload: {} bytes", stats.used_size));
    if let Ok(modified) = fs::metadata(&data).and_then(|meta| meta.modified()) {
        let modified: DateTime<Local> = modified.into();
        info(&format!("modified: {}", modified.format("%Y-%m-%d %H:%M:%S")));
    }
}

fn parse_index(key: &str) -> Result<u32> {
    key.parse()
        .into_diagnostic()
        .wrap_err_with(|| format!("key {key:?} is not a valid u32 index"))
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Resolve the default table path depending on OS
fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".slottable").join("db"))
        .unwrap_or_else(|| PathBuf::from("db"))
}

fn success(msg: &str) {
    println!("{} {}", "✔".bright_green().bold(), msg.normal());
}

fn warn(msg: &str) {
    eprintln!("{} {}", "⚠".bright_yellow().bold(), msg.yellow());
}

fn info(msg: &str) {
    println!("{} {}", "➤".bright_cyan().bold(), msg.cyan());
}
