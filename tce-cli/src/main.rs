//! `tce` is the command line front-end of the test coverage estimation collector.
//!
//! * `tce collector DESCRIPTOR...` receives counters from instrumented programs until SIGTERM.
//! * `tce dump PID PREFIX` asks a running collector to dump into `PREFIX`.
//! * `tce merge` and `tce diff` combine dump files offline.
//! * `tce inspect FILE` prints a dump file as JSON.

#![recursion_limit = "128"] // needed for error_chain.
#![allow(dangerous_implicit_autorefs)] // triggered inside clap 2.x `crate_authors!`.

#[macro_use]
extern crate clap;
#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;
extern crate env_logger;
extern crate serde_json;
extern crate tce;
extern crate termcolor;
extern crate toml;

#[cfg(test)]
extern crate tempfile;

#[macro_use]
mod ui;
mod config;
mod error;

use clap::ArgMatches;
use error::{ErrorKind, Result, ResultExt};
use log::LevelFilter;
use tce::{dump, logfile, Collector, LogFile, Store};
use termcolor::Color;

use std::env;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::process::exit;
use std::time::Duration;

/// Program entry. Calls [`run()`] and prints any error returned to `stderr`.
///
/// [`run()`]: ./fn.run.html
fn main() {
    if let Err(error) = run() {
        let _ = ui::print_error(&error);
        exit(1);
    }
}

/// Runs the `tce` program.
fn run() -> Result<()> {
    let matches = parse_args();
    init_logger(matches.occurrences_of("verbose"));

    match matches.subcommand() {
        ("collector", Some(matches)) => collector(matches),
        ("dump", Some(matches)) => request_dump(matches),
        ("merge", Some(matches)) => merge(matches),
        ("diff", Some(matches)) => diff(matches),
        ("inspect", Some(matches)) => inspect(matches),
        _ => Ok(()),
    }
}

/// Parses the command line arguments using `clap`.
fn parse_args() -> ArgMatches<'static> {
    clap_app!(tce =>
        (author: crate_authors!(", "))
        (about: crate_description!())
        (version: crate_version!())
        (@setting DeriveDisplayOrder)
        (@setting SubcommandRequiredElseHelp)
        (@setting GlobalVersion)
        (@arg verbose: -v --verbose ... +global "Log more details (-v for debug, -vv for trace)")
        (@subcommand collector =>
            (about: "Receives coverage counters until SIGTERM, dumping them on SIGHUP and on exit")
            (@arg output: -o --output [DIR] "Directory receiving the dumps, default to `./tce-dump`")
            (@arg runtime_dir: --("runtime-dir") [DIR] "Directory holding dump requests, default to the temp dir")
            (@arg line_limit: --("line-limit") [BYTES] "Maximum length of a record line, default to 4096")
            (@arg config: --config [FILE] "TOML file with the `listen`, `output`, `runtime_dir` and `line_limit` keys")
            (@arg descriptors: [DESCRIPTOR]... "Listeners: fifo:PATH, unix:PATH, abstract:NAME or tcp:PORT[:ADDR]")
        )
        (@subcommand dump =>
            (about: "Asks a running collector to dump into a directory, and waits until it is done")
            (@arg runtime_dir: --("runtime-dir") [DIR] "Directory holding dump requests, default to the temp dir")
            (@arg timeout: --timeout [SECONDS] "How long to wait for the collector, default to 30")
            (@arg pid: <PID> "Process id of the collector")
            (@arg prefix: <PREFIX> "Directory receiving the dump")
        )
        (@subcommand merge =>
            (about: "Merges dump files of the same source file")
            (@arg output: -o --output <FILE> "The merged file")
            (@arg inputs: <INPUT>... "Dump files to merge")
        )
        (@subcommand diff =>
            (about: "Subtracts an older dump file from a newer one")
            (@arg logical: --logical "Compare whether counters are non-zero instead of their values")
            (@arg output: -o --output [FILE] "The difference, default to stdout")
            (@arg old: <OLD> "The older dump file")
            (@arg new: <NEW> "The newer dump file")
        )
        (@subcommand inspect =>
            (about: "Prints a dump file as JSON")
            (@arg peer: --peer [ID] "Peer id of the file, default to the name of its directory")
            (@arg file: <FILE> "The dump file")
        )
    ).get_matches()
}

/// Logs at `info` by default, raised by each `-v`. `RUST_LOG` refines the filter.
fn init_logger(verbosity: u64) {
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder = env_logger::Builder::new();
    builder.filter(None, level);
    if let Ok(filters) = env::var("RUST_LOG") {
        builder.parse(&filters);
    }
    builder.init();
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Runs the collector until it is terminated.
fn collector(matches: &ArgMatches) -> Result<()> {
    let line_limit = match matches.value_of("line_limit") {
        Some(limit) => Some(limit.parse()?),
        None => None,
    };
    let args = config::Arguments {
        descriptors: matches.values_of("descriptors").map(|v| v.collect()).unwrap_or_default(),
        output: matches.value_of_os("output").map(Path::new),
        runtime_dir: matches.value_of_os("runtime_dir").map(Path::new),
        line_limit,
        config: matches.value_of_os("config").map(Path::new),
    };
    let settings = config::resolve(&args, env_var)?;
    debug!("settings = {:?}", settings);

    let listeners = settings.descriptors.len();
    let mut collector = Collector::open(&settings.descriptors, settings.collector)?;
    collector.install_signal_handlers()?;
    progress!("Collecting", "on {} listeners, pid {}", listeners, std::process::id());
    collector.run()?;
    Ok(())
}

/// Asks a collector to dump, and waits for it.
fn request_dump(matches: &ArgMatches) -> Result<()> {
    let pid = value_t!(matches, "pid", u32).unwrap_or_else(|e| e.exit());
    let timeout = match matches.value_of("timeout") {
        Some(seconds) => Duration::from_secs(seconds.parse()?),
        None => Duration::from_secs(30),
    };
    let prefix = Path::new(matches.value_of_os("prefix").unwrap_or_default());
    let runtime_dir = config::runtime_dir(matches.value_of_os("runtime_dir").map(Path::new), env_var);

    tce::collector::request_dump(&runtime_dir, pid, prefix, timeout)?;
    progress!("Dumped", "collector {} into {}", pid, prefix.display());
    Ok(())
}

fn open_log_file(path: &Path) -> Result<LogFile> {
    Ok(LogFile::open(path)?)
}

/// Merges the input files into the output file.
fn merge(matches: &ArgMatches) -> Result<()> {
    let inputs = matches
        .values_of_os("inputs")
        .into_iter()
        .flat_map(|v| v)
        .map(|p| open_log_file(Path::new(p)))
        .collect::<Result<Vec<_>>>()?;
    ensure!(!inputs.is_empty(), ErrorKind::NothingToMerge);

    let merged = logfile::merge(&inputs)?;
    let output = Path::new(matches.value_of_os("output").unwrap_or_default());
    write_log_file(&merged, Some(output))?;
    progress!("Merged", "{} files into {}", inputs.len(), output.display());
    Ok(())
}

/// Writes the difference of two files.
fn diff(matches: &ArgMatches) -> Result<()> {
    let old = open_log_file(Path::new(matches.value_of_os("old").unwrap_or_default()))?;
    let new = open_log_file(Path::new(matches.value_of_os("new").unwrap_or_default()))?;
    let result = logfile::diff(&old, &new, matches.is_present("logical"))?;
    write_log_file(&result, matches.value_of_os("output").map(Path::new))
}

/// Writes to `path`, or to stdout if it is `None`.
fn write_log_file(file: &LogFile, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let mut writer = BufWriter::new(File::create(path)?);
            file.write_to(&mut writer)?;
            writer.flush()?;
        },
        None => {
            let stdout = io::stdout();
            file.write_to(stdout.lock())?;
        },
    }
    Ok(())
}

/// Prints a dump file as JSON.
fn inspect(matches: &ArgMatches) -> Result<()> {
    let path = Path::new(matches.value_of_os("file").unwrap_or_default());
    let peer = match matches.value_of("peer") {
        Some(peer) => tce::record::parse_peer_id(peer)?,
        None => match path.parent().and_then(Path::file_name).and_then(|n| n.to_str()) {
            Some(name) => tce::record::parse_peer_id(name).unwrap_or_else(|_| {
                let _ = ui::print_status("Warning", Color::Yellow, format_args!("no peer id in {}, using 1", name));
                1
            }),
            None => 1,
        },
    };

    let mut store = Store::new();
    dump::load_file(path, peer, &mut store).chain_err(|| format!("cannot inspect {}", path.display()))?;
    let stdout = io::stdout();
    let mut lock = stdout.lock();
    serde_json::to_writer_pretty(&mut lock, store.objects())?;
    writeln!(lock)?;
    Ok(())
}
