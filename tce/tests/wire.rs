extern crate diff;
extern crate env_logger;
extern crate tce;
extern crate tempfile;
extern crate termcolor;

use tce::*;
use tce::parser::DEFAULT_LINE_LIMIT;
use tempfile::TempDir;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs::{self, read_dir};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::exit;

fn main() {
    let _ = env_logger::try_init();
    run().expect("IO");
}

fn run() -> io::Result<()> {
    let mut failed_tests = 0;

    let stdout = StandardStream::stdout(ColorChoice::Auto);
    let mut lock = stdout.lock();

    let mut cases = read_dir("test-data")?.map(|e| e.map(|e| e.path())).collect::<io::Result<Vec<_>>>()?;
    cases.sort();
    for path in cases {
        if path.is_dir() && !wire_files(&path)?.is_empty() {
            write!(lock, "test {} ... ", path.display())?;
            lock.flush()?;
            if !print_test_result(&mut lock, test(&path))? {
                failed_tests += 1;
            }
        }
    }

    if failed_tests != 0 {
        writeln!(lock, "\ntest result: {} failed.\n", failed_tests)?;
        exit(101);
    } else {
        writeln!(lock, "\ntest result: ok.\n")?;
    }

    Ok(())
}

fn wire_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in read_dir(dir)? {
        let path = entry?.path();
        if path.extension() == Some(OsStr::new("wire")) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Collects every file below `root`, keyed by the path relative to `root`.
fn collect_files(root: &Path, dir: &Path, files: &mut BTreeMap<PathBuf, String>) -> io::Result<()> {
    for entry in read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else {
            let relative = path.strip_prefix(root).unwrap_or(&path).to_owned();
            files.insert(relative, fs::read_to_string(&path)?);
        }
    }
    Ok(())
}

fn render(files: &BTreeMap<PathBuf, String>) -> String {
    let mut result = String::new();
    for (path, content) in files {
        result.push_str(&format!("==> {} <==\n{}", path.display(), content));
    }
    result
}

/// Feeds every `*.wire` stream of the case as a separate connection, dumps the store, and renders both the dump and
/// the expected files.
fn test(path: &Path) -> Result<(String, String)> {
    let mut store = Store::new();
    for (fd, wire_path) in wire_files(path)?.into_iter().enumerate() {
        let stream = fs::read(&wire_path)?;
        // Malformed streams are part of the test cases; only their effect on the store matters.
        let _ = Parser::new(fd as i32 + 3, DEFAULT_LINE_LIMIT).feed(&stream, &mut store);
    }

    let output = TempDir::new()?;
    dump::dump(&store, output.path())?;

    let mut actual = BTreeMap::new();
    collect_files(output.path(), output.path(), &mut actual)?;
    let mut expected = BTreeMap::new();
    let expected_root = path.join("expected");
    collect_files(&expected_root, &expected_root, &mut expected)?;

    Ok((render(&actual), render(&expected)))
}

fn print_test_result<W: Write + WriteColor>(mut lock: W, result: Result<(String, String)>) -> io::Result<bool> {
    Ok(match result {
        Ok((actual, expected)) => {
            let success = actual == expected;
            if success {
                lock.set_color(ColorSpec::new().set_fg(Some(Color::Green)))?;
                writeln!(lock, "ok")?;
            } else {
                lock.set_color(ColorSpec::new().set_fg(Some(Color::Red)))?;
                writeln!(lock, "FAILED")?;
                for d in diff::lines(&actual, &expected) {
                    let (color, prefix, line) = match d {
                        diff::Result::Left(line) => (Color::Green, '+', line),
                        diff::Result::Both(line, _) => (Color::White, ' ', line),
                        diff::Result::Right(line) => (Color::Red, '-', line),
                    };
                    lock.set_color(ColorSpec::new().set_fg(Some(color)))?;
                    writeln!(lock, "{} {}", prefix, line)?;
                }
                writeln!(lock)?;
            }
            lock.reset()?;
            success
        },
        Err(e) => {
            lock.set_color(ColorSpec::new().set_fg(Some(Color::Magenta)))?;
            writeln!(lock, "ERRORED")?;
            lock.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_intense(true).set_bold(true))?;
            write!(lock, "error: ")?;
            lock.reset()?;
            writeln!(lock, "{}\n", e.one_line())?;
            false
        },
    })
}
