//! Writes the coverage store to disk.
//!
//! Every object becomes one file `<output>/<peer>/<source path>.tce` holding the same records as the wire format,
//! without the peer id line. Files are written to a temporary file first and renamed into place.

use error::*;
use parser::{Parser, Status, DEFAULT_LINE_LIMIT};
use record::Line;
use store::{ObjectInfo, Store};

use tempfile::NamedTempFile;

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};

/// Extension appended to the source path of every dump file.
pub const EXTENSION: &str = "tce";

/// Computes where the dump file of `(peer, filename)` is written.
///
/// Root and prefix components are dropped, `.` components are skipped and `..` components become `__`, so the result
/// always stays inside `output`.
pub fn dump_path(output: &Path, peer: u32, filename: &str) -> PathBuf {
    let mut path = output.join(peer.to_string());
    for component in Path::new(filename).components() {
        match component {
            Component::Normal(name) => path.push(name),
            Component::ParentDir => path.push("__"),
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {},
        }
    }
    let mut name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();
    name.push(".");
    name.push(EXTENSION);
    path.set_file_name(name);
    path
}

/// Writes the records of an object.
pub fn write_object<W: Write>(object: &ObjectInfo, mut writer: W) -> io::Result<()> {
    writeln!(writer, "{}", Line::Header(object.header.clone()))?;
    for &(ref o, ref p) in &object.summaries {
        writeln!(writer, "{}", Line::Summary(*o, *p))?;
    }
    for function in &object.functions {
        writeln!(writer, "{}", Line::Function(function.ident, function.checksum))?;
        for array in &function.counters {
            writeln!(writer, "{}", Line::Counters(array.policy.clone(), array.values.len()))?;
            for &value in &array.values {
                writeln!(writer, "{}", Line::Value(value))?;
            }
        }
    }
    writeln!(writer, "{}", Line::End)?;
    writer.flush()
}

/// Writes an object to its dump file atomically.
///
/// # Errors
///
/// Returns [`Io`] if the directory cannot be created or the file cannot be written. The previous file, if any, is
/// left untouched in this case.
///
/// [`Io`]: ../error/enum.ErrorKind.html#variant.Io
pub fn write_object_file(output: &Path, object: &ObjectInfo) -> Result<PathBuf> {
    let path = dump_path(output, object.peer, &object.header.filename);
    Location::File(path.clone()).wrap(|| -> Result<()> {
        let dir = path.parent().unwrap_or(output);
        fs::create_dir_all(dir)?;
        let mut temp = NamedTempFile::new_in(dir)?;
        write_object(object, BufWriter::new(temp.as_file_mut()))?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })?;
    Ok(path)
}

/// Dumps every object of the store into `output`. The store is not modified.
///
/// Returns the number of files written.
///
/// # Errors
///
/// Every file is attempted even if some fail; the failures are logged and the first one is returned.
pub fn dump(store: &Store, output: &Path) -> Result<usize> {
    let mut written = 0;
    let mut first_error = None;
    for object in store.objects() {
        match write_object_file(output, object) {
            Ok(path) => {
                debug!("dumped {}", path.display());
                written += 1;
            },
            Err(e) => {
                error!("cannot dump peer {} object {}: {}", object.peer, object.header.filename, e.one_line());
                first_error.get_or_insert(e);
            },
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => {
            info!("dumped {} files to {}", written, output.display());
            Ok(written)
        },
    }
}

/// Merges the records of a dump file into the store as coming from `peer`.
///
/// # Errors
///
/// Returns any parse error, or [`Truncated`] if the file ends before its `end` record.
///
/// [`Truncated`]: ../error/enum.ErrorKind.html#variant.Truncated
pub fn load<R: Read>(mut reader: R, peer: u32, store: &mut Store) -> Result<()> {
    let mut parser = Parser::with_peer(-1, peer, DEFAULT_LINE_LIMIT);
    let mut buf = [0; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            bail!(ErrorKind::Truncated("dump file".to_owned()));
        }
        if parser.feed(&buf[..n], store)? == Status::Finished {
            return Ok(());
        }
    }
}

/// Merges a dump file into the store as coming from `peer`.
pub fn load_file(path: &Path, peer: u32, store: &mut Store) -> Result<()> {
    Location::File(path.to_owned()).wrap(|| load(File::open(path)?, peer, store))
}
