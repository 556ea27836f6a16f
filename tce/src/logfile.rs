//! Offline merging and subtraction of dump files.
//!
//! Inputs must come from the same instrumentation: they have the same number of lines, and every header, function and
//! counter header agrees. Only summaries and counter values may differ.

use error::*;
use raw::*;
use record::Line;

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::{fmt, io};

/// A parsed dump file, line by line.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LogFile {
    pub lines: Vec<Line>,
}

impl LogFile {
    /// Parses a dump file.
    ///
    /// # Errors
    ///
    /// * Returns [`Protocol`] if a line is malformed.
    /// * Returns [`Truncated`] if the input ends before the `end` record.
    ///
    /// Errors carry the line number.
    ///
    /// [`Protocol`]: ../error/enum.ErrorKind.html#variant.Protocol
    /// [`Truncated`]: ../error/enum.ErrorKind.html#variant.Truncated
    pub fn read<R: Read>(reader: R) -> Result<LogFile> {
        let mut lines = Vec::new();
        for (i, line) in BufReader::new(reader).lines().enumerate() {
            let line = Location::Line(i + 1).wrap(|| Line::parse(&line?))?;
            lines.push(line);
        }
        ensure!(lines.last() == Some(&Line::End), ErrorKind::Truncated("input".to_owned()));
        Ok(LogFile { lines })
    }

    /// Parses a dump file from the file system.
    pub fn open(path: &Path) -> Result<LogFile> {
        Location::File(path.to_owned()).wrap(|| LogFile::read(File::open(path)?))
    }

    /// Writes the lines, each terminated by a newline.
    pub fn write_to<W: Write>(&self, mut writer: W) -> io::Result<()> {
        write!(writer, "{}", self)?;
        writer.flush()
    }
}

impl fmt::Display for LogFile {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        for line in &self.lines {
            writeln!(fmt, "{}", line)?;
        }
        Ok(())
    }
}

/// Checks that two lines at the same position come from the same instrumentation.
fn check_compatible(index: usize, a: &Line, b: &Line) -> Result<()> {
    let compatible = match (a, b) {
        (&Line::Header(ref x), &Line::Header(ref y)) => x.same_instrumentation(y) && x.n_functions == y.n_functions,
        (&Line::Summary(..), &Line::Summary(..)) | (&Line::Value(_), &Line::Value(_)) => true,
        (&Line::End, &Line::End) => true,
        (&Line::Function(..), &Line::Function(..)) | (&Line::Counters(..), &Line::Counters(..)) => a == b,
        _ => false,
    };
    ensure!(
        compatible,
        ErrorKind::InstrumentationMismatch(format!("line {}: '{}' versus '{}'", index + 1, a, b))
    );
    Ok(())
}

fn check_all_compatible(first: &LogFile, other: &LogFile) -> Result<()> {
    ensure!(
        first.lines.len() == other.lines.len(),
        ErrorKind::InstrumentationMismatch(format!("{} lines versus {} lines", first.lines.len(), other.lines.len()))
    );
    for (i, (a, b)) in first.lines.iter().zip(&other.lines).enumerate() {
        check_compatible(i, a, b)?;
    }
    Ok(())
}

/// Merges several dump files of the same instrumentation.
///
/// Counters are merged by their policy, the way the collector merges repeated sightings: `add` counters are summed,
/// `single` triples vote and `delta` pairs accumulate. Summaries are merged component-wise. Headers and the timestamp
/// are shared by all inputs.
///
/// # Errors
///
/// * Returns [`InstrumentationMismatch`] if the inputs are not from the same instrumentation, or if there are no
///   inputs.
/// * Returns [`CounterOverflow`] if a merged counter does not fit in 64 bits, and [`IncompleteTuple`] or
///   [`Protocol`] if a counter array is malformed. These errors carry the line of the counter header.
///
/// [`InstrumentationMismatch`]: ../error/enum.ErrorKind.html#variant.InstrumentationMismatch
/// [`CounterOverflow`]: ../error/enum.ErrorKind.html#variant.CounterOverflow
/// [`IncompleteTuple`]: ../error/enum.ErrorKind.html#variant.IncompleteTuple
/// [`Protocol`]: ../error/enum.ErrorKind.html#variant.Protocol
pub fn merge(inputs: &[LogFile]) -> Result<LogFile> {
    let (first, rest) = match inputs.split_first() {
        Some(split) => split,
        None => bail!(ErrorKind::InstrumentationMismatch("nothing to merge".to_owned())),
    };
    for other in rest {
        check_all_compatible(first, other)?;
    }

    let mut result = first.clone();
    for other in rest {
        merge_into(&mut result.lines, &other.lines)?;
    }
    Ok(result)
}

/// Merges compatible lines of `other` into `lines`.
fn merge_into(lines: &mut [Line], other: &[Line]) -> Result<()> {
    let mut i = 0;
    while i < lines.len() {
        let (policy, count) = match (&mut lines[i], &other[i]) {
            (&mut Line::Counters(ref policy, count), _) => (policy.clone(), count),
            (&mut Line::Summary(ref mut o, ref mut p), &Line::Summary(ref io, ref ip)) => {
                o.merge(io);
                p.merge(ip);
                i += 1;
                continue;
            },
            _ => {
                i += 1;
                continue;
            },
        };

        let range = i + 1..(i + 1).saturating_add(count);
        let merged = Location::Line(i + 1).wrap(|| {
            let old = counter_values(lines.get(range.clone()))?;
            let new = counter_values(other.get(range.clone()))?;
            policy.merge(&old, &new)
        })?;
        for (line, value) in lines[range].iter_mut().zip(merged) {
            *line = Line::Value(value);
        }
        i += count + 1;
    }
    Ok(())
}

/// The values of a counter array, which must be all present.
fn counter_values(lines: Option<&[Line]>) -> Result<Vec<i64>> {
    let lines = lines.ok_or_else(|| ErrorKind::Truncated("counter array".to_owned()))?;
    lines
        .iter()
        .map(|line| match *line {
            Line::Value(value) => Ok(value),
            ref line => Err(ErrorKind::UnexpectedRecord("counter value", line.to_string()).into()),
        })
        .collect()
}

/// Subtracts an older dump file from a newer one of the same instrumentation.
///
/// Counters under the `add` policy become `new - old`; other counters keep the new value. Summaries are subtracted
/// such that merging `old` with the result gives back `new`.
///
/// With `logical`, every counter becomes `!!new - !!old`: `1` for newly covered, `-1` for newly uncovered, and
/// summaries are copied from `new`.
///
/// A warning is logged, once, if any `add` counter decreased.
///
/// # Errors
///
/// * Returns [`InstrumentationMismatch`] if the inputs are not from the same instrumentation.
/// * Returns [`CounterOverflow`] if a difference does not fit in 64 bits. The error carries the line number.
///
/// [`InstrumentationMismatch`]: ../error/enum.ErrorKind.html#variant.InstrumentationMismatch
/// [`CounterOverflow`]: ../error/enum.ErrorKind.html#variant.CounterOverflow
pub fn diff(old: &LogFile, new: &LogFile, logical: bool) -> Result<LogFile> {
    check_all_compatible(old, new)?;

    let mut result = new.clone();
    let mut policy = MergePolicy::Add;
    let mut regressed = false;
    for (i, (line, old_line)) in result.lines.iter_mut().zip(&old.lines).enumerate() {
        match (line, old_line) {
            (&mut Line::Counters(ref p, _), _) => policy = p.clone(),
            (&mut Line::Summary(ref mut n, ref mut p), &Line::Summary(ref on, ref op)) => {
                if !logical {
                    *n = n.subtract(on);
                    *p = p.subtract(op);
                }
            },
            (&mut Line::Value(ref mut value), &Line::Value(old_value)) => {
                if policy == MergePolicy::Add && old_value > *value && !regressed {
                    warn!("counter regressed at line {}: {} -> {}", i + 1, old_value, *value);
                    regressed = true;
                }
                if logical {
                    *value = i64::from(*value != 0) - i64::from(old_value != 0);
                } else if policy == MergePolicy::Add {
                    *value = value
                        .checked_sub(old_value)
                        .ok_or_else(|| Location::Line(i + 1).wrap_error(ErrorKind::CounterOverflow))?;
                }
            },
            _ => {},
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> LogFile {
        LogFile::read(text.as_bytes()).unwrap()
    }

    fn values(log: &LogFile) -> Vec<i64> {
        log.lines
            .iter()
            .filter_map(|line| match *line {
                Line::Value(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    const OLD: &str = "foo.c new 1 0 0 0 1 1\n>4 1 8 5 5 4 1 8 5 5\n*1 0\n~add 4\n+0\n+5\n+0\n+3\nend\n";
    const NEW: &str = "foo.c new 1 0 0 0 1 1\n>4 2 15 5 10 4 2 15 5 10\n*1 0\n~add 4\n+2\n+5\n+0\n+0\nend\n";

    #[test]
    fn test_diff_logical() {
        let result = diff(&parse(OLD), &parse(NEW), true).unwrap();
        assert_eq!(values(&result), vec![1, 0, 0, -1]);
        assert_eq!(result.lines[1], parse(NEW).lines[1]);
        assert_eq!(
            result.to_string(),
            "foo.c new 1 0 0 0 1 1\n>4 2 15 5 10 4 2 15 5 10\n*1 0\n~add 4\n+1\n+0\n+0\n+-1\nend\n"
        );
    }

    #[test]
    fn test_diff_inverse() {
        let old = parse(OLD);
        let new = parse(NEW);
        let delta = diff(&old, &new, false).unwrap();
        assert_eq!(values(&delta), vec![2, 0, 0, -3]);
        assert_eq!(merge(&[old, delta]).unwrap(), new);
    }

    #[test]
    fn test_merge() {
        let a = parse("foo.c new 1 0 0 0 1 25\n>1 1 5 5 5 1 1 5 5 5\n*1 0\n~add 1\n+5\n~single 3\n+1\n+2\n+2\n\
                       ~delta 2\n+10\n+3\nend\n");
        let b = parse("foo.c new 1 0 0 0 1 25\n>1 1 7 7 7 1 1 7 7 7\n*1 0\n~add 1\n+7\n~single 3\n+3\n+4\n+4\n\
                       ~delta 2\n+18\n+5\nend\n");
        let merged = merge(&[a.clone(), b]).unwrap();
        assert_eq!(
            merged.to_string(),
            "foo.c new 1 0 0 0 1 25\n>1 2 12 7 12 1 2 12 7 12\n*1 0\n~add 1\n+12\n~single 3\n+3\n+2\n+6\n\
             ~delta 2\n+18\n+8\nend\n"
        );
        assert_eq!(merge(&[a.clone()]).unwrap(), a);
    }

    #[test]
    fn test_merge_single_follows_majority() {
        let votes = [5, 5, 7, 5]
            .iter()
            .map(|v| parse(&format!("foo.c new 1 0 0 0 1 8\n*1 0\n~single 3\n+{}\n+1\n+1\nend\n", v)))
            .collect::<Vec<_>>();
        let merged = merge(&votes).unwrap();
        assert_eq!(values(&merged), vec![5, 2, 4]);
    }

    #[test]
    fn test_overflow() {
        let max = "foo.c new 1 0 0 0 1 1\n>1 1 5 5 5 1 1 5 5 5\n*1 0\n~add 1\n+9223372036854775807\nend\n";
        let e = merge(&[parse(max), parse(max)]).unwrap_err();
        match *e.kind() {
            ErrorKind::AtLine(4) => {},
            ref k => panic!("unexpected error {:?}", k),
        }
        assert_eq!(e.one_line(), "at line 4: counter overflow");

        let min = "foo.c new 1 0 0 0 1 1\n>1 1 5 5 5 1 1 5 5 5\n*1 0\n~add 1\n+-9223372036854775808\nend\n";
        let e = diff(&parse(max.replace("+9223372036854775807", "+1").as_str()), &parse(min), false).unwrap_err();
        assert_eq!(e.one_line(), "at line 5: counter overflow");
    }

    #[test]
    fn test_mismatch() {
        let old = parse(OLD);
        let other_stamp = parse(&OLD.replace("new 1 0", "new 1 1"));
        let other_count = parse("foo.c new 1 0 0 0 1 1\n>4 1 8 5 5 4 1 8 5 5\n*1 0\n~add 3\n+0\n+5\n+0\nend\n");
        let other_function = parse(&OLD.replace("*1 0", "*2 0"));
        for other in &[other_stamp, other_count, other_function] {
            match merge(&[old.clone(), other.clone()]) {
                Err(Error(ErrorKind::InstrumentationMismatch(_), _)) => {},
                r => panic!("unexpected {:?}", r),
            }
            assert!(diff(&old, other, false).is_err());
        }
        assert!(merge(&[]).is_err());
    }

    #[test]
    fn test_truncated() {
        match LogFile::read(&OLD.as_bytes()[..OLD.len() - 4]) {
            Err(Error(ErrorKind::Truncated(_), _)) => {},
            r => panic!("unexpected {:?}", r),
        }
        match LogFile::read("foo.c new 1 0 0 0 1 1\nbogus\nend\n".as_bytes()) {
            Err(Error(ErrorKind::AtLine(2), _)) => {},
            r => panic!("unexpected {:?}", r),
        }
    }
}
