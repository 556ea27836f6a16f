//! Codec of the line-oriented record format shared by the wire and dump files.
//!
//! ```text
//! PEER_ID                                 ; only on the wire
//! FILENAME new VERSION STAMP OBJCHK PRGCHK NFUNCS CTRMASK
//! >NUM RUNS SUM_ALL RUN_MAX SUM_MAX NUM RUNS SUM_ALL RUN_MAX SUM_MAX
//! *IDENT CHECKSUM
//! ~POLICY COUNT
//! +VALUE
//! end
//! ```
//!
//! Fields are separated by a single space and every number is written in decimal.

use error::*;
use raw::*;

use std::fmt;
use std::str::{FromStr, Split};

/// The token separating the filename from the rest of a header line.
const NEW_TOKEN: &str = " new ";

/// A decoded record line, excluding the peer id which only the wire carries.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Line {
    /// `FILENAME new ...`
    Header(ObjectHeader),
    /// `>...`, the object summary followed by the program summary.
    Summary(Summary, Summary),
    /// `*IDENT CHECKSUM`
    Function(Ident, u32),
    /// `~POLICY COUNT`
    Counters(MergePolicy, usize),
    /// `+VALUE`
    Value(i64),
    /// `end`
    End,
}

/// Splits a record body into single-space separated fields.
struct Fields<'a> {
    line: &'a str,
    iter: Split<'a, char>,
}

impl<'a> Fields<'a> {
    fn new(line: &'a str, body: &'a str) -> Fields<'a> {
        Fields {
            line,
            iter: body.split(' '),
        }
    }

    fn next<T: FromStr>(&mut self) -> Result<T> {
        match self.iter.next() {
            Some(field) if !field.is_empty() && !field.starts_with('+') => {
                field.parse().map_err(|_| ErrorKind::Protocol(self.line.to_owned()).into())
            },
            _ => bail!(ErrorKind::Protocol(self.line.to_owned())),
        }
    }

    fn next_summary(&mut self) -> Result<Summary> {
        Ok(Summary {
            num: self.next()?,
            runs: self.next()?,
            sum_all: self.next()?,
            run_max: self.next()?,
            sum_max: self.next()?,
        })
    }

    fn finish(mut self) -> Result<()> {
        ensure!(self.iter.next().is_none(), ErrorKind::Protocol(self.line.to_owned()));
        Ok(())
    }
}

impl Line {
    /// Decodes a record line. The line must not contain the terminating newline.
    ///
    /// # Errors
    ///
    /// Returns [`Protocol`] if the line does not follow the record grammar, or [`UnsupportedCounterMask`] if a header
    /// enables unknown counter types.
    ///
    /// [`Protocol`]: ../error/enum.ErrorKind.html#variant.Protocol
    /// [`UnsupportedCounterMask`]: ../error/enum.ErrorKind.html#variant.UnsupportedCounterMask
    pub fn parse(line: &str) -> Result<Line> {
        if line == "end" {
            return Ok(Line::End);
        }
        if let Some(pos) = line.find(NEW_TOKEN) {
            let filename = &line[..pos];
            ensure!(!filename.is_empty(), ErrorKind::Protocol(line.to_owned()));
            let mut fields = Fields::new(line, &line[pos + NEW_TOKEN.len()..]);
            let version = Version(fields.next()?);
            let stamp = fields.next()?;
            let checksum = fields.next()?;
            let program_checksum = fields.next()?;
            let n_functions = fields.next()?;
            let ctr_mask = CounterMask::from_raw(fields.next()?)?;
            fields.finish()?;
            return Ok(Line::Header(ObjectHeader {
                filename: filename.to_owned(),
                version,
                stamp,
                checksum,
                program_checksum,
                n_functions,
                ctr_mask,
            }));
        }

        let body = line.get(1..).unwrap_or("");
        let mut fields = Fields::new(line, body);
        let result = match line.as_bytes().first() {
            Some(b'>') => {
                let object = fields.next_summary()?;
                let program = fields.next_summary()?;
                Line::Summary(object, program)
            },
            Some(b'*') => Line::Function(Ident(fields.next()?), fields.next()?),
            Some(b'~') => {
                let policy = match fields.iter.next() {
                    Some(name) if !name.is_empty() => MergePolicy::from(name),
                    _ => bail!(ErrorKind::Protocol(line.to_owned())),
                };
                Line::Counters(policy, fields.next()?)
            },
            Some(b'+') => Line::Value(fields.next()?),
            _ => bail!(ErrorKind::Protocol(line.to_owned())),
        };
        fields.finish()?;
        Ok(result)
    }

    /// A short description of the kind of line, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match *self {
            Line::Header(_) => "object header",
            Line::Summary(..) => "summary",
            Line::Function(..) => "function",
            Line::Counters(..) => "counter header",
            Line::Value(_) => "counter value",
            Line::End => "end",
        }
    }
}

/// Decodes the peer id, the first line of a wire stream.
///
/// # Errors
///
/// Returns [`Protocol`] if the line is not a positive decimal integer.
///
/// [`Protocol`]: ../error/enum.ErrorKind.html#variant.Protocol
pub fn parse_peer_id(line: &str) -> Result<u32> {
    match line.parse() {
        Ok(peer) if peer > 0 && line.bytes().all(|b| b.is_ascii_digit()) => Ok(peer),
        _ => bail!(ErrorKind::Protocol(line.to_owned())),
    }
}

fn fmt_summary(fmt: &mut fmt::Formatter, s: &Summary) -> fmt::Result {
    write!(fmt, "{} {} {} {} {}", s.num, s.runs, s.sum_all, s.run_max, s.sum_max)
}

/// Encodes the line without the terminating newline.
impl fmt::Display for Line {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Line::Header(ref h) => write!(
                fmt,
                "{}{}{} {} {} {} {} {}",
                h.filename,
                NEW_TOKEN,
                h.version,
                h.stamp,
                h.checksum,
                h.program_checksum,
                h.n_functions,
                h.ctr_mask.bits()
            ),
            Line::Summary(ref object, ref program) => {
                fmt.write_str(">")?;
                fmt_summary(fmt, object)?;
                fmt.write_str(" ")?;
                fmt_summary(fmt, program)
            },
            Line::Function(ident, checksum) => write!(fmt, "*{} {}", ident, checksum),
            Line::Counters(ref policy, count) => write!(fmt, "~{} {}", policy, count),
            Line::Value(value) => write!(fmt, "+{}", value),
            Line::End => fmt.write_str("end"),
        }
    }
}
