//! The raw structures shared by the wire protocol, the coverage store and dump files.

use error::*;

#[cfg(feature = "serde")]
use serde::{Serialize, Serializer};

use std::{cmp, fmt};
#[cfg(feature = "serde")]
use std::result::Result as StdResult;
use std::str::FromStr;

//----------------------------------------------------------------------------------------------------------------------
//{{{ Version

/// Format version magic, distinguishing incompatible counter layouts.
///
/// On the wire the version is written as a plain decimal number.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Version(pub u32);

impl Version {
    /// Derives the version magic from a compiler version string such as `"rustc 1.75.0 (82e1608df 2023-12-21)"`.
    ///
    /// The magic packs four characters big-endian: the major version (`0`-`9`, then `A`-`Z`), the two digits of the
    /// minor version, and `*` for a release compiler or `e` for a pre-release one. A string without any version
    /// number yields `Version(0)`.
    pub fn from_compiler(compiler: &str) -> Version {
        let number = match compiler.split_whitespace().find(|w| w.starts_with(|c: char| c.is_ascii_digit())) {
            Some(n) => n,
            None => return Version::default(),
        };
        let mut parts = number.split(|c: char| !c.is_ascii_digit()).map(|p| p.parse::<u32>().unwrap_or(0));
        let major = cmp::min(parts.next().unwrap_or(0), 35);
        let minor = parts.next().unwrap_or(0) % 100;
        let prerelease = number.contains('-') || compiler.contains("nightly") || compiler.contains("beta");

        let major_char = if major < 10 { b'0' + major as u8 } else { b'A' + (major - 10) as u8 };
        let chars = [
            major_char,
            b'0' + (minor / 10) as u8,
            b'0' + (minor % 10) as u8,
            if prerelease { b'e' } else { b'*' },
        ];
        Version(chars.iter().fold(0, |acc, c| acc << 8 | u32::from(*c)))
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let bytes = [(self.0 >> 24) as u8, (self.0 >> 16) as u8, (self.0 >> 8) as u8, self.0 as u8];
        if bytes.iter().all(|b| b.is_ascii_graphic()) {
            write!(fmt, "Version(\"{}\")", String::from_utf8_lossy(&bytes))
        } else {
            write!(fmt, "Version({})", self.0)
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(fmt)
    }
}

impl FromStr for Version {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(Version(s.parse()?))
    }
}

#[test]
fn test_version_from_compiler() {
    assert_eq!(Version::from_compiler("rustc 1.75.0 (82e1608df 2023-12-21)"), Version(0x31_37_35_2a));
    assert_eq!(Version::from_compiler("rustc 1.80.0-nightly (abcdef 2024-05-01)"), Version(0x31_38_30_65));
    assert_eq!(Version::from_compiler("gcc 12.2"), Version(0x43_30_32_2a));
    assert_eq!(Version::from_compiler("unknown"), Version(0));
}

//}}}
//----------------------------------------------------------------------------------------------------------------------
//{{{ Ident

/// Function identifier.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Ident(pub u32);

impl fmt::Debug for Ident {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Ident({})", self.0)
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(fmt)
    }
}

//}}}
//----------------------------------------------------------------------------------------------------------------------
//{{{ CounterType & CounterMask

/// Kind of instrumentation a counter array records.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum CounterType {
    /// Arc transitions.
    Arcs,
    /// Histogram of values inside an interval.
    Interval,
    /// Histogram of the exact power-of-2 logarithm of a value.
    Pow2,
    /// The most common value of an expression.
    Single,
    /// The most common difference between consecutive values of an expression.
    Delta,
}

/// All counter types, in mask bit order.
pub const COUNTER_TYPES: [CounterType; 5] = [
    CounterType::Arcs,
    CounterType::Interval,
    CounterType::Pow2,
    CounterType::Single,
    CounterType::Delta,
];

impl CounterType {
    /// The bit position of this type in a [`CounterMask`].
    ///
    /// [`CounterMask`]: ./struct.CounterMask.html
    pub fn index(self) -> usize {
        self as usize
    }

    /// Counters which can be summarized. Only summable types have a `>` summary line.
    pub fn is_summable(self) -> bool {
        self == CounterType::Arcs
    }

    /// The mask bit of this type.
    pub fn mask(self) -> CounterMask {
        CounterMask::from_bits_truncate(1 << self.index())
    }
}

impl fmt::Display for CounterType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(match *self {
            CounterType::Arcs => "arcs",
            CounterType::Interval => "interval",
            CounterType::Pow2 => "pow2",
            CounterType::Single => "single",
            CounterType::Delta => "delta",
        })
    }
}

bitflags! {
    /// Set of counter types present in an object.
    #[derive(Default)]
    pub struct CounterMask: u32 {
        const ARCS = 1;
        const INTERVAL = 2;
        const POW2 = 4;
        const SINGLE = 8;
        const DELTA = 0x10;
    }
}

impl CounterMask {
    /// Converts the raw mask from a header line.
    ///
    /// Returns `Err(UnsupportedCounterMask)` if an unknown bit is set.
    pub fn from_raw(raw: u32) -> Result<CounterMask> {
        CounterMask::from_bits(raw).ok_or_else(|| ErrorKind::UnsupportedCounterMask(raw).into())
    }

    /// The enabled counter types, in bit order.
    pub fn types(self) -> Vec<CounterType> {
        COUNTER_TYPES.iter().cloned().filter(|t| self.contains(t.mask())).collect()
    }

    /// The enabled summable counter types, in bit order.
    pub fn summable_types(self) -> Vec<CounterType> {
        COUNTER_TYPES.iter().cloned().filter(|t| t.is_summable() && self.contains(t.mask())).collect()
    }
}

#[cfg(feature = "serde")]
impl Serialize for CounterMask {
    fn serialize<S: Serializer>(&self, serializer: S) -> StdResult<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

#[test]
fn test_counter_mask() {
    let mask = CounterMask::from_raw(0b11001).unwrap();
    assert_eq!(mask.types(), vec![CounterType::Arcs, CounterType::Single, CounterType::Delta]);
    assert_eq!(mask.summable_types(), vec![CounterType::Arcs]);
    assert_eq!(CounterMask::from_raw(0b1000).unwrap().summable_types(), vec![]);
    assert!(CounterMask::from_raw(0x20).is_err());
}

//}}}
//----------------------------------------------------------------------------------------------------------------------
//{{{ MergePolicy

/// Rule for combining counter values across records and peers.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum MergePolicy {
    /// Counters are summed.
    Add,
    /// Majority vote for the most common value, over `(candidate, count, seen)` triples.
    Single,
    /// Accumulated difference between consecutive values, over `(last, accumulated)` pairs.
    Delta,
    /// An unrecognized policy name, kept verbatim. New values replace old ones.
    Unknown(String),
}

impl MergePolicy {
    /// The policy name written after `~`.
    pub fn name(&self) -> &str {
        match *self {
            MergePolicy::Add => "add",
            MergePolicy::Single => "single",
            MergePolicy::Delta => "delta",
            MergePolicy::Unknown(ref name) => name,
        }
    }

    /// Number of counter values forming one measurement.
    pub fn tuple_len(&self) -> usize {
        match *self {
            MergePolicy::Single => 3,
            MergePolicy::Delta => 2,
            _ => 1,
        }
    }

    /// Checks that `count` counter values form whole measurements.
    ///
    /// # Errors
    ///
    /// Returns [`IncompleteTuple`] if `count` is not a multiple of [`tuple_len()`].
    ///
    /// [`IncompleteTuple`]: ../error/enum.ErrorKind.html#variant.IncompleteTuple
    /// [`tuple_len()`]: #method.tuple_len
    pub fn check_count(&self, count: usize) -> Result<()> {
        ensure!(
            count % self.tuple_len() == 0,
            ErrorKind::IncompleteTuple(self.name().to_owned(), self.tuple_len(), count)
        );
        Ok(())
    }

    /// Merges the counters `new` into `old`, returning the result. Both slices must have the same length.
    ///
    /// * `add` sums the values.
    /// * `single` merges each `(value, count, seen)` triple by majority vote: a matching candidate gains the count, a
    ///   different value with a larger count takes over with the excess, otherwise the candidate loses the count.
    ///   `seen` is summed.
    /// * `delta` sums the accumulated differences of each `(last, accumulated)` pair, and keeps the newer `last`.
    /// * Unknown policies replace the values.
    ///
    /// # Errors
    ///
    /// * Returns [`IncompleteTuple`] if the values do not form whole measurements.
    /// * Returns [`CounterOverflow`] if a sum does not fit in 64 bits.
    ///
    /// [`IncompleteTuple`]: ../error/enum.ErrorKind.html#variant.IncompleteTuple
    /// [`CounterOverflow`]: ../error/enum.ErrorKind.html#variant.CounterOverflow
    pub fn merge(&self, old: &[i64], new: &[i64]) -> Result<Vec<i64>> {
        self.check_count(new.len())?;
        ensure!(
            old.len() == new.len(),
            ErrorKind::Protocol(format!("merging {} counters into {}", new.len(), old.len()))
        );

        let mut merged = old.to_vec();
        match *self {
            MergePolicy::Add => for (m, &n) in merged.iter_mut().zip(new) {
                *m = checked_add(*m, n)?;
            },
            MergePolicy::Single => for (m, n) in merged.chunks_mut(3).zip(new.chunks(3)) {
                let (value, count, seen) = (n[0], n[1], n[2]);
                if m[0] == value {
                    m[1] = checked_add(m[1], count)?;
                } else if count > m[1] {
                    m[0] = value;
                    m[1] = checked_sub(count, m[1])?;
                } else {
                    m[1] = checked_sub(m[1], count)?;
                }
                m[2] = checked_add(m[2], seen)?;
            },
            MergePolicy::Delta => for (m, n) in merged.chunks_mut(2).zip(new.chunks(2)) {
                m[0] = n[0];
                m[1] = checked_add(m[1], n[1])?;
            },
            MergePolicy::Unknown(_) => merged.copy_from_slice(new),
        }
        Ok(merged)
    }
}

fn checked_add(a: i64, b: i64) -> Result<i64> {
    a.checked_add(b).ok_or_else(|| ErrorKind::CounterOverflow.into())
}

fn checked_sub(a: i64, b: i64) -> Result<i64> {
    a.checked_sub(b).ok_or_else(|| ErrorKind::CounterOverflow.into())
}

impl<'a> From<&'a str> for MergePolicy {
    fn from(name: &'a str) -> MergePolicy {
        match name {
            "add" => MergePolicy::Add,
            "single" => MergePolicy::Single,
            "delta" => MergePolicy::Delta,
            other => MergePolicy::Unknown(other.to_owned()),
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.name())
    }
}

#[cfg(feature = "serde")]
impl Serialize for MergePolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> StdResult<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

#[test]
fn test_merge_single() {
    let single = MergePolicy::Single;
    let mut state = vec![5, 1, 1];
    for &value in &[5, 5, 7, 5] {
        state = single.merge(&state, &[value, 1, 1]).unwrap();
    }
    assert_eq!(state, vec![5, 3, 5]);

    // A stronger value takes over with the excess count.
    assert_eq!(single.merge(&[5, 2, 4], &[7, 5, 6]).unwrap(), vec![7, 3, 10]);
    // An equally strong value only cancels the candidate.
    assert_eq!(single.merge(&[5, 1, 1], &[7, 1, 1]).unwrap(), vec![5, 0, 2]);
    assert_eq!(single.merge(&[5, 0, 2], &[7, 1, 1]).unwrap(), vec![7, 1, 3]);
}

#[test]
fn test_merge_delta() {
    let delta = MergePolicy::Delta;
    assert_eq!(delta.merge(&[10, 3, 0, 0], &[18, 5, 4, -2]).unwrap(), vec![18, 8, 4, -2]);
}

#[test]
fn test_merge_add_and_unknown() {
    assert_eq!(MergePolicy::Add.merge(&[1, 2, 3], &[10, 20, 30]).unwrap(), vec![11, 22, 33]);
    let ior = MergePolicy::Unknown("ior".to_owned());
    assert_eq!(ior.merge(&[1, 2], &[3, 0]).unwrap(), vec![3, 0]);
}

#[test]
fn test_merge_errors() {
    match *MergePolicy::Add.merge(&[i64::max_value()], &[1]).unwrap_err().kind() {
        ErrorKind::CounterOverflow => {},
        ref e => panic!("unexpected error {:?}", e),
    }
    match *MergePolicy::Single.merge(&[5, -1, 1], &[7, i64::max_value(), 1]).unwrap_err().kind() {
        ErrorKind::CounterOverflow => {},
        ref e => panic!("unexpected error {:?}", e),
    }
    match *MergePolicy::Single.merge(&[1, 2, 3, 4], &[1, 2, 3, 4]).unwrap_err().kind() {
        ErrorKind::IncompleteTuple(ref name, 3, 4) if name == "single" => {},
        ref e => panic!("unexpected error {:?}", e),
    }
    assert!(MergePolicy::Delta.check_count(3).is_err());
    assert!(MergePolicy::Delta.check_count(4).is_ok());
    assert!(MergePolicy::Add.check_count(7).is_ok());
}

//}}}
//----------------------------------------------------------------------------------------------------------------------
//{{{ Summary

/// Cumulative summary of one summable counter type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Summary {
    /// Number of counters.
    pub num: u32,
    /// Number of program runs.
    pub runs: u32,
    /// Sum of all counters accumulated.
    pub sum_all: i64,
    /// Maximum value on a single run.
    pub run_max: i64,
    /// Sum of individual run maximums.
    pub sum_max: i64,
}

impl Summary {
    /// Summarizes the counters of a single run.
    pub fn of_run<I: IntoIterator<Item = i64>>(values: I) -> Summary {
        let mut summary = Summary {
            runs: 1,
            ..Summary::default()
        };
        for value in values {
            summary.num = summary.num.saturating_add(1);
            summary.sum_all = summary.sum_all.saturating_add(value);
            summary.run_max = cmp::max(summary.run_max, value);
        }
        summary.sum_max = summary.run_max;
        summary
    }

    /// Merges another summary to here, component by component. Sums saturate.
    pub fn merge(&mut self, other: &Summary) {
        self.num = cmp::max(self.num, other.num);
        self.runs = self.runs.saturating_add(other.runs);
        self.sum_all = self.sum_all.saturating_add(other.sum_all);
        self.run_max = cmp::max(self.run_max, other.run_max);
        self.sum_max = self.sum_max.saturating_add(other.sum_max);
    }

    /// Merges a summary received from a peer. A summary is always worth at least one run, and its sum of maximums is
    /// never below its run maximum.
    pub fn merge_run(&mut self, other: &Summary) {
        let normalized = Summary {
            runs: cmp::max(other.runs, 1),
            run_max: cmp::max(other.run_max, 0),
            sum_max: cmp::max(other.sum_max, cmp::max(other.run_max, 0)),
            ..*other
        };
        self.merge(&normalized);
    }

    /// Computes the difference `self - old`, such that merging `old` with the result gives back `self`.
    pub fn subtract(&self, old: &Summary) -> Summary {
        Summary {
            num: self.num,
            runs: self.runs.saturating_sub(old.runs),
            sum_all: self.sum_all.saturating_sub(old.sum_all),
            run_max: self.run_max,
            sum_max: self.sum_max.saturating_sub(old.sum_max),
        }
    }
}

#[test]
fn test_summary_merge_run() {
    let mut s = Summary::default();
    s.merge_run(&Summary { num: 1, runs: 1, sum_all: 5, run_max: 5, sum_max: 5 });
    assert_eq!(s, Summary { num: 1, runs: 1, sum_all: 5, run_max: 5, sum_max: 5 });
    s.merge_run(&Summary { num: 3, runs: 0, sum_all: 9, run_max: 7, sum_max: 0 });
    assert_eq!(s, Summary { num: 3, runs: 2, sum_all: 14, run_max: 7, sum_max: 12 });
    assert!(s.sum_max >= s.run_max && s.run_max >= 0);
}

#[test]
fn test_summary_subtract() {
    let old = Summary { num: 3, runs: 2, sum_all: 14, run_max: 7, sum_max: 12 };
    let new = Summary { num: 3, runs: 3, sum_all: 20, run_max: 8, sum_max: 20 };
    let mut merged = old;
    merged.merge(&new.subtract(&old));
    assert_eq!(merged, new);
}

#[test]
fn test_summary_saturates() {
    let mut s = Summary { num: 1, runs: u32::max_value(), sum_all: i64::max_value(), run_max: 1, sum_max: 1 };
    s.merge_run(&Summary { num: 1, runs: 1, sum_all: 1, run_max: i64::max_value(), sum_max: i64::max_value() });
    assert_eq!(s, Summary {
        num: 1,
        runs: u32::max_value(),
        sum_all: i64::max_value(),
        run_max: i64::max_value(),
        sum_max: i64::max_value(),
    });
}

//}}}
//----------------------------------------------------------------------------------------------------------------------
//{{{ ObjectHeader

/// The header line of an object record: `FILENAME new VERSION STAMP OBJCHK PRGCHK NFUNCS CTRMASK`.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ObjectHeader {
    pub filename: String,
    pub version: Version,
    pub stamp: u32,
    pub checksum: u32,
    pub program_checksum: u32,
    pub n_functions: u32,
    pub ctr_mask: CounterMask,
}

impl ObjectHeader {
    /// Whether two headers describe the same instrumentation of the same file.
    pub fn same_instrumentation(&self, other: &ObjectHeader) -> bool {
        self.filename == other.filename &&
            self.version == other.version &&
            self.stamp == other.stamp &&
            self.checksum == other.checksum &&
            self.program_checksum == other.program_checksum &&
            self.ctr_mask == other.ctr_mask
    }
}

//}}}
