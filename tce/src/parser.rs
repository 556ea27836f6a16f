//! Per-peer state machine turning a byte stream into store updates.
//!
//! The parser is fed whatever bytes are available and buffers the incomplete tail, so the store only ever sees whole
//! lines. A function record is staged until its last counter arrives and is then merged in one step, so a dump taken
//! between two reads never contains a partial function.

use error::*;
use raw::*;
use record::{parse_peer_id, Line};
use store::{FunctionRecord, ObjectIndex, Store};

use std::{mem, str};
use std::os::unix::io::RawFd;

/// Default maximum length of a line, including the newline.
pub const DEFAULT_LINE_LIMIT: usize = 4096;

/// Maximum number of counters announced by a single counter header.
pub const MAX_COUNTERS: usize = 1 << 20;

/// Whether the stream expects more data.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Status {
    /// More records are expected.
    Reading,
    /// The `end` record was received, or the parser is dead.
    Finished,
}

#[derive(Debug)]
enum State {
    Auth,
    Idle,
    Summaries {
        object: ObjectIndex,
        next: usize,
    },
    Functions {
        object: ObjectIndex,
    },
    CountersHead {
        object: ObjectIndex,
        function: FunctionRecord,
    },
    CountersBody {
        object: ObjectIndex,
        function: FunctionRecord,
        remaining: usize,
    },
    /// Ignoring the rest of an object that was rejected by the store.
    Skip,
    Done,
    Dead,
}

impl State {
    fn expecting(&self) -> &'static str {
        match *self {
            State::Auth => "peer id",
            State::Idle => "object header or end",
            State::Summaries { .. } => "summary",
            State::Functions { .. } => "function, object header or end",
            State::CountersHead { .. } => "counter header",
            State::CountersBody { .. } => "counter value",
            State::Skip => "object header or end",
            State::Done | State::Dead => "nothing",
        }
    }
}

/// The parser of a single data channel.
#[derive(Debug)]
pub struct Parser {
    fd: RawFd,
    peer: u32,
    buffer: Vec<u8>,
    line_limit: usize,
    line_number: usize,
    rearm: bool,
    state: State,
}

impl Parser {
    /// Creates a parser for a wire stream, which starts with the peer id.
    ///
    /// `fd` only identifies the channel in diagnostics, and is negative when reading a file. Lines longer than
    /// `line_limit` bytes (including the newline) are fatal.
    pub fn new(fd: RawFd, line_limit: usize) -> Parser {
        Parser {
            fd,
            peer: 0,
            buffer: Vec::new(),
            line_limit,
            line_number: 0,
            rearm: false,
            state: State::Auth,
        }
    }

    /// Creates a parser for a dump file, which carries no peer id. The records are attributed to `peer`.
    pub fn with_peer(fd: RawFd, peer: u32, line_limit: usize) -> Parser {
        Parser {
            peer,
            state: State::Idle,
            ..Parser::new(fd, line_limit)
        }
    }

    /// Makes the parser expect a new peer id after `end`, instead of finishing. Used for FIFOs, which successive
    /// writers share.
    pub fn rearm_after_end(mut self) -> Parser {
        self.rearm = true;
        self
    }

    /// The peer id, once authenticated.
    pub fn peer(&self) -> Option<u32> {
        if self.peer == 0 {
            None
        } else {
            Some(self.peer)
        }
    }

    /// Whether a line is partially buffered or a record is partially read.
    pub fn is_mid_record(&self) -> bool {
        if !self.buffer.is_empty() {
            return true;
        }
        match self.state {
            State::Auth | State::Done | State::Dead => false,
            _ => true,
        }
    }

    /// Consumes a chunk of the stream, applying every complete line to the store.
    ///
    /// Record-local errors (an object or function inconsistent with what the store already has) are logged, and the
    /// offending record is dropped.
    ///
    /// # Errors
    ///
    /// Any other error, e.g. a malformed line, a line exceeding the limit, or a counter header announcing more than
    /// [`MAX_COUNTERS`] values or incomplete tuples, kills the parser. The error is wrapped with the channel and line
    /// number.
    ///
    /// [`MAX_COUNTERS`]: ./constant.MAX_COUNTERS.html
    pub fn feed(&mut self, bytes: &[u8], store: &mut Store) -> Result<Status> {
        for &b in bytes {
            match self.state {
                State::Done | State::Dead => break,
                _ => {},
            }
            if b == b'\n' {
                self.line_number += 1;
                let line = mem::replace(&mut self.buffer, Vec::new());
                let res = self.dispatch(&line, store);
                self.buffer = line;
                self.buffer.clear();
                if let Err(e) = res {
                    self.state = State::Dead;
                    return Err(self.locate(Location::Line(self.line_number).wrap_error(e)));
                }
            } else if self.buffer.len() + 1 >= self.line_limit {
                self.state = State::Dead;
                return Err(self.locate(ErrorKind::LineTooLong(self.line_limit).into()));
            } else {
                self.buffer.push(b);
            }
        }
        Ok(self.status())
    }

    /// Whether the stream expects more data.
    pub fn status(&self) -> Status {
        match self.state {
            State::Done | State::Dead => Status::Finished,
            _ => Status::Reading,
        }
    }

    fn dispatch(&mut self, raw: &[u8], store: &mut Store) -> Result<()> {
        let text = str::from_utf8(raw).map_err(|_| ErrorKind::Protocol(String::from_utf8_lossy(raw).into_owned()))?;
        trace!("peer fd {}: {}", self.fd, text);

        let state = mem::replace(&mut self.state, State::Dead);
        match state {
            State::Auth => {
                let peer = parse_peer_id(text)?;
                ensure!(self.peer == 0 || self.peer == peer, ErrorKind::PeerRebind(self.peer, peer));
                debug!("peer fd {}: authenticated as peer {}", self.fd, peer);
                self.peer = peer;
                self.state = State::Idle;
                return Ok(());
            },
            State::Skip => {
                match Line::parse(text)? {
                    Line::Header(header) => self.open_object(header, store)?,
                    Line::End => self.end(),
                    _ => self.state = State::Skip,
                }
                return Ok(());
            },
            _ => {},
        }

        self.state = match (state, Line::parse(text)?) {
            (State::Idle, Line::Header(header)) | (State::Functions { .. }, Line::Header(header)) => {
                return self.open_object(header, store);
            },
            (State::Idle, Line::End) | (State::Functions { .. }, Line::End) => {
                self.end();
                return Ok(());
            },
            (State::Summaries { object, next }, Line::Summary(o, p)) => {
                store.merge_summary(object, next, &o, &p);
                if next + 1 < store[object].summaries.len() {
                    State::Summaries { object, next: next + 1 }
                } else {
                    State::Functions { object }
                }
            },
            (State::Functions { object }, Line::Function(ident, checksum)) => {
                let function = FunctionRecord {
                    ident,
                    checksum,
                    counters: Vec::new(),
                };
                self.next_counters(object, function, store)?
            },
            (State::CountersHead { object, mut function }, Line::Counters(policy, count)) => {
                ensure!(count <= MAX_COUNTERS, ErrorKind::TooManyCounters(count, MAX_COUNTERS));
                policy.check_count(count)?;
                function.counters.push((policy, Vec::new()));
                if count == 0 {
                    self.next_counters(object, function, store)?
                } else {
                    State::CountersBody {
                        object,
                        function,
                        remaining: count,
                    }
                }
            },
            (State::CountersBody { object, mut function, remaining }, Line::Value(value)) => {
                if let Some(&mut (_, ref mut values)) = function.counters.last_mut() {
                    values.push(value);
                }
                if remaining > 1 {
                    State::CountersBody {
                        object,
                        function,
                        remaining: remaining - 1,
                    }
                } else {
                    self.next_counters(object, function, store)?
                }
            },
            (state, line) => bail!(ErrorKind::UnexpectedRecord(state.expecting(), line.to_string())),
        };
        Ok(())
    }

    fn open_object(&mut self, header: ObjectHeader, store: &mut Store) -> Result<()> {
        match store.get_or_create(self.peer, &header) {
            Ok(object) => {
                self.state = if store[object].summaries.is_empty() {
                    State::Functions { object }
                } else {
                    State::Summaries { object, next: 0 }
                };
                Ok(())
            },
            Err(ref e) if e.kind().is_record_local() => {
                self.report_dropped(e);
                self.state = State::Skip;
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    /// Moves to the next counter type of the function, or merges the function if all counter types were read.
    fn next_counters(&mut self, object: ObjectIndex, function: FunctionRecord, store: &mut Store) -> Result<State> {
        if function.counters.len() < store[object].header.ctr_mask.types().len() {
            return Ok(State::CountersHead { object, function });
        }
        match store.merge_function(object, function) {
            Ok(()) => {},
            Err(ref e) if e.kind().is_record_local() => self.report_dropped(e),
            Err(e) => return Err(e),
        }
        Ok(State::Functions { object })
    }

    /// Attaches the channel to an error. Parsers reading files have a negative `fd` and no channel.
    fn locate(&self, e: Error) -> Error {
        if self.fd < 0 {
            e
        } else {
            Location::Peer(self.fd).wrap_error(e)
        }
    }

    fn end(&mut self) {
        debug!("peer fd {}: end of records from peer {}", self.fd, self.peer);
        self.state = if self.rearm { State::Auth } else { State::Done };
    }

    fn report_dropped(&self, e: &Error) {
        error!("peer fd {}: line {}: {}, record dropped", self.fd, self.line_number, e.one_line());
    }
}

//----------------------------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO_1: &[u8] = b"7\nfoo.c new 1 0 0 0 1 1\n>1 1 5 5 5 1 1 5 5 5\n*1 0\n~add 3\n+1\n+2\n+2\nend\n";

    fn feed(stream: &[u8], store: &mut Store) -> Result<Status> {
        Parser::new(3, DEFAULT_LINE_LIMIT).feed(stream, store)
    }

    fn values(store: &Store, peer: u32, filename: &str) -> Vec<Vec<i64>> {
        let object = store.find(peer, filename).expect("object exists");
        store[object].functions.iter().map(|f| f.counters[0].values.clone()).collect()
    }

    #[test]
    fn test_single_peer() {
        let mut store = Store::new();
        assert_eq!(feed(SCENARIO_1, &mut store).unwrap(), Status::Finished);
        let object = store.find(7, "foo.c").unwrap();
        assert_eq!(values(&store, 7, "foo.c"), vec![vec![1, 2, 2]]);
        let s = Summary { num: 1, runs: 1, sum_all: 5, run_max: 5, sum_max: 5 };
        assert_eq!(store[object].summaries, vec![(s, s)]);
    }

    #[test]
    fn test_line_atomicity() {
        let mut whole = Store::new();
        feed(SCENARIO_1, &mut whole).unwrap();

        for split in 0..SCENARIO_1.len() {
            let mut store = Store::new();
            let mut parser = Parser::new(3, DEFAULT_LINE_LIMIT);
            parser.feed(&SCENARIO_1[..split], &mut store).unwrap();
            parser.feed(&SCENARIO_1[split..], &mut store).unwrap();
            assert_eq!(store.objects().len(), 1, "split at {}", split);
            assert_eq!(store.objects()[0].functions, whole.objects()[0].functions, "split at {}", split);
            assert_eq!(store.objects()[0].summaries, whole.objects()[0].summaries, "split at {}", split);
        }

        let mut store = Store::new();
        let mut parser = Parser::new(3, DEFAULT_LINE_LIMIT);
        for b in SCENARIO_1 {
            parser.feed(&[*b], &mut store).unwrap();
        }
        assert_eq!(store.objects()[0].functions, whole.objects()[0].functions);
    }

    #[test]
    fn test_partial_function_is_not_visible() {
        let mut store = Store::new();
        let mut parser = Parser::new(3, DEFAULT_LINE_LIMIT);
        let stream = b"7\nfoo.c new 1 0 0 0 2 1\n>1 1 5 5 5 1 1 5 5 5\n*1 0\n~add 1\n+4\n*2 0\n~add 2\n+1\n+";
        assert_eq!(parser.feed(stream, &mut store).unwrap(), Status::Reading);
        assert!(parser.is_mid_record());
        let object = store.find(7, "foo.c").unwrap();
        assert_eq!(store[object].functions.len(), 1);
        assert_eq!(store[object].functions[0].ident, Ident(1));

        parser.feed(b"9\nend\n", &mut store).unwrap();
        assert_eq!(values(&store, 7, "foo.c"), vec![vec![4], vec![1, 9]]);
    }

    #[test]
    fn test_garbage_kills_peer() {
        let mut store = Store::new();
        let mut parser = Parser::new(5, DEFAULT_LINE_LIMIT);
        let e = parser.feed(b"7\ngarbage\n", &mut store).unwrap_err();
        assert_eq!(e.one_line(), "peer fd 5: at line 2: malformed record 'garbage'");
        assert_eq!(parser.status(), Status::Finished);
        assert!(store.is_empty());
    }

    #[test]
    fn test_unexpected_record() {
        let mut store = Store::new();
        let e = feed(b"7\n+1\n", &mut store).unwrap_err();
        match *e.kind() {
            ErrorKind::OnPeer(3) => {},
            ref k => panic!("unexpected error {:?}", k),
        }
        assert!(e.one_line().ends_with("expecting object header or end, received '+1'"));
    }

    #[test]
    fn test_bad_peer_id() {
        let mut store = Store::new();
        assert!(feed(b"0\n", &mut store).is_err());
        assert!(feed(b"foo.c new 1 0 0 0 1 1\n", &mut store).is_err());
    }

    #[test]
    fn test_line_too_long() {
        let mut store = Store::new();
        let mut parser = Parser::new(3, 8);
        assert_eq!(parser.feed(b"1234567\n", &mut store).unwrap(), Status::Reading);
        let e = parser.feed(b"12345678", &mut store).unwrap_err();
        assert_eq!(e.one_line(), "peer fd 3: line longer than 8 bytes");
    }

    #[test]
    fn test_incompatible_object_is_skipped() {
        let mut store = Store::new();
        feed(SCENARIO_1, &mut store).unwrap();
        let stream = b"7\nfoo.c new 1 9 0 0 1 1\n>1 1 5 5 5 1 1 5 5 5\n*1 0\n~add 3\n+1\n+2\n+2\n\
                       bar.c new 1 0 0 0 1 1\n>1 1 1 1 1 1 1 1 1 1\n*1 0\n~add 1\n+1\nend\n";
        assert_eq!(feed(stream, &mut store).unwrap(), Status::Finished);
        assert_eq!(values(&store, 7, "foo.c"), vec![vec![1, 2, 2]]);
        assert_eq!(values(&store, 7, "bar.c"), vec![vec![1]]);
    }

    #[test]
    fn test_skipped_object_still_checks_grammar() {
        let mut store = Store::new();
        feed(SCENARIO_1, &mut store).unwrap();
        let stream = b"7\nfoo.c new 1 9 0 0 1 1\n>1 1 5 5 5 1 1 5 5 5\ngarbage\n";
        let e = feed(stream, &mut store).unwrap_err();
        assert_eq!(e.one_line(), "peer fd 3: at line 4: malformed record 'garbage'");
        assert_eq!(values(&store, 7, "foo.c"), vec![vec![1, 2, 2]]);
    }

    #[test]
    fn test_counter_header_limits() {
        let mut store = Store::new();
        let stream = format!("7\nfoo.c new 1 0 0 0 1 1\n>1 1 5 5 5 1 1 5 5 5\n*1 0\n~add {}\n", MAX_COUNTERS + 1);
        let e = feed(stream.as_bytes(), &mut store).unwrap_err();
        let expected = format!("{} counters announced, the limit is {}", MAX_COUNTERS + 1, MAX_COUNTERS);
        assert!(e.one_line().ends_with(&expected), "{}", e.one_line());

        let mut store = Store::new();
        let stream = b"7\nfoo.c new 1 0 0 0 1 8\n*1 0\n~single 2\n+5\n+1\nend\n";
        let e = feed(stream, &mut store).unwrap_err();
        assert!(e.one_line().ends_with("2 counters of policy 'single' do not form tuples of 3"), "{}", e.one_line());
        assert!(store[store.find(7, "foo.c").unwrap()].functions.is_empty());
    }

    #[test]
    fn test_counts_mismatch_drops_function() {
        let mut store = Store::new();
        feed(SCENARIO_1, &mut store).unwrap();
        let stream = b"7\nfoo.c new 1 0 0 0 1 1\n>1 1 5 5 5 1 1 5 5 5\n*1 0\n~add 2\n+1\n+2\nend\n";
        assert_eq!(feed(stream, &mut store).unwrap(), Status::Finished);
        assert_eq!(values(&store, 7, "foo.c"), vec![vec![1, 2, 2]]);
        let object = store.find(7, "foo.c").unwrap();
        assert_eq!(store[object].summaries[0].0.runs, 2);
    }

    #[test]
    fn test_multiple_counter_types() {
        let mut store = Store::new();
        let stream = b"7\nfoo.c new 1 0 0 0 1 9\n>2 1 3 2 2 2 1 3 2 2\n*1 0\n~add 2\n+1\n+2\n~single 0\n\
                       *2 0\n~add 0\n~single 3\n+5\n+5\n+7\nend\n";
        feed(stream, &mut store).unwrap();
        let object = store.find(7, "foo.c").unwrap();
        let functions = &store[object].functions;
        assert_eq!(functions.len(), 2);
        assert_eq!(functions[0].counters[1].values, Vec::<i64>::new());
        assert_eq!(functions[1].counters[0].values, Vec::<i64>::new());
        assert_eq!(functions[1].counters[1].values, vec![5, 5, 7]);
        assert_eq!(functions[1].counters[1].policy, MergePolicy::Single);
    }

    #[test]
    fn test_rearm_after_end() {
        let mut store = Store::new();
        let mut parser = Parser::new(3, DEFAULT_LINE_LIMIT).rearm_after_end();
        assert_eq!(parser.feed(SCENARIO_1, &mut store).unwrap(), Status::Reading);
        assert_eq!(parser.feed(SCENARIO_1, &mut store).unwrap(), Status::Reading);
        assert_eq!(values(&store, 7, "foo.c"), vec![vec![2, 4, 4]]);

        let e = parser.feed(b"8\n", &mut store).unwrap_err();
        match *e.kind() {
            ErrorKind::OnPeer(3) => {},
            ref k => panic!("unexpected error {:?}", k),
        }
        assert!(e.one_line().ends_with("peer id is already 7, refusing to rebind to 8"));
    }

    #[test]
    fn test_with_peer() {
        let mut store = Store::new();
        let mut parser = Parser::with_peer(-1, 42, DEFAULT_LINE_LIMIT);
        parser.feed(&SCENARIO_1[2..], &mut store).unwrap();
        assert_eq!(parser.peer(), Some(42));
        assert_eq!(values(&store, 42, "foo.c"), vec![vec![1, 2, 2]]);
    }
}
