//! Errors related to the `tce` crate.
//!
//! Please see documentation of the [`error-chain` crate](https://docs.rs/error-chain/0.12.0/error_chain/) for detailed
//! usage.

use raw::{CounterType, Ident};

use std::io;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::result::Result as StdResult;

error_chain! {
    foreign_links {
        Io(io::Error) /** Wrapper of standard I/O error. */;
        ParseInt(ParseIntError) /** Wrapper of integer parse error. */;
        Nix(::nix::Error) /** Wrapper of a system call error. */;
        Json(::serde_json::Error) #[cfg(feature="serde_json")] /** Wrapper of JSON error. */;
    }

    errors {
        /// The transport descriptor is not one of `fifo:`, `unix:`, `abstract:` or `tcp:`.
        BadDescriptor(descriptor: String) {
            description("bad transport descriptor")
            display("bad transport descriptor '{}'", descriptor)
        }

        /// The system ran out of file descriptors or memory while opening a channel.
        ResourceExhausted(descriptor: String) {
            description("resource exhausted")
            display("resource exhausted while opening '{}'", descriptor)
        }

        /// The address of a listening socket is already bound.
        AddressInUse(descriptor: String) {
            description("address in use")
            display("address of '{}' is already in use", descriptor)
        }

        /// Not allowed to create or open the channel.
        PermissionDenied(descriptor: String) {
            description("permission denied")
            display("permission denied while opening '{}'", descriptor)
        }

        /// None of the requested listeners could be opened.
        NoListeners {
            description("no channels could be opened")
        }

        /// A line does not follow the record grammar.
        Protocol(line: String) {
            description("malformed record")
            display("malformed record '{}'", line)
        }

        /// A well-formed record arrived in a state that does not accept it.
        UnexpectedRecord(expected: &'static str, line: String) {
            description("unexpected record")
            display("expecting {}, received '{}'", expected, line)
        }

        /// A line did not terminate before the line buffer was full.
        LineTooLong(limit: usize) {
            description("line too long")
            display("line longer than {} bytes", limit)
        }

        /// The peer tried to authenticate twice with different ids.
        PeerRebind(old: u32, new: u32) {
            description("peer id rebinding")
            display("peer id is already {}, refusing to rebind to {}", old, new)
        }

        /// The counter mask has bits outside the known counter types.
        UnsupportedCounterMask(mask: u32) {
            description("unsupported counter mask")
            display("unsupported counter mask 0x{:x}", mask)
        }

        /// A file is announced again by the same peer, but from a different compilation.
        IncompatibleReinstrumentation(peer: u32, filename: String) {
            description("incompatible reinstrumentation")
            display("'{}' of peer {} was instrumented differently before", filename, peer)
        }

        /// A function is announced again with a different checksum.
        ChecksumMismatch(ident: Ident, expected: u32, actual: u32) {
            description("checksum mismatch")
            display("checksum mismatch on function {}, expecting {}, received {}", ident, expected, actual)
        }

        /// The number of counters of some type differs from the previous sighting of the function.
        CountsMismatch(ty: CounterType, expected: usize, actual: usize) {
            description("counts mismatch")
            display("{0} counts mismatch, expecting {1} {0}, received {2} {0}", ty, expected, actual)
        }

        /// The number of counters is not a multiple of the measurement size of the merge policy.
        IncompleteTuple(policy: String, tuple_len: usize, count: usize) {
            description("incomplete counter tuple")
            display("{} counters of policy '{}' do not form tuples of {}", count, policy, tuple_len)
        }

        /// More counters announced than the collector accepts for one function.
        TooManyCounters(count: usize, limit: usize) {
            description("too many counters")
            display("{} counters announced, the limit is {}", count, limit)
        }

        /// Merging the counters would overflow 64 bits.
        CounterOverflow {
            description("counter overflow")
        }

        /// Two dump files do not come from the same instrumentation.
        InstrumentationMismatch(detail: String) {
            description("instrumentation mismatch")
            display("inputs come from different instrumentations: {}", detail)
        }

        /// A dump file stopped before its `end` record.
        Truncated(what: String) {
            description("truncated input")
            display("{} is truncated", what)
        }

        /// Context: the error happened at a line of an input.
        AtLine(line: usize) {
            description("error at line")
            display("at line {}", line)
        }

        /// Context: the error happened while processing a file.
        InFile(path: PathBuf) {
            description("error in file")
            display("in file {}", path.display())
        }

        /// Context: the error happened on a peer connection.
        OnPeer(fd: i32) {
            description("error on peer")
            display("peer fd {}", fd)
        }
    }
}

impl Error {
    /// Formats the whole cause chain on a single line, outermost first, e.g. `peer fd 5: at line 2: malformed record`.
    pub fn one_line(&self) -> String {
        self.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(": ")
    }
}

impl ErrorKind {
    /// Whether the error only concerns the current record, so the peer connection may carry on.
    pub fn is_record_local(&self) -> bool {
        match *self {
            ErrorKind::IncompatibleReinstrumentation(..) |
            ErrorKind::ChecksumMismatch(..) |
            ErrorKind::CountsMismatch(..) |
            ErrorKind::CounterOverflow => true,
            _ => false,
        }
    }
}

//----------------------------------------------------------------------------------------------------------------------

/// Where an error happened. Wrapping a result attaches the location as the outermost error in the chain.
#[derive(Clone, Debug)]
pub enum Location {
    /// No location information.
    None,
    /// A 1-based line number.
    Line(usize),
    /// A file path.
    File(PathBuf),
    /// A peer connection, identified by its file descriptor.
    Peer(i32),
}

impl Location {
    /// Runs `f`, and wraps its error with this location.
    pub fn wrap<T, E: Into<Error>, F: FnOnce() -> StdResult<T, E>>(&self, f: F) -> Result<T> {
        f().map_err(|e| self.wrap_error(e))
    }

    /// Wraps an error with this location.
    pub fn wrap_error<E: Into<Error>>(&self, e: E) -> Error {
        let e = e.into();
        let kind = match *self {
            Location::None => return e,
            Location::Line(line) => ErrorKind::AtLine(line),
            Location::File(ref path) => ErrorKind::InFile(path.clone()),
            Location::Peer(fd) => ErrorKind::OnPeer(fd),
        };
        Error::with_chain(e, kind)
    }
}
