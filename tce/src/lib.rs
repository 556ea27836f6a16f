//! `tce` is the test coverage estimation pipeline: a collector which receives coverage counters from instrumented
//! programs, merges them per peer and source file, and dumps them for reporting tools.
//!
//! * [`runtime`] is linked into instrumented programs, and sends their counters on exit.
//! * [`collector`] runs the event loop receiving those counters over the [`transport`]s.
//! * [`parser`] turns each connection's byte stream into updates of the [`store`].
//! * [`dump`] writes the store to disk, and [`logfile`] merges or subtracts the written files.
//!
//! [`runtime`]: ./runtime/index.html
//! [`collector`]: ./collector/index.html
//! [`transport`]: ./transport/index.html
//! [`parser`]: ./parser/index.html
//! [`store`]: ./store/index.html
//! [`dump`]: ./dump/index.html
//! [`logfile`]: ./logfile/index.html

#![recursion_limit="256"] // needed for error_chain.

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[cfg(feature = "serde")]
#[macro_use]
extern crate serde;
#[cfg(feature = "serde_json")]
extern crate serde_json;
extern crate crc32fast;
extern crate libc;
extern crate nix;
extern crate tempfile;

pub mod error;
pub mod raw;
pub mod record;
pub mod store;
pub mod parser;
pub mod transport;
pub mod dump;
pub mod logfile;
pub mod collector;
pub mod runtime;

pub use collector::{Collector, Trigger};
pub use error::{Error, ErrorKind, Result};
pub use logfile::LogFile;
pub use parser::Parser;
pub use store::Store;
pub use transport::Descriptor;
