//! The runtime linked into instrumented programs.
//!
//! Every instrumented unit registers an [`ObjectDescriptor`] when the program starts. At exit, or when [`flush`] is
//! called, the counters of all registered objects are sent to the collector named by [`configure`] or by the
//! `TCE_CONNECTION` environment variable (`"<descriptor> <peer-id>"`).
//!
//! Coverage is best effort: failures are reported on stderr and never abort the program.
//!
//! Units built before `main` use [`register_at_startup!`], which registers them from the platform's static
//! initializer section.
//!
//! [`ObjectDescriptor`]: ./struct.ObjectDescriptor.html
//! [`register_at_startup!`]: ../macro.register_at_startup.html
//! [`flush`]: ./fn.flush.html
//! [`configure`]: ./fn.configure.html

use error::*;
use raw::*;
use record::Line;
use transport::{connect, Descriptor};

use crc32fast::Hasher;
use libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use std::env;
use std::io::{BufWriter, Write};
use std::sync::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicI64, Ordering};

include!(concat!(env!("OUT_DIR"), "/compiler.rs"));

/// Environment variable naming the collector when the program did not call [`configure`].
///
/// [`configure`]: ./fn.configure.html
pub const CONNECTION_VAR: &str = "TCE_CONNECTION";

//----------------------------------------------------------------------------------------------------------------------
//{{{ Descriptors

/// Counters of one counter type of a function.
#[derive(Debug)]
pub struct Counters {
    pub policy: MergePolicy,
    values: Vec<AtomicI64>,
}

impl Counters {
    /// Creates `len` zeroed counters.
    pub fn new(policy: MergePolicy, len: usize) -> Counters {
        Counters {
            policy,
            values: (0..len).map(|_| AtomicI64::new(0)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Adds `delta` to the `index`-th counter. Out-of-range indices are ignored.
    pub fn add(&self, index: usize, delta: i64) {
        if let Some(value) = self.values.get(index) {
            value.fetch_add(delta, Ordering::Relaxed);
        }
    }

    /// Sets the `index`-th counter. Out-of-range indices are ignored.
    pub fn set(&self, index: usize, value: i64) {
        if let Some(slot) = self.values.get(index) {
            slot.store(value, Ordering::Relaxed);
        }
    }

    /// Profiles one occurrence of `value` into the `(value, count, seen)` triple starting at `index`, the way the
    /// collector merges `single` counters.
    pub fn profile_value(&self, index: usize, value: i64) {
        let triple = match self.values.get(index..).and_then(|v| v.get(..3)) {
            Some(triple) => triple,
            None => return,
        };
        if triple[0].load(Ordering::Relaxed) == value {
            triple[1].fetch_add(1, Ordering::Relaxed);
        } else if triple[1].load(Ordering::Relaxed) == 0 {
            triple[0].store(value, Ordering::Relaxed);
            triple[1].store(1, Ordering::Relaxed);
        } else {
            triple[1].fetch_sub(1, Ordering::Relaxed);
        }
        triple[2].fetch_add(1, Ordering::Relaxed);
    }

    /// Reads the current values.
    pub fn snapshot(&self) -> Vec<i64> {
        self.values.iter().map(|v| v.load(Ordering::Relaxed)).collect()
    }

    fn reset(&self) {
        for value in &self.values {
            value.store(0, Ordering::Relaxed);
        }
    }
}

/// A function of an instrumented unit.
#[derive(Debug)]
pub struct FunctionDescriptor {
    pub ident: Ident,
    pub checksum: u32,
    /// One entry per enabled counter type, in mask order.
    pub counters: Vec<Counters>,
}

/// An instrumented unit.
#[derive(Debug)]
pub struct ObjectDescriptor {
    pub filename: String,
    pub stamp: u32,
    pub checksum: u32,
    pub ctr_mask: CounterMask,
    pub functions: Vec<FunctionDescriptor>,
}

impl ObjectDescriptor {
    /// The counters of the given type, if the type is enabled.
    pub fn counters(&self, function: usize, ty: CounterType) -> Option<&Counters> {
        let position = self.ctr_mask.types().iter().position(|&t| t == ty)?;
        self.functions.get(function).and_then(|f| f.counters.get(position))
    }

    /// All arc counter values, in function order.
    fn arcs(&self) -> Vec<i64> {
        if !self.ctr_mask.contains(CounterMask::ARCS) {
            return Vec::new();
        }
        self.functions
            .iter()
            .filter_map(|f| f.counters.first())
            .flat_map(|c| c.snapshot())
            .collect()
    }
}

//}}}
//----------------------------------------------------------------------------------------------------------------------
//{{{ Registry

#[derive(Default)]
struct Registry {
    objects: Vec<&'static ObjectDescriptor>,
    connection: Option<(Descriptor, u32)>,
    init_hook: Option<fn()>,
    fini_hook: Option<fn()>,
    exit_hook_installed: bool,
    init_done: bool,
}

impl Registry {
    /// The init hook, if it is due: something is registered and the hook has not run yet.
    fn take_init_hook(&mut self) -> Option<fn()> {
        if self.init_done || self.objects.is_empty() {
            return None;
        }
        let init = self.init_hook?;
        self.init_done = true;
        Some(init)
    }
}

lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry::default());
}

fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(|e| e.into_inner())
}

extern "C" fn at_exit() {
    let _ = dump();
    let fini = registry().fini_hook;
    if let Some(fini) = fini {
        fini();
    }
}

/// Registers an instrumented unit. The first registration installs the exit hook. The init hook runs once, as soon as
/// both a unit is registered and the hook is set.
///
/// # Errors
///
/// * Returns [`Protocol`] if the number of counter arrays of a function does not match the counter mask.
/// * Returns [`IncompleteTuple`] if a counter array does not hold whole tuples of its merge policy.
///
/// [`Protocol`]: ../error/enum.ErrorKind.html#variant.Protocol
/// [`IncompleteTuple`]: ../error/enum.ErrorKind.html#variant.IncompleteTuple
pub fn register(object: ObjectDescriptor) -> Result<&'static ObjectDescriptor> {
    let n_types = object.ctr_mask.types().len();
    for function in &object.functions {
        ensure!(
            function.counters.len() == n_types,
            ErrorKind::Protocol(format!(
                "{}: function {} has {} counter arrays",
                object.filename,
                function.ident,
                function.counters.len()
            ))
        );
        for counters in &function.counters {
            counters.policy.check_count(counters.len())?;
        }
    }

    let object: &'static ObjectDescriptor = Box::leak(Box::new(object));
    let (install, init) = {
        let mut registry = registry();
        registry.objects.push(object);
        let install = !registry.exit_hook_installed;
        registry.exit_hook_installed = true;
        (install, registry.take_init_hook())
    };
    if install && unsafe { libc::atexit(at_exit) } != 0 {
        eprintln!("tce: cannot install the exit hook, coverage of this run will be lost");
    }
    if let Some(init) = init {
        init();
    }
    Ok(object)
}

/// All registered units, in registration order.
pub fn registered() -> Vec<&'static ObjectDescriptor> {
    registry().objects.clone()
}

/// Registers the unit built by `$build`, a `fn() -> ObjectDescriptor`, before `main` runs.
///
/// Registration errors are reported on stderr.
#[macro_export]
macro_rules! register_at_startup {
    ($build:path) => {
        const _: () = {
            extern "C" fn register_unit() {
                if let Err(e) = $crate::runtime::register($build()) {
                    eprintln!("tce: cannot register: {}", e.one_line());
                }
            }

            #[used]
            #[cfg_attr(
                any(target_os = "linux", target_os = "android", target_os = "freebsd"),
                link_section = ".init_array"
            )]
            #[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
            static REGISTER_UNIT: extern "C" fn() = register_unit;
        };
    };
}

/// Names the collector, overriding `TCE_CONNECTION`.
///
/// # Errors
///
/// Returns [`BadDescriptor`] if the descriptor cannot be parsed, or [`Protocol`] if the peer id is zero.
///
/// [`BadDescriptor`]: ../error/enum.ErrorKind.html#variant.BadDescriptor
/// [`Protocol`]: ../error/enum.ErrorKind.html#variant.Protocol
pub fn configure(descriptor: &str, peer: u32) -> Result<()> {
    ensure!(peer > 0, ErrorKind::Protocol(peer.to_string()));
    let descriptor = descriptor.parse()?;
    registry().connection = Some((descriptor, peer));
    Ok(())
}

/// Installs functions run once after the first registration, and after the exit dump.
///
/// If units are already registered, e.g. from static initializers, the init hook runs before this returns.
pub fn set_target_hooks(init: Option<fn()>, fini: Option<fn()>) {
    let init = {
        let mut registry = registry();
        registry.init_hook = init;
        registry.fini_hook = fini;
        registry.take_init_hook()
    };
    if let Some(init) = init {
        init();
    }
}

/// Parses a `"<descriptor> <peer-id>"` connection string.
pub fn parse_connection(value: &str) -> Result<(Descriptor, u32)> {
    let mut parts = value.split_whitespace();
    let descriptor = parts.next().ok_or_else(|| ErrorKind::BadDescriptor(value.to_owned()))?.parse()?;
    let peer = match (parts.next(), parts.next()) {
        (Some(peer), None) => ::record::parse_peer_id(peer)?,
        _ => bail!(ErrorKind::BadDescriptor(value.to_owned())),
    };
    Ok((descriptor, peer))
}

/// The version magic of this runtime.
pub fn version() -> Version {
    Version::from_compiler(COMPILER_VERSION)
}

/// CRC-32 over the concatenation of the filenames.
pub fn program_checksum<'a, I: IntoIterator<Item = &'a str>>(filenames: I) -> u32 {
    let mut hasher = Hasher::new();
    for filename in filenames {
        hasher.update(filename.as_bytes());
    }
    hasher.finalize()
}

//}}}
//----------------------------------------------------------------------------------------------------------------------
//{{{ Dump

/// Writes the wire stream of `objects`, starting with the peer id.
pub fn write_records<W: Write>(
    mut writer: W,
    peer: u32,
    version: Version,
    objects: &[&ObjectDescriptor],
) -> Result<()> {
    let program_checksum = program_checksum(objects.iter().map(|o| &*o.filename));
    let program_summary = Summary::of_run(objects.iter().flat_map(|o| o.arcs()));

    writeln!(writer, "{}", peer)?;
    for object in objects {
        let header = ObjectHeader {
            filename: object.filename.clone(),
            version,
            stamp: object.stamp,
            checksum: object.checksum,
            program_checksum,
            n_functions: object.functions.len() as u32,
            ctr_mask: object.ctr_mask,
        };
        writeln!(writer, "{}", Line::Header(header))?;
        for _ in object.ctr_mask.summable_types() {
            writeln!(writer, "{}", Line::Summary(Summary::of_run(object.arcs()), program_summary))?;
        }
        for function in &object.functions {
            writeln!(writer, "{}", Line::Function(function.ident, function.checksum))?;
            for counters in &function.counters {
                let values = counters.snapshot();
                writeln!(writer, "{}", Line::Counters(counters.policy.clone(), values.len()))?;
                for value in values {
                    writeln!(writer, "{}", Line::Value(value))?;
                }
            }
        }
    }
    writeln!(writer, "{}", Line::End)?;
    writer.flush()?;
    Ok(())
}

/// Sends the counters of every registered unit to the collector.
///
/// SIGPIPE is ignored while sending. Failures are also reported on stderr.
///
/// # Errors
///
/// Returns [`BadDescriptor`] if no collector is configured, or the error from connecting or writing.
///
/// [`BadDescriptor`]: ../error/enum.ErrorKind.html#variant.BadDescriptor
pub fn dump() -> Result<()> {
    let (objects, connection) = {
        let registry = registry();
        (registry.objects.clone(), registry.connection.clone())
    };
    if objects.is_empty() {
        return Ok(());
    }
    let connection = match connection {
        Some(c) => Ok(c),
        None => match env::var(CONNECTION_VAR) {
            Ok(value) => parse_connection(&value),
            Err(_) => Err(ErrorKind::BadDescriptor(format!("${} is not set", CONNECTION_VAR)).into()),
        },
    };

    let result = connection.and_then(|(descriptor, peer)| {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let previous = unsafe { sigaction(Signal::SIGPIPE, &ignore) };
        let result = connect(&descriptor)
            .and_then(|stream| write_records(BufWriter::new(stream), peer, version(), &objects));
        if let Ok(previous) = previous {
            unsafe {
                let _ = sigaction(Signal::SIGPIPE, &previous);
            }
        }
        result
    });
    if let Err(ref e) = result {
        eprintln!("tce: coverage not sent: {}", e.one_line());
    }
    result
}

/// Sends the counters to the collector, then zeroes them so that a forked or re-executed process does not count them
/// twice.
pub fn flush() -> Result<()> {
    let result = dump();
    for object in registry().objects.iter() {
        for function in &object.functions {
            for counters in &function.counters {
                counters.reset();
            }
        }
    }
    result
}

//}}}
//----------------------------------------------------------------------------------------------------------------------
