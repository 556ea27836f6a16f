//! The collector event loop.
//!
//! A single thread waits for readiness on every listener, every connected peer and a wake-up socket. Signals and
//! [`Trigger`]s only write a request byte to the wake-up socket, so the store is never touched outside the loop and
//! requests are served between two reads, never in the middle of a line.
//!
//! [`Trigger`]: ./struct.Trigger.html

use dump;
use error::*;
use parser::{Parser, Status, DEFAULT_LINE_LIMIT};
use store::Store;
use transport::{open_listener, Descriptor, Listener, Stream};

use libc::{self, c_int, c_void};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;

use std::{env, fs, io, process, thread};
use std::io::{Read, Write};
use std::os::unix::io::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

const REQUEST_DUMP: u8 = b'H';
const REQUEST_TERMINATE: u8 = b'T';
const REQUEST_RESET: u8 = b'R';

const READ_BUFFER_SIZE: usize = 65536;

//----------------------------------------------------------------------------------------------------------------------
//{{{ Signals

/// Write end of the wake-up socket of the collector that installed the signal handlers, or -1.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(signo: c_int) {
    let request = match signo {
        libc::SIGHUP => REQUEST_DUMP,
        libc::SIGTERM => REQUEST_TERMINATE,
        libc::SIGUSR1 => REQUEST_RESET,
        _ => return,
    };
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        // write(2) is async-signal-safe; a full socket already holds pending requests.
        unsafe {
            libc::write(fd, &request as *const u8 as *const c_void, 1);
        }
    }
}

//}}}
//----------------------------------------------------------------------------------------------------------------------
//{{{ Trigger

/// Requests actions from a running collector, from any thread.
#[derive(Clone, Debug)]
pub struct Trigger {
    wake: Arc<UnixStream>,
}

impl Trigger {
    fn send(&self, request: u8) -> io::Result<()> {
        match (&*self.wake).write(&[request]) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Requests a dump, like SIGHUP.
    pub fn dump(&self) -> io::Result<()> {
        self.send(REQUEST_DUMP)
    }

    /// Requests a final dump and the end of the event loop, like SIGTERM.
    pub fn terminate(&self) -> io::Result<()> {
        self.send(REQUEST_TERMINATE)
    }

    /// Requests clearing the store, like SIGUSR1.
    pub fn reset(&self) -> io::Result<()> {
        self.send(REQUEST_RESET)
    }
}

//}}}
//----------------------------------------------------------------------------------------------------------------------
//{{{ Config

/// Settings of the collector.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory where dumps are written unless a dump request names another one.
    pub output: PathBuf,
    /// Directory holding dump request files.
    pub runtime_dir: PathBuf,
    /// Maximum length of a record line.
    pub line_limit: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            output: PathBuf::from("tce-dump"),
            runtime_dir: env::temp_dir(),
            line_limit: DEFAULT_LINE_LIMIT,
        }
    }
}

/// The file through which `tce dump` tells the collector `pid` where to dump.
pub fn dump_request_path(runtime_dir: &Path, pid: u32) -> PathBuf {
    runtime_dir.join(format!("tce-collector.{}.dump", pid))
}

/// Asks the collector `pid` to dump into `output`, and waits until it has done so.
///
/// # Errors
///
/// * Returns [`Nix`] if the collector cannot be signaled.
/// * Returns [`Io`] with kind `TimedOut` if the collector did not finish the dump within `timeout`.
///
/// [`Nix`]: ../error/enum.ErrorKind.html#variant.Nix
/// [`Io`]: ../error/enum.ErrorKind.html#variant.Io
pub fn request_dump(runtime_dir: &Path, pid: u32, output: &Path, timeout: Duration) -> Result<()> {
    let request = dump_request_path(runtime_dir, pid);
    let output = if output.is_absolute() { output.to_owned() } else { env::current_dir()?.join(output) };
    fs::write(&request, output.to_string_lossy().as_bytes())?;
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGHUP) {
        let _ = fs::remove_file(&request);
        bail!(e);
    }

    let deadline = Instant::now() + timeout;
    while request.exists() {
        if Instant::now() >= deadline {
            let _ = fs::remove_file(&request);
            bail!(io::Error::new(io::ErrorKind::TimedOut, format!("collector {} did not dump in time", pid)));
        }
        thread::sleep(Duration::from_millis(20));
    }
    Ok(())
}

//}}}
//----------------------------------------------------------------------------------------------------------------------
//{{{ Collector

struct ListenerSlot {
    listener: Listener,
    /// The parser of a FIFO, which is its own data channel.
    parser: Option<Parser>,
}

struct Peer {
    stream: Stream,
    parser: Parser,
}

/// The collector: listeners, peers and the coverage store.
pub struct Collector {
    config: Config,
    listeners: Vec<ListenerSlot>,
    peers: Vec<Peer>,
    store: Store,
    wake_rx: UnixStream,
    wake_tx: Arc<UnixStream>,
}

/// What to do after serving a channel.
enum Next {
    Keep,
    Close,
}

impl Collector {
    /// Opens every listener.
    ///
    /// A listener which cannot be opened is logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`NoListeners`] if no listener could be opened, or [`Io`] if the wake-up socket cannot be created.
    ///
    /// [`NoListeners`]: ../error/enum.ErrorKind.html#variant.NoListeners
    /// [`Io`]: ../error/enum.ErrorKind.html#variant.Io
    pub fn open(descriptors: &[Descriptor], config: Config) -> Result<Collector> {
        let mut listeners = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            match open_listener(descriptor) {
                Ok(listener) => {
                    let parser = if listener.is_fifo() {
                        Some(Parser::new(listener.as_raw_fd(), config.line_limit).rearm_after_end())
                    } else {
                        None
                    };
                    listeners.push(ListenerSlot { listener, parser });
                },
                Err(e) => error!("cannot open {}: {}", descriptor, e.one_line()),
            }
        }
        ensure!(!listeners.is_empty(), ErrorKind::NoListeners);

        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        Ok(Collector {
            config,
            listeners,
            peers: Vec::new(),
            store: Store::new(),
            wake_rx,
            wake_tx: Arc::new(wake_tx),
        })
    }

    /// The coverage store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The descriptors of the opened listeners, with ephemeral TCP ports resolved.
    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.listeners.iter().map(|slot| slot.listener.descriptor().clone()).collect()
    }

    /// Number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Creates a handle to request dumps and termination.
    pub fn trigger(&self) -> Trigger {
        Trigger {
            wake: self.wake_tx.clone(),
        }
    }

    /// Routes SIGHUP, SIGTERM and SIGUSR1 to this collector, and ignores SIGPIPE, SIGINT and SIGQUIT.
    ///
    /// # Errors
    ///
    /// Returns [`Nix`] if a signal disposition cannot be changed.
    ///
    /// [`Nix`]: ../error/enum.ErrorKind.html#variant.Nix
    pub fn install_signal_handlers(&self) -> Result<()> {
        WAKE_FD.store(self.wake_tx.as_raw_fd(), Ordering::SeqCst);
        let handle = SigAction::new(SigHandler::Handler(on_signal), SaFlags::SA_RESTART, SigSet::empty());
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe {
            for &signal in &[Signal::SIGHUP, Signal::SIGTERM, Signal::SIGUSR1] {
                sigaction(signal, &handle)?;
            }
            for &signal in &[Signal::SIGPIPE, Signal::SIGINT, Signal::SIGQUIT] {
                sigaction(signal, &ignore)?;
            }
        }
        Ok(())
    }

    /// Runs the event loop until termination is requested. Before returning, pending connections and data are read
    /// and the store is dumped.
    ///
    /// # Errors
    ///
    /// Returns [`Nix`] if waiting for readiness fails for a reason other than an interrupt.
    ///
    /// [`Nix`]: ../error/enum.ErrorKind.html#variant.Nix
    pub fn run(&mut self) -> Result<()> {
        info!("collector started, pid {}", process::id());
        let mut buf = vec![0; READ_BUFFER_SIZE];
        loop {
            let (wake, listeners_ready, peers_ready) = match self.wait() {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(e) => bail!(e),
            };

            for (i, ready) in listeners_ready.into_iter().enumerate() {
                if ready {
                    self.serve_listener(i, &mut buf);
                }
            }
            self.serve_peers(&peers_ready, &mut buf);

            if wake && self.handle_requests() {
                info!("terminating");
                self.drain(&mut buf);
                self.dump();
                return Ok(());
            }
        }
    }

    /// Waits for readiness. Returns whether the wake-up socket, each listener and each peer are ready.
    fn wait(&self) -> ::std::result::Result<(bool, Vec<bool>, Vec<bool>), Errno> {
        let events = PollFlags::POLLIN;
        let mut fds = Vec::with_capacity(1 + self.listeners.len() + self.peers.len());
        fds.push(PollFd::new(self.wake_rx.as_fd(), events));
        fds.extend(self.listeners.iter().map(|s| PollFd::new(s.listener.as_fd(), events)));
        fds.extend(self.peers.iter().map(|p| PollFd::new(p.stream.as_fd(), events)));
        poll(&mut fds, PollTimeout::NONE)?;

        let ready = fds
            .iter()
            .map(|fd| fd.revents().map_or(false, |r| !r.is_empty()))
            .collect::<Vec<_>>();
        let listeners_end = 1 + self.listeners.len();
        Ok((ready[0], ready[1..listeners_end].to_vec(), ready[listeners_end..].to_vec()))
    }

    /// Accepts every pending connection of a socket listener, or reads the available data of a FIFO.
    fn serve_listener(&mut self, index: usize, buf: &mut [u8]) {
        let line_limit = self.config.line_limit;
        let slot = &mut self.listeners[index];
        if let Some(ref mut parser) = slot.parser {
            if let Next::Close = serve_fifo(&mut slot.listener, parser, &mut self.store, buf) {
                if let Err(e) = slot.listener.reopen() {
                    error!("cannot reopen {}: {}", slot.listener.descriptor(), e.one_line());
                }
                *parser = Parser::new(slot.listener.as_raw_fd(), line_limit).rearm_after_end();
            }
            return;
        }

        loop {
            match slot.listener.accept() {
                Ok(Some(stream)) => {
                    let fd = stream.as_raw_fd();
                    info!("peer fd {}: connected via {}", fd, slot.listener.descriptor());
                    self.peers.push(Peer {
                        stream,
                        parser: Parser::new(fd, line_limit),
                    });
                },
                Ok(None) => break,
                Err(e) => {
                    error!("cannot accept on {}: {}", slot.listener.descriptor(), e);
                    break;
                },
            }
        }
    }

    fn serve_peers(&mut self, ready: &[bool], buf: &mut [u8]) {
        let store = &mut self.store;
        let mut ready = ready.iter().cloned();
        self.peers.retain_mut(|peer| {
            if !ready.next().unwrap_or(false) {
                return true;
            }
            match serve_peer(peer, store, buf) {
                Next::Keep => true,
                Next::Close => {
                    info!("peer fd {}: closed", peer.stream.as_raw_fd());
                    false
                },
            }
        });
    }

    /// Reads every request byte. Dumps and resets are served immediately; returns whether termination is requested.
    fn handle_requests(&mut self) -> bool {
        let mut requests = [0u8; 64];
        let mut terminate = false;
        let mut dump = false;
        loop {
            let n = match self.wake_rx.read(&mut requests) {
                Ok(0) => break,
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            for &request in &requests[..n] {
                match request {
                    REQUEST_DUMP => dump = true,
                    REQUEST_TERMINATE => terminate = true,
                    REQUEST_RESET => {
                        if dump {
                            self.dump();
                            dump = false;
                        }
                        info!("clearing the store");
                        self.store.clear();
                    },
                    _ => {},
                }
            }
        }
        // A terminating collector dumps once, after draining.
        if dump && !terminate {
            self.dump();
        }
        terminate
    }

    /// Accepts pending connections and reads all data already available.
    fn drain(&mut self, buf: &mut [u8]) {
        for i in 0..self.listeners.len() {
            self.serve_listener(i, buf);
        }
        let all = vec![true; self.peers.len()];
        self.serve_peers(&all, buf);
    }

    /// Dumps the store. The output directory is taken from a pending dump request, or from the configuration.
    fn dump(&mut self) {
        let request = dump_request_path(&self.config.runtime_dir, process::id());
        let output = match fs::read_to_string(&request) {
            Ok(ref prefix) if !prefix.trim().is_empty() => PathBuf::from(prefix.trim()),
            _ => self.config.output.clone(),
        };
        info!("dumping {} objects to {}", self.store.objects().len(), output.display());
        if let Err(e) = dump::dump(&self.store, &output) {
            error!("dump incomplete: {}", e.one_line());
        }
        if request.exists() {
            if let Err(e) = fs::remove_file(&request) {
                error!("cannot remove {}: {}", request.display(), e);
            }
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        let fd = self.wake_tx.as_raw_fd();
        let _ = WAKE_FD.compare_exchange(fd, -1, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// Reads everything available from a peer.
fn serve_peer(peer: &mut Peer, store: &mut Store, buf: &mut [u8]) -> Next {
    let fd = peer.stream.as_raw_fd();
    loop {
        let n = match peer.stream.read(buf) {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Next::Keep,
            Err(e) => {
                error!("peer fd {}: {}", fd, e);
                return Next::Close;
            },
        };
        if n == 0 {
            if peer.parser.is_mid_record() {
                warn!("peer fd {}: connection closed in the middle of a record", fd);
            }
            return Next::Close;
        }
        match peer.parser.feed(&buf[..n], store) {
            Ok(Status::Reading) => {},
            Ok(Status::Finished) => return Next::Close,
            Err(e) => {
                error!("{}", e.one_line());
                return Next::Close;
            },
        }
    }
}

/// Reads everything available from a FIFO. Returns `Close` when the writers are gone or the stream is broken.
fn serve_fifo(listener: &mut Listener, parser: &mut Parser, store: &mut Store, buf: &mut [u8]) -> Next {
    loop {
        let n = match listener.read_fifo(buf) {
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Next::Keep,
            Err(e) => {
                error!("{}: {}", listener.descriptor(), e);
                return Next::Close;
            },
        };
        if n == 0 {
            if parser.is_mid_record() {
                warn!("{}: writer closed in the middle of a record", listener.descriptor());
            }
            return Next::Close;
        }
        if let Err(e) = parser.feed(&buf[..n], store) {
            error!("{}", e.one_line());
            return Next::Close;
        }
    }
}

//}}}
