//! Channels between instrumented programs and the collector.
//!
//! A transport is named by a descriptor string:
//!
//! ```text
//! fifo:<path> | unix:<path> | abstract:<name> | tcp:<port>[:<dotted-ipv4>]
//! ```
//!
//! A FIFO is a data channel by itself. The three socket kinds are listeners, which yield one data channel per accepted
//! connection.

use error::*;

use libc;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::socket::{bind, listen, setsockopt, socket, sockopt};
use nix::sys::socket::{AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, SockaddrLike, UnixAddr};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;

use std::{fmt, fs, io};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::str::FromStr;

//----------------------------------------------------------------------------------------------------------------------
//{{{ Descriptor

/// A parsed transport descriptor.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Descriptor {
    /// `fifo:PATH`
    Fifo(PathBuf),
    /// `unix:PATH`
    Unix(PathBuf),
    /// `abstract:NAME`, a socket in the Linux abstract namespace.
    Abstract(String),
    /// `tcp:PORT[:ADDR]`
    Tcp(SocketAddrV4),
}

impl FromStr for Descriptor {
    type Err = Error;

    /// Parses a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`BadDescriptor`] if the prefix is unknown or the rest cannot be parsed.
    ///
    /// [`BadDescriptor`]: ../error/enum.ErrorKind.html#variant.BadDescriptor
    fn from_str(s: &str) -> Result<Descriptor> {
        let bad = || Error::from(ErrorKind::BadDescriptor(s.to_owned()));
        let colon = s.find(':').ok_or_else(bad)?;
        let (kind, rest) = (&s[..colon], &s[colon + 1..]);
        if rest.is_empty() {
            return Err(bad());
        }
        Ok(match kind {
            "fifo" => Descriptor::Fifo(PathBuf::from(rest)),
            "unix" => Descriptor::Unix(PathBuf::from(rest)),
            "abstract" => Descriptor::Abstract(rest.to_owned()),
            "tcp" => {
                let mut parts = rest.splitn(2, ':');
                let port = parts.next().and_then(|p| p.parse::<u16>().ok()).ok_or_else(bad)?;
                let addr = match parts.next() {
                    Some(addr) => addr.parse::<Ipv4Addr>().map_err(|_| bad())?,
                    None => Ipv4Addr::new(0, 0, 0, 0),
                };
                Descriptor::Tcp(SocketAddrV4::new(addr, port))
            },
            _ => return Err(bad()),
        })
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Descriptor::Fifo(ref path) => write!(fmt, "fifo:{}", path.display()),
            Descriptor::Unix(ref path) => write!(fmt, "unix:{}", path.display()),
            Descriptor::Abstract(ref name) => write!(fmt, "abstract:{}", name),
            Descriptor::Tcp(addr) => write!(fmt, "tcp:{}:{}", addr.port(), addr.ip()),
        }
    }
}

/// Converts an I/O error from opening a channel into the corresponding error kind.
fn open_error(descriptor: &Descriptor, e: io::Error) -> Error {
    let descriptor = descriptor.to_string();
    let kind = match e.raw_os_error() {
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOMEM) | Some(libc::ENOBUFS) => {
            ErrorKind::ResourceExhausted(descriptor)
        },
        Some(libc::EADDRINUSE) => ErrorKind::AddressInUse(descriptor),
        Some(libc::EACCES) | Some(libc::EPERM) => ErrorKind::PermissionDenied(descriptor),
        Some(libc::ENAMETOOLONG) | Some(libc::EINVAL) | Some(libc::EADDRNOTAVAIL) => {
            ErrorKind::BadDescriptor(descriptor)
        },
        _ => return e.into(),
    };
    Error::with_chain(e, kind)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn abstract_address(name: &str) -> io::Result<::std::os::unix::net::SocketAddr> {
    use std::os::linux::net::SocketAddrExt;
    ::std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn abstract_address(_: &str) -> io::Result<::std::os::unix::net::SocketAddr> {
    Err(io::Error::from_raw_os_error(libc::EINVAL))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn abstract_unix_addr(name: &str) -> io::Result<UnixAddr> {
    Ok(UnixAddr::new_abstract(name.as_bytes())?)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn abstract_unix_addr(_: &str) -> io::Result<UnixAddr> {
    Err(io::Error::from_raw_os_error(libc::EINVAL))
}

//}}}
//----------------------------------------------------------------------------------------------------------------------
//{{{ Listener

/// Number of pending connections a listening socket queues before refusing more.
pub const LISTEN_BACKLOG: i32 = 5;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SOCKET_FLAGS: SockFlag = SockFlag::SOCK_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SOCKET_FLAGS: SockFlag = SockFlag::empty();

/// Creates a stream socket bound to `addr` and listening with [`LISTEN_BACKLOG`].
///
/// [`LISTEN_BACKLOG`]: ./constant.LISTEN_BACKLOG.html
fn listen_on<A: SockaddrLike>(family: AddressFamily, addr: &A) -> io::Result<OwnedFd> {
    let fd = socket(family, SockType::Stream, SOCKET_FLAGS, None)?;
    if family == AddressFamily::Inet {
        setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    }
    bind(fd.as_raw_fd(), addr)?;
    listen(&fd, Backlog::new(LISTEN_BACKLOG)?)?;
    Ok(fd)
}

#[derive(Debug)]
enum ListenerKind {
    Fifo(File),
    Unix(UnixListener),
    Tcp(TcpListener),
}

/// A listening channel of the collector.
#[derive(Debug)]
pub struct Listener {
    descriptor: Descriptor,
    kind: ListenerKind,
}

/// Opens a listening channel.
///
/// A FIFO is created if it does not exist yet, and opened read-only and non-blocking. Sockets are bound, set
/// non-blocking and marked listening with a backlog of [`LISTEN_BACKLOG`]. A TCP listener on port 0 gets an
/// ephemeral port, which the [`descriptor()`] of the listener reports.
///
/// # Errors
///
/// Returns [`ResourceExhausted`], [`AddressInUse`], [`PermissionDenied`] or [`BadDescriptor`] depending on why the
/// channel cannot be opened.
///
/// [`ResourceExhausted`]: ../error/enum.ErrorKind.html#variant.ResourceExhausted
/// [`AddressInUse`]: ../error/enum.ErrorKind.html#variant.AddressInUse
/// [`PermissionDenied`]: ../error/enum.ErrorKind.html#variant.PermissionDenied
/// [`BadDescriptor`]: ../error/enum.ErrorKind.html#variant.BadDescriptor
/// [`LISTEN_BACKLOG`]: ./constant.LISTEN_BACKLOG.html
/// [`descriptor()`]: ./struct.Listener.html#method.descriptor
pub fn open_listener(descriptor: &Descriptor) -> Result<Listener> {
    let kind = match *descriptor {
        Descriptor::Fifo(ref path) => {
            match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
                Ok(()) | Err(Errno::EEXIST) => {},
                Err(e) => return Err(open_error(descriptor, io::Error::from_raw_os_error(e as i32))),
            }
            let file_type = fs::metadata(path).map_err(|e| open_error(descriptor, e))?.file_type();
            ensure!(file_type.is_fifo(), ErrorKind::BadDescriptor(descriptor.to_string()));
            ListenerKind::Fifo(open_fifo(descriptor, path)?)
        },
        Descriptor::Unix(ref path) => {
            let fd = UnixAddr::new(path.as_path())
                .map_err(io::Error::from)
                .and_then(|addr| listen_on(AddressFamily::Unix, &addr));
            ListenerKind::Unix(UnixListener::from(fd.map_err(|e| open_error(descriptor, e))?))
        },
        Descriptor::Abstract(ref name) => {
            let fd = abstract_unix_addr(name).and_then(|addr| listen_on(AddressFamily::Unix, &addr));
            ListenerKind::Unix(UnixListener::from(fd.map_err(|e| open_error(descriptor, e))?))
        },
        Descriptor::Tcp(addr) => {
            let fd = listen_on(AddressFamily::Inet, &SockaddrIn::from(addr));
            ListenerKind::Tcp(TcpListener::from(fd.map_err(|e| open_error(descriptor, e))?))
        },
    };
    let descriptor = match kind {
        ListenerKind::Tcp(ref l) => match l.local_addr() {
            Ok(::std::net::SocketAddr::V4(bound)) => Descriptor::Tcp(bound),
            _ => descriptor.clone(),
        },
        _ => descriptor.clone(),
    };
    let nonblocking = match kind {
        ListenerKind::Fifo(_) => Ok(()),
        ListenerKind::Unix(ref l) => l.set_nonblocking(true),
        ListenerKind::Tcp(ref l) => l.set_nonblocking(true),
    };
    nonblocking.map_err(|e| open_error(&descriptor, e))?;
    info!("listening on {}", descriptor);
    Ok(Listener { descriptor, kind })
}

fn open_fifo(descriptor: &Descriptor, path: &PathBuf) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| open_error(descriptor, e))
}

impl Listener {
    /// The descriptor this listener was opened from.
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Whether this is a FIFO, which carries data itself instead of accepting connections.
    pub fn is_fifo(&self) -> bool {
        match self.kind {
            ListenerKind::Fifo(_) => true,
            _ => false,
        }
    }

    /// Accepts a pending connection, returning `None` if there is none. The returned stream is non-blocking.
    ///
    /// A FIFO never has connections to accept.
    pub fn accept(&self) -> io::Result<Option<Stream>> {
        let stream = match self.kind {
            ListenerKind::Fifo(_) => return Ok(None),
            ListenerKind::Unix(ref l) => l.accept().map(|(s, _)| Stream::Unix(s)),
            ListenerKind::Tcp(ref l) => l.accept().map(|(s, _)| Stream::Tcp(s)),
        };
        match stream {
            Ok(stream) => {
                stream.set_nonblocking()?;
                Ok(Some(stream))
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reads available data from a FIFO. Returns `Ok(0)` when the writer side is closed.
    pub fn read_fifo(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.kind {
            ListenerKind::Fifo(ref mut file) => file.read(buf),
            _ => Ok(0),
        }
    }

    /// Closes and opens the FIFO again, so that the next writer can attach. Does nothing on sockets.
    pub fn reopen(&mut self) -> Result<()> {
        let Listener {
            ref descriptor,
            ref mut kind,
        } = *self;
        if let (&Descriptor::Fifo(ref path), &mut ListenerKind::Fifo(ref mut file)) = (descriptor, kind) {
            *file = open_fifo(descriptor, path)?;
            debug!("reopened {}", descriptor);
        }
        Ok(())
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self.kind {
            ListenerKind::Fifo(ref f) => f.as_raw_fd(),
            ListenerKind::Unix(ref l) => l.as_raw_fd(),
            ListenerKind::Tcp(ref l) => l.as_raw_fd(),
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd {
        match self.kind {
            ListenerKind::Fifo(ref f) => f.as_fd(),
            ListenerKind::Unix(ref l) => l.as_fd(),
            ListenerKind::Tcp(ref l) => l.as_fd(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Descriptor::Unix(ref path) = self.descriptor {
            let _ = fs::remove_file(path);
        }
    }
}

//}}}
//----------------------------------------------------------------------------------------------------------------------
//{{{ Stream

/// A data channel.
#[derive(Debug)]
pub enum Stream {
    Fifo(File),
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    fn set_nonblocking(&self) -> io::Result<()> {
        match *self {
            Stream::Fifo(_) => Ok(()),
            Stream::Unix(ref s) => s.set_nonblocking(true),
            Stream::Tcp(ref s) => s.set_nonblocking(true),
        }
    }
}

/// Connects to a collector as a writer.
///
/// A TCP descriptor without an address connects to the loopback interface.
///
/// # Errors
///
/// Returns the same errors as [`open_listener`], or the underlying I/O error if nobody is listening.
///
/// [`open_listener`]: ./fn.open_listener.html
pub fn connect(descriptor: &Descriptor) -> Result<Stream> {
    let stream = match *descriptor {
        Descriptor::Fifo(ref path) => open_fifo_writer(path).map(Stream::Fifo),
        Descriptor::Unix(ref path) => UnixStream::connect(path).map(Stream::Unix),
        Descriptor::Abstract(ref name) => {
            abstract_address(name).and_then(|a| UnixStream::connect_addr(&a)).map(Stream::Unix)
        },
        Descriptor::Tcp(addr) => {
            let addr = if addr.ip().is_unspecified() {
                SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), addr.port())
            } else {
                addr
            };
            TcpStream::connect(addr).map(Stream::Tcp)
        },
    };
    stream.map_err(|e| open_error(descriptor, e))
}

/// Opens the write end of a FIFO, failing instead of blocking when no collector has it open.
fn open_fifo_writer(path: &PathBuf) -> io::Result<File> {
    let file = OpenOptions::new().write(true).custom_flags(libc::O_NONBLOCK).open(path)?;
    fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(OFlag::empty()))?;
    Ok(file)
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Stream::Fifo(ref mut s) => s.read(buf),
            Stream::Unix(ref mut s) => s.read(buf),
            Stream::Tcp(ref mut s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            Stream::Fifo(ref mut s) => s.write(buf),
            Stream::Unix(ref mut s) => s.write(buf),
            Stream::Tcp(ref mut s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            Stream::Fifo(ref mut s) => s.flush(),
            Stream::Unix(ref mut s) => s.flush(),
            Stream::Tcp(ref mut s) => s.flush(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match *self {
            Stream::Fifo(ref s) => s.as_raw_fd(),
            Stream::Unix(ref s) => s.as_raw_fd(),
            Stream::Tcp(ref s) => s.as_raw_fd(),
        }
    }
}

impl AsFd for Stream {
    fn as_fd(&self) -> BorrowedFd {
        match *self {
            Stream::Fifo(ref s) => s.as_fd(),
            Stream::Unix(ref s) => s.as_fd(),
            Stream::Tcp(ref s) => s.as_fd(),
        }
    }
}

//}}}
//----------------------------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_descriptor() {
        assert_eq!("fifo:/tmp/x".parse::<Descriptor>().unwrap(), Descriptor::Fifo(PathBuf::from("/tmp/x")));
        assert_eq!("unix:sock".parse::<Descriptor>().unwrap(), Descriptor::Unix(PathBuf::from("sock")));
        assert_eq!("abstract:tce".parse::<Descriptor>().unwrap(), Descriptor::Abstract("tce".to_owned()));
        assert_eq!(
            "tcp:4000".parse::<Descriptor>().unwrap(),
            Descriptor::Tcp(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 4000))
        );
        assert_eq!(
            "tcp:4000:10.1.2.3".parse::<Descriptor>().unwrap(),
            Descriptor::Tcp(SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 4000))
        );
        assert_eq!("tcp:4000:10.1.2.3".parse::<Descriptor>().unwrap().to_string(), "tcp:4000:10.1.2.3");
    }

    #[test]
    fn test_bad_descriptor() {
        for s in &["", "fifo", "fifo:", "udp:4000", "tcp:port", "tcp:70000", "tcp:4000:localhost", "tcp:4000:::1"] {
            match s.parse::<Descriptor>() {
                Err(Error(ErrorKind::BadDescriptor(ref d), _)) if d == s => {},
                other => panic!("{:?} parsed as {:?}", s, other),
            }
        }
    }

    /// Accepts one connection and reads what the client sent, polling the non-blocking listener.
    fn accept_and_read(listener: &Listener, expected: usize) -> Vec<u8> {
        let mut server = None;
        for _ in 0..100 {
            server = listener.accept().unwrap();
            if server.is_some() {
                break;
            }
            ::std::thread::sleep(::std::time::Duration::from_millis(10));
        }
        let mut server = server.expect("connection accepted");
        let mut data = Vec::new();
        let mut buf = [0u8; 64];
        for _ in 0..100 {
            match server.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    data.extend_from_slice(&buf[..n]);
                    if data.len() >= expected {
                        break;
                    }
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ::std::thread::sleep(::std::time::Duration::from_millis(10));
                },
                Err(e) => panic!("{}", e),
            }
        }
        data
    }

    #[test]
    fn test_unix_listener() {
        let dir = TempDir::new().unwrap();
        let descriptor = Descriptor::Unix(dir.path().join("sock"));
        let listener = open_listener(&descriptor).unwrap();
        assert!(!listener.is_fifo());
        assert!(listener.accept().unwrap().is_none());

        match open_listener(&descriptor) {
            Err(Error(ErrorKind::AddressInUse(_), _)) => {},
            other => panic!("unexpected {:?}", other),
        }

        let mut client = connect(&descriptor).unwrap();
        client.write_all(b"7\n").unwrap();
        assert_eq!(accept_and_read(&listener, 2), b"7\n");

        drop(listener);
        assert!(!dir.path().join("sock").exists());
    }

    #[test]
    fn test_tcp_listener() {
        let listener = open_listener(&"tcp:0:127.0.0.1".parse().unwrap()).unwrap();
        let bound = listener.descriptor().clone();
        match bound {
            Descriptor::Tcp(addr) => {
                assert_eq!(addr.ip(), &Ipv4Addr::new(127, 0, 0, 1));
                assert_ne!(addr.port(), 0);
            },
            ref other => panic!("unexpected {:?}", other),
        }
        assert!(listener.accept().unwrap().is_none());

        match open_listener(&bound) {
            Err(Error(ErrorKind::AddressInUse(_), _)) => {},
            other => panic!("unexpected {:?}", other),
        }

        let mut client = connect(&bound).unwrap();
        client.write_all(b"8\n").unwrap();
        assert_eq!(accept_and_read(&listener, 2), b"8\n");
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_abstract_listener() {
        let name = format!("tce-transport-test-{}", ::std::process::id());
        let descriptor = Descriptor::Abstract(name);
        let listener = open_listener(&descriptor).unwrap();
        match open_listener(&descriptor) {
            Err(Error(ErrorKind::AddressInUse(_), _)) => {},
            other => panic!("unexpected {:?}", other),
        }

        let mut client = connect(&descriptor).unwrap();
        client.write_all(b"9\n").unwrap();
        assert_eq!(accept_and_read(&listener, 2), b"9\n");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_listen_backlog() {
        use nix::sys::socket::connect as connect_socket;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sock");
        let _listener = open_listener(&Descriptor::Unix(path.clone())).unwrap();
        let addr = UnixAddr::new(path.as_path()).unwrap();

        // Nothing accepts, so connections pile up in the backlog until the kernel refuses them.
        let mut pending = Vec::new();
        let refused_at = (0..64).position(|_| {
            let fd = socket(AddressFamily::Unix, SockType::Stream, SockFlag::SOCK_NONBLOCK, None).unwrap();
            let connected = connect_socket(fd.as_raw_fd(), &addr).is_ok();
            pending.push(fd);
            !connected
        });
        match refused_at {
            Some(n) => assert!(n <= LISTEN_BACKLOG as usize + 1, "refused after {} connections", n),
            None => panic!("64 pending connections accepted"),
        }
    }

    #[test]
    fn test_fifo_listener() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fifo");
        let mut listener = open_listener(&Descriptor::Fifo(path.clone())).unwrap();
        assert!(listener.is_fifo());

        let mut buf = [0u8; 8];
        match listener.read_fifo(&mut buf) {
            Ok(0) => {},
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {},
            other => panic!("unexpected {:?}", other),
        }

        let mut writer = connect(&Descriptor::Fifo(path)).unwrap();
        writer.write_all(b"7\n").unwrap();
        assert_eq!(listener.read_fifo(&mut buf).unwrap(), 2);
        drop(writer);
        assert_eq!(listener.read_fifo(&mut buf).unwrap(), 0);
        listener.reopen().unwrap();
    }

    #[test]
    fn test_fifo_over_regular_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plain");
        File::create(&path).unwrap();
        match open_listener(&Descriptor::Fifo(path)) {
            Err(Error(ErrorKind::BadDescriptor(_), _)) => {},
            other => panic!("unexpected {:?}", other),
        }
    }
}
