use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};

/// A connected duplex byte stream; implements `Read` and `Write`.
///
/// No framing happens here. A stream and its [`try_clone`](Self::try_clone)
/// twin may be read and written concurrently from different threads; multiple
/// concurrent writers need external serialization.
pub struct IpcStream {
    inner: IpcStreamInner,
}

enum IpcStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    Tcp(TcpStream),
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.read(buf),
            IpcStreamInner::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.write(buf),
            IpcStreamInner::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.flush(),
            IpcStreamInner::Tcp(stream) => stream.flush(),
        }
    }
}

/// Connect to an already-reachable endpoint.
///
/// `timeout` bounds TCP connection establishment. Unix socket connects are
/// immediate: they either reach a listener or fail.
pub fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<IpcStream> {
    let name = endpoint.to_string();
    let stream = match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => std::os::unix::net::UnixStream::connect(path)
            .map(IpcStream::from_unix)
            .map_err(|e| TransportError::from_connect(&name, timeout, e))?,
        #[cfg(not(unix))]
        Endpoint::Unix(_) => {
            return Err(TransportError::Connect {
                endpoint: name,
                source: std::io::Error::new(
                    ErrorKind::Unsupported,
                    "unix domain sockets are not available on this platform",
                ),
            })
        }
        Endpoint::Tcp(addr) => connect_tcp(&name, addr, timeout)?,
    };

    debug!(endpoint = %name, "connected");
    if let Some((uid, gid, pid)) = stream.peer_credentials() {
        debug!(uid, gid, pid, "peer credentials");
    }
    Ok(stream)
}

fn connect_tcp(name: &str, addr: &str, timeout: Duration) -> Result<IpcStream> {
    let addrs = addr
        .to_socket_addrs()
        .map_err(|e| TransportError::from_connect(name, timeout, e))?;

    let mut last_err = None;
    for sock_addr in addrs {
        match TcpStream::connect_timeout(&sock_addr, timeout) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(IpcStream::from_tcp(stream));
            }
            Err(err) => last_err = Some(err),
        }
    }

    let err = last_err.unwrap_or_else(|| {
        std::io::Error::new(ErrorKind::AddrNotAvailable, "address resolved to nothing")
    });
    Err(TransportError::from_connect(name, timeout, err))
}

impl IpcStream {
    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: IpcStreamInner::Unix(stream),
        }
    }

    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: IpcStreamInner::Tcp(stream),
        }
    }

    /// Close both directions. Calling this more than once is harmless.
    ///
    /// Shutdown applies to the socket, so closing any clone unblocks a read
    /// pending on another clone.
    pub fn close(&self) -> Result<()> {
        let res = match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.shutdown(Shutdown::Both),
            IpcStreamInner::Tcp(stream) => stream.shutdown(Shutdown::Both),
        };
        match res {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(TransportError::Io(err)),
        }
    }

    /// Write all of `bytes`, reporting a closed peer as [`TransportError::BrokenPipe`].
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize> {
        self.write_all(bytes).map_err(classify_write_error)?;
        Ok(bytes.len())
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            IpcStreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            IpcStreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => Ok(Self::from_unix(stream.try_clone()?)),
            IpcStreamInner::Tcp(stream) => Ok(Self::from_tcp(stream.try_clone()?)),
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(_) => "unix-domain-socket",
            IpcStreamInner::Tcp(_) => "tcp",
        }
    }

    /// Get the credentials of the connected peer (Linux Unix sockets only).
    ///
    /// Returns `(uid, gid, pid)` via `SO_PEERCRED`, or `None` if unavailable.
    #[cfg(target_os = "linux")]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        use std::os::fd::AsRawFd;

        let fd = match &self.inner {
            IpcStreamInner::Unix(stream) => stream.as_raw_fd(),
            IpcStreamInner::Tcp(_) => return None,
        };

        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` are valid writable pointers for the provided sizes,
        // and `fd` is an open Unix socket descriptor owned by this process.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
            Some((cred.uid, cred.gid, cred.pid as u32))
        } else {
            None
        }
    }

    /// Get the credentials of the connected peer.
    ///
    /// Returns `None` on platforms that do not expose peer credentials.
    #[cfg(not(target_os = "linux"))]
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        None
    }
}

/// Map an I/O error from a write into the channel's error vocabulary.
pub fn classify_write_error(err: std::io::Error) -> TransportError {
    match err.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
            TransportError::BrokenPipe
        }
        _ => TransportError::Io(err),
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcStream")
            .field("type", &self.transport_name())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn close_is_idempotent() {
        let (left, _right) = UnixStream::pair().unwrap();
        let stream = IpcStream::from_unix(left);
        stream.close().unwrap();
        stream.close().unwrap();
    }

    #[test]
    fn close_on_clone_unblocks_reader() {
        let (left, _right) = UnixStream::pair().unwrap();
        let stream = IpcStream::from_unix(left);
        let mut reader = stream.try_clone().unwrap();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).unwrap()
        });

        std::thread::sleep(Duration::from_millis(20));
        stream.close().unwrap();
        assert_eq!(handle.join().unwrap(), 0, "read should observe orderly close");
    }

    #[test]
    fn write_after_peer_close_is_broken_pipe() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut stream = IpcStream::from_unix(left);
        drop(right);

        // The first write may be buffered by the kernel; keep going until it fails.
        let mut last = Ok(0);
        for _ in 0..16 {
            last = stream.write_bytes(&[0u8; 4096]);
            if last.is_err() {
                break;
            }
        }
        assert!(matches!(last, Err(TransportError::BrokenPipe)));
    }

    #[test]
    fn read_returns_zero_on_orderly_close() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut stream = IpcStream::from_unix(left);
        drop(right);
        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn connect_missing_socket_is_refused() {
        let endpoint = Endpoint::Unix(std::env::temp_dir().join(format!(
            "hostlink-missing-{}.sock",
            std::process::id()
        )));
        let err = connect(&endpoint, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, TransportError::ConnectionRefused { .. }));
    }

    #[test]
    fn connect_tcp_refused() {
        // Bind then drop to find a port with nothing listening.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = Endpoint::Tcp(format!("127.0.0.1:{port}"));
        let err = connect(&endpoint, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, TransportError::ConnectionRefused { .. }));
    }

    #[test]
    fn tcp_roundtrip() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).unwrap();
            buf
        });

        let mut stream =
            connect(&Endpoint::Tcp(addr.to_string()), Duration::from_secs(1)).unwrap();
        assert_eq!(stream.transport_name(), "tcp");
        stream.write_bytes(b"hello").unwrap();
        assert_eq!(&server.join().unwrap(), b"hello");
    }
}
