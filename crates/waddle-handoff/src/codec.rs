//! Encoding and decoding of the handoff triple.
//!
//! A restarted child learns about its inherited listener from three
//! environment variables (descriptor number, listener label, parent pid).
//! Decoding fails hard when the variables are partial, point at something
//! that is not a listening TCP socket, or were written by a process that is
//! not our parent. A child never operates on an unverified descriptor.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

use tracing::{debug, info, warn};

use crate::config::HandoffVars;
use crate::error::{HandoffError, Result};
use crate::listener::{parse_label, HandoffListener};

/// Highest descriptor reserved for the standard streams.
pub(crate) const STDERR_FD: RawFd = 2;

/// The three values a parent passes to its child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffTriple {
    /// Descriptor number of the listener in the child.
    pub fd: RawFd,
    /// Listener label, `tcp:<local-address>->`.
    pub name: String,
    /// Pid of the process performing the handoff.
    pub ppid: u32,
}

impl HandoffTriple {
    /// Describe `listener` for a child whose parent will be `parent_pid`.
    ///
    /// Only reads the socket's descriptor number and local address.
    pub fn encode<L: HandoffListener + ?Sized>(listener: &L, parent_pid: u32) -> Result<Self> {
        let name = listener
            .label()
            .map_err(|source| HandoffError::LookupFailure {
                what: "listener address",
                source,
            })?;

        Ok(Self {
            fd: listener.raw_descriptor(),
            name,
            ppid: parent_pid,
        })
    }

    /// The `(variable, value)` pairs to set in the child's environment.
    pub fn to_env<'a>(&self, vars: &'a HandoffVars) -> [(&'a str, String); 3] {
        [
            (vars.fd.as_str(), self.fd.to_string()),
            (vars.name.as_str(), self.name.clone()),
            (vars.ppid.as_str(), self.ppid.to_string()),
        ]
    }

    /// Read and parse the triple. Does not touch the descriptor.
    fn parse<F>(vars: &HandoffVars, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let fd = env(&vars.fd)
            .and_then(|v| v.trim().parse::<RawFd>().ok())
            .filter(|fd| *fd >= 0)
            .ok_or_else(|| HandoffError::missing(&vars.fd))?;

        let name = env(&vars.name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| HandoffError::missing(&vars.name))?;

        let ppid = env(&vars.ppid)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|pid| *pid > 0)
            .ok_or_else(|| HandoffError::missing(&vars.ppid))?;

        Ok(Self { fd, name, ppid })
    }
}

/// A listener recovered from a parent process.
#[derive(Debug)]
pub struct Inherited {
    /// The usable listener. Close-on-exec, independent of the inherited fd number.
    pub listener: std::net::TcpListener,
    /// Pid of the process that handed the listener over.
    pub parent_pid: u32,
    /// Label the parent gave the listener.
    pub name: String,
}

impl Inherited {
    /// Convert into a tokio listener. Must be called within a tokio runtime.
    pub fn into_tokio(self) -> io::Result<tokio::net::TcpListener> {
        self.listener.set_nonblocking(true)?;
        tokio::net::TcpListener::from_std(self.listener)
    }
}

/// Decode the handoff triple from the process environment.
pub fn decode(vars: &HandoffVars) -> Result<Inherited> {
    decode_from(vars, |name| std::env::var(name).ok())
}

/// Decode the handoff triple using `env` to look up variables.
///
/// The encoded parent pid is checked against the OS-reported parent pid before
/// the descriptor is inspected. On success the descriptor number named by the
/// environment is closed and the returned listener owns a private duplicate.
///
/// When a parsed triple is rejected and its descriptor is a listening socket,
/// that descriptor is closed so the address is free for a cold start and the
/// socket cannot leak into later children. Anything else it names is left
/// untouched.
///
/// The variables themselves are not removed from the process environment;
/// see [`HandoffVars::scrub`] for subprocesses that are not relaunches.
pub fn decode_from<F>(vars: &HandoffVars, env: F) -> Result<Inherited>
where
    F: Fn(&str) -> Option<String>,
{
    let triple = HandoffTriple::parse(vars, env)?;

    let actual = std::os::unix::process::parent_id();
    let verified = if triple.ppid == actual {
        adopt_verified(&triple)
    } else {
        Err(HandoffError::ParentMismatch {
            encoded: triple.ppid,
            actual,
        })
    };

    let (listener, addr) = match verified {
        Ok(verified) => verified,
        Err(e) => {
            release_rejected(triple.fd);
            return Err(e);
        }
    };

    // The listener holds its own duplicate; release the inherited number.
    close_fd(triple.fd);

    info!(
        fd = triple.fd,
        name = %triple.name,
        addr = %addr,
        parent_pid = triple.ppid,
        "Inherited listener from parent process"
    );

    Ok(Inherited {
        listener,
        parent_pid: triple.ppid,
        name: triple.name,
    })
}

/// Decode the triple if this process looks like a restarted child.
///
/// Returns `Ok(None)` when none of the three variables is set (cold start).
/// A partially present triple is an error, not a cold start.
pub fn detect(vars: &HandoffVars) -> Result<Option<Inherited>> {
    detect_from(vars, |name| std::env::var(name).ok())
}

fn detect_from<F>(vars: &HandoffVars, env: F) -> Result<Option<Inherited>>
where
    F: Fn(&str) -> Option<String>,
{
    if vars.all().iter().all(|name| env(name).is_none()) {
        debug!("No handoff variables set, cold start");
        return Ok(None);
    }

    decode_from(vars, env).map(Some)
}

/// Adopt the descriptor and check it against the label.
fn adopt_verified(triple: &HandoffTriple) -> Result<(std::net::TcpListener, SocketAddr)> {
    let listener = adopt_listener(triple)?;
    let addr = listener
        .local_addr()
        .map_err(|e| HandoffError::mismatch(triple.fd, format!("no local address: {e}")))?;

    match parse_label(&triple.name) {
        None => Err(HandoffError::mismatch(
            triple.fd,
            format!("label {:?} does not name a tcp listener", triple.name),
        )),
        Some(Err(raw)) => Err(HandoffError::mismatch(
            triple.fd,
            format!("label address {raw:?} is not a socket address"),
        )),
        Some(Ok(labelled)) if labelled != addr => Err(HandoffError::mismatch(
            triple.fd,
            format!("label says {labelled} but socket is bound to {addr}"),
        )),
        Some(Ok(_)) => Ok((listener, addr)),
    }
}

/// Close the descriptor of a rejected triple if it is a listening socket.
fn release_rejected(fd: RawFd) {
    if fd <= STDERR_FD || validate_listening_socket(fd).is_err() {
        return;
    }
    warn!(fd, "Closing listening socket from rejected handoff");
    close_fd(fd);
}

/// Validate the inherited fd and wrap a close-on-exec duplicate of it.
fn adopt_listener(triple: &HandoffTriple) -> Result<std::net::TcpListener> {
    let fd = triple.fd;
    if fd <= STDERR_FD {
        return Err(HandoffError::mismatch(fd, "descriptor is a standard stream"));
    }

    validate_listening_socket(fd)?;

    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, STDERR_FD + 1) };
    if dup < 0 {
        return Err(HandoffError::mismatch(
            fd,
            format!("cannot duplicate descriptor: {}", io::Error::last_os_error()),
        ));
    }

    // SAFETY: `dup` is a fresh descriptor we just created and nothing else owns.
    let owned = unsafe { OwnedFd::from_raw_fd(dup) };
    Ok(std::net::TcpListener::from(owned))
}

/// Check that `fd` is a stream socket in the listening state.
fn validate_listening_socket(fd: RawFd) -> Result<()> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return Err(HandoffError::mismatch(
            fd,
            format!("fstat failed: {}", io::Error::last_os_error()),
        ));
    }
    if (stat.st_mode & libc::S_IFMT) != libc::S_IFSOCK {
        return Err(HandoffError::mismatch(fd, "not a socket"));
    }

    let sock_type = socket_option(fd, libc::SO_TYPE)
        .map_err(|e| HandoffError::mismatch(fd, format!("SO_TYPE: {e}")))?;
    if sock_type != libc::SOCK_STREAM {
        return Err(HandoffError::mismatch(fd, "not a stream socket"));
    }

    let listening = socket_option(fd, libc::SO_ACCEPTCONN)
        .map_err(|e| HandoffError::mismatch(fd, format!("SO_ACCEPTCONN: {e}")))?;
    if listening == 0 {
        return Err(HandoffError::mismatch(fd, "socket is not listening"));
    }

    Ok(())
}

fn socket_option(fd: RawFd, option: libc::c_int) -> io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            (&mut value as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value)
}

fn close_fd(fd: RawFd) {
    if unsafe { libc::close(fd) } != 0 {
        debug!(fd, error = %io::Error::last_os_error(), "Closing inherited fd failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::os::unix::io::{AsRawFd, IntoRawFd};

    fn env_map(triple: &HandoffTriple, vars: &HandoffVars) -> HashMap<String, String> {
        triple
            .to_env(vars)
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    fn inode(fd: RawFd) -> (u64, u64) {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        assert_eq!(unsafe { libc::fstat(fd, &mut stat) }, 0);
        (stat.st_dev as u64, stat.st_ino as u64)
    }

    #[test]
    fn test_encode_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let triple = HandoffTriple::encode(&listener, 12345).unwrap();
        assert_eq!(triple.fd, listener.as_raw_fd());
        assert_eq!(triple.name, format!("tcp:{addr}->"));
        assert_eq!(triple.ppid, 12345);

        // Encoding leaves the listener usable.
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();
        client.write_all(b"hi").unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn test_to_env_uses_configured_names() {
        let vars = HandoffVars::with_prefix("GOAGAIN");
        let triple = HandoffTriple {
            fd: 3,
            name: "tcp:127.0.0.1:9090->".to_string(),
            ppid: 42,
        };
        let env = env_map(&triple, &vars);
        assert_eq!(env["GOAGAIN_FD"], "3");
        assert_eq!(env["GOAGAIN_NAME"], "tcp:127.0.0.1:9090->");
        assert_eq!(env["GOAGAIN_PPID"], "42");
    }

    /// Encode → decode yields the same socket and parent pid.
    #[test]
    fn test_round_trip() {
        let vars = HandoffVars::default();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let ppid = std::os::unix::process::parent_id();

        let triple = HandoffTriple::encode(&listener, ppid).unwrap();
        let identity = inode(triple.fd);
        let env = env_map(&triple, &vars);

        // Ownership of the raw fd moves to the decoder, as it would in a child.
        let _ = listener.into_raw_fd();

        let inherited = decode_from(&vars, |k| env.get(k).cloned()).unwrap();
        assert_eq!(inherited.parent_pid, ppid);
        assert_eq!(inherited.name, triple.name);
        assert_eq!(inherited.listener.local_addr().unwrap(), addr);
        assert_eq!(inode(inherited.listener.as_raw_fd()), identity);

        let _client = std::net::TcpStream::connect(addr).unwrap();
        assert!(inherited.listener.accept().is_ok());
    }

    #[tokio::test]
    async fn test_into_tokio_accepts() {
        let vars = HandoffVars::default();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let triple = HandoffTriple::encode(&listener, std::os::unix::process::parent_id()).unwrap();
        let env = env_map(&triple, &vars);
        let _ = listener.into_raw_fd();

        let inherited = decode_from(&vars, |k| env.get(k).cloned()).unwrap();
        let listener = inherited.into_tokio().unwrap();

        let connect = tokio::net::TcpStream::connect(addr);
        let (accepted, connected) = tokio::join!(listener.accept(), connect);
        assert!(accepted.is_ok());
        assert!(connected.is_ok());
    }

    /// A triple whose ppid is not our parent is rejected, and its listening
    /// socket is closed so the address can be bound again.
    #[test]
    fn test_parent_mismatch_releases_listener() {
        let vars = HandoffVars::default();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        // Our own pid can never be our parent's pid.
        let wrong = std::process::id();
        let triple = HandoffTriple::encode(&listener, wrong).unwrap();
        let env = env_map(&triple, &vars);
        let _ = listener.into_raw_fd();

        let err = decode_from(&vars, |k| env.get(k).cloned()).unwrap_err();
        match err {
            HandoffError::ParentMismatch { encoded, actual } => {
                assert_eq!(encoded, wrong);
                assert_eq!(actual, std::os::unix::process::parent_id());
            }
            other => panic!("expected ParentMismatch, got {other:?}"),
        }

        assert!(std::net::TcpListener::bind(addr).is_ok());
    }

    fn assert_missing(without: &str) {
        let vars = HandoffVars::default();
        let triple = HandoffTriple {
            fd: 3,
            name: "tcp:127.0.0.1:9090->".to_string(),
            ppid: std::os::unix::process::parent_id(),
        };
        let mut env = env_map(&triple, &vars);
        env.remove(without);

        match decode_from(&vars, |k| env.get(k).cloned()) {
            Err(HandoffError::MissingVariable { name }) => assert_eq!(name, without),
            other => panic!("expected MissingVariable({without}), got {other:?}"),
        }
    }

    #[test]
    fn test_missing_fd() {
        assert_missing("WADDLE_HANDOFF_FD");
    }

    #[test]
    fn test_missing_name() {
        assert_missing("WADDLE_HANDOFF_NAME");
    }

    #[test]
    fn test_missing_ppid() {
        assert_missing("WADDLE_HANDOFF_PPID");
    }

    #[test]
    fn test_malformed_values_are_missing() {
        let vars = HandoffVars::default();
        for (fd, ppid, bad) in [
            ("three", "1", "WADDLE_HANDOFF_FD"),
            ("-4", "1", "WADDLE_HANDOFF_FD"),
            ("3", "pid", "WADDLE_HANDOFF_PPID"),
            ("3", "0", "WADDLE_HANDOFF_PPID"),
        ] {
            let env: HashMap<&str, &str> = HashMap::from([
                ("WADDLE_HANDOFF_FD", fd),
                ("WADDLE_HANDOFF_NAME", "tcp:127.0.0.1:9090->"),
                ("WADDLE_HANDOFF_PPID", ppid),
            ]);
            let err = decode_from(&vars, |k| env.get(k).map(|v| v.to_string())).unwrap_err();
            assert!(
                matches!(&err, HandoffError::MissingVariable { name } if name == bad),
                "fd={fd} ppid={ppid}: {err:?}"
            );
        }
    }

    fn decode_raw(fd: RawFd, name: &str) -> Result<Inherited> {
        let vars = HandoffVars::default();
        let ppid = std::os::unix::process::parent_id().to_string();
        let fd = fd.to_string();
        let env: HashMap<&str, &str> = HashMap::from([
            ("WADDLE_HANDOFF_FD", fd.as_str()),
            ("WADDLE_HANDOFF_NAME", name),
            ("WADDLE_HANDOFF_PPID", ppid.as_str()),
        ]);
        decode_from(&vars, |k| env.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn test_regular_file_is_type_mismatch() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let err = decode_raw(file.as_raw_fd(), "tcp:127.0.0.1:9090->").unwrap_err();
        assert!(matches!(err, HandoffError::TypeMismatch { .. }), "{err:?}");
    }

    #[test]
    fn test_unbound_socket_is_type_mismatch() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let err = decode_raw(fd, "tcp:127.0.0.1:9090->").unwrap_err();
        assert!(matches!(err, HandoffError::TypeMismatch { .. }), "{err:?}");

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_datagram_socket_is_type_mismatch() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let name = format!("tcp:{}->", socket.local_addr().unwrap());
        let err = decode_raw(socket.as_raw_fd(), &name).unwrap_err();
        assert!(matches!(err, HandoffError::TypeMismatch { .. }), "{err:?}");
    }

    #[test]
    fn test_standard_stream_is_type_mismatch() {
        let err = decode_raw(1, "tcp:127.0.0.1:9090->").unwrap_err();
        assert!(matches!(err, HandoffError::TypeMismatch { fd: 1, .. }), "{err:?}");
    }

    /// A label that disagrees with the socket is rejected and the socket released.
    #[test]
    fn test_label_mismatch_releases_listener() {
        for label in [None, Some("unix:/tmp/waddle.sock->")] {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let addr = listener.local_addr().unwrap();
            let name = label.map(str::to_string).unwrap_or_else(|| {
                let mut other = addr;
                other.set_port(other.port().wrapping_add(1).max(1));
                format!("tcp:{other}->")
            });
            let fd = listener.into_raw_fd();

            let err = decode_raw(fd, &name).unwrap_err();
            assert!(matches!(err, HandoffError::TypeMismatch { .. }), "{err:?}");
            assert!(std::net::TcpListener::bind(addr).is_ok(), "{name} kept {addr}");
        }
    }

    /// Rejection never closes a descriptor that is not a listening socket.
    #[test]
    fn test_rejection_keeps_other_descriptors() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let vars = HandoffVars::default();
        let fd = file.as_raw_fd().to_string();
        let wrong = std::process::id().to_string();
        let env: HashMap<&str, &str> = HashMap::from([
            ("WADDLE_HANDOFF_FD", fd.as_str()),
            ("WADDLE_HANDOFF_NAME", "tcp:127.0.0.1:9090->"),
            ("WADDLE_HANDOFF_PPID", wrong.as_str()),
        ]);

        let err = decode_from(&vars, |k| env.get(k).map(|v| v.to_string())).unwrap_err();
        assert!(matches!(err, HandoffError::ParentMismatch { .. }), "{err:?}");
        assert!(file.metadata().is_ok());
    }

    #[test]
    fn test_detect_cold_start() {
        let vars = HandoffVars::with_prefix("WADDLE_HANDOFF_TEST_UNSET");
        assert!(detect(&vars).unwrap().is_none());
        assert!(detect_from(&vars, |_| None).unwrap().is_none());
    }

    #[test]
    fn test_detect_partial_triple_fails() {
        let vars = HandoffVars::default();
        let err = detect_from(&vars, |k| (k == "WADDLE_HANDOFF_FD").then(|| "3".to_string()))
            .unwrap_err();
        assert!(matches!(err, HandoffError::MissingVariable { .. }));
    }
}
