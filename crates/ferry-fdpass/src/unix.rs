//! SCM_RIGHTS send/receive and descriptor adoption.

use std::io::{self, ErrorKind};
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use thiserror::Error;
use tokio::io::Interest;
use tokio::net::{TcpStream, UnixStream};

/// More than this many descriptors in one control message is unambiguously
/// malformed; the receive buffer is sized to observe them all so they can be
/// closed.
const MAX_RIGHTS: usize = 4;

/// Failure modes of a single descriptor-transfer attempt.
#[derive(Debug, Error)]
pub enum FdPassError {
    /// The peer closed the channel before sending a control message.
    #[error("peer closed the channel before sending a control message")]
    PeerClosed,
    /// A message arrived but carried no descriptor rights.
    #[error("control message carried no descriptor")]
    NoDescriptor,
    /// The control data was truncated by the kernel (MSG_CTRUNC).
    #[error("ancillary data truncated")]
    Truncated,
    /// More than one descriptor in a single control message. All received
    /// descriptors have been closed.
    #[error("control message carried {0} descriptors, expected exactly one")]
    TooManyDescriptors(usize),
    /// The received descriptor is not a stream socket and cannot carry a
    /// framed session.
    #[error("descriptor is not a stream socket (SO_TYPE {0})")]
    NotAStreamSocket(i32),
    /// Underlying socket I/O failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Send one file descriptor over a Unix stream.
///
/// The descriptor rides as SCM_RIGHTS ancillary data on a one-byte message.
/// The kernel duplicates the underlying open file description into the
/// receiver, so the sender's copy remains open after this returns — but the
/// transfer is a handoff: once it succeeds the receiver is the owner and the
/// sender must stop using its copy.
pub async fn send_fd(stream: &UnixStream, fd: BorrowedFd<'_>) -> io::Result<()> {
    loop {
        stream.writable().await?;
        match stream.try_io(Interest::WRITABLE, || {
            send_fd_once(stream.as_raw_fd(), fd.as_raw_fd())
        }) {
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
            other => return other,
        }
    }
}

/// Receive exactly one file descriptor from a Unix stream.
///
/// Reads a single control message and extracts its SCM_RIGHTS payload. The
/// returned [`OwnedFd`] is solely owned by the caller; dropping it closes
/// the descriptor. Zero descriptors, truncated ancillary data, or more than
/// one descriptor all fail the attempt — in the multi-descriptor case every
/// received descriptor is closed before returning.
pub async fn recv_fd(stream: &UnixStream) -> Result<OwnedFd, FdPassError> {
    let outcome = loop {
        stream.readable().await?;
        match stream.try_io(Interest::READABLE, || recv_fds_once(stream.as_raw_fd())) {
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
            Ok(outcome) => break outcome,
        }
    };

    if outcome.truncated {
        // Dropping `outcome.fds` closes whatever was extracted.
        return Err(FdPassError::Truncated);
    }
    if outcome.fds.len() > 1 {
        return Err(FdPassError::TooManyDescriptors(outcome.fds.len()));
    }
    let mut fds = outcome.fds;
    match fds.pop() {
        Some(fd) => Ok(fd),
        None if outcome.bytes == 0 => Err(FdPassError::PeerClosed),
        None => Err(FdPassError::NoDescriptor),
    }
}

/// Adopt a received descriptor as a nonblocking tokio [`TcpStream`].
///
/// Verifies via `SO_TYPE` that the descriptor is a stream socket before
/// adoption. On any failure the descriptor is closed when `fd` drops.
pub fn into_tcp_stream(fd: OwnedFd) -> Result<TcpStream, FdPassError> {
    let sock_type = socket_type(fd.as_raw_fd())?;
    if sock_type != libc::SOCK_STREAM {
        return Err(FdPassError::NotAStreamSocket(sock_type));
    }
    let stream = std::net::TcpStream::from(fd);
    stream.set_nonblocking(true)?;
    Ok(TcpStream::from_std(stream)?)
}

/// Result of one `recvmsg` call.
struct RecvOutcome {
    /// Regular payload bytes read; zero with no rights means EOF.
    bytes: usize,
    /// Every descriptor extracted from SCM_RIGHTS control headers.
    fds: Vec<OwnedFd>,
    /// Whether the kernel flagged the control data as truncated.
    truncated: bool,
}

fn recv_fds_once(sock: RawFd) -> io::Result<RecvOutcome> {
    let fd_size = mem::size_of::<libc::c_int>();
    let mut data = [0u8; 1];
    #[allow(clippy::cast_possible_truncation)]
    let cmsg_space = unsafe { libc::CMSG_SPACE((fd_size * MAX_RIGHTS) as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: data.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    #[allow(clippy::cast_possible_truncation)]
    {
        msg.msg_controllen = cmsg_space as _;
    }

    let n = unsafe { libc::recvmsg(sock, &raw mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    // Walk every control header and claim each SCM_RIGHTS descriptor as an
    // OwnedFd immediately, so malformed messages leak nothing.
    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let count =
                    ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize) / fd_size;
                let base = libc::CMSG_DATA(cmsg);
                for i in 0..count {
                    let raw = ptr::read_unaligned(base.add(i * fd_size).cast::<libc::c_int>());
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&raw const msg, cmsg);
        }
    }

    #[allow(clippy::cast_sign_loss)]
    let bytes = n as usize;
    Ok(RecvOutcome {
        bytes,
        fds,
        truncated: msg.msg_flags & libc::MSG_CTRUNC != 0,
    })
}

fn send_fd_once(sock: RawFd, fd: RawFd) -> io::Result<()> {
    let fd_size = mem::size_of::<libc::c_int>();
    #[allow(clippy::cast_possible_truncation)]
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];
    let mut data = [0u8; 1];

    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: data.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    #[allow(clippy::cast_possible_truncation)]
    {
        msg.msg_controllen = cmsg_space as _;
    }

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        #[allow(clippy::cast_possible_truncation)]
        {
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
        }
        ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::c_int>(), fd);
    }

    let n = unsafe { libc::sendmsg(sock, &raw const msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn socket_type(fd: RawFd) -> io::Result<libc::c_int> {
    let mut sock_type: libc::c_int = 0;
    #[allow(clippy::cast_possible_truncation)]
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            (&raw mut sock_type).cast::<libc::c_void>(),
            &raw mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(sock_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Connected loopback TCP pair (client end, server end).
    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let connect = TcpStream::connect(addr);
        let accept = async { listener.accept().await.expect("accept").0 };
        let (client, server) = tokio::join!(connect, accept);
        (client.expect("connect"), server)
    }

    /// Send `fds` on one message, bypassing the single-fd public API.
    fn send_fds_raw(sock: RawFd, fds: &[RawFd]) {
        let fd_size = mem::size_of::<libc::c_int>();
        let cmsg_space = unsafe { libc::CMSG_SPACE((fd_size * fds.len()) as u32) } as usize;
        let mut cmsg_buf = vec![0u8; cmsg_space];
        let mut data = [0u8; 1];

        let mut iov = libc::iovec {
            iov_base: data.as_mut_ptr().cast(),
            iov_len: data.len(),
        };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &raw mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = cmsg_space as _;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN((fd_size * fds.len()) as u32) as _;
            let base = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
            for (i, fd) in fds.iter().enumerate() {
                ptr::write_unaligned(base.add(i), *fd);
            }
        }

        let n = unsafe { libc::sendmsg(sock, &raw const msg, 0) };
        assert!(n >= 0, "sendmsg: {}", io::Error::last_os_error());
    }

    #[tokio::test]
    async fn descriptor_roundtrips_and_remains_usable() {
        let (tx, rx) = UnixStream::pair().expect("unix pair");
        let (mut client, server) = tcp_pair().await;

        send_fd(&tx, server.as_fd()).await.expect("send fd");
        let received = recv_fd(&rx).await.expect("recv fd");
        let mut adopted = into_tcp_stream(received).expect("adopt");

        client.write_all(b"ping over adopted fd").await.expect("write");
        let mut buf = [0u8; 20];
        adopted.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping over adopted fd");
    }

    #[tokio::test]
    async fn sender_copy_stays_open_after_transfer() {
        let (tx, rx) = UnixStream::pair().expect("unix pair");
        let (_client, mut server) = tcp_pair().await;

        send_fd(&tx, server.as_fd()).await.expect("send fd");
        let received = recv_fd(&rx).await.expect("recv fd");
        drop(received);

        // The kernel duplicated the descriptor; the sender's handle is
        // still a valid socket even though ownership has moved on.
        server.write_all(b"x").await.expect("sender copy still writable");
    }

    #[tokio::test]
    async fn message_without_rights_is_rejected() {
        let (mut tx, rx) = UnixStream::pair().expect("unix pair");

        tx.write_all(b"j").await.expect("write");
        let err = recv_fd(&rx).await.expect_err("no descriptor attached");
        assert!(matches!(err, FdPassError::NoDescriptor));
    }

    #[tokio::test]
    async fn peer_eof_is_reported() {
        let (tx, rx) = UnixStream::pair().expect("unix pair");
        drop(tx);

        let err = recv_fd(&rx).await.expect_err("peer gone");
        assert!(matches!(err, FdPassError::PeerClosed));
    }

    #[tokio::test]
    async fn multiple_descriptors_are_malformed() {
        let (tx, rx) = UnixStream::pair().expect("unix pair");
        let (client, server) = tcp_pair().await;

        send_fds_raw(tx.as_raw_fd(), &[client.as_raw_fd(), server.as_raw_fd()]);
        let err = recv_fd(&rx).await.expect_err("two descriptors");
        assert!(matches!(err, FdPassError::TooManyDescriptors(2)));
    }

    #[tokio::test]
    async fn non_socket_descriptor_fails_adoption() {
        let file = tempfile::tempfile().expect("tempfile");
        let err = into_tcp_stream(OwnedFd::from(file)).expect_err("not a socket");
        assert!(matches!(err, FdPassError::Io(_)));
    }

    #[tokio::test]
    async fn non_stream_socket_fails_adoption() {
        let sock = unsafe {
            let raw = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
            assert!(raw >= 0, "socket: {}", io::Error::last_os_error());
            OwnedFd::from_raw_fd(raw)
        };
        let err = into_tcp_stream(sock).expect_err("datagram socket");
        assert!(matches!(err, FdPassError::NotAStreamSocket(_)));
    }

    #[tokio::test]
    async fn consecutive_transfers_on_one_channel() {
        let (tx, rx) = UnixStream::pair().expect("unix pair");

        for _ in 0..3 {
            let (_client, server) = tcp_pair().await;
            send_fd(&tx, server.as_fd()).await.expect("send fd");
            let received = recv_fd(&rx).await.expect("recv fd");
            assert!(into_tcp_stream(received).is_ok());
        }
    }
}
