//! # ferry-fdpass
//!
//! SCM_RIGHTS descriptor transfer over Unix stream sockets.
//!
//! A front-end process accepts a network connection, then hands the live
//! socket to the backend by attaching its file descriptor as ancillary data
//! to a single control message on a Unix domain socket. This crate provides
//! both halves of that exchange:
//!
//! - [`send_fd`]: attach one descriptor to a one-byte control message. The
//!   kernel duplicates the descriptor into the receiving process; the
//!   sender's copy stays open but must be treated as handed off.
//! - [`recv_fd`]: read one control message and extract exactly one
//!   descriptor, returned as an [`OwnedFd`](std::os::fd::OwnedFd) so every
//!   failure path afterwards closes it on drop.
//! - [`into_tcp_stream`]: adopt a received descriptor as a nonblocking
//!   tokio [`TcpStream`](tokio::net::TcpStream), verifying first that it is
//!   actually a stream socket.
//!
//! A control message carrying zero descriptors, truncated ancillary data, or
//! more than one descriptor is rejected as malformed — in the multi-descriptor
//! case every received descriptor is closed and nothing is kept.

// Raw recvmsg/sendmsg and descriptor adoption require unsafe; this is the
// only crate in the workspace allowed to contain it.
#![allow(unsafe_code)]

mod unix;

pub use unix::{into_tcp_stream, recv_fd, send_fd, FdPassError};
