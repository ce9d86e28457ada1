// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler-integrated sockets.
//!
//! Stream handles serialize their operations through a task mutex and
//! keep exactly one submission in flight; completions wake the owning
//! fiber through the reactor. The server manager runs an acceptor pool
//! and hands each connection to a handler task.

pub mod addr;
pub mod client;
pub mod server;
pub mod stream;
pub mod udp;

pub use addr::{AddrKind, Address};
pub use client::TcpClient;
pub use server::{ServerState, TcpServer, TcpServerConfig};
pub use stream::{ManageType, StreamConfig, StreamError, TcpStream};
pub use udp::UdpSocket;
