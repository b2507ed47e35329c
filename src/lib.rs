// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # ripx - IPX/SPX emulation over IP
//!
//! `ripx` carries the legacy IPX protocol family on a modern IP only host,
//! so that vintage applications which speak IPX or SPX keep working against
//! today's networks. Applications open sockets in the IPX address family
//! and use ordinary datagram or stream operations; the stack moves the
//! packets over one of three interchangeable carriers and routes them back
//! to peer sockets:
//!
//! - **IPX over UDP** (the default): packets travel as UDP datagrams on a
//!   well known port. Peers are discovered by broadcasting on every IP
//!   subnet of the chosen interface; once a peer replies, its IP endpoint
//!   is cached and traffic switches to unicast.
//! - **Raw Ethernet**: packets are framed as real IPX (Ethernet II, Novell
//!   raw 802.3 or 802.2 LLC) and exchanged through a capture handle, for
//!   talking to actual IPX hosts on the LAN.
//! - **DOSBox relay**: packets are tunnelled to a DOSBox compatible IPX
//!   server which assigns this instance an address and forwards between
//!   clients, optionally batching small packets (see `coalesce`).
//!
//! ## Architecture
//!
//! A process holds one [`IpxStack`]. Creating it starts a single router
//! thread which ingests wire frames from the active carrier, validates
//! them and delivers one copy to every matching socket's receive queue via
//! a loopback relay. Sockets are handles into the stack; their blocking
//! receive path drains the queue, pumping the loopback socket as needed.
//!
//! SPX stream sockets are carried over TCP: a connect broadcasts a lookup
//! for the listening socket's TCP port, then the stream opens with a small
//! record naming the caller's IPX address (see `spx` in the sources).
//!
//! Socket numbers are kept unique across all instances on the host
//! through a shared address table and per number advisory locks; see
//! [`addrtable`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use ripx::{IpxStack, MainConfig, IpxAddr};
//!
//! let stack = IpxStack::new(MainConfig::default()).unwrap();
//! let socket = stack.datagram_socket(0).unwrap();
//! socket.bind(IpxAddr::ZERO).unwrap();
//!
//! let mut buf = [0u8; 1024];
//! let (len, from) = socket.recv_from(&mut buf).unwrap();
//! socket.send_to(&buf[..len], from).unwrap();
//! ```
//!
//! The crate never installs a logger; route the `log` output wherever the
//! embedding application wants it, filtered per `MainConfig::log_level`.

extern crate ipnetwork;
extern crate libc;
extern crate pnet;
extern crate rand;

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate log;

use std::time::Duration;

pub mod addr;
pub mod addrcache;
pub mod addrtable;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod ethernet;
pub mod interface;
pub mod packet;
pub mod recvqueue;
pub mod socket;
pub mod stack;

mod router;
mod spx;
mod tx;

pub use addr::{Addr32, Addr48, IpxAddr, IpxAddrExt};
pub use config::{
    ConfigStore, EncapType, FrameType, IfaceConfig, LogLevel, MainConfig, MemoryConfigStore,
    DEFAULT_PORT,
};
pub use error::{Error, Result, RxError};
pub use interface::{IpxBinding, IpxInterface};
pub use socket::{select_read, IpxAddressData, IpxSocket, SocketFlags};
pub use stack::IpxStack;

/// Total time an SPX connect spends waiting for lookup replies.
pub const IPX_CONNECT_TIMEOUT: Duration = Duration::from_secs(6);

/// Number of lookup broadcasts an SPX connect sends before giving up.
pub const IPX_CONNECT_TRIES: u32 = 3;

/// How long ordinarily non-blocking calls wait for the relay registration
/// to finish while the DOSBox carrier is starting up.
pub const IPX_READY_TIMEOUT: Duration = Duration::from_secs(3);
