//! The AF_IPX socket layer.
//!
//! Sockets are entries in a process wide table guarded by one coarse lock.
//! A datagram socket is backed by a loopback UDP socket which the router
//! relays matching packets to; reading drains the per socket receive queue,
//! filling it from the loopback socket with the recv pump below. An SPX
//! socket is backed by TCP plus the session setup in the `spx` module.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use libc;

use addr::{Addr32, Addr48, IpxAddr, IpxAddrExt, IPX_ADDR_FLAG_BCAST, IPX_ADDR_FLAG_LOCAL};
use addrtable::SocketMutex;
use config::EncapType;
use error::{Error, Result};
use interface::DosboxState;
use packet::{unpack_ipx_packet, MAX_PKT_SIZE};
use recvqueue::RecvQueue;
use spx;
use stack::StackInner;
use tx;
use IPX_READY_TIMEOUT;

bitflags! {
    /// Socket state bits. The closed set every operation works in terms of.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SocketFlags: u32 {
        /// Packet type filtering is enabled (`f_ptype` is meaningful).
        const FILTER      = 1 << 0;
        const BOUND       = 1 << 1;
        /// SO_BROADCAST, as the application set it.
        const BROADCAST   = 1 << 2;
        const SEND        = 1 << 3;
        const RECV        = 1 << 4;
        const REUSE       = 1 << 6;
        const CONNECTED   = 1 << 7;
        /// Reception of broadcast packets is enabled (default on).
        const RECV_BCAST  = 1 << 8;
        /// Packet type extension: wider addresses on send/receive.
        const EXT_ADDR    = 1 << 9;
        const IS_SPX      = 1 << 10;
        const IS_SPXII    = 1 << 11;
        const LISTENING   = 1 << 12;
        /// An asynchronous observer has not yet been told about a completed
        /// connect.
        const CONNECT_OK  = 1 << 13;
    }
}

pub(crate) struct SocketEntry {
    pub flags: SocketFlags,

    /// Packet type stamped on outgoing packets.
    pub s_ptype: u8,
    /// Receive filter, meaningful only with `FILTER` set.
    pub f_ptype: u8,

    /// Local IPX address, meaningful only with `BOUND` set.
    pub addr: IpxAddr,
    /// Remote IPX address, meaningful only with `CONNECTED` set.
    pub remote_addr: IpxAddr,

    /// Local port of the underlying socket, host byte order.
    pub port: u16,

    pub udp: Option<UdpSocket>,
    pub tcp_listener: Option<TcpListener>,
    pub tcp_stream: Option<TcpStream>,

    pub recv_queue: Option<Arc<RecvQueue>>,
    pub sock_mut: Option<SocketMutex>,

    /// Whether this socket owns an entry in the shared address table.
    /// Accepted SPX sockets share the listener's entry and do not.
    pub in_addr_table: bool,

    /// Set after a partial bind. Every further operation is refused.
    pub inconsistent: bool,
}

impl SocketEntry {
    fn new_datagram(ptype: u8) -> SocketEntry {
        SocketEntry {
            flags: SocketFlags::SEND | SocketFlags::RECV | SocketFlags::RECV_BCAST,
            s_ptype: ptype,
            f_ptype: 0,
            addr: IpxAddr::ZERO,
            remote_addr: IpxAddr::ZERO,
            port: 0,
            udp: None,
            tcp_listener: None,
            tcp_stream: None,
            recv_queue: Some(Arc::new(RecvQueue::new())),
            sock_mut: None,
            in_addr_table: false,
            inconsistent: false,
        }
    }

    fn new_stream(spx2: bool) -> SocketEntry {
        let mut flags = SocketFlags::IS_SPX;
        if spx2 {
            flags |= SocketFlags::IS_SPXII;
        }
        SocketEntry {
            flags: flags,
            s_ptype: 0,
            f_ptype: 0,
            addr: IpxAddr::ZERO,
            remote_addr: IpxAddr::ZERO,
            port: 0,
            udp: None,
            tcp_listener: None,
            tcp_stream: None,
            recv_queue: None,
            sock_mut: None,
            in_addr_table: false,
            inconsistent: false,
        }
    }

    pub fn is_spx(&self) -> bool {
        self.flags.contains(SocketFlags::IS_SPX)
    }
}

pub(crate) struct SocketTable {
    map: ::std::collections::HashMap<usize, SocketEntry>,
    next_handle: usize,
}

impl SocketTable {
    pub fn new() -> SocketTable {
        SocketTable {
            map: ::std::collections::HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn insert(&mut self, entry: SocketEntry) -> usize {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.map.insert(handle, entry);
        handle
    }

    pub fn get(&self, handle: usize) -> Option<&SocketEntry> {
        self.map.get(&handle)
    }

    pub fn get_mut(&mut self, handle: usize) -> Option<&mut SocketEntry> {
        self.map.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: usize) -> Option<SocketEntry> {
        self.map.remove(&handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&usize, &SocketEntry)> {
        self.map.iter()
    }

    /// Loopback ports of all bound sockets, for the address table heartbeat.
    pub fn bound_ports(&self) -> Vec<u16> {
        self.map
            .values()
            .filter(|entry| entry.flags.contains(SocketFlags::BOUND))
            .map(|entry| entry.port)
            .collect()
    }
}

/// Data behind the `IPX_ADDRESS` socket option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpxAddressData {
    pub adapternum: usize,
    pub netnum: Addr32,
    pub nodenum: Addr48,
    pub wan: bool,
    pub status: bool,
    pub maxpkt: usize,
    pub linkspeed: u32,
}

/// A handle to an IPX or SPX socket. Closing happens on drop.
pub struct IpxSocket {
    pub(crate) stack: Arc<StackInner>,
    pub(crate) handle: usize,
}

pub(crate) fn create_datagram(stack: &Arc<StackInner>, ptype: u8) -> Result<IpxSocket> {
    let handle = stack
        .sockets
        .lock()
        .unwrap()
        .insert(SocketEntry::new_datagram(ptype));
    info!("IPX socket created (handle = {})", handle);
    Ok(IpxSocket {
        stack: stack.clone(),
        handle: handle,
    })
}

pub(crate) fn create_stream(stack: &Arc<StackInner>, spx2: bool) -> Result<IpxSocket> {
    match stack.config.encap_type {
        EncapType::Pcap => {
            warn!("Application attempted to create an SPX socket, this isn't supported when using Ethernet encapsulation");
            return Err(Error::ProtoNotSupported);
        }
        EncapType::DosBox => {
            warn!("Application attempted to create an SPX socket, this isn't supported when using DOSBox encapsulation");
            return Err(Error::ProtoNotSupported);
        }
        EncapType::IpxWrapper => {}
    }
    let handle = stack
        .sockets
        .lock()
        .unwrap()
        .insert(SocketEntry::new_stream(spx2));
    info!("SPX socket created (handle = {})", handle);
    Ok(IpxSocket {
        stack: stack.clone(),
        handle: handle,
    })
}

/// Blocks ordinarily non-blocking calls while the DOSBox registration is
/// still in flight, so applications don't fail right at process startup.
pub(crate) fn wait_for_ready(stack: &StackInner) {
    if stack.config.encap_type == EncapType::DosBox
        && stack.dosbox.state() != DosboxState::Connected
    {
        stack.dosbox.wait_ready(IPX_READY_TIMEOUT);
    }
}

/// Picks the socket number for a bind and takes its cross process mutex.
///
/// A requested number is checked against the address table (or, when that
/// is unavailable, this process's own sockets) and then locked. A zero
/// number walks up from 1024 until a free one is found.
pub(crate) fn choose_socket_number(
    stack: &StackInner,
    table: &SocketTable,
    addr: &IpxAddr,
    reuse: bool,
) -> Result<SocketMutex> {
    let locally_conflicting = |socket: u16| {
        table.iter().any(|(_, entry)| {
            entry.flags.contains(SocketFlags::BOUND)
                && entry.addr.socket == socket
                && !(entry.flags.contains(SocketFlags::REUSE) && reuse)
        })
    };

    if addr.socket != 0 {
        match stack.addr_table.check(addr, reuse) {
            Some(true) => {}
            Some(false) => return Err(Error::AddrInUse),
            // Table unavailable: in-process uniqueness only.
            None => {
                if locally_conflicting(addr.socket) {
                    return Err(Error::AddrInUse);
                }
            }
        }
        match SocketMutex::acquire(addr.socket, !reuse) {
            Some(mutex) => Ok(mutex),
            None => Err(Error::AddrInUse),
        }
    } else {
        // Automatic allocations start at 1024, matching IP ephemeral
        // behaviour; the address table knows the first candidate.
        let start = stack.addr_table.auto_socket().unwrap_or(1024);
        let mut socket = start as u32;
        while socket <= 0xffff {
            let num = socket as u16;
            let taken_locally = table.iter().any(|(_, entry)| {
                entry.flags.contains(SocketFlags::BOUND) && entry.addr.socket == num
            });
            if !taken_locally {
                if let Some(mutex) = SocketMutex::acquire(num, true) {
                    return Ok(mutex);
                }
            }
            socket += 1;
        }
        Err(Error::AddrInUse)
    }
}

fn recv_dontwait(socket: &UdpSocket, buf: &mut [u8]) -> ::std::io::Result<usize> {
    let n = unsafe {
        libc::recv(
            socket.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        )
    };
    if n < 0 {
        Err(::std::io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Reads one packet from the socket's loopback port into its receive queue.
///
/// The sockets lock is only held to look the socket up; the blocking OS
/// read happens against a claimed queue slot with no locks held, and the
/// socket is looked up again afterwards since the application may have
/// closed it in the meantime. Returns whether a packet was committed.
pub(crate) fn recv_pump(stack: &StackInner, handle: usize, block: bool) -> Result<bool> {
    let (socket, queue) = {
        let sockets = stack.sockets.lock().unwrap();
        let entry = sockets.get(handle).ok_or(Error::InvalidArg)?;
        if !entry.flags.contains(SocketFlags::BOUND) {
            return Err(Error::InvalidArg);
        }
        let socket = entry
            .udp
            .as_ref()
            .ok_or(Error::InvalidArg)?
            .try_clone()
            .map_err(Error::Io)?;
        let queue = entry.recv_queue.clone().ok_or(Error::InvalidArg)?;
        (socket, queue)
    };

    let slot = match queue.claim() {
        Some(slot) => slot,
        // Queue full; the packet stays in the OS buffer for now.
        None => return Ok(false),
    };

    let mut buf = vec![0u8; MAX_PKT_SIZE];
    let received = if block {
        socket.recv(&mut buf)
    } else {
        recv_dontwait(&socket, &mut buf)
    };

    let n = match received {
        Ok(n) => n,
        Err(e) => {
            queue.release(slot);
            let would_block = e.kind() == ::std::io::ErrorKind::WouldBlock
                || e.kind() == ::std::io::ErrorKind::TimedOut;
            return if would_block { Ok(false) } else { Err(Error::Io(e)) };
        }
    };

    let sockets = stack.sockets.lock().unwrap();
    if sockets.get(handle).is_none() {
        // The application closed the socket while we were in recv(). Just
        // discard our queue handle.
        debug!("Socket {} closed during a recv pump", handle);
        queue.release(slot);
        return Err(Error::InvalidArg);
    }

    buf.truncate(n);
    if unpack_ipx_packet(&buf).is_none() {
        error!("Invalid packet received on loopback port!");
        queue.release(slot);
        return Err(Error::WouldBlock);
    }

    queue.commit(slot, buf);
    Ok(true)
}

struct Received {
    size: usize,
    src: IpxAddr,
    ptype: u8,
    ext_flags: u8,
    truncated: bool,
}

fn recv_packet(
    stack: &StackInner,
    handle: usize,
    buf: &mut [u8],
    peek: bool,
    want_ext: bool,
) -> Result<Received> {
    let packet = loop {
        let queue = {
            let sockets = stack.sockets.lock().unwrap();
            let entry = sockets.get(handle).ok_or(Error::InvalidArg)?;
            if !entry.flags.contains(SocketFlags::BOUND) {
                return Err(Error::InvalidArg);
            }
            entry.recv_queue.clone().ok_or(Error::InvalidArg)?
        };

        if let Some(packet) = queue.pop(peek) {
            break packet;
        }
        if !recv_pump(stack, handle, true)? {
            // Every slot is claimed by a pump in another thread; give them
            // a moment instead of spinning on the queue lock.
            ::std::thread::sleep(Duration::from_millis(1));
        }
    };

    let (header, payload) = match unpack_ipx_packet(&packet) {
        Some(parsed) => parsed,
        // Cannot happen, the pump validated it before committing.
        None => return Err(Error::WouldBlock),
    };

    debug!("Received packet from {}", header.src);

    let mut ext_flags = 0;
    if want_ext {
        if header.dest.node.is_broadcast() {
            ext_flags |= IPX_ADDR_FLAG_BCAST;
        }
        if stack
            .interfaces
            .by_addr(header.src.net, header.src.node)
            .is_some()
        {
            ext_flags |= IPX_ADDR_FLAG_LOCAL;
        }
    }

    let n = ::std::cmp::min(buf.len(), payload.len());
    buf[..n].copy_from_slice(&payload[..n]);

    stack.counters.recv_packets.fetch_add(1, Ordering::Relaxed);
    stack
        .counters
        .recv_bytes
        .fetch_add(payload.len() as u64, Ordering::Relaxed);

    Ok(Received {
        size: payload.len(),
        src: header.src,
        ptype: header.ptype,
        ext_flags: ext_flags,
        truncated: payload.len() > buf.len(),
    })
}

impl IpxSocket {
    fn with_entry<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SocketEntry) -> Result<T>,
    {
        let sockets = self.stack.sockets.lock().unwrap();
        let entry = sockets.get(self.handle).ok_or(Error::InvalidArg)?;
        f(entry)
    }

    fn with_entry_mut<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SocketEntry) -> Result<T>,
    {
        let mut sockets = self.stack.sockets.lock().unwrap();
        let entry = sockets.get_mut(self.handle).ok_or(Error::InvalidArg)?;
        f(entry)
    }

    /// Binds the socket to an IPX address. Zero network or node numbers are
    /// wildcards resolved against the interface table, a zero socket number
    /// asks for automatic allocation.
    pub fn bind(&self, addr: IpxAddr) -> Result<()> {
        wait_for_ready(&self.stack);

        let mut sockets = self.stack.sockets.lock().unwrap();

        let (reuse, is_spx) = {
            let entry = sockets.get(self.handle).ok_or(Error::InvalidArg)?;
            if entry.inconsistent {
                return Err(Error::Inconsistent);
            }
            if entry.flags.contains(SocketFlags::BOUND) {
                error!("bind failed: socket already bound");
                return Err(Error::InvalidArg);
            }
            (entry.flags.contains(SocketFlags::REUSE), entry.is_spx())
        };

        info!("bind({}, {})", self.handle, addr);

        let (net, node) = match self.stack.interfaces.resolve_bind(addr.net, addr.node) {
            Some(resolved) => resolved,
            None => {
                error!("bind failed: no such address");
                return Err(Error::AddrNotAvail);
            }
        };

        let resolved = IpxAddr::new(net, node, addr.socket);
        let mutex = choose_socket_number(&self.stack, &sockets, &resolved, reuse)?;
        let bound = IpxAddr::new(net, node, mutex.socket());

        info!("bind address: {}", bound);

        // Bind the underlying socket and read back the allocated port.
        let mut udp = None;
        let mut listener = None;
        let port;
        if is_spx {
            let tcp = TcpListener::bind(("0.0.0.0", 0)).map_err(|e| {
                error!("Binding local socket failed: {}", e);
                Error::Io(e)
            })?;
            port = match tcp.local_addr() {
                Ok(addr) => addr.port(),
                Err(e) => {
                    error!("Cannot get local port of socket: {}", e);
                    warn!("Socket {} is NOW INCONSISTENT!", self.handle);
                    let entry = sockets.get_mut(self.handle).unwrap();
                    entry.inconsistent = true;
                    return Err(Error::Inconsistent);
                }
            };
            listener = Some(tcp);
        } else {
            let socket = UdpSocket::bind(("127.0.0.1", 0)).map_err(|e| {
                error!("Binding local socket failed: {}", e);
                Error::Io(e)
            })?;
            port = match socket.local_addr() {
                Ok(addr) => addr.port(),
                Err(e) => {
                    error!("Cannot get local port of socket: {}", e);
                    warn!("Socket {} is NOW INCONSISTENT!", self.handle);
                    let entry = sockets.get_mut(self.handle).unwrap();
                    entry.inconsistent = true;
                    return Err(Error::Inconsistent);
                }
            };
            udp = Some(socket);
        }

        debug!("Bound to local port {}", port);

        {
            let entry = sockets.get_mut(self.handle).unwrap();
            entry.addr = bound;
            entry.port = port;
            entry.udp = udp;
            entry.tcp_listener = listener;
            entry.sock_mut = Some(mutex);
            entry.flags |= SocketFlags::BOUND;
            entry.in_addr_table = true;
        }

        self.stack.addr_table.add(&bound, port, reuse);
        Ok(())
    }

    pub fn local_addr(&self) -> Result<IpxAddr> {
        self.with_entry(|entry| {
            if entry.flags.contains(SocketFlags::BOUND) {
                Ok(entry.addr)
            } else {
                Err(Error::InvalidArg)
            }
        })
    }

    pub fn peer_addr(&self) -> Result<IpxAddr> {
        self.with_entry(|entry| {
            if entry.flags.contains(SocketFlags::CONNECTED) {
                Ok(entry.remote_addr)
            } else {
                Err(Error::NotConnected)
            }
        })
    }

    /// Connects the socket. For a datagram socket this just pins the remote
    /// address (an all-zero node disconnects again); for SPX it performs
    /// the address lookup handshake and opens the stream.
    pub fn connect(&self, addr: IpxAddr) -> Result<()> {
        wait_for_ready(&self.stack);

        let is_spx = self.with_entry(|entry| Ok(entry.is_spx()))?;
        if is_spx {
            return spx::connect(&self.stack, self.handle, addr);
        }

        if addr.node.is_zero() {
            // Connecting to an all-zero node disconnects.
            return self.with_entry_mut(|entry| {
                entry.flags.remove(SocketFlags::CONNECTED);
                Ok(())
            });
        }

        let bound = self.with_entry(|entry| Ok(entry.flags.contains(SocketFlags::BOUND)))?;
        if !bound {
            warn!("connect() on unbound socket, attempting implicit bind");
            self.bind(IpxAddr::new(addr.net, Addr48::ZERO, 0))?;
        }

        self.with_entry_mut(|entry| {
            entry.remote_addr = addr;
            entry.flags |= SocketFlags::CONNECTED;
            Ok(())
        })
    }

    /// SPX only. The listen backlog is managed by the OS.
    pub fn listen(&self) -> Result<()> {
        self.with_entry_mut(|entry| {
            if !entry.is_spx() {
                return Err(Error::OpNotSupported);
            }
            if !entry.flags.contains(SocketFlags::BOUND) {
                return Err(Error::InvalidArg);
            }
            if entry.flags.contains(SocketFlags::LISTENING) {
                return Err(Error::InvalidArg);
            }
            entry.flags |= SocketFlags::LISTENING;
            Ok(())
        })
    }

    /// SPX only. Accepts a connection and recovers the peer's IPX address
    /// from the first bytes on the stream.
    pub fn accept(&self) -> Result<(IpxSocket, IpxAddr)> {
        spx::accept(&self.stack, self.handle)
    }

    pub fn send_to(&self, buf: &[u8], dest: IpxAddr) -> Result<usize> {
        self.send_to_internal(buf, dest, None)
    }

    /// Send with the wider address variant. The carried packet type
    /// overrides the socket's default when the packet type extension is
    /// enabled.
    pub fn send_to_ext(&self, buf: &[u8], dest: &IpxAddrExt) -> Result<usize> {
        self.send_to_internal(buf, dest.addr, Some(dest.ptype))
    }

    fn send_to_internal(&self, buf: &[u8], dest: IpxAddr, ptype: Option<u8>) -> Result<usize> {
        wait_for_ready(&self.stack);

        let (is_spx, can_send, bound) = self.with_entry(|entry| {
            if entry.inconsistent {
                return Err(Error::Inconsistent);
            }
            Ok((
                entry.is_spx(),
                entry.flags.contains(SocketFlags::SEND),
                entry.flags.contains(SocketFlags::BOUND),
            ))
        })?;

        if is_spx {
            return self.send(buf);
        }
        if !can_send {
            return Err(Error::Shutdown);
        }
        if !bound {
            warn!("send_to() on unbound socket, attempting implicit bind");
            self.bind(IpxAddr::new(dest.net, Addr48::ZERO, 0))?;
        }

        if buf.len() > tx::max_ipx_payload(&self.stack) {
            return Err(Error::MsgSize);
        }

        let sockets = self.stack.sockets.lock().unwrap();
        let entry = sockets.get(self.handle).ok_or(Error::InvalidArg)?;

        let mut ptype_used = entry.s_ptype;
        if entry.flags.contains(SocketFlags::EXT_ADDR) {
            if let Some(override_ptype) = ptype {
                ptype_used = override_ptype;
            }
        }

        let src = entry.addr;
        let mut dest = dest;
        if dest.net.is_zero() {
            dest.net = src.net;
        }

        tx::ipx_send_packet(&self.stack, ptype_used, src, dest, buf)?;

        self.stack.counters.send_packets.fetch_add(1, Ordering::Relaxed);
        self.stack
            .counters
            .send_bytes
            .fetch_add(buf.len() as u64, Ordering::Relaxed);

        Ok(buf.len())
    }

    /// Sends on a connected socket: the stream for SPX, the pinned remote
    /// address for datagram sockets.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        enum Target {
            Stream(TcpStream),
            Datagram(IpxAddr),
        }

        let target = self.with_entry(|entry| {
            if entry.is_spx() {
                let stream = entry
                    .tcp_stream
                    .as_ref()
                    .ok_or(Error::NotConnected)?
                    .try_clone()
                    .map_err(Error::Io)?;
                Ok(Target::Stream(stream))
            } else if entry.flags.contains(SocketFlags::CONNECTED) {
                Ok(Target::Datagram(entry.remote_addr))
            } else {
                Err(Error::NotConnected)
            }
        })?;

        match target {
            Target::Stream(stream) => {
                let mut writer = &stream;
                writer.write(buf).map_err(Error::Io)
            }
            Target::Datagram(remote) => self.send_to(buf, remote),
        }
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, IpxAddr)> {
        let received = self.recv_dispatch(buf, false, false)?;
        if received.truncated {
            return Err(Error::MsgSize);
        }
        Ok((received.size, received.src))
    }

    /// Like `recv_from` but additionally reports the packet type and the
    /// broadcast/local flags of the wider address variant.
    pub fn recv_from_ext(&self, buf: &mut [u8]) -> Result<(usize, IpxAddrExt)> {
        let received = self.recv_dispatch(buf, false, true)?;
        if received.truncated {
            return Err(Error::MsgSize);
        }
        Ok((
            received.size,
            IpxAddrExt {
                addr: received.src,
                ptype: received.ptype,
                flags: received.ext_flags,
            },
        ))
    }

    /// Reads the next packet without taking it off the queue.
    pub fn peek_from(&self, buf: &mut [u8]) -> Result<(usize, IpxAddr)> {
        let received = self.recv_dispatch(buf, true, false)?;
        if received.truncated {
            return Err(Error::MsgSize);
        }
        Ok((received.size, received.src))
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let is_spx = self.with_entry(|entry| Ok(entry.is_spx()))?;
        if is_spx {
            let stream = self.with_entry(|entry| {
                entry
                    .tcp_stream
                    .as_ref()
                    .ok_or(Error::NotConnected)?
                    .try_clone()
                    .map_err(Error::Io)
            })?;
            let mut reader = &stream;
            // A zero return is a normal close of the peer.
            return reader.read(buf).map_err(Error::Io);
        }

        let received = recv_packet(&self.stack, self.handle, buf, false, false)?;
        if received.truncated {
            return Err(Error::MsgSize);
        }
        Ok(received.size)
    }

    fn recv_dispatch(&self, buf: &mut [u8], peek: bool, want_ext: bool) -> Result<Received> {
        let is_spx = self.with_entry(|entry| Ok(entry.is_spx()))?;
        if is_spx {
            return Err(Error::OpNotSupported);
        }
        recv_packet(&self.stack, self.handle, buf, peek, want_ext)
    }

    /// The FIONREAD ioctl: drains the loopback socket into the receive
    /// queue without blocking, then reports the total payload bytes ready.
    pub fn ready_bytes(&self) -> Result<usize> {
        let queue = self.with_entry(|entry| {
            if entry.is_spx() {
                return Err(Error::OpNotSupported);
            }
            if !entry.flags.contains(SocketFlags::BOUND) {
                return Err(Error::InvalidArg);
            }
            entry.recv_queue.clone().ok_or(Error::InvalidArg)
        })?;

        while recv_pump(&self.stack, self.handle, false)? {}
        Ok(queue.ready_payload_bytes())
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        self.with_entry_mut(|entry| {
            if entry.is_spx() {
                if let Some(ref stream) = entry.tcp_stream {
                    stream.shutdown(how).map_err(Error::Io)?;
                }
                return Ok(());
            }
            if how == Shutdown::Read || how == Shutdown::Both {
                entry.flags.remove(SocketFlags::RECV);
            }
            if how == Shutdown::Write || how == Shutdown::Both {
                entry.flags.remove(SocketFlags::SEND);
            }
            Ok(())
        })
    }

    pub fn packet_type(&self) -> Result<u8> {
        self.with_entry(|entry| Ok(entry.s_ptype))
    }

    pub fn set_packet_type(&self, ptype: u8) -> Result<()> {
        self.with_entry_mut(|entry| {
            entry.s_ptype = ptype;
            Ok(())
        })
    }

    /// The receive filter, `None` when filtering is off.
    pub fn filter_packet_type(&self) -> Result<Option<u8>> {
        self.with_entry(|entry| {
            if entry.flags.contains(SocketFlags::FILTER) {
                Ok(Some(entry.f_ptype))
            } else {
                Ok(None)
            }
        })
    }

    /// Sets or clears the receive filter (`IPX_FILTERPTYPE` and
    /// `IPX_STOPFILTERPTYPE`).
    pub fn set_filter_packet_type(&self, filter: Option<u8>) -> Result<()> {
        self.with_entry_mut(|entry| {
            match filter {
                Some(ptype) => {
                    entry.f_ptype = ptype;
                    entry.flags |= SocketFlags::FILTER;
                }
                None => {
                    entry.flags.remove(SocketFlags::FILTER);
                }
            }
            Ok(())
        })
    }

    /// `IPX_MAXSIZE`: the largest payload the current carrier can send.
    pub fn max_size(&self) -> Result<usize> {
        Ok(tx::max_ipx_payload(&self.stack))
    }

    pub fn broadcast(&self) -> Result<bool> {
        self.with_entry(|entry| Ok(entry.flags.contains(SocketFlags::BROADCAST)))
    }

    pub fn set_broadcast(&self, on: bool) -> Result<()> {
        self.with_entry_mut(|entry| {
            entry.flags.set(SocketFlags::BROADCAST, on);
            Ok(())
        })
    }

    pub fn reuse_addr(&self) -> Result<bool> {
        self.with_entry(|entry| Ok(entry.flags.contains(SocketFlags::REUSE)))
    }

    pub fn set_reuse_addr(&self, on: bool) -> Result<()> {
        self.with_entry_mut(|entry| {
            entry.flags.set(SocketFlags::REUSE, on);
            Ok(())
        })
    }

    /// `IPX_RECEIVE_BROADCAST`: whether broadcast packets are delivered at
    /// all. On by default.
    pub fn set_receive_broadcast(&self, on: bool) -> Result<()> {
        self.with_entry_mut(|entry| {
            entry.flags.set(SocketFlags::RECV_BCAST, on);
            Ok(())
        })
    }

    pub fn extended_address(&self) -> Result<bool> {
        self.with_entry(|entry| Ok(entry.flags.contains(SocketFlags::EXT_ADDR)))
    }

    pub fn set_extended_address(&self, on: bool) -> Result<()> {
        self.with_entry_mut(|entry| {
            entry.flags.set(SocketFlags::EXT_ADDR, on);
            Ok(())
        })
    }

    /// `IPX_ADDRESS` for one adapter index.
    pub fn ipx_address_data(&self, adapternum: usize) -> Result<IpxAddressData> {
        wait_for_ready(&self.stack);
        let iface = self
            .stack
            .interfaces
            .by_index(adapternum)
            .ok_or(Error::AddrNotAvail)?;
        Ok(IpxAddressData {
            adapternum: adapternum,
            netnum: iface.net,
            nodenum: iface.node,
            wan: false,
            status: false,
            maxpkt: tx::max_ipx_payload(&self.stack),
            linkspeed: 100000, // 10MBps
        })
    }

    /// `IPX_MAX_ADAPTER_NUM`. Despite the name this is the number of
    /// interfaces, not the highest index.
    pub fn max_adapter_num(&self) -> Result<usize> {
        wait_for_ready(&self.stack);
        Ok(self.stack.interfaces.count())
    }

    /// `SO_LINGER` has no effect on a datagram socket but some
    /// applications insist on setting it, so it is accepted and ignored.
    pub fn set_linger(&self, _linger: Option<Duration>) -> Result<()> {
        debug!("Ignoring SO_LINGER on socket {}", self.handle);
        Ok(())
    }
}

/// Waits until at least one of the given datagram sockets has a packet
/// ready to read, or the timeout passes. Returns the indices of the ready
/// sockets; `None` for the timeout blocks indefinitely.
///
/// A socket whose receive queue already holds packets is reported ready
/// immediately, whether or not its underlying OS socket is readable; the
/// queues and the loopback sockets are polled together so the result moves
/// in lockstep with `ready_bytes`.
pub fn select_read(sockets: &[&IpxSocket], timeout: Option<Duration>) -> Vec<usize> {
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let mut ready = Vec::new();
        for (index, socket) in sockets.iter().enumerate() {
            let queue = socket
                .with_entry(|entry| {
                    if entry.is_spx() || !entry.flags.contains(SocketFlags::BOUND) {
                        return Ok(None);
                    }
                    Ok(entry.recv_queue.clone())
                })
                .unwrap_or(None);
            let queue = match queue {
                Some(queue) => queue,
                None => continue,
            };

            if queue.ready_len() == 0 {
                while recv_pump(&socket.stack, socket.handle, false).unwrap_or(false) {}
            }
            if queue.ready_len() > 0 {
                ready.push(index);
            }
        }

        if !ready.is_empty() {
            return ready;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return ready;
            }
        }
        ::std::thread::sleep(Duration::from_millis(2));
    }
}

impl Drop for IpxSocket {
    fn drop(&mut self) {
        let mut sockets = self.stack.sockets.lock().unwrap();
        if let Some(entry) = sockets.remove(self.handle) {
            info!(
                "Socket {} ({}) closed",
                self.handle,
                if entry.is_spx() { "SPX" } else { "IPX" }
            );
            if entry.in_addr_table {
                self.stack.addr_table.remove(entry.port);
            }
            // The receive queue, socket mutex and OS sockets are released
            // by dropping the entry; in-flight recv pumps keep the queue
            // alive through their own reference.
        }
    }
}
