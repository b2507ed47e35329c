//! SPX session setup.
//!
//! SPX is carried as a thin layer over TCP. A connect broadcasts an address
//! lookup asking who has a listening SPX socket bound to the target IPX
//! address; the reply names the TCP port and its source IP names the host.
//! After the TCP connect the client sends an `spxinit` record carrying its
//! own IPX address so the accepting side can recover it. From then on the
//! stream carries application bytes untouched.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::Instant;

use addr::{Addr32, Addr48, IpxAddr};
use error::{Error, Result};
use interface::IpxBinding;
use packet::{
    pack_ipx_packet, SpxInit, SpxLookupReply, SpxLookupReq, IPX_MAGIC_SPXLOOKUP, SPX_RECORD_SIZE,
};
use socket::{choose_socket_number, IpxSocket, SocketEntry, SocketFlags};
use stack::StackInner;
use {IPX_CONNECT_TIMEOUT, IPX_CONNECT_TRIES};

/// Upper bound on distinct broadcast addresses probed by one connect.
const MAX_CONNECT_BCAST_ADDRS: usize = 64;

fn push_bcast(bcast_addrs: &mut Vec<Ipv4Addr>, bindings: &[IpxBinding]) {
    for binding in bindings {
        if bcast_addrs.contains(&binding.bcast) {
            continue;
        }
        if bcast_addrs.len() < MAX_CONNECT_BCAST_ADDRS {
            bcast_addrs.push(binding.bcast);
        }
    }
}

pub(crate) fn connect(stack: &StackInner, handle: usize, target: IpxAddr) -> Result<()> {
    // Determine which broadcast domains to probe: the bound interface's, or
    // every interface's when the socket is unbound, since by default every
    // interface carries the same network number.
    let (bound, bound_addr) = {
        let sockets = stack.sockets.lock().unwrap();
        let entry = sockets.get(handle).ok_or(Error::InvalidArg)?;
        if entry.tcp_stream.is_some() {
            return Err(Error::InvalidArg);
        }
        (entry.flags.contains(SocketFlags::BOUND), entry.addr)
    };

    let mut bcast_addrs = Vec::new();
    if bound {
        if let Some(iface) = stack.interfaces.by_addr(bound_addr.net, bound_addr.node) {
            push_bcast(&mut bcast_addrs, &iface.bindings);
        }
    } else {
        for iface in stack.interfaces.list() {
            push_bcast(&mut bcast_addrs, &iface.bindings);
        }
    }

    if bcast_addrs.is_empty() {
        // There isn't anywhere for us to probe.
        return Err(Error::NetUnreach);
    }

    debug!("Trying to connect SPX socket {} to {}", handle, target);

    let request = SpxLookupReq { addr: target };
    let packet = pack_ipx_packet(
        IPX_MAGIC_SPXLOOKUP,
        IpxAddr::ZERO,
        IpxAddr::ZERO,
        &request.to_bytes(),
    );

    // A dedicated socket for the lookup exchange, so blocking here cannot
    // interfere with the router.
    let lookup = UdpSocket::bind(("0.0.0.0", 0)).map_err(Error::Io)?;
    lookup.set_broadcast(true).map_err(Error::Io)?;

    let try_window = IPX_CONNECT_TIMEOUT / IPX_CONNECT_TRIES;
    let mut reply_endpoint: Option<(SocketAddr, u16)> = None;
    let mut learned: Option<(Addr32, Addr48)> = None;

    'tries: for _ in 0..IPX_CONNECT_TRIES {
        let mut sent_any = false;
        for bcast in &bcast_addrs {
            let endpoint = SocketAddr::from((*bcast, stack.config.udp_port));
            debug!("Sending SPX lookup packet to {}", endpoint);
            match lookup.send_to(&packet, endpoint) {
                Ok(_) => sent_any = true,
                Err(e) => error!("Cannot send SPX lookup packet: {}", e),
            }
        }
        if !sent_any {
            return Err(Error::NetUnreach);
        }

        let deadline = Instant::now() + try_window;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            lookup
                .set_read_timeout(Some(deadline - now))
                .map_err(Error::Io)?;

            let mut buf = [0u8; SPX_RECORD_SIZE];
            let (n, from) = match lookup.recv_from(&mut buf) {
                Ok(received) => received,
                Err(ref e)
                    if e.kind() == ::std::io::ErrorKind::WouldBlock
                        || e.kind() == ::std::io::ErrorKind::TimedOut =>
                {
                    break;
                }
                Err(e) => return Err(Error::Io(e)),
            };

            let reply = match SpxLookupReply::from_bytes(&buf[..n]) {
                Some(reply) => reply,
                None => continue,
            };
            if reply.addr != target {
                continue;
            }

            let from_ip = match from {
                SocketAddr::V4(v4) => *v4.ip(),
                SocketAddr::V6(_) => continue,
            };

            if !bound {
                // Connecting implicitly binds: adopt the address of the
                // interface that heard the reply.
                match stack.interfaces.by_subnet(from_ip) {
                    Some(iface) => learned = Some((iface.net, iface.node)),
                    None => continue,
                }
            }

            reply_endpoint = Some((from, reply.port));
            break 'tries;
        }
    }

    let (from, port) = match reply_endpoint {
        Some(endpoint) => endpoint,
        None => {
            debug!("Didn't get any replies to the SPX lookup");
            return Err(Error::NetUnreach);
        }
    };

    let target_endpoint = SocketAddr::new(from.ip(), port);
    debug!("Got SPX lookup reply; connecting to {}", target_endpoint);

    let stream =
        TcpStream::connect_timeout(&target_endpoint, IPX_CONNECT_TIMEOUT).map_err(Error::Io)?;

    debug!("Connection succeeded");

    {
        let mut sockets = stack.sockets.lock().unwrap();

        // Make sure the application didn't close the socket while the
        // lookup was in flight.
        if sockets.get(handle).is_none() {
            debug!("Application closed socket during connect!");
            return Err(Error::InvalidArg);
        }

        if !sockets
            .get(handle)
            .map(|entry| entry.flags.contains(SocketFlags::BOUND))
            .unwrap_or(false)
        {
            let (net, node) = learned.ok_or(Error::NetUnreach)?;
            let port = match stream.local_addr() {
                Ok(addr) => addr.port(),
                Err(e) => {
                    error!("Cannot get local TCP port of SPX socket: {}", e);
                    warn!("Socket {} is NOW INCONSISTENT!", handle);
                    let entry = sockets.get_mut(handle).unwrap();
                    entry.inconsistent = true;
                    return Err(Error::Inconsistent);
                }
            };

            let auto = IpxAddr::new(net, node, 0);
            let mutex = choose_socket_number(stack, &sockets, &auto, false).map_err(|e| {
                error!("Cannot allocate socket number for SPX socket");
                warn!("Socket {} is NOW INCONSISTENT!", handle);
                e
            })?;
            let bound = IpxAddr::new(net, node, mutex.socket());

            let entry = sockets.get_mut(handle).unwrap();
            entry.addr = bound;
            entry.port = port;
            entry.sock_mut = Some(mutex);
            entry.flags |= SocketFlags::BOUND;
            entry.in_addr_table = true;
            debug!("Socket implicitly bound to {}", bound);

            stack.addr_table.add(&bound, port, false);
        }

        let entry = sockets.get_mut(handle).unwrap();
        entry.remote_addr = target;
        entry.flags |= SocketFlags::CONNECTED | SocketFlags::CONNECT_OK;

        // The first bytes on the stream carry our IPX address for the
        // accepting side.
        let init = SpxInit { addr: entry.addr };
        let mut writer = &stream;
        if let Err(e) = writer.write_all(&init.to_bytes()) {
            error!("Cannot send spxinit record: {}", e);
            warn!("Socket {} is NOW INCONSISTENT!", handle);
            entry.inconsistent = true;
            return Err(Error::Io(e));
        }

        entry.tcp_stream = Some(stream);
    }

    Ok(())
}

pub(crate) fn accept(stack: &Arc<StackInner>, handle: usize) -> Result<(IpxSocket, IpxAddr)> {
    let listener = {
        let sockets = stack.sockets.lock().unwrap();
        let entry = sockets.get(handle).ok_or(Error::InvalidArg)?;
        if !entry.is_spx() {
            return Err(Error::OpNotSupported);
        }
        if !entry.flags.contains(SocketFlags::LISTENING) {
            return Err(Error::InvalidArg);
        }
        entry
            .tcp_listener
            .as_ref()
            .ok_or(Error::InvalidArg)?
            .try_clone()
            .map_err(Error::Io)?
    };

    // Blocking accept with no locks held.
    let (stream, peer) = listener.accept().map_err(Error::Io)?;
    info!("Accepted SPX connection from {}", peer);

    // The first thing sent over an SPX connection is the spxinit record
    // with the IPX address of the client.
    let mut init_buf = [0u8; SPX_RECORD_SIZE];
    stream
        .set_read_timeout(Some(IPX_CONNECT_TIMEOUT))
        .map_err(Error::Io)?;
    {
        let mut reader = &stream;
        if let Err(e) = reader.read_exact(&mut init_buf) {
            error!("Error receiving spxinit record: {}", e);
            return Err(Error::Io(e));
        }
    }
    stream.set_read_timeout(None).map_err(Error::Io)?;

    let init = SpxInit::from_bytes(&init_buf).ok_or(Error::InvalidArg)?;

    let mut sockets = stack.sockets.lock().unwrap();
    let (local_addr, spx2, mutex) = {
        let entry = match sockets.get(handle) {
            Some(entry) => entry,
            None => {
                debug!("Application closed listening socket during accept!");
                return Err(Error::InvalidArg);
            }
        };
        // The accepted socket shares the listener's IPX address and
        // therefore a handle on its socket number lock.
        let mutex = match entry.sock_mut {
            Some(ref mutex) => mutex.duplicate().map_err(Error::Io)?,
            None => return Err(Error::InvalidArg),
        };
        (
            entry.addr,
            entry.flags.contains(SocketFlags::IS_SPXII),
            mutex,
        )
    };

    let port = stream.local_addr().map_err(Error::Io)?.port();

    let mut flags = SocketFlags::IS_SPX | SocketFlags::BOUND | SocketFlags::CONNECTED;
    if spx2 {
        flags |= SocketFlags::IS_SPXII;
    }

    let entry = SocketEntry {
        flags: flags,
        s_ptype: 0,
        f_ptype: 0,
        addr: local_addr,
        remote_addr: init.addr,
        port: port,
        udp: None,
        tcp_listener: None,
        tcp_stream: Some(stream),
        recv_queue: None,
        sock_mut: Some(mutex),
        in_addr_table: false,
        inconsistent: false,
    };
    let new_handle = sockets.insert(entry);
    info!(
        "SPX socket accepted (handle = {}, peer = {})",
        new_handle, init.addr
    );

    Ok((
        IpxSocket {
            stack: stack.clone(),
            handle: new_handle,
        },
        init.addr,
    ))
}
