//! The router: a single dispatch loop that ingests wire frames from the
//! active carrier, validates them and fans each packet out to every local
//! socket whose address and filters admit it.
//!
//! Blocking reads happen in small pump threads, one per carrier input
//! (each UDP socket, each capture handle), which feed a channel. The
//! channel is the router's single readiness signal, so the dispatch loop
//! itself never blocks on a socket and can observe shutdown promptly.
//!
//! Delivery is a relay over loopback: one copy of the packet is sent to
//! the loopback UDP port of every matching socket, where the socket's recv
//! pump picks it up.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use pnet::datalink::DataLinkReceiver;

use addr::{Addr32, Addr48, IpxAddr};
use config::{EncapType, MainConfig};
use error::{RxError, RxResult};
use interface::DosboxState;
use packet::{
    pack_ipx_packet, unpack_ipx_packet, IpxHeader, SpxLookupReply, SpxLookupReq, IPX_HEADER_SIZE,
    IPX_MAGIC_COALESCED, IPX_MAGIC_DOSBOX_REG, IPX_MAGIC_SPXLOOKUP, IPX_SOCK_ECHO, MAX_PKT_SIZE,
};
use socket::{SocketEntry, SocketFlags};
use stack::StackInner;
use tx;

/// How long pump threads block before re-checking the shutdown flag.
const PUMP_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Cadence of the address table heartbeat.
const ADDR_TABLE_REFRESH: Duration = Duration::from_secs(1);

/// Cadence of the coalescer flush sweep.
const COALESCE_SWEEP: Duration = Duration::from_millis(5);

enum RouterInput {
    /// A datagram from the IPX over UDP carrier.
    Udp { data: Vec<u8>, from: SocketAddr },

    /// A captured Ethernet frame, tagged with the node number of the
    /// interface it arrived on.
    Frame { data: Vec<u8>, iface_node: Addr48 },

    /// A datagram from the relay server socket.
    Relay { data: Vec<u8>, from: SocketAddr },
}

pub(crate) struct Router {
    dispatch: Option<JoinHandle<()>>,
    pumps: Vec<JoinHandle<()>>,
    sweep: Option<JoinHandle<()>>,
}

impl Router {
    /// Starts the dispatch loop and its pump threads for the configured
    /// carrier. `captures` carries the receive halves of the capture
    /// channels under the Ethernet carrier, empty otherwise.
    pub fn spawn(
        stack: Arc<StackInner>,
        captures: Vec<(Addr48, Box<dyn DataLinkReceiver>)>,
    ) -> Router {
        let (sender, receiver) = mpsc::channel();
        let mut pumps = Vec::new();

        match stack.config.encap_type {
            EncapType::IpxWrapper => {
                if let Some(shared) = stack.shared_socket.as_ref() {
                    if let Ok(socket) = shared.try_clone() {
                        pumps.push(spawn_udp_pump(stack.clone(), socket, sender.clone(), false));
                    }
                }
                if let Ok(socket) = stack.private_socket.try_clone() {
                    pumps.push(spawn_udp_pump(stack.clone(), socket, sender.clone(), false));
                }
            }
            EncapType::DosBox => {
                if let Ok(socket) = stack.private_socket.try_clone() {
                    pumps.push(spawn_udp_pump(stack.clone(), socket, sender.clone(), true));
                }
            }
            EncapType::Pcap => {
                for (node, capture) in captures {
                    pumps.push(spawn_capture_pump(
                        stack.clone(),
                        node,
                        capture,
                        sender.clone(),
                    ));
                }
            }
        }
        drop(sender);

        let sweep = if stack.config.encap_type == EncapType::DosBox
            && stack.config.dosbox_coalesce
        {
            Some(spawn_coalesce_sweep(stack.clone()))
        } else {
            None
        };

        let dispatch_stack = stack.clone();
        let dispatch = thread::Builder::new()
            .name("ipx-router".to_owned())
            .spawn(move || dispatch_loop(dispatch_stack, receiver))
            .expect("Cannot create router thread");

        Router {
            dispatch: Some(dispatch),
            pumps: pumps,
            sweep: sweep,
        }
    }

    /// Waits for the dispatch loop and pumps to observe the shutdown flag
    /// and exit. The pumps wake at least every `PUMP_READ_TIMEOUT`.
    pub fn join(&mut self) {
        if let Some(handle) = self.dispatch.take() {
            handle.join().ok();
        }
        for handle in self.pumps.drain(..) {
            handle.join().ok();
        }
        if let Some(handle) = self.sweep.take() {
            handle.join().ok();
        }
    }
}

fn spawn_udp_pump(
    stack: Arc<StackInner>,
    socket: UdpSocket,
    sender: Sender<RouterInput>,
    relay: bool,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("ipx-pump".to_owned())
        .spawn(move || {
            socket.set_read_timeout(Some(PUMP_READ_TIMEOUT)).ok();
            let mut buf = vec![0u8; MAX_PKT_SIZE];
            while stack.running.load(Ordering::SeqCst) {
                let (n, from) = match socket.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(ref e)
                        if e.kind() == ::std::io::ErrorKind::WouldBlock
                            || e.kind() == ::std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    // A previous send to an unreachable port bounced;
                    // harmless for a datagram carrier.
                    Err(ref e) if e.kind() == ::std::io::ErrorKind::ConnectionReset => continue,
                    Err(e) => {
                        error!("Error receiving on carrier socket: {}", e);
                        warn!("No more IPX packets will be received");
                        // Carrier failure stops the dispatch loop; sending
                        // still works.
                        stack.running.store(false, Ordering::SeqCst);
                        break;
                    }
                };

                stack
                    .counters
                    .recv_packets_udp
                    .fetch_add(1, Ordering::Relaxed);
                stack
                    .counters
                    .recv_bytes_udp
                    .fetch_add(n as u64, Ordering::Relaxed);

                let data = buf[..n].to_vec();
                let input = if relay {
                    RouterInput::Relay {
                        data: data,
                        from: from,
                    }
                } else {
                    RouterInput::Udp {
                        data: data,
                        from: from,
                    }
                };
                if sender.send(input).is_err() {
                    break;
                }
            }
        })
        .expect("Cannot create pump thread")
}

fn spawn_capture_pump(
    stack: Arc<StackInner>,
    node: Addr48,
    mut capture: Box<dyn DataLinkReceiver>,
    sender: Sender<RouterInput>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("ipx-capture".to_owned())
        .spawn(move || {
            while stack.running.load(Ordering::SeqCst) {
                match capture.next() {
                    Ok(frame) => {
                        let input = RouterInput::Frame {
                            data: frame.to_vec(),
                            iface_node: node,
                        };
                        if sender.send(input).is_err() {
                            break;
                        }
                    }
                    Err(ref e)
                        if e.kind() == ::std::io::ErrorKind::WouldBlock
                            || e.kind() == ::std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(e) => {
                        // Capture driver errors are fatal for reception.
                        error!("Could not read from capture interface: {}", e);
                        warn!("No more IPX packets will be received");
                        stack.running.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        })
        .expect("Cannot create capture thread")
}

fn spawn_coalesce_sweep(stack: Arc<StackInner>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("ipx-coalesce".to_owned())
        .spawn(move || {
            while stack.running.load(Ordering::SeqCst) {
                thread::sleep(COALESCE_SWEEP);
                let waiting = stack
                    .coalescer
                    .lock()
                    .unwrap()
                    .flush_waiting(Instant::now());
                if waiting.is_empty() {
                    continue;
                }
                if let Some(server) = stack.dosbox_server {
                    for datagram in waiting {
                        debug!("Sending coalesced packet ({} bytes)", datagram.len());
                        tx::send_relay(&stack, &datagram, server).ok();
                    }
                }
            }
        })
        .expect("Cannot create coalesce sweep thread")
}

fn dispatch_loop(stack: Arc<StackInner>, receiver: Receiver<RouterInput>) {
    let mut last_refresh = Instant::now();

    loop {
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(input) => handle_input(&stack, input),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if !stack.running.load(Ordering::SeqCst) {
            break;
        }

        if last_refresh.elapsed() >= ADDR_TABLE_REFRESH {
            let ports = stack.sockets.lock().unwrap().bound_ports();
            stack.addr_table.update(&ports);
            last_refresh = Instant::now();
        }
    }
    debug!("Router thread is quitting");
}

fn handle_input(stack: &StackInner, input: RouterInput) {
    let result = match input {
        RouterInput::Udp { data, from } => handle_udp(stack, &data, from),
        RouterInput::Relay { data, from } => handle_relay(stack, &data, from),
        RouterInput::Frame { data, iface_node } => handle_frame(stack, &data, iface_node),
    };
    if let Err(e) = result {
        debug!("Dropping received frame: {}", e);
    }
}

fn handle_udp(stack: &StackInner, data: &[u8], from: SocketAddr) -> RxResult {
    let (header, payload) = match unpack_ipx_packet(data) {
        Some(parsed) => parsed,
        None => {
            return Err(if data.len() < IPX_HEADER_SIZE {
                RxError::TooShort
            } else {
                RxError::InvalidLength
            });
        }
    };

    if header.src.socket == 0 {
        // Internal traffic between instances; never delivered to
        // applications, which cannot bind socket zero.
        return match header.ptype {
            IPX_MAGIC_SPXLOOKUP => handle_spx_lookup(stack, payload, from),
            other => Err(RxError::UnknownMagic(other)),
        };
    }

    debug!(
        "Received packet from {} ({}) for {}",
        header.src, from, header.dest
    );

    // Unicast packets must originate inside the subnet of the destination
    // interface; broadcasts are accepted from the subnet of any interface.
    let from_ip = match from {
        SocketAddr::V4(v4) => *v4.ip(),
        SocketAddr::V6(_) => return Err(RxError::WrongSubnet),
    };

    let allowed = if header.dest.node.is_broadcast() {
        stack.interfaces.list()
    } else {
        stack
            .interfaces
            .by_addr(header.dest.net, header.dest.node)
            .map(|iface| vec![iface])
            .unwrap_or_default()
    };
    let source_ok = allowed
        .iter()
        .any(|iface| iface.bindings.iter().any(|binding| binding.contains(from_ip)));
    if !source_ok {
        return Err(RxError::WrongSubnet);
    }

    // Remember where this IPX address lives so replies can be unicast.
    stack
        .addr_cache
        .lock()
        .unwrap()
        .set(from, header.src.net, header.src.node, header.src.socket);

    deliver_packet(stack, &header, data);
    Ok(())
}

fn handle_spx_lookup(stack: &StackInner, payload: &[u8], from: SocketAddr) -> RxResult {
    let request = match SpxLookupReq::from_bytes(payload) {
        Some(request) => request,
        None => {
            debug!(
                "Received SPX lookup packet with {} byte payload, dropping",
                payload.len()
            );
            return Err(RxError::InvalidLength);
        }
    };

    // Reply with the TCP port of a listening SPX socket bound to the
    // requested address. A zero network in the request means "any".
    let reply = {
        let sockets = stack.sockets.lock().unwrap();
        let found = sockets
            .iter()
            .find(|&(_, entry)| {
                entry.flags.contains(SocketFlags::IS_SPX)
                    && entry.flags.contains(SocketFlags::LISTENING)
                    && (entry.addr.net == request.addr.net || request.addr.net.is_zero())
                    && entry.addr.node == request.addr.node
                    && entry.addr.socket == request.addr.socket
            })
            .map(|(_, entry)| SpxLookupReply {
                addr: request.addr,
                port: entry.port,
            });
        found
    };

    if let Some(reply) = reply {
        if let Err(e) = stack.private_socket.send_to(&reply.to_bytes(), from) {
            error!("Cannot send SPX lookup reply: {}", e);
        }
    }
    Ok(())
}

fn handle_relay(stack: &StackInner, data: &[u8], from: SocketAddr) -> RxResult {
    if stack.dosbox_server != Some(from) {
        return Err(RxError::NotFromServer);
    }

    match stack.dosbox.state() {
        DosboxState::Registering => handle_registration(stack, data),
        DosboxState::Connected => {
            let (header, payload) = match unpack_ipx_packet(data) {
                Some(parsed) => parsed,
                None => {
                    error!("Received invalid IPX packet from DOSBox server, dropping");
                    return Err(RxError::InvalidLength);
                }
            };

            if header.ptype == IPX_MAGIC_COALESCED {
                return inflate_coalesced(stack, payload);
            }

            debug!("Received packet from {} for {}", header.src, header.dest);
            deliver_packet(stack, &header, data);
            Ok(())
        }
        DosboxState::Disconnected => Err(RxError::NotFromServer),
    }
}

fn handle_registration(stack: &StackInner, data: &[u8]) -> RxResult {
    let (header, _) = match unpack_ipx_packet(data) {
        Some(parsed) => parsed,
        None => {
            error!("Got invalid registration response from DOSBox server!");
            return Err(RxError::InvalidLength);
        }
    };

    // The address the relay assigned to us arrives as the destination of
    // the registration response.
    stack
        .dosbox
        .set_connected(header.dest.net, header.dest.node);
    stack.interfaces.reload();

    info!(
        "Connected to DOSBox server, local address: {}/{}",
        header.dest.net, header.dest.node
    );
    Ok(())
}

/// Splits a coalesced payload back into the individual IPX packets it
/// carries and delivers each one.
fn inflate_coalesced(stack: &StackInner, payload: &[u8]) -> RxResult {
    let mut offset = 0;
    while offset < payload.len() {
        let remaining = &payload[offset..];
        let (inner, _) = match IpxHeader::read(remaining) {
            Some(parsed) => parsed,
            None => return Err(RxError::TooShort),
        };
        let length = inner.length as usize;
        if length < IPX_HEADER_SIZE || length > remaining.len() {
            return Err(RxError::InvalidLength);
        }
        let packet = &remaining[..length];
        if let Some((header, _)) = unpack_ipx_packet(packet) {
            deliver_packet(stack, &header, packet);
        }
        offset += length;
    }
    Ok(())
}

fn handle_frame(stack: &StackInner, data: &[u8], iface_node: Addr48) -> RxResult {
    let codec = stack.config.frame_type.codec();
    let ipx = match codec.unpack(data) {
        Some(ipx) => ipx,
        None => return Err(RxError::BadFrame),
    };

    let (header, checksum) = match IpxHeader::read(ipx) {
        Some(parsed) => parsed,
        None => return Err(RxError::TooShort),
    };
    if checksum != 0xffff {
        return Err(RxError::InvalidChecksum);
    }
    let length = header.length as usize;
    if length < IPX_HEADER_SIZE || length > ipx.len() {
        return Err(RxError::InvalidLength);
    }

    // Only frames for this card or for everyone.
    if header.dest.node != iface_node && !header.dest.node.is_broadcast() {
        return Ok(());
    }

    if header.src.socket == 0 {
        return Err(RxError::UnknownMagic(header.ptype));
    }

    deliver_packet(stack, &header, &ipx[..length]);
    Ok(())
}

/// Whether one socket should receive this packet. Pure so it can be tested
/// exhaustively; the order of the checks follows the dispatch rules.
pub(crate) fn socket_accepts(
    entry: &SocketEntry,
    config: &MainConfig,
    header: &IpxHeader,
) -> bool {
    let dest = &header.dest;
    let broadcast = dest.net.is_broadcast() || dest.node.is_broadcast();

    if entry.is_spx() {
        return false;
    }
    if !entry.flags.contains(SocketFlags::BOUND) {
        return false;
    }
    if !entry.flags.contains(SocketFlags::RECV) {
        // Shut down for receive operations.
        return false;
    }
    if entry.flags.contains(SocketFlags::FILTER) && entry.f_ptype != header.ptype {
        return false;
    }
    if (dest.net != entry.addr.net && !dest.net.is_broadcast())
        || (dest.node != entry.addr.node && !dest.node.is_broadcast())
        || dest.socket != entry.addr.socket
    {
        return false;
    }
    if broadcast && !entry.flags.contains(SocketFlags::RECV_BCAST) {
        return false;
    }
    if broadcast && config.w95_bug && !entry.flags.contains(SocketFlags::BROADCAST) {
        // Windows 95 required SO_BROADCAST to receive broadcasts; some
        // applications depend on the lossage.
        return false;
    }
    if entry.flags.contains(SocketFlags::CONNECTED) && header.src != entry.remote_addr {
        return false;
    }
    true
}

fn deliver_packet(stack: &StackInner, header: &IpxHeader, wire: &[u8]) {
    debug!(
        "Delivering {} byte payload from {} to {}",
        wire.len() - IPX_HEADER_SIZE,
        header.src,
        header.dest
    );

    let sockets = stack.sockets.lock().unwrap();
    for (_, entry) in sockets.iter() {
        if !socket_accepts(entry, &stack.config, header) {
            continue;
        }
        debug!("...relaying to local port {}", entry.port);

        let endpoint = SocketAddr::from(([127, 0, 0, 1], entry.port));
        if let Err(e) = stack.private_socket.send_to(wire, endpoint) {
            error!("Error relaying packet: {}", e);
        }
    }
}

/// Asks a DOSBox server for an address assignment. The response is handled
/// by the dispatch loop.
pub(crate) fn send_dosbox_registration(stack: &StackInner) {
    let server = match stack.dosbox_server {
        Some(server) => server,
        None => return,
    };

    let echo = IpxAddr::new(Addr32::ZERO, Addr48::ZERO, IPX_SOCK_ECHO);
    let request = pack_ipx_packet(IPX_MAGIC_DOSBOX_REG, echo, echo, &[]);

    if let Err(e) = stack.private_socket.send_to(&request, server) {
        error!("Error sending DOSBox IPX registration request: {}", e);
    }
}
