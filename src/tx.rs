//! The encapsulation send path.
//!
//! Serialises one IPX packet and hands it to whichever carrier the stack
//! was configured with: a capture handle for raw Ethernet, the relay server
//! for DOSBox (possibly through the coalescer), or UDP with cached unicast
//! and broadcast fallback.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Instant;

use addr::IpxAddr;
use config::EncapType;
use error::{Error, Result};
use packet::{pack_ipx_packet, MAX_DATA_SIZE};
use stack::StackInner;

/// The largest payload `send_to` accepts under the current configuration.
pub(crate) fn max_ipx_payload(stack: &StackInner) -> usize {
    match stack.config.encap_type {
        EncapType::Pcap => ::std::cmp::min(MAX_DATA_SIZE, stack.config.frame_type.max_payload()),
        _ => MAX_DATA_SIZE,
    }
}

/// Sends one fully described packet. Returns only once the packet has been
/// handed to the OS (or buffered by the coalescer).
pub(crate) fn ipx_send_packet(
    stack: &StackInner,
    ptype: u8,
    src: IpxAddr,
    dest: IpxAddr,
    payload: &[u8],
) -> Result<()> {
    debug!(
        "Sending {} byte payload from {} to {}",
        payload.len(),
        src,
        dest
    );

    match stack.config.encap_type {
        EncapType::Pcap => send_pcap(stack, ptype, src, dest, payload),
        EncapType::DosBox => send_dosbox(stack, ptype, src, dest, payload),
        EncapType::IpxWrapper => send_udp(stack, ptype, src, dest, payload),
    }
}

fn send_pcap(
    stack: &StackInner,
    ptype: u8,
    src: IpxAddr,
    dest: IpxAddr,
    payload: &[u8],
) -> Result<()> {
    if stack.interfaces.by_addr(src.net, src.node).is_none() {
        // Bound sockets always carry an interface address, so this is
        // either a stale cache or a bug.
        return Err(Error::NetDown);
    }

    let frame = match stack
        .config
        .frame_type
        .pack_frame(ptype, src, dest, payload)
    {
        Some(frame) => frame,
        None => {
            error!(
                "Tried sending a {} byte packet, too large for the selected frame type",
                payload.len()
            );
            return Err(Error::MsgSize);
        }
    };

    debug!("...frame size = {}", frame.len());

    let mut senders = stack.carrier_senders.lock().unwrap();
    let sender = match senders.get_mut(&src.node) {
        Some(sender) => sender,
        None => return Err(Error::NetDown),
    };

    match sender.send_to(&frame, None) {
        Some(Ok(())) => Ok(()),
        _ => {
            error!("Could not transmit Ethernet frame");
            Err(Error::NetDown)
        }
    }
}

fn send_dosbox(
    stack: &StackInner,
    ptype: u8,
    src: IpxAddr,
    dest: IpxAddr,
    payload: &[u8],
) -> Result<()> {
    let (local_net, local_node) = match stack.dosbox.assigned() {
        Some(assigned) => assigned,
        None => return Err(Error::NetDown),
    };
    if src.net != local_net || src.node != local_node {
        return Err(Error::NetDown);
    }

    let server = stack.dosbox_server.ok_or(Error::NetDown)?;
    let packet = pack_ipx_packet(ptype, src, dest, payload);

    if stack.config.dosbox_coalesce {
        let datagrams = stack.coalescer.lock().unwrap().send(
            &packet,
            dest,
            (local_net, local_node),
            Instant::now(),
        );
        for datagram in datagrams {
            send_relay(stack, &datagram, server)?;
        }
        Ok(())
    } else {
        send_relay(stack, &packet, server)
    }
}

/// One datagram to the relay server, with transport level accounting.
pub(crate) fn send_relay(stack: &StackInner, datagram: &[u8], server: SocketAddr) -> Result<()> {
    match stack.private_socket.send_to(datagram, server) {
        Ok(_) => {
            stack
                .counters
                .send_packets_udp
                .fetch_add(1, Ordering::Relaxed);
            stack
                .counters
                .send_bytes_udp
                .fetch_add(datagram.len() as u64, Ordering::Relaxed);
            Ok(())
        }
        Err(e) => {
            error!("Error sending DOSBox IPX packet: {}", e);
            Err(Error::Io(e))
        }
    }
}

fn send_udp(
    stack: &StackInner,
    ptype: u8,
    src: IpxAddr,
    dest: IpxAddr,
    payload: &[u8],
) -> Result<()> {
    let packet = pack_ipx_packet(ptype, src, dest, payload);

    // A peer we heard from recently can be addressed directly.
    let cached = stack
        .addr_cache
        .lock()
        .unwrap()
        .get(dest.net, dest.node, dest.socket);

    if let Some(endpoint) = cached {
        debug!("Sending packet from {} to {} ({})", src, dest, endpoint);
        return send_transport(stack, &packet, endpoint);
    }

    // No cached address: broadcast on every IP binding of the source
    // interface. The send succeeds if any broadcast makes it out.
    let iface = stack.interfaces.by_addr(src.net, src.node);
    let bindings = match iface {
        Some(ref iface) if !iface.bindings.is_empty() => &iface.bindings,
        _ => return Err(Error::NetUnreach),
    };

    let mut sent = false;
    let mut last_error = Error::NetUnreach;
    for binding in bindings {
        let endpoint = SocketAddr::from((binding.bcast, stack.config.udp_port));
        debug!("Sending packet from {} to {} ({})", src, dest, endpoint);
        match send_transport(stack, &packet, endpoint) {
            Ok(()) => sent = true,
            Err(e) => last_error = e,
        }
    }

    if sent {
        Ok(())
    } else {
        Err(last_error)
    }
}

fn send_transport(stack: &StackInner, packet: &[u8], endpoint: SocketAddr) -> Result<()> {
    match stack.private_socket.send_to(packet, endpoint) {
        Ok(_) => {
            stack
                .counters
                .send_packets_udp
                .fetch_add(1, Ordering::Relaxed);
            stack
                .counters
                .send_bytes_udp
                .fetch_add(packet.len() as u64, Ordering::Relaxed);
            Ok(())
        }
        Err(e) => Err(Error::Io(e)),
    }
}
