//! End to end datagram traffic over the IPX-over-UDP carrier: broadcast
//! discovery first, learned unicast for the reply.
//!
//! Every test runs its own stack on its own UDP port so concurrently
//! running tests cannot hear each other's broadcasts.

extern crate ripx;

#[macro_use]
extern crate lazy_static;

use std::thread::sleep;
use std::time::{Duration, Instant};

use ripx::{IpxAddr, IpxSocket, IpxStack, MainConfig};

lazy_static! {
    static ref PAYLOAD: Vec<u8> = (0..128).map(|i| i as u8).collect();
}

fn test_stack(port: u16) -> IpxStack {
    let mut config = MainConfig::default();
    config.udp_port = port;
    config.w95_bug = false;
    IpxStack::new(config).expect("Cannot bring up IPX stack")
}

/// Waits until the socket has a packet queued, so a lost packet fails the
/// test instead of hanging it in a blocking recv.
fn wait_for_packet(socket: &IpxSocket) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while socket.ready_bytes().unwrap() == 0 {
        if Instant::now() >= deadline {
            panic!("No packet arrived within five seconds");
        }
        sleep(Duration::from_millis(10));
    }
}

#[test]
fn round_trip_and_reply() {
    let stack = test_stack(42110);

    let iface = stack.interfaces().into_iter().next().expect("No interfaces");

    let sock_a = stack.datagram_socket(0).unwrap();
    sock_a.bind(IpxAddr::new(iface.net, iface.node, 4567)).unwrap();

    let sock_b = stack.datagram_socket(0).unwrap();
    sock_b.bind(IpxAddr::new(iface.net, iface.node, 4568)).unwrap();

    let addr_a = sock_a.local_addr().unwrap();
    let addr_b = sock_b.local_addr().unwrap();
    assert_eq!(addr_a.socket, 4567);
    assert_eq!(addr_b.socket, 4568);

    // First packet goes out by broadcast since nothing is cached yet.
    assert_eq!(sock_a.send_to(&PAYLOAD, addr_b).unwrap(), 128);

    wait_for_packet(&sock_b);
    let mut buf = [0u8; 1024];
    let (len, from) = sock_b.recv_from(&mut buf).unwrap();
    assert_eq!(len, 128);
    assert_eq!(&buf[..len], &PAYLOAD[..]);
    assert_eq!(from, addr_a);

    // The reply rides on the address the router learned for A.
    sock_b.send_to(b"pong", addr_a).unwrap();
    wait_for_packet(&sock_a);
    let (len, from) = sock_a.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"pong");
    assert_eq!(from, addr_b);
}

#[test]
fn peek_leaves_the_packet() {
    let stack = test_stack(42118);
    let iface = stack.interfaces().into_iter().next().expect("No interfaces");

    let sock_a = stack.datagram_socket(0).unwrap();
    sock_a.bind(IpxAddr::new(iface.net, iface.node, 4571)).unwrap();
    let sock_b = stack.datagram_socket(0).unwrap();
    sock_b.bind(IpxAddr::new(iface.net, iface.node, 4572)).unwrap();

    sock_a
        .send_to(b"look once", sock_b.local_addr().unwrap())
        .unwrap();
    wait_for_packet(&sock_b);

    let mut buf = [0u8; 64];
    let (len, _) = sock_b.peek_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"look once");

    let (len, _) = sock_b.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"look once");
}

#[test]
fn connected_socket_filters_and_sends() {
    let stack = test_stack(42119);
    let iface = stack.interfaces().into_iter().next().expect("No interfaces");

    let sock_a = stack.datagram_socket(0).unwrap();
    sock_a.bind(IpxAddr::new(iface.net, iface.node, 4573)).unwrap();
    let sock_b = stack.datagram_socket(0).unwrap();
    sock_b.bind(IpxAddr::new(iface.net, iface.node, 4574)).unwrap();

    let addr_a = sock_a.local_addr().unwrap();
    let addr_b = sock_b.local_addr().unwrap();

    sock_a.connect(addr_b).unwrap();
    assert_eq!(sock_a.peer_addr().unwrap(), addr_b);

    // send() on a connected socket goes to the pinned address.
    sock_a.send(b"hello").unwrap();
    wait_for_packet(&sock_b);
    let mut buf = [0u8; 64];
    let (len, from) = sock_b.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"hello");
    assert_eq!(from, addr_a);

    // Disconnect with an all-zero node.
    sock_a.connect(IpxAddr::ZERO).unwrap();
    assert!(sock_a.peer_addr().is_err());
}

#[test]
fn bind_conflicts_are_refused() {
    let stack = test_stack(42120);
    let iface = stack.interfaces().into_iter().next().expect("No interfaces");

    let sock_a = stack.datagram_socket(0).unwrap();
    sock_a.bind(IpxAddr::new(iface.net, iface.node, 4580)).unwrap();

    let sock_b = stack.datagram_socket(0).unwrap();
    assert!(sock_b
        .bind(IpxAddr::new(iface.net, iface.node, 4580))
        .is_err());

    // With SO_REUSEADDR on both sides the second bind is allowed.
    let sock_c = stack.datagram_socket(0).unwrap();
    let sock_d = stack.datagram_socket(0).unwrap();
    sock_c.set_reuse_addr(true).unwrap();
    sock_d.set_reuse_addr(true).unwrap();
    sock_c.bind(IpxAddr::new(iface.net, iface.node, 4581)).unwrap();
    sock_d.bind(IpxAddr::new(iface.net, iface.node, 4581)).unwrap();
}

#[test]
fn auto_allocated_socket_numbers_are_distinct() {
    let stack = test_stack(42121);

    let sock_a = stack.datagram_socket(0).unwrap();
    sock_a.bind(IpxAddr::ZERO).unwrap();
    let sock_b = stack.datagram_socket(0).unwrap();
    sock_b.bind(IpxAddr::ZERO).unwrap();

    let num_a = sock_a.local_addr().unwrap().socket;
    let num_b = sock_b.local_addr().unwrap().socket;
    assert!(num_a >= 1024);
    assert!(num_b >= 1024);
    assert_ne!(num_a, num_b);
}

#[test]
fn socket_options_report_interface_data() {
    let stack = test_stack(42125);
    let interfaces = stack.interfaces();
    assert!(!interfaces.is_empty());

    let socket = stack.datagram_socket(0).unwrap();

    assert_eq!(socket.max_adapter_num().unwrap(), interfaces.len());
    assert_eq!(socket.max_size().unwrap(), 8192);

    let data = socket.ipx_address_data(0).unwrap();
    assert_eq!(data.netnum, interfaces[0].net);
    assert_eq!(data.nodenum, interfaces[0].node);
    assert!(socket.ipx_address_data(interfaces.len()).is_err());

    assert_eq!(socket.packet_type().unwrap(), 0);
    socket.set_packet_type(5).unwrap();
    assert_eq!(socket.packet_type().unwrap(), 5);

    assert_eq!(socket.filter_packet_type().unwrap(), None);
    socket.set_filter_packet_type(Some(5)).unwrap();
    assert_eq!(socket.filter_packet_type().unwrap(), Some(5));

    // SO_LINGER on a datagram socket is accepted and ignored.
    socket.set_linger(Some(Duration::from_secs(1))).unwrap();
}

#[test]
fn shutdown_blocks_directions_independently() {
    use std::net::Shutdown;

    let stack = test_stack(42124);
    let iface = stack.interfaces().into_iter().next().expect("No interfaces");

    let sock_a = stack.datagram_socket(0).unwrap();
    sock_a.bind(IpxAddr::new(iface.net, iface.node, 4591)).unwrap();
    let sock_b = stack.datagram_socket(0).unwrap();
    sock_b.bind(IpxAddr::new(iface.net, iface.node, 4592)).unwrap();

    let addr_b = sock_b.local_addr().unwrap();

    sock_a.shutdown(Shutdown::Write).unwrap();
    assert!(sock_a.send_to(b"too late", addr_b).is_err());

    // Receive still works after a write shutdown.
    sock_b.send_to(b"still here", sock_a.local_addr().unwrap()).unwrap();
    wait_for_packet(&sock_a);
    let mut buf = [0u8; 64];
    let (len, _) = sock_a.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"still here");

    // After a read shutdown the router stops delivering.
    sock_a.shutdown(Shutdown::Read).unwrap();
    sock_b.send_to(b"dropped", sock_a.local_addr().unwrap()).unwrap();
    sleep(Duration::from_millis(300));
    assert_eq!(sock_a.ready_bytes().unwrap(), 0);
}

#[test]
fn bind_rejects_unknown_interface() {
    let stack = test_stack(42122);

    let sock = stack.datagram_socket(0).unwrap();
    let bogus = IpxAddr::new(
        ripx::Addr32::from(0x7f7f7f7f),
        ripx::Addr48::from(0x0102030405),
        4590,
    );
    assert!(sock.bind(bogus).is_err());
}
