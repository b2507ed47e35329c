//! FIONREAD accounting and select() emulation moving in lockstep.

extern crate ripx;

use std::thread::sleep;
use std::time::{Duration, Instant};

use ripx::{select_read, IpxAddr, IpxSocket, IpxStack, MainConfig};

fn test_stack(port: u16) -> IpxStack {
    let mut config = MainConfig::default();
    config.udp_port = port;
    config.w95_bug = false;
    IpxStack::new(config).expect("Cannot bring up IPX stack")
}

fn wait_ready_bytes(socket: &IpxSocket, expected: usize) -> usize {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let ready = socket.ready_bytes().unwrap();
        if ready >= expected || Instant::now() >= deadline {
            return ready;
        }
        sleep(Duration::from_millis(10));
    }
}

/// Reads until the socket has been quiet for a moment, so that duplicate
/// broadcast copies from multi-homed hosts don't skew the byte counts.
fn drain(socket: &IpxSocket) {
    let mut buf = [0u8; 2048];
    let mut quiet = Instant::now();
    while quiet.elapsed() < Duration::from_millis(200) {
        if socket.ready_bytes().unwrap() > 0 {
            socket.recv_from(&mut buf).unwrap();
            quiet = Instant::now();
        } else {
            sleep(Duration::from_millis(10));
        }
    }
}

#[test]
fn fionread_and_select_lockstep() {
    let stack = test_stack(42113);
    let iface = stack.interfaces().into_iter().next().expect("No interfaces");

    let sock_a = stack.datagram_socket(0).unwrap();
    sock_a.bind(IpxAddr::new(iface.net, iface.node, 4621)).unwrap();
    let sock_b = stack.datagram_socket(0).unwrap();
    sock_b.bind(IpxAddr::new(iface.net, iface.node, 4622)).unwrap();

    let addr_a = sock_a.local_addr().unwrap();
    let addr_b = sock_b.local_addr().unwrap();

    // Prime the address cache in both directions so the counted sends below
    // travel by unicast and arrive exactly once.
    sock_b.send_to(b"prime", addr_a).unwrap();
    wait_ready_bytes(&sock_a, 1);
    sock_a.send_to(b"prime", addr_b).unwrap();
    wait_ready_bytes(&sock_b, 1);
    drain(&sock_a);
    drain(&sock_b);

    assert_eq!(sock_b.ready_bytes().unwrap(), 0);
    assert!(select_read(&[&sock_b], Some(Duration::from_millis(50))).is_empty());

    sock_a.send_to(&[1u8; 128], addr_b).unwrap();
    sock_a.send_to(&[2u8; 256], addr_b).unwrap();

    assert_eq!(wait_ready_bytes(&sock_b, 384), 384);
    assert_eq!(
        select_read(&[&sock_a, &sock_b], Some(Duration::from_millis(50))),
        vec![1]
    );

    let mut buf = [0u8; 1024];
    let (len, _) = sock_b.recv_from(&mut buf).unwrap();
    assert_eq!(len, 128);
    assert_eq!(sock_b.ready_bytes().unwrap(), 256);
    assert_eq!(
        select_read(&[&sock_b], Some(Duration::from_millis(50))),
        vec![0]
    );

    let (len, _) = sock_b.recv_from(&mut buf).unwrap();
    assert_eq!(len, 256);
    assert_eq!(sock_b.ready_bytes().unwrap(), 0);
    assert!(select_read(&[&sock_b], Some(Duration::from_millis(50))).is_empty());
}

#[test]
fn truncated_reads_report_msgsize() {
    let stack = test_stack(42123);
    let iface = stack.interfaces().into_iter().next().expect("No interfaces");

    let sock_a = stack.datagram_socket(0).unwrap();
    sock_a.bind(IpxAddr::new(iface.net, iface.node, 4625)).unwrap();
    let sock_b = stack.datagram_socket(0).unwrap();
    sock_b.bind(IpxAddr::new(iface.net, iface.node, 4626)).unwrap();

    sock_a
        .send_to(&[9u8; 100], sock_b.local_addr().unwrap())
        .unwrap();
    wait_ready_bytes(&sock_b, 100);

    let mut small = [0u8; 10];
    assert!(sock_b.recv_from(&mut small).is_err());
    assert_eq!(&small, &[9u8; 10]);
}
