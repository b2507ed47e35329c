//! Broadcast reception and the Windows 95 SO_BROADCAST bug emulation.

extern crate ripx;

use std::thread::sleep;
use std::time::{Duration, Instant};

use ripx::{Addr48, IpxAddr, IpxSocket, IpxStack, MainConfig};

fn test_stack(port: u16, w95_bug: bool) -> IpxStack {
    let mut config = MainConfig::default();
    config.udp_port = port;
    config.w95_bug = w95_bug;
    IpxStack::new(config).expect("Cannot bring up IPX stack")
}

/// Polls FIONREAD until something arrives or the deadline passes.
fn arrived(socket: &IpxSocket, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        if socket.ready_bytes().unwrap() > 0 {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10));
    }
}

#[test]
fn w95_bug_requires_so_broadcast() {
    let stack = test_stack(42111, true);
    let iface = stack.interfaces().into_iter().next().expect("No interfaces");

    let sender = stack.datagram_socket(0).unwrap();
    sender.bind(IpxAddr::new(iface.net, iface.node, 4601)).unwrap();
    let receiver = stack.datagram_socket(0).unwrap();
    receiver.bind(IpxAddr::new(iface.net, iface.node, 4602)).unwrap();

    let bcast = IpxAddr::new(iface.net, Addr48::BROADCAST, 4602);

    // Without SO_BROADCAST the emulated bug swallows the packet.
    sender.send_to(b"nobody home", bcast).unwrap();
    assert!(!arrived(&receiver, Duration::from_millis(300)));

    // With SO_BROADCAST it arrives.
    receiver.set_broadcast(true).unwrap();
    sender.send_to(b"hello all", bcast).unwrap();
    assert!(arrived(&receiver, Duration::from_secs(5)));

    let mut buf = [0u8; 64];
    let (len, from) = receiver.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"hello all");
    assert_eq!(from, sender.local_addr().unwrap());
}

#[test]
fn broadcast_arrives_without_the_bug() {
    let stack = test_stack(42112, false);
    let iface = stack.interfaces().into_iter().next().expect("No interfaces");

    let sender = stack.datagram_socket(0).unwrap();
    sender.bind(IpxAddr::new(iface.net, iface.node, 4611)).unwrap();
    let receiver = stack.datagram_socket(0).unwrap();
    receiver.bind(IpxAddr::new(iface.net, iface.node, 4612)).unwrap();

    // No SO_BROADCAST and still delivered.
    let bcast = IpxAddr::new(iface.net, Addr48::BROADCAST, 4612);
    sender.send_to(b"free for all", bcast).unwrap();
    assert!(arrived(&receiver, Duration::from_secs(5)));

    // Unless reception of broadcasts is turned off entirely.
    let muted = stack.datagram_socket(0).unwrap();
    muted.bind(IpxAddr::new(iface.net, iface.node, 4613)).unwrap();
    muted.set_receive_broadcast(false).unwrap();

    sender
        .send_to(b"none for you", IpxAddr::new(iface.net, Addr48::BROADCAST, 4613))
        .unwrap();
    assert!(!arrived(&muted, Duration::from_millis(300)));
}

#[test]
fn filter_drops_other_packet_types() {
    let stack = test_stack(42115, false);
    let iface = stack.interfaces().into_iter().next().expect("No interfaces");

    let sender = stack.datagram_socket(4).unwrap();
    sender.bind(IpxAddr::new(iface.net, iface.node, 4615)).unwrap();
    let receiver = stack.datagram_socket(0).unwrap();
    receiver.bind(IpxAddr::new(iface.net, iface.node, 4616)).unwrap();

    let dest = receiver.local_addr().unwrap();

    // Filter on a type the sender doesn't use: nothing shows up.
    receiver.set_filter_packet_type(Some(7)).unwrap();
    sender.send_to(b"wrong type", dest).unwrap();
    assert!(!arrived(&receiver, Duration::from_millis(300)));

    // Match the sender's type and packets flow again.
    receiver.set_filter_packet_type(Some(4)).unwrap();
    sender.send_to(b"right type", dest).unwrap();
    assert!(arrived(&receiver, Duration::from_secs(5)));

    let mut buf = [0u8; 64];
    let (len, ext) = receiver.recv_from_ext(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"right type");
    assert_eq!(ext.ptype, 4);

    // With the packet type extension enabled, the wider address variant
    // overrides the sender's default type per packet.
    sender.set_extended_address(true).unwrap();
    receiver.set_filter_packet_type(Some(9)).unwrap();
    sender
        .send_to_ext(
            b"override",
            &ripx::IpxAddrExt {
                addr: dest,
                ptype: 9,
                flags: 0,
            },
        )
        .unwrap();
    assert!(arrived(&receiver, Duration::from_secs(5)));

    let (len, ext) = receiver.recv_from_ext(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"override");
    assert_eq!(ext.ptype, 9);
}
