//! SPX session setup: lookup broadcast, TCP handshake, spxinit exchange.

extern crate ripx;

use std::thread;

use ripx::{IpxAddr, IpxStack, MainConfig};

fn test_stack(port: u16) -> IpxStack {
    let mut config = MainConfig::default();
    config.udp_port = port;
    config.w95_bug = false;
    IpxStack::new(config).expect("Cannot bring up IPX stack")
}

#[test]
fn spx_connect_round_trip() {
    let stack = test_stack(42114);
    let iface = stack.interfaces().into_iter().next().expect("No interfaces");

    let listener = stack.stream_socket().unwrap();
    listener
        .bind(IpxAddr::new(iface.net, iface.node, 2000))
        .unwrap();
    listener.listen().unwrap();
    let listen_addr = listener.local_addr().unwrap();

    let acceptor = thread::spawn(move || {
        let (accepted, peer) = listener.accept().unwrap();
        assert_eq!(accepted.peer_addr().unwrap(), peer);

        // Read the whole 77 byte message, then echo it back.
        let mut buf = [0u8; 256];
        let mut got = 0;
        while got < 77 {
            let n = accepted.recv(&mut buf[got..]).unwrap();
            assert!(n > 0);
            got += n;
        }
        accepted.send(&buf[..77]).unwrap();

        (listener, accepted, peer)
    });

    // The client starts unbound; connecting resolves the listener, binds
    // to an automatic socket number and opens the stream.
    let client = stack.stream_socket().unwrap();
    client.connect(listen_addr).unwrap();

    let client_addr = client.local_addr().unwrap();
    assert!(client_addr.socket >= 1024);
    assert_eq!(client.peer_addr().unwrap(), listen_addr);

    let message = [0x42u8; 77];
    assert_eq!(client.send(&message).unwrap(), 77);

    let mut buf = [0u8; 256];
    let mut got = 0;
    while got < 77 {
        let n = client.recv(&mut buf[got..]).unwrap();
        assert!(n > 0);
        got += n;
    }
    assert_eq!(&buf[..77], &message[..]);

    let (_listener, accepted, peer) = acceptor.join().unwrap();
    assert_eq!(peer, client_addr);
    assert_eq!(accepted.local_addr().unwrap(), listen_addr);
}

#[test]
fn connect_without_listener_fails() {
    let stack = test_stack(42116);
    let iface = stack.interfaces().into_iter().next().expect("No interfaces");

    let client = stack.stream_socket().unwrap();
    // Nothing listens on this address, so the lookup times out.
    assert!(client
        .connect(IpxAddr::new(iface.net, iface.node, 2999))
        .is_err());
}

#[test]
fn stream_ops_rejected_on_datagram_sockets() {
    let stack = test_stack(42117);
    let iface = stack.interfaces().into_iter().next().expect("No interfaces");

    let socket = stack.datagram_socket(0).unwrap();
    socket.bind(IpxAddr::new(iface.net, iface.node, 4631)).unwrap();

    assert!(socket.listen().is_err());
    assert!(socket.accept().is_err());
}
