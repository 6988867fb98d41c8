use std::sync::Arc;
use std::thread;

use segfab::{EventKind, FabricError, Flags, Info, PeerAddr};
use segfab_interconnect::loopback::LoopbackFabric;

use crate::harness::{config, connect_pair, Node, CLIENT_NODE, LISTEN_SEGMENT, PATIENCE, SERVER_NODE};

#[test]
fn handshake_leaves_one_connected_event() {
    let switch = LoopbackFabric::new();
    let (server, client) = connect_pair(&switch, config(4096), config(4096)).expect("connect");

    assert!(server.ep.is_connected());
    assert!(client.ep.is_connected());
    assert_eq!(server.eq().pending(), (1, 0));
    let event = server.eq().read(Flags::empty()).expect("connected");
    assert_eq!(event.event, EventKind::Connected);
    assert_eq!(event.fid, server.ep.fid());
    assert!(matches!(
        server.eq().read(Flags::empty()),
        Err(FabricError::Again)
    ));

    assert_eq!(server.ep.peer().map(|p| p.node_id), Some(CLIENT_NODE));
    assert_eq!(client.ep.peer().map(|p| p.node_id), Some(SERVER_NODE));
}

#[test]
fn each_side_owns_one_ring_buffer() {
    let switch = LoopbackFabric::new();
    let (server, client) = connect_pair(&switch, config(4096), config(4096)).expect("connect");
    let per_segment = config(4096).buffers_per_segment;
    assert_eq!(server.node.provider.buffer_usage(), (1, per_segment - 1));
    assert_eq!(client.node.provider.buffer_usage(), (1, per_segment - 1));

    server.ep.shutdown().expect("shutdown");
    assert_eq!(server.node.provider.buffer_usage(), (1, per_segment));
}

#[test]
fn shutdown_reports_event_and_is_idempotent() {
    let switch = LoopbackFabric::new();
    let (server, _client) = connect_pair(&switch, config(1024), config(1024)).expect("connect");
    server.eq().read(Flags::empty()).expect("connected");

    server.ep.shutdown().expect("shutdown");
    server.ep.shutdown().expect("second shutdown");
    assert!(!server.ep.is_connected());
    assert_eq!(server.ep.peer(), None);

    let event = server.eq().read(Flags::empty()).expect("shutdown event");
    assert_eq!(event.event, EventKind::Shutdown);
    assert_eq!(server.eq().pending(), (0, 0));
    assert!(matches!(
        server.ep.send(vec![0; 8], 1).and_then(|_| server.cq().read(1)),
        Err(FabricError::Again)
    ));
}

#[test]
fn listener_serves_two_clients() {
    let switch = LoopbackFabric::new();
    let server = Node::open(&switch, SERVER_NODE, config(512)).expect("server");
    let listener = server
        .fabric
        .passive_ep(&Info {
            src_addr: Some(PeerAddr::new(SERVER_NODE, LISTEN_SEGMENT)),
            ..Info::default()
        })
        .expect("pep");
    listener.bind_eq(&server.eq).expect("bind");
    listener.listen().expect("listen");

    let clients: Vec<_> = [21, 22]
        .into_iter()
        .map(|node| {
            let switch = Arc::clone(&switch);
            thread::spawn(move || {
                let client = Node::open(&switch, node, config(512)).expect("client");
                let ep = client.endpoint(&Info::default()).expect("ep");
                ep.connect(Some(PeerAddr::new(SERVER_NODE, LISTEN_SEGMENT)))
                    .expect("connect");
                ep.send(node.to_le_bytes().to_vec(), u64::from(node)).expect("send");
                let sent = client.cq.sread(1, PATIENCE).expect("send completion");
                assert_eq!(sent[0].context, u64::from(node));
                (client, ep)
            })
        })
        .collect();

    let mut accepted = Vec::new();
    while accepted.len() < 2 {
        let request = server.eq.sread(PATIENCE, Flags::empty()).expect("event");
        match request.event {
            EventKind::ConnReq => {}
            EventKind::Connected => continue,
            other => panic!("unexpected event {other:?}"),
        }
        let ep = server
            .endpoint(&request.info.expect("info"))
            .expect("ep");
        ep.accept().expect("accept");
        accepted.push(ep);
    }
    let _clients: Vec<_> = clients
        .into_iter()
        .map(|client| client.join().expect("client thread"))
        .collect();

    let mut senders = Vec::new();
    for ep in &accepted {
        let node = ep.peer().expect("peer").node_id;
        ep.recv(vec![0; 16], u64::from(node)).expect("recv");
        senders.push(node);
    }
    let mut seen: Vec<u32> = Vec::new();
    while seen.len() < 2 {
        for entry in server.cq.sread(2, PATIENCE).expect("recv completion") {
            if entry.flags.contains(Flags::RECV) {
                let buf = entry.buf.expect("buffer");
                let node = u32::from_le_bytes(buf[..4].try_into().expect("len"));
                assert_eq!(u64::from(node), entry.context);
                seen.push(node);
            }
        }
    }
    seen.sort_unstable();
    senders.sort_unstable();
    assert_eq!(seen, senders);
}
