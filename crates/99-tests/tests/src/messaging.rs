use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use segfab::{CounterAttr, FabricError, Flags};
use segfab_interconnect::loopback::LoopbackFabric;

use crate::harness::{config, connect_pair, payload, sequence_of, Peer};

fn contexts(entries: &[segfab::CqEntry]) -> Vec<u64> {
    entries.iter().map(|entry| entry.context).collect()
}

fn pair(buffer_size: usize) -> (Peer, Peer) {
    let switch = LoopbackFabric::new();
    connect_pair(&switch, config(buffer_size), config(buffer_size)).expect("connect")
}

#[test]
fn late_receive_gets_waiting_message() {
    let (server, client) = pair(4096);
    let cntr = server
        .node
        .domain
        .cntr_open(CounterAttr::default())
        .expect("counter");
    server.ep.bind_cntr(&cntr, Flags::RECV).expect("bind counter");

    let message = payload(1, 100);
    client.ep.send(message.clone(), 5).expect("send");
    let sent = client.next_completion().expect("send completion");
    assert_eq!(sent.context, 5);
    assert!(sent.flags.contains(Flags::MSG | Flags::SEND));
    assert_eq!(sent.buf.as_deref(), Some(&message[..]));

    server.ep.recv(vec![0; 200], 6).expect("recv");
    let received = server.next_completion().expect("recv completion");
    assert_eq!(received.context, 6);
    assert_eq!(received.len, 100);
    assert_eq!(received.err, 0);
    assert!(received.flags.contains(Flags::MSG | Flags::RECV));
    assert_eq!(received.buf.as_deref(), Some(&message[..]));
    assert_eq!((cntr.read(), cntr.readerr()), (1, 0));
}

#[test]
fn short_receive_reports_truncation() {
    let (server, client) = pair(4096);
    server.ep.recv(vec![0; 50], 9).expect("recv");
    assert_eq!(server.ep.pending(), (0, 1));

    let message = payload(2, 100);
    client.ep.send(message.clone(), 1).expect("send");

    let entry = server.next_error().expect("truncated completion");
    assert_eq!(entry.context, 9);
    assert_eq!(entry.len, 50);
    assert_eq!(entry.olen, 50);
    assert_eq!(entry.err, FabricError::TooSmall.errno());
    assert_eq!(entry.buf.as_deref(), Some(&message[..50]));
    assert_eq!(server.ep.pending(), (0, 0));
}

#[test]
fn blocked_send_holds_back_later_ones() {
    let (server, client) = pair(256);
    assert!(matches!(
        client.ep.send(vec![0; 300], 0),
        Err(FabricError::MsgSize)
    ));

    client.ep.send(payload(1, 200), 1).expect("first");
    client.ep.send(payload(2, 100), 2).expect("second");
    client.ep.send(payload(3, 8), 3).expect("third");
    assert_eq!(client.ep.pending(), (2, 0));
    assert_eq!(contexts(&client.cq().read(4).expect("first completion")), vec![1]);
    assert!(matches!(client.cq().read(4), Err(FabricError::Again)));

    for context in 10..13 {
        server.ep.recv(vec![0; 256], context).expect("recv");
    }
    assert_eq!(contexts(&client.completions(2).expect("sends")), vec![2, 3]);

    let received = server.completions(3).expect("receives");
    assert_eq!(contexts(&received), vec![10, 11, 12]);
    let lens: Vec<_> = received.iter().map(|entry| entry.len).collect();
    assert_eq!(lens, vec![200, 100, 8]);
    for (seq, entry) in (1..).zip(&received) {
        assert_eq!(entry.buf.as_deref(), Some(&payload(seq, entry.len)[..]));
    }
}

#[test]
fn stream_recovers_from_full_ring() {
    const MESSAGES: u64 = 2_000;
    const MAX_LEN: usize = 300;
    let (server, client) = pair(1024);

    let sender = thread::spawn(move || {
        let mut rng = StdRng::seed_from_u64(0x5e9f);
        let mut lens = Vec::new();
        for seq in 0..MESSAGES {
            let len = rng.gen_range(8..=MAX_LEN);
            client.ep.send(payload(seq, len), seq).expect("send");
            lens.push(len);
        }
        let done = client.completions(MESSAGES as usize).expect("send completions");
        assert_eq!(contexts(&done), (0..MESSAGES).collect::<Vec<_>>());
        lens
    });

    let receiver = thread::spawn(move || {
        for seq in 0..MESSAGES {
            server.ep.recv(vec![0; MAX_LEN], seq).expect("recv");
        }
        server.completions(MESSAGES as usize).expect("recv completions")
    });

    let lens = sender.join().expect("sender");
    let received = receiver.join().expect("receiver");
    for ((seq, len), entry) in (0..).zip(lens).zip(&received) {
        assert_eq!(entry.context, seq);
        assert_eq!(entry.len, len);
        let buf = entry.buf.as_deref().expect("buffer");
        assert_eq!(sequence_of(buf), Some(seq));
        assert_eq!(buf, &payload(seq, len)[..]);
    }
}

#[test]
fn shutdown_cancels_queued_operations() {
    let (server, client) = pair(256);
    for context in 1..=3 {
        server.ep.recv(vec![context as u8; 256], context).expect("recv");
    }
    assert_eq!(server.ep.pending(), (0, 3));

    client.ep.send(payload(1, 200), 1).expect("fits");
    client.ep.send(payload(2, 200), 2).expect("queued");
    assert_eq!(client.ep.pending(), (1, 0));
    client.next_completion().expect("first send");

    client.ep.shutdown().expect("client shutdown");
    let canceled = client.next_error().expect("canceled send");
    assert_eq!(canceled.context, 2);
    assert_eq!(canceled.err, FabricError::Canceled.errno());
    assert_eq!(canceled.buf.as_deref(), Some(&payload(2, 200)[..]));

    // The first frame already sits in the server's ring, so one receive
    // completes before the others are canceled.
    let first = server.next_completion().expect("delivered");
    assert_eq!((first.context, first.len), (1, 200));
    server.ep.shutdown().expect("server shutdown");
    for context in 2..=3 {
        let entry = server.cq().readerr().expect("canceled recv");
        assert_eq!(entry.context, context);
        assert_eq!(entry.err, FabricError::Canceled.errno());
        assert!(entry.flags.contains(Flags::RECV));
        assert_eq!(entry.buf.as_deref(), Some(&[context as u8; 256][..]));
    }
    assert!(matches!(server.cq().readerr(), Err(FabricError::Again)));
}
