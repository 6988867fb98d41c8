use segfab::{FabricError, Flags, Info, MemoryRegion, RmaIov, RmaMsg};
use segfab_interconnect::loopback::LoopbackFabric;

use crate::harness::{config, connect_pair, payload, Peer};

const REGION_X: u64 = 100;
const REGION_Y: u64 = 200;

fn regions(server: &Peer) -> (MemoryRegion, MemoryRegion) {
    let access = Flags::REMOTE_READ | Flags::REMOTE_WRITE;
    let domain = &server.node.domain;
    (
        domain.mr_reg(4096, access, REGION_X).expect("region x"),
        domain.mr_reg(4096, access, REGION_Y).expect("region y"),
    )
}

fn region_bytes(region: &MemoryRegion, offset: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0; len];
    region.read(offset, &mut out).expect("region read");
    out
}

#[test]
fn alternating_targets_reconnect_cache() {
    let switch = LoopbackFabric::new();
    let (server, client) = connect_pair(&switch, config(4096), config(4096)).expect("connect");
    let (x, y) = regions(&server);

    client.ep.write(&payload(1, 64), 0, 0, REGION_X, 1).expect("write x");
    client.ep.write(&payload(2, 64), 0, 128, REGION_Y, 2).expect("write y");
    client.ep.write(&payload(3, 64), 0, 256, REGION_X, 3).expect("write x again");

    let done = client.completions(3).expect("write completions");
    assert!(done
        .iter()
        .all(|entry| entry.flags.contains(Flags::RMA | Flags::WRITE) && entry.err == 0));
    assert_eq!(client.ep.rma_connects(), 3);

    assert_eq!(region_bytes(&x, 0, 64), payload(1, 64));
    assert_eq!(region_bytes(&y, 128, 64), payload(2, 64));
    assert_eq!(region_bytes(&x, 256, 64), payload(3, 64));

    let mut back = vec![0; 64];
    client.ep.read(&mut back, 0, 128, REGION_Y, 4).expect("read y");
    assert_eq!(back, payload(2, 64));
    assert_eq!(client.next_completion().expect("read completion").context, 4);
    assert_eq!(client.ep.rma_connects(), 4);
}

#[test]
fn write_with_data_raises_target_interrupt() {
    const IRQ: u64 = 0x4000;
    let switch = LoopbackFabric::new();
    let (server, client) = connect_pair(&switch, config(4096), config(4096)).expect("connect");
    let (x, _y) = regions(&server);

    let id = server
        .cq()
        .wait_data(IRQ, Flags::REMOTE_CQ_DATA | Flags::RMA)
        .expect("wait data");
    assert_eq!(u64::from(id), IRQ);

    let flushes = switch.stats().flushes;
    client
        .ep
        .writedata(b"notify", IRQ, 0, 8, REGION_X, 7)
        .expect("writedata");
    assert!(switch.stats().flushes > flushes);

    let local = client.next_completion().expect("local completion");
    assert_eq!((local.context, local.data), (7, IRQ));

    let remote = server.next_completion().expect("remote completion");
    assert_eq!(remote.data, IRQ);
    assert!(remote.flags.contains(Flags::REMOTE_CQ_DATA));
    assert_eq!(region_bytes(&x, 8, 6), b"notify");
}

#[test]
fn out_of_range_write_is_truncated_and_reported() {
    let switch = LoopbackFabric::new();
    let (server, client) = connect_pair(&switch, config(4096), config(4096)).expect("connect");
    let (x, _y) = regions(&server);

    client
        .ep
        .write(&payload(5, 64), 0, 4096 - 16, REGION_X, 9)
        .expect("write");
    let entry = client.next_error().expect("truncated write");
    assert_eq!((entry.context, entry.len, entry.olen), (9, 16, 48));
    assert_eq!(entry.err, FabricError::TooSmall.errno());
    assert_eq!(region_bytes(&x, 4096 - 16, 16), payload(5, 64)[..16]);
}

#[test]
fn unconnected_endpoint_needs_an_address_vector() {
    let switch = LoopbackFabric::new();
    let (_server, client) = connect_pair(&switch, config(4096), config(4096)).expect("connect");
    let loose = client.node.endpoint(&Info::default()).expect("endpoint");
    assert!(matches!(
        loose.write(b"x", 0, 0, REGION_X, 1),
        Err(FabricError::NotConn)
    ));
}

#[test]
fn missing_target_interrupt_still_posts_completion() {
    let switch = LoopbackFabric::new();
    let (server, client) = connect_pair(&switch, config(4096), config(4096)).expect("connect");
    let (x, _y) = regions(&server);

    let triggers = switch.stats().triggers;
    client
        .ep
        .writedata(b"orphan", 0x7777, 0, 0, REGION_X, 42)
        .expect("writedata");
    let entry = client.next_completion().expect("local completion");
    assert_eq!((entry.context, entry.len, entry.data), (42, 6, 0x7777));
    assert_eq!(switch.stats().triggers, triggers);
    assert_eq!(region_bytes(&x, 0, 6), b"orphan");
}

#[test]
fn read_with_remote_data_interrupts_target() {
    const IRQ: u64 = 0x4100;
    let switch = LoopbackFabric::new();
    let (server, client) = connect_pair(&switch, config(4096), config(4096)).expect("connect");
    let (x, _y) = regions(&server);
    x.write(16, b"pulled").expect("seed region");
    server
        .cq()
        .wait_data(IRQ, Flags::REMOTE_CQ_DATA | Flags::RMA)
        .expect("wait data");

    let mut back = vec![0; 6];
    let msg = RmaMsg {
        iov: vec![&mut back[..]],
        addr: 0,
        rma_iov: vec![RmaIov {
            addr: 16,
            len: 6,
            key: REGION_X,
        }],
        context: 11,
        data: IRQ,
    };
    client.ep.readmsg(msg, Flags::REMOTE_CQ_DATA).expect("readmsg");
    assert_eq!(back, b"pulled");

    let local = client.next_completion().expect("local completion");
    assert_eq!(local.context, 11);
    assert!(local.flags.contains(Flags::RMA | Flags::READ));
    let remote = server.next_completion().expect("remote completion");
    assert_eq!(remote.data, IRQ);
}
