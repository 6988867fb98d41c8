//! In-process interconnect: every simulated node shares one switch.
//!
//! Segments are [`SharedRegion`]s registered under `(node, segment id)`;
//! remote connections clone the region's [`Window`], so "remote" stores land
//! in the owner's memory exactly like a PCIe mapping would. Interrupts are
//! unbounded `crossbeam-channel` queues: triggering only enqueues a wake
//! token and the owner drains it from whichever thread waits. Segment events
//! sit in a bounded queue per segment; once it is full, further events are
//! dropped, so segments nobody listens on stay bounded.

use std::collections::HashMap;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use segfab_transport::{SharedRegion, Timeout, Window};
use tracing::{debug, trace};

use crate::{
    HwError, HwResult, Interconnect, InterruptId, LocalInterrupt, LocalSegment, NodeId,
    RemoteInterrupt, RemoteSegment, SegmentEvent, SegmentId,
};

/// Connect/disconnect events a segment buffers before dropping new ones.
pub const SEGMENT_EVENT_BACKLOG: usize = 1024;

#[derive(Debug)]
struct SegmentEntry {
    window: Window,
    events: Sender<SegmentEvent>,
}

#[derive(Debug, Default)]
struct SwitchState {
    segments: HashMap<(NodeId, SegmentId), SegmentEntry>,
    interrupts: HashMap<(NodeId, InterruptId), Sender<()>>,
    next_interrupt: HashMap<NodeId, InterruptId>,
}

#[derive(Debug, Default)]
struct SwitchStats {
    flushes: AtomicU64,
    triggers: AtomicU64,
    segment_connects: AtomicU64,
}

/// Counters observed on the switch since it was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopbackStatsSnapshot {
    pub flushes: u64,
    pub triggers: u64,
    pub segment_connects: u64,
}

/// Process-local switch connecting simulated nodes.
#[derive(Debug, Default)]
pub struct LoopbackFabric {
    state: Mutex<SwitchState>,
    changed: Condvar,
    stats: SwitchStats,
}

impl LoopbackFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the adapter handle for `node` (adapter 0).
    pub fn node(self: &Arc<Self>, node: NodeId) -> Arc<LoopbackNode> {
        self.node_on_adapter(node, 0)
    }

    pub fn node_on_adapter(self: &Arc<Self>, node: NodeId, adapter: u32) -> Arc<LoopbackNode> {
        Arc::new(LoopbackNode {
            switch: Arc::clone(self),
            node,
            adapter,
        })
    }

    pub fn stats(&self) -> LoopbackStatsSnapshot {
        LoopbackStatsSnapshot {
            flushes: self.stats.flushes.load(Ordering::Relaxed),
            triggers: self.stats.triggers.load(Ordering::Relaxed),
            segment_connects: self.stats.segment_connects.load(Ordering::Relaxed),
        }
    }

    /// Segments currently exported by `node`.
    pub fn segment_count(&self, node: NodeId) -> usize {
        let state = self.state.lock();
        state.segments.keys().filter(|(n, _)| *n == node).count()
    }

    /// Interrupts currently owned by `node`.
    pub fn interrupt_count(&self, node: NodeId) -> usize {
        let state = self.state.lock();
        state.interrupts.keys().filter(|(n, _)| *n == node).count()
    }

    /// Blocks until `lookup` finds something or `timeout` expires.
    fn wait_for<T>(
        &self,
        timeout: Timeout,
        mut lookup: impl FnMut(&mut SwitchState) -> Option<T>,
    ) -> Option<T> {
        let deadline = timeout.start();
        let mut state = self.state.lock();
        loop {
            if let Some(found) = lookup(&mut state) {
                return Some(found);
            }
            match deadline.remaining() {
                Timeout::Infinite => self.changed.wait(&mut state),
                Timeout::After(left) if left.is_zero() => return None,
                Timeout::After(left) => {
                    let _ = self.changed.wait_for(&mut state, left);
                }
            }
        }
    }

    fn unregister_segment(&self, node: NodeId, id: SegmentId, window: &Window) {
        let mut state = self.state.lock();
        let owned = state
            .segments
            .get(&(node, id))
            .is_some_and(|entry| entry.window.same_region(window));
        if owned {
            state.segments.remove(&(node, id));
        }
    }

    fn unregister_interrupt(&self, node: NodeId, id: InterruptId) {
        self.state.lock().interrupts.remove(&(node, id));
    }

    fn notify(&self, state: MutexGuard<'_, SwitchState>) {
        drop(state);
        self.changed.notify_all();
    }
}

/// One node's adapter on a [`LoopbackFabric`].
#[derive(Debug)]
pub struct LoopbackNode {
    switch: Arc<LoopbackFabric>,
    node: NodeId,
    adapter: u32,
}

impl LoopbackNode {
    pub fn switch(&self) -> &Arc<LoopbackFabric> {
        &self.switch
    }
}

impl Interconnect for LoopbackNode {
    fn local_node_id(&self) -> NodeId {
        self.node
    }

    fn adapter(&self) -> u32 {
        self.adapter
    }

    fn create_segment(&self, id: SegmentId, size: usize) -> HwResult<Box<dyn LocalSegment>> {
        let mut state = self.switch.state.lock();
        if state.segments.contains_key(&(self.node, id)) {
            return Err(HwError::SegmentIdUsed(id));
        }
        let window = SharedRegion::zeroed(size)?.into_window();
        let (events, receiver) = crossbeam_channel::bounded(SEGMENT_EVENT_BACKLOG);
        state.segments.insert(
            (self.node, id),
            SegmentEntry {
                window: window.clone(),
                events,
            },
        );
        self.switch.notify(state);
        debug!(node = self.node, segment = id, size, "created segment");

        Ok(Box::new(LoopbackLocalSegment {
            switch: Arc::clone(&self.switch),
            node: self.node,
            id,
            window,
            events: receiver,
        }))
    }

    fn connect_segment(
        &self,
        node: NodeId,
        id: SegmentId,
        timeout: Timeout,
    ) -> HwResult<Box<dyn RemoteSegment>> {
        let local = self.node;
        let found = self.switch.wait_for(timeout, |state| {
            state
                .segments
                .get(&(node, id))
                .map(|entry| (entry.window.clone(), entry.events.clone()))
        });
        let (window, events) = found.ok_or(HwError::NoSuchSegment { node, segment: id })?;

        post_event(&events, SegmentEvent::Connect { node: local });
        self.switch
            .stats
            .segment_connects
            .fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(LoopbackRemoteSegment {
            switch: Arc::clone(&self.switch),
            local,
            node,
            id,
            window,
            events,
        }))
    }

    fn create_interrupt(&self, id: Option<InterruptId>) -> HwResult<Box<dyn LocalInterrupt>> {
        let mut state = self.switch.state.lock();
        let id = match id {
            Some(id) if state.interrupts.contains_key(&(self.node, id)) => {
                return Err(HwError::InterruptIdUsed(id));
            }
            Some(id) => id,
            None => next_free_interrupt(&mut state, self.node)?,
        };

        let (sender, receiver) = crossbeam_channel::unbounded();
        state.interrupts.insert((self.node, id), sender);
        self.switch.notify(state);

        Ok(Box::new(LoopbackLocalInterrupt {
            switch: Arc::clone(&self.switch),
            node: self.node,
            id,
            wakeups: receiver,
        }))
    }

    fn connect_interrupt(
        &self,
        node: NodeId,
        id: InterruptId,
        timeout: Timeout,
    ) -> HwResult<Box<dyn RemoteInterrupt>> {
        let sender = self
            .switch
            .wait_for(timeout, |state| state.interrupts.get(&(node, id)).cloned())
            .ok_or(HwError::NoSuchInterrupt { node, interrupt: id })?;

        Ok(Box::new(LoopbackRemoteInterrupt {
            switch: Arc::clone(&self.switch),
            node,
            id,
            sender,
        }))
    }
}

fn next_free_interrupt(state: &mut SwitchState, node: NodeId) -> HwResult<InterruptId> {
    let start = state.next_interrupt.get(&node).copied().unwrap_or(1);
    let mut candidate = start;
    loop {
        if candidate != 0 && !state.interrupts.contains_key(&(node, candidate)) {
            state.next_interrupt.insert(node, candidate.wrapping_add(1));
            return Ok(candidate);
        }
        candidate = candidate.wrapping_add(1);
        if candidate == start {
            return Err(HwError::Exhausted);
        }
    }
}

#[derive(Debug)]
struct LoopbackLocalSegment {
    switch: Arc<LoopbackFabric>,
    node: NodeId,
    id: SegmentId,
    window: Window,
    events: Receiver<SegmentEvent>,
}

impl LocalSegment for LoopbackLocalSegment {
    fn id(&self) -> SegmentId {
        self.id
    }

    fn window(&self) -> Window {
        self.window.clone()
    }

    fn wait_event(&self, timeout: Timeout) -> HwResult<SegmentEvent> {
        recv(&self.events, timeout)
    }
}

impl Drop for LoopbackLocalSegment {
    fn drop(&mut self) {
        self.switch
            .unregister_segment(self.node, self.id, &self.window);
        debug!(node = self.node, segment = self.id, "removed segment");
    }
}

#[derive(Debug)]
struct LoopbackRemoteSegment {
    switch: Arc<LoopbackFabric>,
    local: NodeId,
    node: NodeId,
    id: SegmentId,
    window: Window,
    events: Sender<SegmentEvent>,
}

impl RemoteSegment for LoopbackRemoteSegment {
    fn node(&self) -> NodeId {
        self.node
    }

    fn id(&self) -> SegmentId {
        self.id
    }

    fn len(&self) -> usize {
        self.window.len()
    }

    fn map(&self, offset: usize, len: usize) -> HwResult<Window> {
        self.window.sub(offset, len).map_err(|_| HwError::OutOfRange {
            offset,
            len,
            size: self.window.len(),
        })
    }

    fn flush(&self) -> HwResult<()> {
        fence(Ordering::SeqCst);
        self.switch.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for LoopbackRemoteSegment {
    fn drop(&mut self) {
        post_event(&self.events, SegmentEvent::Disconnect { node: self.local });
    }
}

#[derive(Debug)]
struct LoopbackLocalInterrupt {
    switch: Arc<LoopbackFabric>,
    node: NodeId,
    id: InterruptId,
    wakeups: Receiver<()>,
}

impl LocalInterrupt for LoopbackLocalInterrupt {
    fn id(&self) -> InterruptId {
        self.id
    }

    fn wait(&self, timeout: Timeout) -> HwResult<()> {
        recv(&self.wakeups, timeout)
    }
}

impl Drop for LoopbackLocalInterrupt {
    fn drop(&mut self) {
        self.switch.unregister_interrupt(self.node, self.id);
    }
}

#[derive(Debug)]
struct LoopbackRemoteInterrupt {
    switch: Arc<LoopbackFabric>,
    node: NodeId,
    id: InterruptId,
    sender: Sender<()>,
}

impl RemoteInterrupt for LoopbackRemoteInterrupt {
    fn node(&self) -> NodeId {
        self.node
    }

    fn id(&self) -> InterruptId {
        self.id
    }

    fn trigger(&self) -> HwResult<()> {
        self.sender.send(()).map_err(|_| HwError::Disconnected)?;
        self.switch.stats.triggers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn post_event(events: &Sender<SegmentEvent>, event: SegmentEvent) {
    if let Err(TrySendError::Full(event)) = events.try_send(event) {
        trace!(?event, "segment event backlog full, dropping");
    }
}

fn recv<T>(receiver: &Receiver<T>, timeout: Timeout) -> HwResult<T> {
    match timeout {
        Timeout::Infinite => receiver.recv().map_err(|_| HwError::Disconnected),
        Timeout::After(d) if d.is_zero() => receiver.try_recv().map_err(|err| match err {
            TryRecvError::Empty => HwError::Timeout,
            TryRecvError::Disconnected => HwError::Disconnected,
        }),
        Timeout::After(d) => receiver.recv_timeout(d).map_err(|err| match err {
            RecvTimeoutError::Timeout => HwError::Timeout,
            RecvTimeoutError::Disconnected => HwError::Disconnected,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    const SHORT: Timeout = Timeout::After(Duration::from_millis(20));
    const LONG: Timeout = Timeout::After(Duration::from_secs(5));

    #[test]
    fn remote_stores_land_in_owner_memory() {
        let switch = LoopbackFabric::new();
        let owner = switch.node(1);
        let peer = switch.node(2);

        let segment = owner.create_segment(9, 128).expect("create");
        let remote = peer.connect_segment(1, 9, SHORT).expect("connect");
        assert_eq!(remote.len(), 128);

        let mapping = remote.map(64, 64).expect("map");
        mapping.write(0, b"over the wire");
        mapping.word(16).store(42, Ordering::Release);

        let mut buf = [0u8; 13];
        segment.window().read(64, &mut buf);
        assert_eq!(&buf, b"over the wire");
        assert_eq!(segment.window().word(80).load(Ordering::Acquire), 42);
        assert_eq!(
            segment.wait_event(SHORT).expect("event"),
            SegmentEvent::Connect { node: 2 }
        );
    }

    #[test]
    fn undrained_segment_events_stay_bounded() {
        let switch = LoopbackFabric::new();
        let owner = switch.node(1);
        let peer = switch.node(2);
        let segment = owner.create_segment(4, 64).expect("create");

        for _ in 0..SEGMENT_EVENT_BACKLOG + 100 {
            drop(peer.connect_segment(1, 4, Timeout::ZERO).expect("connect"));
        }
        let mut drained = 0;
        while segment.wait_event(Timeout::ZERO).is_ok() {
            drained += 1;
        }
        assert_eq!(drained, SEGMENT_EVENT_BACKLOG);
        assert_eq!(
            switch.stats().segment_connects,
            SEGMENT_EVENT_BACKLOG as u64 + 100
        );

        let _remote = peer.connect_segment(1, 4, Timeout::ZERO).expect("connect");
        assert_eq!(
            segment.wait_event(SHORT).expect("room again"),
            SegmentEvent::Connect { node: 2 }
        );
    }

    #[test]
    fn duplicate_segment_ids_are_rejected_per_node() {
        let switch = LoopbackFabric::new();
        let a = switch.node(1);
        let b = switch.node(2);
        let _first = a.create_segment(5, 64).expect("first");
        assert_eq!(
            a.create_segment(5, 64).unwrap_err(),
            HwError::SegmentIdUsed(5)
        );
        b.create_segment(5, 64).expect("same id on another node");
    }

    #[test]
    fn connect_waits_for_late_segment() {
        let switch = LoopbackFabric::new();
        let owner = switch.node(1);
        let peer = switch.node(2);

        let creator = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            owner.create_segment(3, 64).expect("create late")
        });
        let remote = peer.connect_segment(1, 3, LONG).expect("connect after wait");
        assert_eq!(remote.id(), 3);
        drop(creator.join().expect("creator"));
    }

    #[test]
    fn connect_times_out_without_segment() {
        let switch = LoopbackFabric::new();
        let peer = switch.node(2);
        assert_eq!(
            peer.connect_segment(1, 3, SHORT).unwrap_err(),
            HwError::NoSuchSegment {
                node: 1,
                segment: 3
            }
        );
        assert_eq!(
            peer.connect_segment(1, 3, Timeout::ZERO).unwrap_err(),
            HwError::NoSuchSegment {
                node: 1,
                segment: 3
            }
        );
    }

    #[test]
    fn dropping_segment_unregisters_but_keeps_mappings_alive() {
        let switch = LoopbackFabric::new();
        let owner = switch.node(1);
        let peer = switch.node(2);
        let segment = owner.create_segment(1, 64).expect("create");
        let remote = peer.connect_segment(1, 1, SHORT).expect("connect");
        let mapping = remote.map(0, 64).expect("map");

        drop(segment);
        assert_eq!(switch.segment_count(1), 0);
        mapping.write(0, &[1, 2, 3]);
        assert!(peer.connect_segment(1, 1, Timeout::ZERO).is_err());
    }

    #[test]
    fn interrupts_deliver_one_wakeup_per_trigger() {
        let switch = LoopbackFabric::new();
        let owner = switch.node(1);
        let peer = switch.node(2);

        let local = owner.create_interrupt(None).expect("create");
        let remote = peer
            .connect_interrupt(1, local.id(), SHORT)
            .expect("connect");
        remote.trigger().expect("trigger");
        remote.trigger().expect("trigger");

        local.wait(Timeout::ZERO).expect("first wakeup");
        local.wait(SHORT).expect("second wakeup");
        assert_eq!(local.wait(Timeout::ZERO).unwrap_err(), HwError::Timeout);
        assert_eq!(switch.stats().triggers, 2);
    }

    #[test]
    fn interrupt_ids_are_allocated_and_released() {
        let switch = LoopbackFabric::new();
        let node = switch.node(4);
        let fixed = node.create_interrupt(Some(77)).expect("fixed id");
        assert_eq!(fixed.id(), 77);
        assert_eq!(
            node.create_interrupt(Some(77)).unwrap_err(),
            HwError::InterruptIdUsed(77)
        );

        let a = node.create_interrupt(None).expect("auto");
        let b = node.create_interrupt(None).expect("auto");
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), 0);
        assert_eq!(switch.interrupt_count(4), 3);

        drop(fixed);
        assert_eq!(switch.interrupt_count(4), 2);
        node.create_interrupt(Some(77)).expect("id reusable after drop");
    }

    #[test]
    fn trigger_after_owner_drop_reports_disconnect() {
        let switch = LoopbackFabric::new();
        let owner = switch.node(1);
        let peer = switch.node(2);
        let local = owner.create_interrupt(None).expect("create");
        let remote = peer.connect_interrupt(1, local.id(), SHORT).expect("connect");
        drop(local);
        assert_eq!(remote.trigger().unwrap_err(), HwError::Disconnected);
    }

    #[test]
    fn out_of_range_mapping() {
        let switch = LoopbackFabric::new();
        let owner = switch.node(1);
        let _segment = owner.create_segment(2, 64).expect("create");
        let remote = switch
            .node(2)
            .connect_segment(1, 2, SHORT)
            .expect("connect");
        assert_eq!(
            remote.map(32, 64).unwrap_err(),
            HwError::OutOfRange {
                offset: 32,
                len: 64,
                size: 64
            }
        );
        remote.flush().expect("flush");
        assert_eq!(switch.stats().flushes, 1);
    }
}
