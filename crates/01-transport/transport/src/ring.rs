//! Cross-node single-producer/single-consumer frame ring.
//!
//! Every connection owns one ring per direction. The ring's data lives in the
//! *receiver's* buffer; the writer reaches it through a remote mapping, while
//! the reader's progress flows back through a status word in the *writer's*
//! buffer. Each side therefore polls only local memory.
//!
//! ```text
//! buffer:  +----------------+-----------------------------------------+
//!          | status (u64)   | data (capacity bytes, 8B aligned)       |
//!          +----------------+-----------------------------------------+
//! frame:   [u64 READY | len][payload ...][pad → 8 bytes]
//! ```
//!
//! Cursors are logical offsets modulo `2 * capacity`, so `read == write` means
//! empty and `write - read == capacity` means full without a separate lap bit.
//! The writer copies the payload before it release-stores the header. The
//! reader acquire-loads the header, copies, zeroes the whole frame and only
//! then release-stores its cursor into the writer's status word.

use crate::region::{Window, WORD_ALIGN};
use crate::{TransportError, TransportResult};
use std::sync::atomic::Ordering;

/// Size of the per-frame header word.
pub const FRAME_HEADER: usize = 8;
/// Size of the status word that prefixes every ring buffer.
pub const STATUS_BYTES: usize = 8;
/// Smallest usable data area (one header plus one payload word).
pub const MIN_RING_BYTES: usize = 16;

const FRAME_READY: u64 = 1 << 63;
const LEN_MASK: u64 = FRAME_READY - 1;

/// Returned by [`RingWriter::try_write`] when the peer has not released enough space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WouldBlock;

/// Overflow reported by [`RingReader::try_read`]; zero means the frame fit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Truncated {
    /// Bytes of the frame that did not fit into the destination.
    pub overflow: usize,
}

impl Truncated {
    pub fn is_truncated(&self) -> bool {
        self.overflow > 0
    }
}

/// Outcome of [`RingReader::try_read_into`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Received {
    /// Bytes copied into the destination.
    pub copied: usize,
    /// Payload length announced by the frame header.
    pub frame_len: usize,
}

impl Received {
    pub fn overflow(&self) -> usize {
        self.frame_len - self.copied
    }
}

/// Bytes a payload of `len` occupies inside the ring; `None` when that
/// overflows `usize`.
pub fn frame_len(len: usize) -> Option<usize> {
    len.checked_add(FRAME_HEADER + WORD_ALIGN - 1)
        .map(|padded| padded & !(WORD_ALIGN - 1))
}

/// A ring buffer carved into its status word and data area.
#[derive(Clone, Debug)]
pub struct BufferLayout {
    /// Cursor published by the peer that reads what this side writes.
    pub status: Window,
    /// Frames written by the peer.
    pub data: Window,
}

impl BufferLayout {
    /// Bytes a buffer needs to carry `capacity` bytes of frames.
    pub fn buffer_len(capacity: usize) -> usize {
        STATUS_BYTES + capacity
    }

    /// Splits a buffer into status word and data area.
    pub fn split(buffer: &Window) -> TransportResult<Self> {
        let capacity = buffer.len().saturating_sub(STATUS_BYTES);
        validate_capacity(capacity)?;
        let (status, data) = buffer.split_at(STATUS_BYTES)?;
        Ok(Self { status, data })
    }
}

fn validate_capacity(capacity: usize) -> TransportResult<()> {
    if capacity < MIN_RING_BYTES || capacity % WORD_ALIGN != 0 {
        return Err(TransportError::InvalidCapacity {
            requested: capacity,
            minimum: MIN_RING_BYTES,
        });
    }
    Ok(())
}

/// Producer half: writes frames into the peer's data area.
#[derive(Debug)]
pub struct RingWriter {
    data: Window,
    credit: Window,
    write: usize,
    capacity: usize,
}

impl RingWriter {
    /// `data` is the peer's data area, `credit` the local status word the peer
    /// publishes its read cursor into.
    pub fn new(data: Window, credit: Window) -> TransportResult<Self> {
        validate_capacity(data.len())?;
        let credit = credit.sub(0, STATUS_BYTES)?;
        Ok(Self {
            capacity: data.len(),
            data,
            credit,
            write: 0,
        })
    }

    /// Size of the data area in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest payload a single frame can carry.
    pub fn max_payload(&self) -> usize {
        self.capacity - FRAME_HEADER
    }

    /// Bytes the reader has released and that can be written right now.
    pub fn available(&self) -> usize {
        let read = self.credit.word(0).load(Ordering::Acquire) as usize;
        let used = distance(read, self.write, self.capacity);
        self.capacity.saturating_sub(used)
    }

    /// Logical write cursor in `0..2 * capacity`.
    pub fn write_cursor(&self) -> usize {
        self.write
    }

    /// Writes one frame, or reports backpressure without side effects.
    pub fn try_write(&mut self, payload: &[u8]) -> Result<(), WouldBlock> {
        let need = frame_len(payload.len()).ok_or(WouldBlock)?;
        if need > self.capacity || need > self.available() {
            return Err(WouldBlock);
        }

        let at = self.write % self.capacity;
        let body = (at + FRAME_HEADER) % self.capacity;
        self.copy_in(body, payload);
        self.data
            .word(at)
            .store(FRAME_READY | payload.len() as u64, Ordering::Release);
        self.write = (self.write + need) % (2 * self.capacity);
        Ok(())
    }

    fn copy_in(&self, start: usize, bytes: &[u8]) {
        let first = bytes.len().min(self.capacity - start);
        self.data.write(start, &bytes[..first]);
        if first < bytes.len() {
            self.data.write(0, &bytes[first..]);
        }
    }
}

/// Consumer half: reads frames from the local data area.
#[derive(Debug)]
pub struct RingReader {
    data: Window,
    publish: Window,
    read: usize,
    capacity: usize,
}

impl RingReader {
    /// `data` is the local data area, `publish` the peer's status word that
    /// receives the read cursor.
    pub fn new(data: Window, publish: Window) -> TransportResult<Self> {
        validate_capacity(data.len())?;
        let publish = publish.sub(0, STATUS_BYTES)?;
        Ok(Self {
            capacity: data.len(),
            data,
            publish,
            read: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Logical read cursor in `0..2 * capacity`.
    pub fn read_cursor(&self) -> usize {
        self.read
    }

    /// Payload length of the next frame, if one is ready.
    ///
    /// The header comes from the peer; one announcing a frame larger than the
    /// ring is reported as [`TransportError::CorruptFrame`] and leaves the
    /// cursor where it is.
    pub fn peek_len(&self) -> TransportResult<Option<usize>> {
        let header = self.data.word(self.read % self.capacity).load(Ordering::Acquire);
        if header & FRAME_READY == 0 {
            return Ok(None);
        }
        let announced = header & LEN_MASK;
        let len = usize::try_from(announced).ok();
        match len.and_then(frame_len) {
            Some(extent) if extent <= self.capacity => Ok(len),
            _ => Err(TransportError::CorruptFrame {
                len: announced,
                capacity: self.capacity,
            }),
        }
    }

    /// Reads the next frame into `dst`, copying at most `dst.len()` bytes.
    ///
    /// The frame is consumed even when it does not fit; the caller learns the
    /// shortfall through [`Received::overflow`].
    pub fn try_read_into(&mut self, dst: &mut [u8]) -> TransportResult<Option<Received>> {
        let Some(frame_len_bytes) = self.peek_len()? else {
            return Ok(None);
        };
        let at = self.read % self.capacity;
        let body = (at + FRAME_HEADER) % self.capacity;
        let copied = frame_len_bytes.min(dst.len());
        self.copy_out(body, &mut dst[..copied]);

        let extent = FRAME_HEADER + align_up(frame_len_bytes, WORD_ALIGN);
        self.clear(body, extent - FRAME_HEADER);
        self.data.word(at).store(0, Ordering::Relaxed);

        self.read = (self.read + extent) % (2 * self.capacity);
        self.publish
            .word(0)
            .store(self.read as u64, Ordering::Release);

        Ok(Some(Received {
            copied,
            frame_len: frame_len_bytes,
        }))
    }

    /// Reads the next frame into a new vector of at most `max_len` bytes.
    pub fn try_read(&mut self, max_len: usize) -> TransportResult<Option<(Vec<u8>, Truncated)>> {
        let Some(len) = self.peek_len()? else {
            return Ok(None);
        };
        let mut payload = vec![0u8; len.min(max_len)];
        let Some(received) = self.try_read_into(&mut payload)? else {
            return Ok(None);
        };
        Ok(Some((
            payload,
            Truncated {
                overflow: received.overflow(),
            },
        )))
    }

    fn copy_out(&self, start: usize, dst: &mut [u8]) {
        let first = dst.len().min(self.capacity - start);
        let (head, tail) = dst.split_at_mut(first);
        self.data.read(start, head);
        if !tail.is_empty() {
            self.data.read(0, tail);
        }
    }

    fn clear(&self, start: usize, len: usize) {
        let first = len.min(self.capacity - start);
        self.data.fill(start, first, 0);
        if first < len {
            self.data.fill(0, len - first, 0);
        }
    }
}

fn distance(read: usize, write: usize, capacity: usize) -> usize {
    let lap = 2 * capacity;
    (write + lap - read % lap) % lap
}

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

#[cfg(test)]
mod tests {
    //! Unit coverage for the frame ring, driven through a single local buffer.
    use super::*;
    use crate::region::SharedRegion;
    use proptest::prelude::*;
    use rand::prelude::*;
    use rand::{Rng as _, RngCore as _};
    use std::collections::VecDeque;

    fn ring(capacity: usize) -> (RingWriter, RingReader) {
        let buffer = SharedRegion::zeroed(BufferLayout::buffer_len(capacity))
            .expect("allocate buffer")
            .into_window();
        let layout = BufferLayout::split(&buffer).expect("split buffer");
        let writer = RingWriter::new(layout.data.clone(), layout.status.clone()).expect("writer");
        let reader = RingReader::new(layout.data, layout.status).expect("reader");
        (writer, reader)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
    }

    fn next(reader: &mut RingReader, max_len: usize) -> Option<(Vec<u8>, Truncated)> {
        reader.try_read(max_len).expect("intact ring")
    }

    fn extent(len: usize) -> usize {
        frame_len(len).expect("frame length fits usize")
    }

    /// Smoke test: a single frame round-trips and the data area is cleared afterwards.
    #[test]
    fn single_frame_round_trip() {
        let (mut writer, mut reader) = ring(128);
        writer.try_write(b"hello segment").expect("write");
        assert_eq!(reader.peek_len(), Ok(Some(13)));

        let (payload, truncated) = next(&mut reader, 64).expect("frame");
        assert_eq!(payload, b"hello segment");
        assert!(!truncated.is_truncated());
        assert!(next(&mut reader, 64).is_none());
        assert_eq!(writer.available(), 128);
    }

    /// Wrap test: a frame whose payload straddles the end of the data area stays intact.
    #[test]
    fn payload_split_across_wrap() {
        let (mut writer, mut reader) = ring(64);
        let first = pattern(40, 1);
        writer.try_write(&first).expect("first");
        assert_eq!(next(&mut reader, 64).expect("first frame").0, first);

        // The next frame starts at offset 48 and its body wraps to the front.
        let second = pattern(30, 7);
        writer.try_write(&second).expect("second");
        assert_eq!(writer.write_cursor(), 48 + extent(30));
        assert_eq!(next(&mut reader, 64).expect("second frame").0, second);
    }

    /// Zero-length messages are legal frames distinct from "no frame".
    #[test]
    fn zero_length_frames() {
        let (mut writer, mut reader) = ring(32);
        writer.try_write(&[]).expect("empty frame");
        writer.try_write(&[9]).expect("one byte");
        let (empty, _) = next(&mut reader, 8).expect("empty frame ready");
        assert!(empty.is_empty());
        assert_eq!(next(&mut reader, 8).expect("second").0, vec![9]);
    }

    /// Capacity test: the writer refuses frames larger than the released space
    /// and recovers as soon as the reader publishes its cursor.
    #[test]
    fn backpressure_then_recovery() {
        let (mut writer, mut reader) = ring(128);
        let payload = vec![0xAB; 24];
        let mut written = 0;
        while writer.try_write(&payload).is_ok() {
            written += 1;
        }
        assert_eq!(written, 4);
        assert_eq!(writer.try_write(&payload), Err(WouldBlock));
        assert_eq!(writer.available(), 0);

        next(&mut reader, 64).expect("drain one");
        assert_eq!(writer.available(), extent(24));
        writer.try_write(&payload).expect("retry after credit");
        assert_eq!(writer.try_write(&[]), Err(WouldBlock));
    }

    #[test]
    fn oversized_frame_never_fits() {
        let (mut writer, _reader) = ring(64);
        assert_eq!(writer.max_payload(), 56);
        assert_eq!(writer.try_write(&[0; 57]), Err(WouldBlock));
        writer.try_write(&[0; 56]).expect("largest frame");
    }

    /// Truncation: the frame is consumed, the overflow is reported and the
    /// following frame is still readable.
    #[test]
    fn truncated_read_consumes_frame() {
        let (mut writer, mut reader) = ring(256);
        writer.try_write(&pattern(100, 3)).expect("big");
        writer.try_write(b"next").expect("next");

        let mut small = [0u8; 50];
        let received = reader
            .try_read_into(&mut small)
            .expect("intact ring")
            .expect("frame");
        assert_eq!(received.copied, 50);
        assert_eq!(received.overflow(), 50);
        assert_eq!(small.to_vec(), pattern(50, 3));

        assert_eq!(next(&mut reader, 16).expect("next").0, b"next");
    }

    /// A header announcing more than the ring holds is an error, not a
    /// panic, and the cursor stays put.
    #[test]
    fn oversized_header_is_corrupt() {
        let (_writer, mut reader) = ring(256);
        reader
            .data
            .word(0)
            .store(FRAME_READY | 4096, Ordering::Release);
        let expected = TransportError::CorruptFrame {
            len: 4096,
            capacity: 256,
        };
        assert_eq!(reader.peek_len(), Err(expected.clone()));
        let mut dst = [0u8; 16];
        assert_eq!(reader.try_read_into(&mut dst), Err(expected));
        assert_eq!(reader.read_cursor(), 0);

        reader.data.word(0).store(FRAME_READY | LEN_MASK, Ordering::Release);
        assert!(matches!(
            reader.peek_len(),
            Err(TransportError::CorruptFrame { .. })
        ));
    }

    #[test]
    fn frame_len_saturates_to_none() {
        assert_eq!(frame_len(0), Some(8));
        assert_eq!(frame_len(13), Some(24));
        assert_eq!(frame_len(usize::MAX - 3), None);
    }

    #[test]
    fn rejects_unaligned_capacity() {
        let buffer = SharedRegion::zeroed(STATUS_BYTES + 20)
            .expect("allocate")
            .into_window();
        assert!(matches!(
            BufferLayout::split(&buffer),
            Err(TransportError::InvalidCapacity { requested: 20, .. })
        ));
    }

    /// Randomised stress covering wrap-around, FIFO order, and data retention.
    #[test]
    fn var_len_stress() {
        let (mut writer, mut reader) = ring(4096);
        let mut rng = StdRng::seed_from_u64(0x5E6F_AB);
        let mut expected = VecDeque::<Vec<u8>>::new();

        for _ in 0..10_000 {
            let len = rng.gen_range(0..=writer.max_payload());
            let mut payload = vec![0u8; len];
            rng.fill_bytes(&mut payload);

            loop {
                if writer.try_write(&payload).is_ok() {
                    expected.push_back(payload);
                    break;
                }
                let (got, truncated) = next(&mut reader, usize::MAX)
                    .unwrap_or_else(|| panic!("cannot fit {len} bytes into an empty ring"));
                assert!(!truncated.is_truncated());
                assert_eq!(Some(got), expected.pop_front());
            }
        }

        while let Some((got, _)) = next(&mut reader, usize::MAX) {
            assert_eq!(Some(got), expected.pop_front());
        }
        assert!(expected.is_empty());
    }

    /// Two threads hammer the ring; the reader must observe every frame in order.
    #[test]
    fn concurrent_writer_and_reader() {
        const FRAMES: u32 = 20_000;
        let (mut writer, mut reader) = ring(1024);

        let producer = std::thread::spawn(move || {
            for seq in 0..FRAMES {
                let payload = seq.to_le_bytes().repeat((seq % 13) as usize + 1);
                while writer.try_write(&payload).is_err() {
                    std::hint::spin_loop();
                }
            }
        });

        let mut next = 0u32;
        while next < FRAMES {
            match self::next(&mut reader, 256) {
                Some((payload, truncated)) => {
                    assert!(!truncated.is_truncated());
                    assert_eq!(payload, next.to_le_bytes().repeat((next % 13) as usize + 1));
                    next += 1;
                }
                None => std::hint::spin_loop(),
            }
        }
        producer.join().expect("producer thread");
    }

    #[derive(Clone, Debug)]
    enum Op {
        Write(usize),
        Read,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0usize..200).prop_map(Op::Write), Just(Op::Read)]
    }

    proptest! {
        /// The writer succeeds exactly when the frame fits into the space the
        /// reader has released.
        #[test]
        fn writer_respects_released_space(ops in proptest::collection::vec(op(), 1..200)) {
            let capacity = 256;
            let (mut writer, mut reader) = ring(capacity);
            let mut in_flight = VecDeque::new();
            let mut used = 0usize;

            for op in ops {
                match op {
                    Op::Write(len) => {
                        let need = extent(len);
                        let fits = need <= capacity - used;
                        prop_assert_eq!(writer.try_write(&vec![len as u8; len]).is_ok(), fits);
                        if fits {
                            used += need;
                            in_flight.push_back(len);
                        }
                    }
                    Op::Read => match in_flight.pop_front() {
                        Some(len) => {
                            let (payload, _) = next(&mut reader, usize::MAX).expect("frame");
                            prop_assert_eq!(payload, vec![len as u8; len]);
                            used -= extent(len);
                        }
                        None => prop_assert!(next(&mut reader, usize::MAX).is_none()),
                    },
                }
                prop_assert_eq!(writer.available(), capacity - used);
            }
        }
    }
}
