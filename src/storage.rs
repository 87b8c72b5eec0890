//! Double-buffered packet storage.
//!
//! [`PacketStore`] absorbs one high-rate stream (one writer, the reactor
//! delivery path) while arbitrary reader threads pull bounded windows. Two
//! equal arrays back the store: the writer fills the *write* array slot by
//! slot; when it fills, the arrays swap roles under a short exclusive lock
//! and the stale contents of the new write array are discarded. Readers
//! therefore always see two contiguous runs of packets (the tail of the
//! stream split across the read and write arrays), which makes "newest N"
//! windows plain slice copies.
//!
//! Retention: at most `2 * capacity` packets, evicted a whole buffer at a
//! time on swap. Packet indices are dense and monotonic across both arrays;
//! every index in the read array is strictly below every index in the write
//! array.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use crate::types::{BaseStationData, DataResponse, ResponseState, StoredPacket, TrackingDeviceData};

/// Milliseconds since the Unix epoch on the system clock.
pub(crate) fn system_now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Payloads that carry the receive-time stamp this SDK applies on delivery.
///
/// Age-based reads are only available for payloads implementing this.
pub trait ReceiveStamped {
    /// System-clock milliseconds at which the SDK received the packet, if
    /// stamped.
    fn received_at_ms(&self) -> Option<u64>;
}

impl ReceiveStamped for TrackingDeviceData {
    fn received_at_ms(&self) -> Option<u64> {
        self.sdk_received_ms()
    }
}

struct Slot<T>(UnsafeCell<Option<StoredPacket<T>>>);

struct Buffer<T> {
    slots: Box<[Slot<T>]>,
    /// Published packet count. Stored with release after the slot write so a
    /// reader that observes `len == k` sees initialized data in `0..k`.
    len: AtomicU32,
}

// The slot protocol makes concurrent access sound: the single writer only
// touches the slot at the published length (or slot 0 of a buffer whose
// length it has reset), and readers only touch slots below a length they
// loaded with acquire. Role changes happen under the exclusive lock.
unsafe impl<T: Send + Sync> Sync for Buffer<T> {}
unsafe impl<T: Send> Send for Buffer<T> {}

impl<T: Clone> Buffer<T> {
    fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| Slot(UnsafeCell::new(None))).collect();
        Self { slots, len: AtomicU32::new(0) }
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire) as usize
    }

    /// Clone out the packet at `i`. Callers pass `i` below a length they
    /// observed; the slot is then guaranteed initialized.
    fn get(&self, i: usize) -> Option<StoredPacket<T>> {
        unsafe { (*self.slots[i].0.get()).clone() }
    }

    /// Clone out the contiguous range `start..end` (bounded by an observed
    /// length) into `out`.
    fn copy_range(&self, start: usize, end: usize, out: &mut Vec<StoredPacket<T>>) {
        for i in start..end {
            if let Some(packet) = self.get(i) {
                out.push(packet);
            }
        }
    }

    /// Read just the index at `i` without cloning the payload.
    fn index_at(&self, i: usize) -> Option<u64> {
        unsafe { (*self.slots[i].0.get()).as_ref().map(|p| p.index) }
    }

    fn first_index(&self, len: usize) -> Option<u64> {
        if len == 0 {
            return None;
        }
        self.index_at(0)
    }

    fn last_index(&self, len: usize) -> Option<u64> {
        if len == 0 {
            return None;
        }
        self.index_at(len - 1)
    }
}

/// Lock-lean double-buffered ring for one stream.
///
/// Contract: a single concurrent writer (the thread driving the owning
/// reactor) and any number of concurrent readers. `push` never fails; the
/// oldest buffer of packets is discarded on swap. Reads never fail; an
/// empty result is [`ResponseState::NoData`] plus an empty sequence.
pub struct PacketStore<T> {
    buffers: [Buffer<T>; 2],
    /// Index of the current write buffer; the other is the read buffer.
    /// `push` holds this shared, readers hold it shared, the swap holds it
    /// exclusive.
    write_role: RwLock<usize>,
    /// Next packet index, assigned at insert time.
    next_index: AtomicU64,
    capacity: usize,
}

impl<T: Clone> PacketStore<T> {
    /// Create a store whose buffer halves hold `capacity` packets each.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffers: [Buffer::with_capacity(capacity), Buffer::with_capacity(capacity)],
            write_role: RwLock::new(0),
            next_index: AtomicU64::new(0),
            capacity,
        }
    }

    /// Capacity of one buffer half.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total packets currently retained across both buffers.
    pub fn stored(&self) -> usize {
        let role = self.write_role.read();
        self.buffers[*role].len() + self.buffers[1 - *role].len()
    }

    /// Store a packet, assigning the next dense index. Swaps buffers when
    /// the write array fills, discarding the previous read array.
    pub fn push(&self, data: T) -> u64 {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);

        let role = self.write_role.read();
        let write = &self.buffers[*role];
        let len = write.len();

        if len < self.capacity {
            // Sole writer; this slot is above the published length until
            // the release store below.
            unsafe {
                *write.slots[len].0.get() = Some(StoredPacket { index, data });
            }
            write.len.store((len + 1) as u32, Ordering::Release);
            let filled = len + 1 == self.capacity;
            drop(role);
            if filled {
                self.swap_buffers();
            }
        } else {
            // The write buffer was left full without a swap; recover by
            // swapping now and restarting at slot 0.
            drop(role);
            self.swap_buffers();
            let role = self.write_role.read();
            let write = &self.buffers[*role];
            unsafe {
                *write.slots[0].0.get() = Some(StoredPacket { index, data });
            }
            write.len.store(1, Ordering::Release);
        }
        index
    }

    /// Swap the read/write roles. The previous read buffer becomes the
    /// write buffer and restarts empty; its packets are gone.
    fn swap_buffers(&self) {
        let mut role = self.write_role.write();
        *role = 1 - *role;
        self.buffers[*role].len.store(0, Ordering::Release);
    }

    /// The single most recent packet.
    pub fn latest(&self) -> DataResponse<T> {
        let role = self.write_role.read();
        let write = &self.buffers[*role];
        let read = &self.buffers[1 - *role];

        let wlen = write.len();
        if wlen > 0 {
            if let Some(packet) = write.get(wlen - 1) {
                return DataResponse { state: ResponseState::Success, packets: vec![packet] };
            }
        }
        let rlen = read.len();
        if rlen > 0 {
            if let Some(packet) = read.get(rlen - 1) {
                return DataResponse { state: ResponseState::Success, packets: vec![packet] };
            }
        }
        DataResponse::no_data()
    }

    /// The last `count` packets in chronological order. Returns everything
    /// retained, marked [`ResponseState::PartialData`], when fewer than
    /// `count` remain.
    pub fn latest_n(&self, count: usize) -> DataResponse<T> {
        if count == 0 {
            return DataResponse::no_data();
        }

        let role = self.write_role.read();
        let write = &self.buffers[*role];
        let read = &self.buffers[1 - *role];
        let wlen = write.len();
        let rlen = read.len();

        let mut packets = Vec::new();
        if count <= wlen {
            write.copy_range(wlen - count, wlen, &mut packets);
            DataResponse { state: ResponseState::Success, packets }
        } else if count <= rlen + wlen {
            read.copy_range(rlen + wlen - count, rlen, &mut packets);
            write.copy_range(0, wlen, &mut packets);
            DataResponse { state: ResponseState::Success, packets }
        } else if rlen + wlen > 0 {
            read.copy_range(0, rlen, &mut packets);
            write.copy_range(0, wlen, &mut packets);
            DataResponse { state: ResponseState::PartialData, packets }
        } else {
            DataResponse::no_data()
        }
    }

    /// Every stored packet with index `>= start`. `NoData` when `start` is
    /// past the newest stored index; everything retained plus
    /// [`ResponseState::PartialData`] when `start` predates the oldest.
    pub fn since_index(&self, start: u64) -> DataResponse<T> {
        let role = self.write_role.read();
        let write = &self.buffers[*role];
        let read = &self.buffers[1 - *role];
        let wlen = write.len();
        let rlen = read.len();

        let write_first = write.first_index(wlen);
        let write_last = write.last_index(wlen);
        let read_first = read.first_index(rlen);
        let read_last = read.last_index(rlen);

        let mut packets = Vec::new();
        if wlen > 0 && write_last.is_some_and(|last| last < start) {
            DataResponse::no_data()
        } else if wlen > 0 && write_first.is_some_and(|first| first <= start) {
            // The write buffer alone covers the request.
            let offset = write_first.map(|first| (start - first) as usize).unwrap_or(0);
            write.copy_range(offset, wlen, &mut packets);
            DataResponse { state: ResponseState::Success, packets }
        } else if wlen == 0 && rlen > 0 && read_last.is_some_and(|last| last < start) {
            DataResponse::no_data()
        } else if rlen > 0 && read_first.is_some_and(|first| first <= start) {
            // The suffix spans both buffers.
            let offset = read_first.map(|first| (start - first) as usize).unwrap_or(0);
            read.copy_range(offset, rlen, &mut packets);
            write.copy_range(0, wlen, &mut packets);
            DataResponse { state: ResponseState::Success, packets }
        } else if rlen > 0 {
            // `start` predates everything retained.
            read.copy_range(0, rlen, &mut packets);
            write.copy_range(0, wlen, &mut packets);
            DataResponse { state: ResponseState::PartialData, packets }
        } else if wlen > 0 {
            // Read buffer empty, write buffer starts past `start`.
            write.copy_range(0, wlen, &mut packets);
            DataResponse { state: ResponseState::PartialData, packets }
        } else {
            DataResponse::no_data()
        }
    }
}

impl<T: Clone + ReceiveStamped> PacketStore<T> {
    /// The contiguous newest run of packets whose receive stamp is at most
    /// `max_age` old, oldest first. Packets without a stamp are out of age.
    pub fn with_max_age(&self, max_age: Duration) -> DataResponse<T> {
        self.with_max_age_at(max_age, system_now_ms())
    }

    pub(crate) fn with_max_age_at(&self, max_age: Duration, now_ms: u64) -> DataResponse<T> {
        let max_age_ms = max_age.as_millis() as u64;
        let cutoff = now_ms.saturating_sub(max_age_ms);

        let all = self.latest_n(2 * self.capacity);
        let run_start = all
            .packets
            .iter()
            .rposition(|p| !Self::within(p, cutoff))
            .map(|i| i + 1)
            .unwrap_or(0);

        let packets: Vec<_> = all.packets[run_start..].to_vec();
        if packets.is_empty() {
            DataResponse::no_data()
        } else {
            DataResponse { state: ResponseState::Success, packets }
        }
    }

    /// As [`latest`](Self::latest), but `NoData` when the newest packet was
    /// received more than `timeout` ago (or carries no receive stamp). A
    /// zero timeout disables the age check.
    pub fn latest_within(&self, timeout: Duration) -> DataResponse<T> {
        self.latest_within_at(timeout, system_now_ms())
    }

    pub(crate) fn latest_within_at(&self, timeout: Duration, now_ms: u64) -> DataResponse<T> {
        let response = self.latest();
        if timeout.is_zero() {
            return response;
        }
        let cutoff = now_ms.saturating_sub(timeout.as_millis() as u64);
        match response.packets.first() {
            Some(packet) if Self::within(packet, cutoff) => response,
            _ => DataResponse::no_data(),
        }
    }

    fn within(packet: &StoredPacket<T>, cutoff_ms: u64) -> bool {
        packet.data.received_at_ms().is_some_and(|at| at >= cutoff_ms)
    }
}

/// Base-station packets share the ring; they carry no receive stamp, so the
/// age-based reads are simply not available for them.
pub type BaseStationStore = PacketStore<BaseStationData>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TimestampData, TimestampType};

    fn packet(seq: u32) -> TrackingDeviceData {
        TrackingDeviceData { siu_uuid: 7, port_id: 1, timestamp: seq, ..Default::default() }
    }

    fn stamped_packet(seq: u32, received_ms: u64) -> TrackingDeviceData {
        let mut data = packet(seq);
        data.latency_timestamps.push(TimestampData {
            timestamp_type: TimestampType::SdkReceived,
            steady_timestamp_ms: received_ms,
            system_timestamp_ms: received_ms,
        });
        data
    }

    fn indices(response: &DataResponse<TrackingDeviceData>) -> Vec<u64> {
        response.packets.iter().map(|p| p.index).collect()
    }

    #[test]
    fn empty_store_reads_no_data() {
        let store: PacketStore<TrackingDeviceData> = PacketStore::new(4);
        assert_eq!(store.latest().state, ResponseState::NoData);
        assert_eq!(store.latest_n(3).state, ResponseState::NoData);
        assert_eq!(store.since_index(0).state, ResponseState::NoData);
    }

    #[test]
    fn push_assigns_dense_indices_from_zero() {
        let store = PacketStore::new(4);
        for expected in 0..10u64 {
            assert_eq!(store.push(packet(expected as u32)), expected);
        }
    }

    #[test]
    fn basic_latest() {
        // Ring capacity 4; push p0..p2.
        let store = PacketStore::new(4);
        for i in 0..3 {
            store.push(packet(i));
        }

        let latest = store.latest();
        assert_eq!(latest.state, ResponseState::Success);
        assert_eq!(indices(&latest), vec![2]);

        let five = store.latest_n(5);
        assert_eq!(five.state, ResponseState::PartialData);
        assert_eq!(indices(&five), vec![0, 1, 2]);
    }

    #[test]
    fn swap_boundary() {
        let store = PacketStore::new(4);
        for i in 0..4 {
            store.push(packet(i));
        }

        let four = store.latest_n(4);
        assert_eq!(four.state, ResponseState::Success);
        assert_eq!(indices(&four), vec![0, 1, 2, 3]);

        store.push(packet(4));
        let four = store.latest_n(4);
        assert_eq!(four.state, ResponseState::Success);
        assert_eq!(indices(&four), vec![1, 2, 3, 4]);

        let all = store.since_index(0);
        assert_eq!(all.state, ResponseState::Success);
        assert_eq!(indices(&all), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn eviction_after_two_swaps() {
        // Capacity 4, 9 pushes: the first buffer of four is discarded on
        // the second swap, leaving p4..p8.
        let store = PacketStore::new(4);
        for i in 0..9 {
            store.push(packet(i));
        }
        assert_eq!(store.stored(), 5);

        let all = store.since_index(0);
        assert_eq!(all.state, ResponseState::PartialData);
        assert_eq!(indices(&all), vec![4, 5, 6, 7, 8]);

        let tail = store.since_index(5);
        assert_eq!(tail.state, ResponseState::Success);
        assert_eq!(indices(&tail), vec![5, 6, 7, 8]);
    }

    #[test]
    fn since_index_past_newest_is_no_data() {
        let store = PacketStore::new(4);
        for i in 0..3 {
            store.push(packet(i));
        }
        assert_eq!(store.since_index(3).state, ResponseState::NoData);
        assert_eq!(store.since_index(100).state, ResponseState::NoData);
    }

    #[test]
    fn since_index_spans_read_and_write_buffers() {
        let store = PacketStore::new(4);
        for i in 0..6 {
            store.push(packet(i));
        }
        // read = [0..3], write = [4, 5]
        let suffix = store.since_index(2);
        assert_eq!(suffix.state, ResponseState::Success);
        assert_eq!(indices(&suffix), vec![2, 3, 4, 5]);
    }

    #[test]
    fn latest_one_equals_latest() {
        let store = PacketStore::new(4);
        for i in 0..7 {
            store.push(packet(i));
        }
        assert_eq!(indices(&store.latest_n(1)), indices(&store.latest()));
        assert_eq!(store.latest_n(1).state, ResponseState::Success);
    }

    #[test]
    fn latest_n_zero_is_no_data() {
        let store = PacketStore::new(4);
        store.push(packet(0));
        assert_eq!(store.latest_n(0).state, ResponseState::NoData);
    }

    #[test]
    fn max_age_returns_newest_contiguous_run() {
        let store = PacketStore::new(8);
        let now = 100_000;
        store.push(stamped_packet(0, now - 5_000));
        store.push(stamped_packet(1, now - 400));
        store.push(stamped_packet(2, now - 100));

        let fresh = store.with_max_age_at(Duration::from_millis(500), now);
        assert_eq!(fresh.state, ResponseState::Success);
        assert_eq!(indices(&fresh), vec![1, 2]);
    }

    #[test]
    fn max_age_skips_runs_broken_by_stale_packet() {
        // An unstamped packet between two fresh ones breaks the run; only
        // the packets newer than the break qualify.
        let store = PacketStore::new(8);
        let now = 100_000;
        store.push(stamped_packet(0, now - 100));
        store.push(packet(1));
        store.push(stamped_packet(2, now - 50));

        let fresh = store.with_max_age_at(Duration::from_millis(500), now);
        assert_eq!(indices(&fresh), vec![2]);
    }

    #[test]
    fn max_age_of_everything_matches_full_window() {
        let store = PacketStore::new(4);
        let now = 100_000;
        for i in 0..6 {
            store.push(stamped_packet(i, now - 10));
        }
        let aged = store.with_max_age_at(Duration::from_millis(u32::MAX as u64), now);
        let full = store.latest_n(store.stored());
        assert_eq!(aged.packets, full.packets);
    }

    #[test]
    fn max_age_with_nothing_fresh_is_no_data() {
        let store = PacketStore::new(4);
        let now = 100_000;
        store.push(stamped_packet(0, now - 10_000));
        assert_eq!(store.with_max_age_at(Duration::from_millis(500), now).state, ResponseState::NoData);
    }

    #[test]
    fn latest_within_honors_timeout() {
        let store = PacketStore::new(4);
        let now = 100_000;
        store.push(stamped_packet(0, now - 2_000));

        assert_eq!(store.latest_within_at(Duration::ZERO, now).state, ResponseState::Success);
        assert_eq!(
            store.latest_within_at(Duration::from_millis(5_000), now).state,
            ResponseState::Success
        );
        assert_eq!(
            store.latest_within_at(Duration::from_millis(1_000), now).state,
            ResponseState::NoData
        );
    }

    #[test]
    fn latest_within_rejects_unstamped_packets() {
        let store = PacketStore::new(4);
        store.push(packet(0));
        assert_eq!(
            store.latest_within_at(Duration::from_millis(1_000), 100_000).state,
            ResponseState::NoData
        );
    }

    #[test]
    fn concurrent_readers_see_monotonic_indices() {
        use std::sync::Arc;

        let store = Arc::new(PacketStore::new(64));
        let writer_store = Arc::clone(&store);
        let writer = std::thread::spawn(move || {
            for i in 0..20_000u32 {
                writer_store.push(packet(i));
            }
        });

        let mut readers = Vec::new();
        for _ in 0..4 {
            let reader_store = Arc::clone(&store);
            readers.push(std::thread::spawn(move || {
                for _ in 0..2_000 {
                    let window = reader_store.latest_n(32);
                    let idx: Vec<u64> = window.packets.iter().map(|p| p.index).collect();
                    assert!(idx.windows(2).all(|w| w[1] == w[0] + 1), "indices not dense: {idx:?}");
                }
            }));
        }

        writer.join().expect("writer thread panicked");
        for reader in readers {
            reader.join().expect("reader thread panicked");
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn counts_and_retention_bounds(
                capacity in 1usize..32,
                pushes in 0usize..200,
            ) {
                let store = PacketStore::new(capacity);
                for i in 0..pushes {
                    store.push(packet(i as u32));
                }

                // P1: both halves within [0, N]; total within 2N.
                prop_assert!(store.stored() <= 2 * capacity);

                let window = store.latest_n(2 * capacity);
                let idx: Vec<u64> = window.packets.iter().map(|p| p.index).collect();

                // P2: strictly monotonic indices.
                prop_assert!(idx.windows(2).all(|w| w[1] > w[0]));

                // P4: nothing newer than the push counter.
                if let Some(last) = idx.last() {
                    prop_assert_eq!(*last, pushes as u64 - 1);
                }

                // P5: after >= 2N pushes the oldest retained index is within
                // a swap phase of `pushes - 2N`.
                if pushes >= 2 * capacity {
                    let smallest = idx[0];
                    let ideal = (pushes - 2 * capacity) as u64;
                    prop_assert!(smallest >= ideal);
                    prop_assert!(smallest <= ideal + capacity as u64);
                }
            }

            #[test]
            fn since_index_agrees_with_latest_n(
                capacity in 1usize..16,
                pushes in 1usize..100,
            ) {
                let store = PacketStore::new(capacity);
                for i in 0..pushes {
                    store.push(packet(i as u32));
                }

                let window = store.latest_n(2 * capacity);
                let oldest = window.packets[0].index;
                let suffix = store.since_index(oldest);
                prop_assert_eq!(suffix.state, ResponseState::Success);
                prop_assert_eq!(suffix.packets.len(), window.packets.len());

                // L2: from zero, either everything (success) or the newest
                // window marked partial.
                let from_zero = store.since_index(0);
                if oldest == 0 {
                    prop_assert_eq!(from_zero.state, ResponseState::Success);
                    prop_assert_eq!(from_zero.packets.len(), pushes);
                } else {
                    prop_assert_eq!(from_zero.state, ResponseState::PartialData);
                }
            }

            #[test]
            fn latest_n_is_ascending_and_ends_at_latest(
                capacity in 1usize..16,
                pushes in 1usize..100,
                count in 1usize..40,
            ) {
                let store = PacketStore::new(capacity);
                for i in 0..pushes {
                    store.push(packet(i as u32));
                }

                // L3: ascending, final packet equals latest().
                let window = store.latest_n(count);
                let idx: Vec<u64> = window.packets.iter().map(|p| p.index).collect();
                prop_assert!(idx.windows(2).all(|w| w[1] > w[0]));

                let latest = store.latest();
                prop_assert_eq!(
                    window.packets.last().map(|p| p.index),
                    latest.packets.first().map(|p| p.index)
                );
            }
        }
    }
}
