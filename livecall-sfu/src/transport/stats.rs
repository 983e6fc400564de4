//! Per-stream RTP counters
//!
//! Inbound loss is derived from sequence number gaps (with wrap-around),
//! jitter follows the RFC 3550 interarrival estimator. Outbound totals are
//! per sender; outbound loss and jitter come from the subscriber's receiver
//! reports.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use webrtc::rtp::packet::Packet;
use webrtc::util::marshal::MarshalSize;

/// Point-in-time view of a stream
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StreamSnapshot {
    pub packets: i64,
    /// Header plus payload bytes
    pub bytes: i64,
    pub header_bytes: i64,
    pub lost: i64,
    /// Seconds
    pub jitter: f64,
}

#[derive(Default)]
struct SequenceState {
    initialized: bool,
    base_seq: u16,
    max_seq: u16,
    cycles: u64,
    received: u64,
    last_arrival: f64,
    last_timestamp: u32,
    /// RTP timestamp units
    jitter: f64,
}

impl SequenceState {
    fn update(&mut self, seq: u16, timestamp: u32, arrival: f64) {
        if !self.initialized {
            self.initialized = true;
            self.base_seq = seq;
            self.max_seq = seq;
        } else {
            let delta = seq.wrapping_sub(self.max_seq);
            if delta != 0 && delta < 0x8000 {
                if seq < self.max_seq {
                    self.cycles += 1 << 16;
                }
                self.max_seq = seq;
            }

            let elapsed = arrival - self.last_arrival;
            let advanced = f64::from(timestamp.wrapping_sub(self.last_timestamp) as i32);
            let d = (elapsed - advanced).abs();
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.received += 1;
        self.last_arrival = arrival;
        self.last_timestamp = timestamp;
    }

    fn lost(&self) -> i64 {
        if !self.initialized {
            return 0;
        }
        let extended_max = self.cycles + u64::from(self.max_seq);
        let expected = extended_max - u64::from(self.base_seq) + 1;
        let lost = i128::from(expected) - i128::from(self.received);
        i64::try_from(lost.max(0)).unwrap_or(i64::MAX)
    }
}

/// Counters for one received stream, updated by its forwarding worker.
pub struct StreamCounters {
    clock_rate: u32,
    started: Instant,
    packets: AtomicU64,
    payload_bytes: AtomicU64,
    header_bytes: AtomicU64,
    sequence: Mutex<SequenceState>,
}

impl StreamCounters {
    #[must_use]
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate: clock_rate.max(1),
            started: Instant::now(),
            packets: AtomicU64::new(0),
            payload_bytes: AtomicU64::new(0),
            header_bytes: AtomicU64::new(0),
            sequence: Mutex::new(SequenceState::default()),
        }
    }

    pub fn record(&self, packet: &Packet) {
        self.record_at(packet, self.started.elapsed());
    }

    /// Record `packet` as arriving `arrival` after the counters were created.
    pub fn record_at(&self, packet: &Packet, arrival: Duration) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.payload_bytes
            .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
        self.header_bytes
            .fetch_add(packet.header.marshal_size() as u64, Ordering::Relaxed);

        let arrival_units = arrival.as_secs_f64() * f64::from(self.clock_rate);
        self.sequence
            .lock()
            .update(packet.header.sequence_number, packet.header.timestamp, arrival_units);
    }

    #[must_use]
    pub fn snapshot(&self) -> StreamSnapshot {
        let header_bytes = self.header_bytes.load(Ordering::Relaxed);
        let payload_bytes = self.payload_bytes.load(Ordering::Relaxed);
        let sequence = self.sequence.lock();
        StreamSnapshot {
            packets: to_i64(self.packets.load(Ordering::Relaxed)),
            bytes: to_i64(header_bytes + payload_bytes),
            header_bytes: to_i64(header_bytes),
            lost: sequence.lost(),
            jitter: sequence.jitter / f64::from(self.clock_rate),
        }
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// What one sender actually put on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SentTotals {
    pub packets: i64,
    /// Header plus payload bytes
    pub bytes: i64,
    pub header_bytes: i64,
}

impl SentTotals {
    #[must_use]
    pub fn new(packets: u64, payload_bytes: u64, header_bytes: u64) -> Self {
        Self {
            packets: to_i64(packets),
            bytes: to_i64(payload_bytes.saturating_add(header_bytes)),
            header_bytes: to_i64(header_bytes),
        }
    }
}

/// Outbound counters for transports that do not keep their own.
#[derive(Debug, Default)]
pub struct SentCounters {
    packets: AtomicU64,
    payload_bytes: AtomicU64,
    header_bytes: AtomicU64,
}

impl SentCounters {
    pub fn record(&self, packet: &Packet) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.payload_bytes
            .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
        self.header_bytes
            .fetch_add(packet.header.marshal_size() as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn totals(&self) -> SentTotals {
        SentTotals::new(
            self.packets.load(Ordering::Relaxed),
            self.payload_bytes.load(Ordering::Relaxed),
            self.header_bytes.load(Ordering::Relaxed),
        )
    }
}

/// Latest receiver report values for one sent stream
#[derive(Debug, Default)]
pub struct RemoteReports {
    lost: AtomicI64,
    /// RTP timestamp units
    jitter: AtomicU32,
}

impl RemoteReports {
    pub fn record(&self, total_lost: u32, jitter: u32) {
        self.lost.store(i64::from(total_lost), Ordering::Relaxed);
        self.jitter.store(jitter, Ordering::Relaxed);
    }

    #[must_use]
    pub fn lost(&self) -> i64 {
        self.lost.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn jitter_seconds(&self, clock_rate: u32) -> f64 {
        f64::from(self.jitter.load(Ordering::Relaxed)) / f64::from(clock_rate.max(1))
    }
}
