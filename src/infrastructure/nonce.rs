//! Request sequence numbers for signed venue calls.
//!
//! The venue rejects any nonce that is not strictly greater than the last one
//! it accepted for the key. The generator is plain data; the REST client keeps
//! it behind the same async mutex that covers the network call consuming it.

use chrono::Utc;

#[derive(Debug, Default)]
pub struct NonceGenerator {
    last: u64,
    /// Server clock minus local clock, in milliseconds
    offset_ms: i64,
    calibrated: bool,
}

impl NonceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the offset measured by the clock handshake
    pub fn calibrate(&mut self, offset_ms: i64) {
        self.offset_ms = offset_ms;
        self.calibrated = true;
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    pub fn last(&self) -> u64 {
        self.last
    }

    /// Next nonce: `max(previous + 1, now_ms + offset)`
    pub fn next(&mut self) -> u64 {
        self.next_at(Utc::now().timestamp_millis())
    }

    pub fn next_at(&mut self, now_ms: i64) -> u64 {
        let clock = now_ms.saturating_add(self.offset_ms).max(0) as u64;
        let nonce = clock.max(self.last + 1);
        self.last = nonce;
        nonce
    }
}

/// Offset between the server's clock and ours, given a round trip that
/// started at `sent_ms` and returned at `received_ms`
pub fn clock_offset_ms(server_unix_secs: i64, sent_ms: i64, received_ms: i64) -> i64 {
    let local_mid = sent_ms + (received_ms - sent_ms) / 2;
    server_unix_secs * 1000 - local_mid
}
