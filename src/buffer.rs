//! The per-connection receive buffer: a flat, growable byte vector that
//! assembles complete frames out of however the stream happened to chunk
//! its reads.
//!
//! Adapted from the grow/drain discipline in
//! `examples/SleepingPills-bushhammer/t51core/src/networking/chunk.rs` (a
//! pooled, fixed-size chunk per connection) down to a single `Vec<u8>`: this
//! crate has one buffer per connection rather than a shared chunk pool, so
//! the only policy worth keeping is the high-water mark — a frame that
//! declares a body larger than `max_size` is never materialized, its bytes
//! are read and discarded instead of accumulated.
use log::warn;

use crate::frame::{Frame, FrameError, HEADER_LEN};

/// Accumulates bytes read off a socket and yields complete frames as soon
/// as enough bytes are present.
pub struct RecvBuffer {
    data: Vec<u8>,
    max_size: usize,
    discarding: Option<usize>,
}

impl RecvBuffer {
    /// `max_size` bounds how large a single frame (header + body) this
    /// buffer will ever hold; anything bigger is drained and dropped
    /// rather than grown into.
    pub fn new(max_size: usize) -> Self {
        RecvBuffer {
            data: Vec::new(),
            max_size,
            discarding: None,
        }
    }

    /// Like [`RecvBuffer::new`], but preallocates `initial_capacity` bytes
    /// up front (the "Recv buffer size" server parameter) instead of
    /// growing from empty.
    pub fn with_capacity(max_size: usize, initial_capacity: usize) -> Self {
        RecvBuffer {
            data: Vec::with_capacity(initial_capacity),
            max_size,
            discarding: None,
        }
    }

    /// Bytes currently buffered, not counting any still being discarded.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Feed newly-read bytes in. If a previous call is mid-way through
    /// discarding an oversize frame, bytes are first consumed against that
    /// debt before anything is buffered again.
    pub fn feed(&mut self, bytes: &[u8]) {
        let mut bytes = bytes;
        if let Some(remaining) = self.discarding {
            let skip = remaining.min(bytes.len());
            bytes = &bytes[skip..];
            let left = remaining - skip;
            self.discarding = if left > 0 { Some(left) } else { None };
        }
        if !bytes.is_empty() {
            self.data.extend_from_slice(bytes);
        }
    }

    /// Try to pull one complete, decoded frame off the front of the
    /// buffer.
    ///
    /// Returns `Ok(None)` when there isn't a full frame buffered yet —
    /// including the case where an oversize frame was just detected and
    /// dropped, so the caller should simply keep reading. A frame larger
    /// than `max_size` is never returned; its header is consumed and its
    /// body bytes are discarded as they arrive.
    pub fn take_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.discarding.is_some() {
            return Ok(None);
        }
        if self.data.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.data[..HEADER_LEN]);
        let (cipher, declared_len) = Frame::decode_header(&header);
        // `declared_len` is the header's `total_length`, which already
        // counts these 16 header bytes.
        let total = declared_len as usize;

        if total > self.max_size {
            warn!(
                target: "paramserve::buffer",
                "dropping oversize frame: cipher {cipher} declares {declared_len} total bytes, limit is {}",
                self.max_size
            );
            let have = self.data.len().min(total);
            let still_to_discard = total - have;
            self.data.clear();
            self.discarding = if still_to_discard > 0 {
                Some(still_to_discard)
            } else {
                None
            };
            return Ok(None);
        }

        if self.data.len() < total {
            return Ok(None);
        }

        let frame = Frame::decode_body(cipher, declared_len, &self.data[HEADER_LEN..total])?;
        self.data.drain(0..total);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn assembles_a_frame_split_across_two_feeds() {
        let mut frame = Frame::new(1);
        frame.set(1, Value::U32(7));
        let bytes = frame.encode();
        let (first, second) = bytes.split_at(bytes.len() / 2);

        let mut buf = RecvBuffer::new(4096);
        buf.feed(first);
        assert!(buf.take_frame().unwrap().is_none());
        buf.feed(second);
        let decoded = buf.take_frame().unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn oversize_frame_is_dropped_and_does_not_wedge_the_stream() {
        let mut big = Frame::new(2);
        big.set(1, Value::Str("x".repeat(200)));
        let big_bytes = big.encode();

        let mut good = Frame::new(3);
        good.set(1, Value::U8(9));
        let good_bytes = good.encode();

        let mut buf = RecvBuffer::new(64);
        buf.feed(&big_bytes);
        assert!(buf.take_frame().unwrap().is_none());

        buf.feed(&good_bytes);
        let decoded = buf.take_frame().unwrap().unwrap();
        assert_eq!(decoded, good);
    }

    #[test]
    fn two_frames_in_one_feed_both_come_out() {
        let mut a = Frame::new(1);
        a.set(1, Value::U8(1));
        let mut b = Frame::new(2);
        b.set(1, Value::U8(2));

        let mut combined = a.encode();
        combined.extend_from_slice(&b.encode());

        let mut buf = RecvBuffer::new(4096);
        buf.feed(&combined);
        assert_eq!(buf.take_frame().unwrap().unwrap(), a);
        assert_eq!(buf.take_frame().unwrap().unwrap(), b);
        assert!(buf.take_frame().unwrap().is_none());
    }
}
