//! Single-slot frame hand-off between a capture worker and the recognition
//! worker. One slot per camera; a write overwrites whatever is there, so the
//! reader always gets the newest frame and a slow reader never backs up the
//! producer.

use std::sync::Mutex;

use byteorder::{ByteOrder, NativeEndian};
use ndarray::{Array3, ArrayView3};

use crate::frame::CHANNELS;

// Layout:
//   [0:4)   height  (i32)
//   [4:8)   width   (i32)
//   [8:16)  frame_id (i64)
//   [16:24) timestamp (f64)
//   [24:28) valid flag (i32, 1 = frame present)
//   [28:)   raw BGR pixels, max_h * max_w * 3 bytes
pub const HEADER_SIZE: usize = 28;

const OFF_HEIGHT: usize = 0;
const OFF_WIDTH: usize = 4;
const OFF_FRAME_ID: usize = 8;
const OFF_TIMESTAMP: usize = 16;
const OFF_VALID: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMeta {
    pub height: usize,
    pub width: usize,
    pub frame_id: i64,
    pub timestamp: f64,
}

pub struct FrameSlot {
    max_h: usize,
    max_w: usize,
    buf: Mutex<Box<[u8]>>,
}

impl FrameSlot {
    pub fn new(max_h: u32, max_w: u32) -> Self {
        let max_h = max_h as usize;
        let max_w = max_w as usize;
        let buf = vec![0u8; HEADER_SIZE + max_h * max_w * CHANNELS].into_boxed_slice();
        Self { max_h, max_w, buf: Mutex::new(buf) }
    }

    /// Publish a frame. Returns false (leaving the slot untouched) when the
    /// frame exceeds the slot capacity. The valid flag is the last store.
    pub fn write(&self, frame: ArrayView3<u8>, frame_id: i64, timestamp: f64) -> bool {
        let (h, w, c) = frame.dim();
        if c != CHANNELS || h > self.max_h || w > self.max_w {
            return false;
        }

        let mut buf = self.buf.lock().expect("frame slot poisoned");
        NativeEndian::write_i32(&mut buf[OFF_HEIGHT..OFF_HEIGHT + 4], h as i32);
        NativeEndian::write_i32(&mut buf[OFF_WIDTH..OFF_WIDTH + 4], w as i32);
        NativeEndian::write_i64(&mut buf[OFF_FRAME_ID..OFF_FRAME_ID + 8], frame_id);
        NativeEndian::write_f64(&mut buf[OFF_TIMESTAMP..OFF_TIMESTAMP + 8], timestamp);

        let nbytes = h * w * CHANNELS;
        let pixels = &mut buf[HEADER_SIZE..HEADER_SIZE + nbytes];
        match frame.as_slice() {
            Some(flat) => pixels.copy_from_slice(flat),
            None => {
                for (dst, src) in pixels.iter_mut().zip(frame.iter()) {
                    *dst = *src;
                }
            }
        }

        NativeEndian::write_i32(&mut buf[OFF_VALID..OFF_VALID + 4], 1);
        true
    }

    /// Copy the current frame out, leaving the slot available for the next
    /// writer. None until the first complete write lands.
    pub fn read(&self) -> Option<(Array3<u8>, FrameMeta)> {
        let (raw, meta) = {
            let buf = self.buf.lock().expect("frame slot poisoned");
            if NativeEndian::read_i32(&buf[OFF_VALID..OFF_VALID + 4]) == 0 {
                return None;
            }
            let h = NativeEndian::read_i32(&buf[OFF_HEIGHT..OFF_HEIGHT + 4]) as usize;
            let w = NativeEndian::read_i32(&buf[OFF_WIDTH..OFF_WIDTH + 4]) as usize;
            let meta = FrameMeta {
                height: h,
                width: w,
                frame_id: NativeEndian::read_i64(&buf[OFF_FRAME_ID..OFF_FRAME_ID + 8]),
                timestamp: NativeEndian::read_f64(&buf[OFF_TIMESTAMP..OFF_TIMESTAMP + 8]),
            };
            let nbytes = h * w * CHANNELS;
            (buf[HEADER_SIZE..HEADER_SIZE + nbytes].to_vec(), meta)
        };
        let frame = Array3::from_shape_vec((meta.height, meta.width, CHANNELS), raw)
            .expect("slot header matches payload length");
        Some((frame, meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn patterned(h: usize, w: usize, base: u8) -> Array3<u8> {
        Array3::from_shape_fn((h, w, CHANNELS), |(y, x, c)| {
            base.wrapping_add((y * 31 + x * 7 + c) as u8)
        })
    }

    #[test]
    fn read_before_first_write_is_none() {
        let slot = FrameSlot::new(720, 1280);
        assert!(slot.read().is_none());
    }

    #[test]
    fn read_returns_last_complete_write() {
        let slot = FrameSlot::new(16, 16);
        let first = patterned(8, 8, 0);
        let second = patterned(12, 10, 100);

        assert!(slot.write(first.view(), 1, 10.0));
        assert!(slot.write(second.view(), 2, 11.5));

        let (frame, meta) = slot.read().unwrap();
        assert_eq!(frame, second);
        assert_eq!(
            meta,
            FrameMeta { height: 12, width: 10, frame_id: 2, timestamp: 11.5 }
        );
    }

    #[test]
    fn oversized_write_is_rejected_and_previous_frame_survives() {
        let slot = FrameSlot::new(10, 10);
        let ok = patterned(10, 10, 5);
        assert!(slot.write(ok.view(), 1, 1.0));

        let too_tall = patterned(11, 4, 9);
        assert!(!slot.write(too_tall.view(), 2, 2.0));

        let (frame, meta) = slot.read().unwrap();
        assert_eq!(frame, ok);
        assert_eq!(meta.frame_id, 1);
    }

    #[test]
    fn oversized_write_on_empty_slot_stays_invalid() {
        let slot = FrameSlot::new(4, 4);
        let big = patterned(8, 8, 0);
        assert!(!slot.write(big.view(), 1, 1.0));
        assert!(slot.read().is_none());
    }

    #[test]
    fn returned_buffer_is_independent_of_later_writes() {
        let slot = FrameSlot::new(8, 8);
        let a = patterned(8, 8, 1);
        slot.write(a.view(), 1, 1.0);
        let (copy, _) = slot.read().unwrap();

        let b = patterned(8, 8, 200);
        slot.write(b.view(), 2, 2.0);
        assert_eq!(copy, a);
    }

    #[test]
    fn concurrent_writers_and_reader_never_tear() {
        use std::sync::Arc;
        let slot = Arc::new(FrameSlot::new(32, 32));
        let mut handles = Vec::new();
        for t in 0..2u8 {
            let slot = Arc::clone(&slot);
            handles.push(std::thread::spawn(move || {
                for i in 0..200i64 {
                    let fill = t.wrapping_mul(100).wrapping_add(i as u8);
                    let frame = Array3::from_elem((32, 32, CHANNELS), fill);
                    slot.write(frame.view(), i, i as f64);
                }
            }));
        }
        for _ in 0..500 {
            if let Some((frame, _)) = slot.read() {
                let first = frame[(0, 0, 0)];
                assert!(frame.iter().all(|&v| v == first), "torn frame observed");
            }
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
