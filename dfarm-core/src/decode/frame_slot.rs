//! Single-buffer frame handoff between decode producer and consumer.
//!
//! The slot holds at most one deliverable frame. When the producer
//! offers a new frame while the previous one was never consumed, the
//! old frame is silently replaced and the offer reports `skipped` —
//! bounded latency, never unbounded queuing. The slot lock is held
//! only for pointer/flag swaps; the rendered frame travels behind an
//! `Arc` so consumers never copy under the lock.
//!
//! The decode scratch buffer is recycled through the slot: the
//! producer takes it with [`FrameSlot::take_decoding_frame`], fills it
//! off-lock, and offers it back; a replaced rendered frame becomes the
//! next scratch buffer once no consumer holds it.

use std::sync::{Arc, Condvar, Mutex};

use crate::decode::frame::VideoFrame;

#[derive(Debug, Default)]
struct SlotInner {
    /// The frame a consumer may take. `None` before the first offer.
    rendered: Option<Arc<VideoFrame>>,
    /// Set on offer, cleared on consume. At most one unconsumed
    /// notification exists at any time.
    pending: bool,
    /// Recycled buffer for the producer.
    spare: Option<VideoFrame>,
    interrupted: bool,
}

/// Single-slot producer/consumer handoff with skip-under-backpressure.
#[derive(Debug, Default)]
pub struct FrameSlot {
    inner: Mutex<SlotInner>,
    cond: Condvar,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a buffer for the decoder to fill. Exclusively owned by the
    /// producer until offered back.
    pub fn take_decoding_frame(&self) -> VideoFrame {
        let mut inner = self.inner.lock().expect("slot lock");
        inner.spare.take().unwrap_or_else(VideoFrame::empty)
    }

    /// Swap a completed frame into the rendered position.
    ///
    /// Returns `true` when the previous rendered frame was never
    /// consumed ("skipped"); the caller must then suppress any
    /// ready-notification, because the consumer already has one
    /// outstanding.
    pub fn offer(&self, frame: VideoFrame) -> bool {
        let mut inner = self.inner.lock().expect("slot lock");
        let skipped = inner.pending;

        let previous = inner.rendered.replace(Arc::new(frame));
        inner.pending = true;

        // A replaced frame nobody holds becomes the next scratch buffer.
        if let Some(prev) = previous {
            if let Ok(buf) = Arc::try_unwrap(prev) {
                inner.spare = Some(buf);
            }
        }

        drop(inner);
        self.cond.notify_all();
        skipped
    }

    /// Take the current rendered frame, clearing the pending flag.
    ///
    /// Returns `None` when no unconsumed frame is waiting, so a
    /// consumer polling twice cannot observe the same frame twice.
    pub fn consume_rendered(&self) -> Option<Arc<VideoFrame>> {
        let mut inner = self.inner.lock().expect("slot lock");
        if !inner.pending {
            return None;
        }
        inner.pending = false;
        inner.rendered.clone()
    }

    /// One-shot read of the rendered frame without touching pending
    /// state (out-of-band snapshot capture).
    pub fn peek(&self) -> Option<Arc<VideoFrame>> {
        let inner = self.inner.lock().expect("slot lock");
        inner.rendered.clone()
    }

    /// Whether an unconsumed frame is waiting.
    pub fn has_pending(&self) -> bool {
        self.inner.lock().expect("slot lock").pending
    }

    /// Block until a frame is pending, then consume it.
    ///
    /// Returns `None` once the slot is interrupted.
    pub fn wait_rendered(&self) -> Option<Arc<VideoFrame>> {
        let mut inner = self.inner.lock().expect("slot lock");
        loop {
            if inner.interrupted {
                return None;
            }
            if inner.pending {
                inner.pending = false;
                return inner.rendered.clone();
            }
            inner = self.cond.wait(inner).expect("slot lock");
        }
    }

    /// Force any blocked waiter to return immediately. Teardown only.
    pub fn interrupt(&self) {
        let mut inner = self.inner.lock().expect("slot lock");
        inner.interrupted = true;
        drop(inner);
        self.cond.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.lock().expect("slot lock").interrupted
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> VideoFrame {
        let mut f = VideoFrame::empty();
        f.reset_for(2, 2);
        f.planes[0][0] = tag;
        f
    }

    #[test]
    fn offer_then_consume() {
        let slot = FrameSlot::new();
        assert!(!slot.offer(frame(1)));
        assert!(slot.has_pending());

        let got = slot.consume_rendered().expect("frame present");
        assert_eq!(got.planes[0][0], 1);
        assert!(!slot.has_pending());
    }

    #[test]
    fn second_offer_without_consume_is_skipped() {
        let slot = FrameSlot::new();
        assert!(!slot.offer(frame(1)));
        assert!(slot.offer(frame(2)));
        assert!(slot.offer(frame(3)));

        // Exactly one deliverable frame — the newest.
        let got = slot.consume_rendered().unwrap();
        assert_eq!(got.planes[0][0], 3);
        assert!(!slot.has_pending());
    }

    #[test]
    fn slow_consumer_sees_one_in_three() {
        let slot = FrameSlot::new();
        let mut delivered = 0;
        let mut skipped = 0;
        for round in 0..3 {
            for i in 0..3u8 {
                if slot.offer(frame(round * 3 + i)) {
                    skipped += 1;
                }
            }
            if slot.consume_rendered().is_some() && !slot.has_pending() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 3);
        assert_eq!(skipped, 6);
    }

    #[test]
    fn peek_leaves_pending_set() {
        let slot = FrameSlot::new();
        slot.offer(frame(5));
        assert!(slot.peek().is_some());
        assert!(slot.has_pending());
    }

    #[test]
    fn replaced_buffer_is_recycled() {
        let slot = FrameSlot::new();
        slot.offer(frame(1));
        slot.offer(frame(2)); // frame(1) is unreferenced, reclaimed

        let scratch = slot.take_decoding_frame();
        assert_eq!(scratch.planes[0][0], 1);
    }

    #[test]
    fn held_arc_is_not_recycled() {
        let slot = FrameSlot::new();
        slot.offer(frame(1));
        let held = slot.consume_rendered().unwrap();
        slot.offer(frame(2));

        // Consumer still holds frame(1); scratch must be fresh.
        let scratch = slot.take_decoding_frame();
        assert!(scratch.is_empty());
        drop(held);
    }

    #[test]
    fn interrupt_unblocks_waiter() {
        let slot = Arc::new(FrameSlot::new());
        let waiter = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || slot.wait_rendered())
        };
        // Give the waiter time to block.
        std::thread::sleep(std::time::Duration::from_millis(50));
        slot.interrupt();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn wait_returns_offered_frame() {
        let slot = Arc::new(FrameSlot::new());
        let waiter = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || slot.wait_rendered())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        slot.offer(frame(9));
        let got = waiter.join().unwrap().expect("frame");
        assert_eq!(got.planes[0][0], 9);
    }
}
