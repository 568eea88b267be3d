//! The reader/writer frame interlock.
//!
//! The backend keeps at most two generations ("frames") of its memory
//! map alive at once. New readers always join the *current* frame;
//! the writer, before each commit, swaps in a fresh current frame (so
//! new readers proceed concurrently against it) and then waits for the
//! frame it just retired to drain to zero before touching the backend.
//! This is the one point in the engine where a reader and the writer
//! synchronize directly.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

struct Frame {
    count: Mutex<usize>,
    zero: Condvar,
}

impl Frame {
    fn new() -> Arc<Self> {
        Arc::new(Frame { count: Mutex::new(0), zero: Condvar::new() })
    }

    fn enter(self: &Arc<Self>) -> FrameGuard {
        *self.count.lock() += 1;
        FrameGuard(self.clone())
    }

    /// Blocks the calling (writer) thread until every reader that had
    /// already joined this frame has dropped its guard.
    fn wait_drained(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }
}

/// Held for the duration of one backend read. Dropping it releases the
/// frame's reader count and wakes a writer waiting in
/// [`Frame::wait_drained`] if the count just reached zero.
pub struct FrameGuard(Arc<Frame>);

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.zero.notify_all();
        }
    }
}

/// The pair of frames a `Db` cycles through: `current`, which new
/// readers join, and whatever `current` pointed to before the writer's
/// last [`Frames::advance`] call.
pub struct Frames {
    current: Mutex<Arc<Frame>>,
}

impl Frames {
    pub fn new() -> Self {
        Frames { current: Mutex::new(Frame::new()) }
    }

    /// Joins the current frame for the lifetime of the returned guard.
    /// Any code that reads through the backend holds one of these.
    pub fn enter(&self) -> FrameGuard {
        self.current.lock().enter()
    }

    /// Swaps in a fresh current frame and returns the one it replaced,
    /// so the writer can wait for it to drain. Readers that call
    /// `enter` after this returns observe the new frame immediately --
    /// they are not blocked by the wait that follows.
    pub fn advance(&self) -> RetiredFrame {
        let mut current = self.current.lock();
        let retired = current.clone();
        *current = Frame::new();
        RetiredFrame(retired)
    }
}

/// The frame retired by [`Frames::advance`]; the writer must wait for
/// it to drain before it is safe to swap the backend's mmap frame.
pub struct RetiredFrame(Arc<Frame>);

impl RetiredFrame {
    pub fn wait_drained(&self) {
        self.0.wait_drained();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn advance_with_no_readers_drains_immediately() {
        let frames = Frames::new();
        let retired = frames.advance();
        retired.wait_drained();
    }

    #[test]
    fn advance_waits_for_outstanding_reader() {
        let frames = Frames::new();
        let guard = frames.enter();
        let retired = frames.advance();

        let drained = Arc::new(AtomicBool::new(false));
        let drained2 = drained.clone();
        let handle = thread::spawn(move || {
            retired.wait_drained();
            drained2.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!drained.load(Ordering::SeqCst));

        drop(guard);
        handle.join().unwrap();
        assert!(drained.load(Ordering::SeqCst));
    }

    #[test]
    fn new_readers_after_advance_use_the_new_frame_and_do_not_block_the_wait() {
        let frames = Frames::new();
        let old_guard = frames.enter();
        let retired = frames.advance();

        // A reader entering after `advance` joins the new frame and
        // must not prevent the retired one from draining.
        let _new_guard = frames.enter();
        drop(old_guard);
        retired.wait_drained();
    }
}
