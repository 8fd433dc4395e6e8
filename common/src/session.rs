use std::{
    sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
    time::Instant,
};

/// Monotonic microsecond clock measured from creation, less a shared
/// "time difference" accumulator.
///
/// The accumulator is the fast-forward mechanism: the player window adds a
/// negative difference on a key press, which advances `now()` and makes
/// every sink consider itself behind schedule. It is folded in here and
/// nowhere else.
pub struct Clock {
    origin: Instant,
    diff: AtomicI64,
}

impl Default for Clock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
            diff: AtomicI64::new(0),
        }
    }
}

impl Clock {
    pub fn now(&self) -> u64 {
        let elapsed = self.origin.elapsed().as_micros() as i64;
        (elapsed - self.diff.load(Ordering::Relaxed)).max(0) as u64
    }

    pub fn add_diff(&self, diff: i64) {
        self.diff.fetch_add(diff, Ordering::Relaxed);
    }
}

/// Process-wide state shared by the capture hooks and the player sinks: the
/// clock, the sticky cancel flag and the stream id allocators.
#[derive(Default)]
pub struct Session {
    pub clock: Clock,
    cancelled: AtomicBool,
    next_video: AtomicU32,
    next_audio: AtomicU32,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Stream ids start at 1; 0 never appears on the wire.
    pub fn next_video_id(&self) -> u32 {
        self.next_video.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn next_audio_id(&self) -> u32 {
        self.next_audio.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::default();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn negative_diff_advances_time() {
        let clock = Clock::default();
        let before = clock.now();
        clock.add_diff(-1_000_000);
        assert!(clock.now() >= before + 1_000_000);
    }

    #[test]
    fn positive_diff_saturates_at_zero() {
        let clock = Clock::default();
        clock.add_diff(60_000_000);
        assert_eq!(clock.now(), 0);
    }

    #[test]
    fn stream_ids_are_dense_from_one() {
        let session = Session::new();
        assert_eq!(session.next_video_id(), 1);
        assert_eq!(session.next_video_id(), 2);
        assert_eq!(session.next_audio_id(), 1);
    }
}
