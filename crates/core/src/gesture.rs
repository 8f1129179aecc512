//! Touch gesture recognition.
//!
//! [`GestureRecognizer`] is a deadline-driven state machine: pointer events
//! are fed in with their timestamps and timers are represented as deadlines
//! that the caller polls. [`GestureRecognizer::run`] drives it from a channel
//! of pointer events with tokio timers.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SingleTap,
    DoubleTap,
    TripleTap,
    SwipeLeft,
    SwipeRight,
    LongPress,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointerEvent {
    Down { x: f32, y: f32, at: Instant },
    Move { x: f32, y: f32, at: Instant },
    Up { x: f32, y: f32, at: Instant },
}

#[derive(Debug, Clone)]
pub struct GestureTuning {
    pub long_press: Duration,
    pub tap_window: Duration,
    pub tap_max_duration: Duration,
    pub tap_slop: f32,
    pub swipe_max_duration: Duration,
    pub swipe_min_dx: f32,
    pub swipe_max_dy: f32,
}

impl Default for GestureTuning {
    fn default() -> Self {
        Self {
            long_press: Duration::from_millis(800),
            tap_window: Duration::from_millis(300),
            tap_max_duration: Duration::from_millis(300),
            tap_slop: 20.0,
            swipe_max_duration: Duration::from_millis(500),
            swipe_min_dx: 80.0,
            swipe_max_dy: 60.0,
        }
    }
}

/// The touch currently in progress.
#[derive(Debug, Clone, Copy)]
struct GestureSample {
    x: f32,
    y: f32,
    at: Instant,
}

#[derive(Debug)]
pub struct GestureRecognizer {
    tuning: GestureTuning,
    touch: Option<GestureSample>,
    long_press_at: Option<Instant>,
    tap_count: u8,
    tap_deadline: Option<Instant>,
}

impl Default for GestureRecognizer {
    fn default() -> Self {
        Self::new(GestureTuning::default())
    }
}

impl GestureRecognizer {
    pub fn new(tuning: GestureTuning) -> Self {
        Self {
            tuning,
            touch: None,
            long_press_at: None,
            tap_count: 0,
            tap_deadline: None,
        }
    }

    pub fn handle(&mut self, event: PointerEvent) -> Option<Action> {
        match event {
            PointerEvent::Down { x, y, at } => {
                self.pointer_down(x, y, at);
                None
            }
            PointerEvent::Move { .. } => None,
            PointerEvent::Up { x, y, at } => self.pointer_up(x, y, at),
        }
    }

    pub fn pointer_down(&mut self, x: f32, y: f32, at: Instant) {
        self.touch = Some(GestureSample { x, y, at });
        self.long_press_at = Some(at + self.tuning.long_press);
    }

    pub fn pointer_up(&mut self, x: f32, y: f32, at: Instant) -> Option<Action> {
        // No touch means the long press already fired for it.
        let touch = self.touch.take()?;
        self.long_press_at = None;

        let dx = x - touch.x;
        let dy = y - touch.y;
        let duration = at.saturating_duration_since(touch.at);

        if duration < self.tuning.swipe_max_duration
            && dx.abs() > self.tuning.swipe_min_dx
            && dy.abs() < self.tuning.swipe_max_dy
        {
            self.reset_taps();
            return Some(if dx < 0.0 {
                Action::SwipeLeft
            } else {
                Action::SwipeRight
            });
        }

        if duration < self.tuning.tap_max_duration
            && dx.abs() < self.tuning.tap_slop
            && dy.abs() < self.tuning.tap_slop
        {
            self.tap_count += 1;
            if self.tap_count >= 3 {
                self.reset_taps();
                return Some(Action::TripleTap);
            }
            self.tap_deadline = Some(at + self.tuning.tap_window);
            return None;
        }

        tracing::trace!(dx, dy, ?duration, "discarding unrecognised touch");
        None
    }

    /// Earliest pending timer, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.long_press_at, self.tap_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fires whichever timer has expired by `now`.
    pub fn poll(&mut self, now: Instant) -> Option<Action> {
        if self.long_press_at.is_some_and(|at| now >= at) {
            self.long_press_at = None;
            self.touch = None;
            return Some(Action::LongPress);
        }
        if self.tap_deadline.is_some_and(|at| now >= at) {
            let count = self.tap_count;
            self.reset_taps();
            return match count {
                1 => Some(Action::SingleTap),
                2 => Some(Action::DoubleTap),
                _ => None,
            };
        }
        None
    }

    /// Drops the in-progress touch and any pending taps without emitting.
    pub fn cancel(&mut self) {
        self.touch = None;
        self.long_press_at = None;
        self.reset_taps();
    }

    fn reset_taps(&mut self) {
        self.tap_count = 0;
        self.tap_deadline = None;
    }

    /// Recognises gestures from `events` until the channel closes or the
    /// action receiver goes away. Pending timers die with the task.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<PointerEvent>,
        actions: mpsc::Sender<Action>,
    ) {
        loop {
            let deadline = self.next_deadline();
            let action = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = sleep_until(deadline) => self.poll(Instant::now()),
            };
            if let Some(action) = action {
                tracing::debug!(?action, "gesture recognised");
                if actions.send(action).await.is_err() {
                    break;
                }
            }
        }
        self.cancel();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    struct Script {
        recognizer: GestureRecognizer,
        t0: Instant,
        emitted: Vec<Action>,
    }

    impl Script {
        fn new() -> Self {
            Self {
                recognizer: GestureRecognizer::default(),
                t0: Instant::now(),
                emitted: Vec::new(),
            }
        }

        fn at(&self, offset: u64) -> Instant {
            self.t0 + ms(offset)
        }

        /// Advances timers up to `offset`, then applies a touch.
        fn touch(&mut self, down: (f32, f32, u64), up: (f32, f32, u64)) {
            self.advance(down.2);
            self.recognizer.pointer_down(down.0, down.1, self.at(down.2));
            self.advance(up.2);
            if let Some(a) = self.recognizer.pointer_up(up.0, up.1, self.at(up.2)) {
                self.emitted.push(a);
            }
        }

        fn tap(&mut self, start: u64) {
            self.touch((100.0, 100.0, start), (102.0, 101.0, start + 80));
        }

        fn advance(&mut self, offset: u64) {
            let now = self.at(offset);
            while let Some(deadline) = self.recognizer.next_deadline() {
                if deadline > now {
                    break;
                }
                if let Some(a) = self.recognizer.poll(deadline) {
                    self.emitted.push(a);
                }
            }
        }
    }

    #[test]
    fn single_tap_emits_after_window() {
        let mut s = Script::new();
        s.tap(0);
        assert!(s.emitted.is_empty(), "must wait for the disambiguation window");
        s.advance(379);
        assert!(s.emitted.is_empty());
        s.advance(380);
        assert_eq!(s.emitted, vec![Action::SingleTap]);
        s.advance(5_000);
        assert_eq!(s.emitted, vec![Action::SingleTap]);
    }

    #[test]
    fn double_tap_emits_once() {
        let mut s = Script::new();
        s.tap(0);
        s.tap(200);
        s.advance(5_000);
        assert_eq!(s.emitted, vec![Action::DoubleTap]);
    }

    #[test]
    fn triple_tap_emits_immediately() {
        let mut s = Script::new();
        s.tap(0);
        s.tap(200);
        s.tap(400);
        assert_eq!(s.emitted, vec![Action::TripleTap]);
        s.advance(5_000);
        assert_eq!(s.emitted, vec![Action::TripleTap]);
    }

    #[test]
    fn taps_outside_window_are_separate() {
        let mut s = Script::new();
        s.tap(0);
        s.tap(1_000);
        s.advance(5_000);
        assert_eq!(s.emitted, vec![Action::SingleTap, Action::SingleTap]);
    }

    #[test]
    fn swipes_by_direction() {
        let mut s = Script::new();
        s.touch((300.0, 200.0, 0), (150.0, 220.0, 200));
        s.touch((100.0, 200.0, 1_000), (250.0, 180.0, 1_300));
        assert_eq!(s.emitted, vec![Action::SwipeLeft, Action::SwipeRight]);
    }

    #[test]
    fn swipe_wins_over_pending_taps() {
        let mut s = Script::new();
        s.tap(0);
        // Fast enough to be a tap by duration, far enough to be a swipe.
        s.touch((100.0, 100.0, 150), (200.0, 100.0, 250));
        s.advance(5_000);
        assert_eq!(s.emitted, vec![Action::SwipeRight]);
    }

    #[test]
    fn slow_or_diagonal_motion_is_discarded() {
        let mut s = Script::new();
        // Too slow to swipe, too far to tap.
        s.touch((100.0, 100.0, 0), (300.0, 100.0, 600));
        // Too much vertical travel.
        s.touch((100.0, 100.0, 1_000), (300.0, 200.0, 1_100));
        // Held too long for a tap.
        s.touch((100.0, 100.0, 2_000), (100.0, 100.0, 2_400));
        s.advance(5_000);
        assert!(s.emitted.is_empty(), "got {:?}", s.emitted);
    }

    #[test]
    fn long_press_fires_once_and_swallows_release() {
        let mut s = Script::new();
        s.touch((100.0, 100.0, 0), (100.0, 100.0, 1_200));
        s.advance(5_000);
        assert_eq!(s.emitted, vec![Action::LongPress]);
    }

    #[test]
    fn release_before_long_press_cancels_it() {
        let mut r = GestureRecognizer::default();
        let t0 = Instant::now();
        r.pointer_down(0.0, 0.0, t0);
        assert_eq!(r.next_deadline(), Some(t0 + ms(800)));
        assert_eq!(r.pointer_up(0.0, 0.0, t0 + ms(50)), None);
        assert_eq!(r.next_deadline(), Some(t0 + ms(350)));
        assert_eq!(r.poll(t0 + ms(900)), Some(Action::SingleTap));
        assert_eq!(r.poll(t0 + ms(900)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn run_emits_from_timers() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let (action_tx, mut action_rx) = mpsc::channel(8);
        let task = tokio::spawn(GestureRecognizer::default().run(event_rx, action_tx));

        let t0 = Instant::now();
        event_tx
            .send(PointerEvent::Down { x: 5.0, y: 5.0, at: t0 })
            .await
            .unwrap();
        event_tx
            .send(PointerEvent::Up { x: 5.0, y: 5.0, at: t0 + ms(40) })
            .await
            .unwrap();

        let action = action_rx.recv().await.unwrap();
        assert_eq!(action, Action::SingleTap);
        assert!(Instant::now() >= t0 + ms(340));

        event_tx
            .send(PointerEvent::Down { x: 5.0, y: 5.0, at: Instant::now() })
            .await
            .unwrap();
        assert_eq!(action_rx.recv().await.unwrap(), Action::LongPress);

        drop(event_tx);
        task.await.unwrap();
    }
}
