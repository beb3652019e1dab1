//! View-mode controller: live tailing vs time-travel inspection.
//!
//! The UI renders a virtual list of `steps ++ [final outcome, if present]`.
//! [`ViewController`] decides which element is active:
//!
//! - **Live**: always the newest element — the view tails the stream.
//! - **Inspecting(i)**: pinned to element `i`; new data arriving never
//!   forces a jump, only an explicit "go live" does.
//!
//! Scroll position is reconciled through the narrow
//! [`ViewController::report_visible_center`] interface so the geometry
//! detection (which element is on screen) stays on the rendering side and
//! this logic stays headless-testable. Programmatic scrolls are ignored via
//! a time-boxed reentrancy guard, so the controller never chases its own
//! scrolling.
//!
//! [`ThinkingTimer`] drives the "agent is thinking" indicator: visible once
//! the trace has been streaming for 5 seconds without a new step, cleared
//! immediately by the next step or a terminal outcome. The anchor is the
//! stored instant streaming (re)started, so cancellation is just clearing
//! the anchor — no timer can fire against a torn-down trace.

use std::time::Duration;

use tokio::time::Instant;

/// How long "thinking" waits before showing.
pub const THINKING_DELAY: Duration = Duration::from_secs(5);
/// How long scroll reconciliation ignores moves we triggered ourselves.
const PROGRAMMATIC_SCROLL_GUARD: Duration = Duration::from_millis(300);
/// Layout-settle debounce before measuring/scrolling, per mode.
pub const LIVE_SCROLL_SETTLE: Duration = Duration::from_millis(50);
pub const INSPECT_SCROLL_SETTLE: Duration = Duration::from_millis(120);

/// Current UI mode over the virtual list `steps ++ [final]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewMode {
    /// Tail the stream; selection is implicit (the newest element).
    #[default]
    Live,
    /// Pinned to a historical element by index.
    Inspecting(usize),
}

#[derive(Debug, Default)]
pub struct ViewController {
    mode: ViewMode,
    ignore_scroll_until: Option<Instant>,
}

impl ViewController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> ViewMode {
        self.mode
    }

    /// Pin to a specific step index.
    pub fn inspect_step(&mut self, index: usize) {
        self.mode = ViewMode::Inspecting(index);
    }

    /// Pin to the final-outcome marker (index `steps_len` in the virtual
    /// list).
    pub fn inspect_final(&mut self, steps_len: usize) {
        self.mode = ViewMode::Inspecting(steps_len);
    }

    /// Resume tailing.
    pub fn go_live(&mut self) {
        self.mode = ViewMode::Live;
    }

    /// A click on element `index`. Clicking the element that is currently
    /// streaming in means "follow along" — that is live mode, not a pin.
    pub fn click(&mut self, index: usize, streaming_index: Option<usize>) {
        if streaming_index == Some(index) {
            self.mode = ViewMode::Live;
        } else {
            self.mode = ViewMode::Inspecting(index);
        }
    }

    /// The element to render, if any. In live mode this is the last element;
    /// an inspecting index is clamped so it stays valid if the list shrank
    /// (a new `agent_start` resetting the trace).
    pub fn active_index(&self, steps_len: usize, has_final: bool) -> Option<usize> {
        let len = steps_len + usize::from(has_final);
        if len == 0 {
            return None;
        }
        match self.mode {
            ViewMode::Live => Some(len - 1),
            ViewMode::Inspecting(i) => Some(i.min(len - 1)),
        }
    }

    /// The element auto-scroll should move to after this state change, with
    /// the settle delay to debounce before measuring layout.
    pub fn scroll_target(&self, steps_len: usize, has_final: bool) -> Option<(usize, Duration)> {
        let index = self.active_index(steps_len, has_final)?;
        let settle = match self.mode {
            ViewMode::Live => LIVE_SCROLL_SETTLE,
            ViewMode::Inspecting(_) => INSPECT_SCROLL_SETTLE,
        };
        Some((index, settle))
    }

    /// Mark the start of a scroll this controller itself requested. Samples
    /// arriving within the guard window are ignored; the guard expires on
    /// its own so a lost "scroll finished" callback cannot wedge it.
    pub fn begin_programmatic_scroll(&mut self, now: Instant) {
        self.ignore_scroll_until = Some(now + PROGRAMMATIC_SCROLL_GUARD);
    }

    /// User-driven scroll reconciliation: the renderer reports the element
    /// nearest the viewport center and the selection follows it, keeping the
    /// step list and the timeline in agreement with what is on screen.
    ///
    /// Inactive while the trace is running (live auto-scroll owns the
    /// viewport then) and while the programmatic-scroll guard is armed.
    pub fn report_visible_center(
        &mut self,
        center: usize,
        steps_len: usize,
        has_final: bool,
        running: bool,
        now: Instant,
    ) {
        if running {
            return;
        }
        if let Some(until) = self.ignore_scroll_until {
            if now < until {
                return;
            }
            self.ignore_scroll_until = None;
        }

        let len = steps_len + usize::from(has_final);
        if len == 0 {
            return;
        }
        let center = center.min(len - 1);
        // Scrolling to the newest element while already live stays live.
        if self.mode == ViewMode::Live && center == len - 1 {
            return;
        }
        self.mode = ViewMode::Inspecting(center);
    }
}

/// Cancelable delayed "agent is thinking" indicator.
#[derive(Debug, Default)]
pub struct ThinkingTimer {
    anchor: Option<Instant>,
}

impl ThinkingTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Streaming is live (past the sandbox wait). Arms the timer if it is
    /// not already running.
    pub fn on_streaming(&mut self, now: Instant) {
        if self.anchor.is_none() {
            self.anchor = Some(now);
        }
    }

    /// A new step arrived: whatever the agent was thinking about is on
    /// screen now. Restart the delay from here.
    pub fn on_step(&mut self, now: Instant) {
        self.anchor = Some(now);
    }

    /// Terminal outcome or streaming stopped: cancel outright.
    pub fn clear(&mut self) {
        self.anchor = None;
    }

    pub fn visible(&self, now: Instant) -> bool {
        match self.anchor {
            Some(anchor) => now.duration_since(anchor) >= THINKING_DELAY,
            None => false,
        }
    }

    /// The instant the indicator would become visible, for event loops that
    /// want to sleep exactly until then.
    pub fn deadline(&self) -> Option<Instant> {
        self.anchor.map(|a| a + THINKING_DELAY)
    }
}

/// One-shot, re-armable deadline used to let layout settle before acting.
#[derive(Debug, Default)]
pub struct Debounce {
    deadline: Option<Instant>,
}

impl Debounce {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re-)arm; a pending deadline is superseded, not stacked.
    pub fn arm(&mut self, now: Instant, settle: Duration) {
        self.deadline = Some(now + settle);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// True exactly once per arming, when the deadline has passed.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(d) if now >= d => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn pending(&self) -> bool {
        self.deadline.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn live_mode_tails_the_stream() {
        let view = ViewController::new();
        assert_eq!(view.active_index(3, false), Some(2));
        assert_eq!(view.active_index(3, true), Some(3));
        assert_eq!(view.active_index(0, false), None);
    }

    #[tokio::test]
    async fn inspecting_survives_new_steps() {
        let mut view = ViewController::new();
        view.inspect_step(2);
        // Step 6 arrives — selection must not jump.
        assert_eq!(view.active_index(6, false), Some(2));
        view.go_live();
        assert_eq!(view.active_index(6, false), Some(5));
    }

    #[tokio::test]
    async fn clicking_the_streaming_step_goes_live() {
        let mut view = ViewController::new();
        view.inspect_step(1);
        view.click(4, Some(4));
        assert_eq!(view.mode(), ViewMode::Live);
        view.click(2, Some(4));
        assert_eq!(view.mode(), ViewMode::Inspecting(2));
    }

    #[tokio::test]
    async fn inspecting_index_clamps_after_trace_reset() {
        let mut view = ViewController::new();
        view.inspect_step(7);
        assert_eq!(view.active_index(2, false), Some(1));
    }

    #[tokio::test]
    async fn inspect_final_pins_the_outcome_marker() {
        let mut view = ViewController::new();
        view.inspect_final(5);
        assert_eq!(view.active_index(5, true), Some(5));
    }

    #[tokio::test]
    async fn scroll_reconciliation_updates_selection() {
        let mut view = ViewController::new();
        let now = Instant::now();
        view.report_visible_center(2, 5, true, false, now);
        assert_eq!(view.mode(), ViewMode::Inspecting(2));
    }

    #[tokio::test]
    async fn scroll_reconciliation_is_inert_while_running() {
        let mut view = ViewController::new();
        view.report_visible_center(1, 5, false, true, Instant::now());
        assert_eq!(view.mode(), ViewMode::Live);
    }

    #[tokio::test]
    async fn programmatic_scrolls_are_ignored_until_guard_expires() {
        let mut view = ViewController::new();
        let now = Instant::now();
        view.begin_programmatic_scroll(now);
        view.report_visible_center(1, 5, false, false, now + Duration::from_millis(100));
        assert_eq!(view.mode(), ViewMode::Live);

        view.report_visible_center(1, 5, false, false, now + Duration::from_millis(400));
        assert_eq!(view.mode(), ViewMode::Inspecting(1));
    }

    #[tokio::test]
    async fn scrolling_to_the_tail_keeps_live_mode() {
        let mut view = ViewController::new();
        view.report_visible_center(4, 5, false, false, Instant::now());
        assert_eq!(view.mode(), ViewMode::Live);
    }

    #[tokio::test]
    async fn thinking_shows_after_delay_without_steps() {
        let mut thinking = ThinkingTimer::new();
        let now = Instant::now();
        thinking.on_streaming(now);
        assert!(!thinking.visible(now + Duration::from_secs(4)));
        assert!(thinking.visible(now + Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn new_step_cancels_thinking_before_next_render() {
        let mut thinking = ThinkingTimer::new();
        let now = Instant::now();
        thinking.on_streaming(now);
        let shown_at = now + Duration::from_secs(6);
        assert!(thinking.visible(shown_at));
        thinking.on_step(shown_at);
        assert!(!thinking.visible(shown_at));
        // And shows again 5s after that step.
        assert!(thinking.visible(shown_at + Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn terminal_clears_thinking_immediately() {
        let mut thinking = ThinkingTimer::new();
        let now = Instant::now();
        thinking.on_streaming(now);
        thinking.clear();
        assert!(!thinking.visible(now + Duration::from_secs(10)));
        assert!(thinking.deadline().is_none());
    }

    #[tokio::test]
    async fn streaming_does_not_rearm_a_running_timer() {
        let mut thinking = ThinkingTimer::new();
        let now = Instant::now();
        thinking.on_streaming(now);
        thinking.on_streaming(now + Duration::from_secs(3));
        // Anchor stays at the original start.
        assert!(thinking.visible(now + Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn debounce_fires_once_per_arm() {
        let mut debounce = Debounce::new();
        let now = Instant::now();
        debounce.arm(now, LIVE_SCROLL_SETTLE);
        assert!(!debounce.fire(now));
        assert!(debounce.fire(now + Duration::from_millis(60)));
        assert!(!debounce.fire(now + Duration::from_millis(120)));
    }

    #[tokio::test]
    async fn debounce_rearm_supersedes_and_cancel_discards() {
        let mut debounce = Debounce::new();
        let now = Instant::now();
        debounce.arm(now, INSPECT_SCROLL_SETTLE);
        debounce.arm(now + Duration::from_millis(100), INSPECT_SCROLL_SETTLE);
        assert!(!debounce.fire(now + Duration::from_millis(150)));
        assert!(debounce.fire(now + Duration::from_millis(220)));

        debounce.arm(now, INSPECT_SCROLL_SETTLE);
        debounce.cancel();
        assert!(!debounce.fire(now + Duration::from_secs(1)));
        assert!(!debounce.pending());
    }
}
