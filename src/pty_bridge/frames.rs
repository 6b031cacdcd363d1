//! Frame grammar of the per-session stream transport.
//!
//! Binary frames are raw PTY bytes in both directions. Text frames are
//! either UTF-8 PTY bytes or, when they start with `{`, a JSON control
//! message with exactly one recognized top-level key.

use std::time::{Duration, Instant};

use log::debug;

/// Largest single frame accepted from a client; one byte more closes
/// the connection with a security violation.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;
/// Ceiling for a coalesced downstream batch.
pub const MAX_COALESCED_BYTES: usize = 32 * 1024;
/// How long the downstream pump waits for the next chunk before
/// flushing a batch.
pub const COALESCE_WINDOW: Duration = Duration::from_millis(2);
/// Capacity of the bounded channels between raw I/O and frame handling.
pub const PUMP_CHANNEL_CAPACITY: usize = 16;
/// Malformed control frames tolerated per flood window.
pub const BAD_FRAME_LIMIT: u32 = 16;
/// Length of the bad-frame accounting window.
pub const BAD_FRAME_WINDOW: Duration = Duration::from_secs(10);

/// A recognized control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Resize { cols: u16, rows: u16 },
}

/// Classification of an inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Plain bytes bound for PTY stdin.
    Data(Vec<u8>),
    Control(ControlMessage),
    /// Parsed but unrecognized or invalid control; dropped without
    /// counting.
    Ignored,
    /// Not valid JSON despite the `{` prefix; dropped and counted.
    Malformed,
}

/// Classifies one text frame per the transport grammar.
pub fn classify_text(text: &str) -> InboundFrame {
    if !text.starts_with('{') {
        return InboundFrame::Data(text.as_bytes().to_vec());
    }

    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => return InboundFrame::Malformed,
    };

    let Some(object) = value.as_object() else {
        return InboundFrame::Malformed;
    };

    if let Some(resize) = object.get("resize") {
        let Some(pair) = resize.as_array() else {
            debug!("Dropping resize control with non-array payload");
            return InboundFrame::Ignored;
        };
        if pair.len() != 2 {
            debug!("Dropping resize control with {} elements", pair.len());
            return InboundFrame::Ignored;
        }
        let (Some(cols), Some(rows)) = (pair[0].as_u64(), pair[1].as_u64()) else {
            return InboundFrame::Ignored;
        };
        if cols == 0 || rows == 0 || cols > u16::MAX as u64 || rows > u16::MAX as u64 {
            debug!("Dropping resize control with geometry {}x{}", cols, rows);
            return InboundFrame::Ignored;
        }
        return InboundFrame::Control(ControlMessage::Resize {
            cols: cols as u16,
            rows: rows as u16,
        });
    }

    debug!("Dropping unrecognized control message");
    InboundFrame::Ignored
}

/// Sliding-window counter for malformed control frames.
pub struct FloodWindow {
    window: Duration,
    limit: u32,
    started: Instant,
    count: u32,
}

impl FloodWindow {
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            window,
            limit,
            started: Instant::now(),
            count: 0,
        }
    }

    /// Records one bad frame; returns true once the window's budget is
    /// exceeded.
    pub fn record(&mut self, now: Instant) -> bool {
        if now.duration_since(self.started) > self.window {
            self.started = now;
            self.count = 0;
        }
        self.count += 1;
        self.count > self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_data() {
        assert_eq!(
            classify_text("echo hi\n"),
            InboundFrame::Data(b"echo hi\n".to_vec())
        );
    }

    #[test]
    fn resize_control_parses() {
        assert_eq!(
            classify_text(r#"{"resize":[132,40]}"#),
            InboundFrame::Control(ControlMessage::Resize {
                cols: 132,
                rows: 40
            })
        );
    }

    #[test]
    fn zero_geometry_resize_is_dropped() {
        assert_eq!(classify_text(r#"{"resize":[0,40]}"#), InboundFrame::Ignored);
        assert_eq!(classify_text(r#"{"resize":[132,0]}"#), InboundFrame::Ignored);
    }

    #[test]
    fn oversized_geometry_resize_is_dropped() {
        assert_eq!(
            classify_text(r#"{"resize":[70000,40]}"#),
            InboundFrame::Ignored
        );
    }

    #[test]
    fn wrong_arity_resize_is_dropped() {
        assert_eq!(classify_text(r#"{"resize":[132]}"#), InboundFrame::Ignored);
        assert_eq!(
            classify_text(r#"{"resize":[1,2,3]}"#),
            InboundFrame::Ignored
        );
    }

    #[test]
    fn unrecognized_control_is_dropped_without_counting() {
        assert_eq!(
            classify_text(r#"{"scroll":[1,2]}"#),
            InboundFrame::Ignored
        );
    }

    #[test]
    fn malformed_json_is_counted() {
        assert_eq!(classify_text("{not json"), InboundFrame::Malformed);
        assert_eq!(classify_text(r#"{"resize""#), InboundFrame::Malformed);
    }

    #[test]
    fn empty_object_is_ignored() {
        assert_eq!(classify_text("{}"), InboundFrame::Ignored);
    }

    #[test]
    fn flood_window_trips_past_limit() {
        let mut window = FloodWindow::new(Duration::from_secs(10), 3);
        let now = Instant::now();
        assert!(!window.record(now));
        assert!(!window.record(now));
        assert!(!window.record(now));
        assert!(window.record(now));
    }

    #[test]
    fn flood_window_resets_after_expiry() {
        let mut window = FloodWindow::new(Duration::from_millis(10), 2);
        let now = Instant::now();
        assert!(!window.record(now));
        assert!(!window.record(now));

        let later = now + Duration::from_millis(20);
        assert!(!window.record(later));
        assert!(!window.record(later));
        assert!(window.record(later));
    }
}
