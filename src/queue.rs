//! Outbound queue and flood limiter.
//!
//! Every JOIN/PART/QUIT/PRIVMSG/ACTION goes through a per-instance FIFO of
//! queued lines. Draining is clocked: at most [`FLOOD_LINES`] wire lines
//! leave per [`FLOOD_INTERVAL`], and payload-bearing verbs are split into
//! lines of at most [`MAX_WIRE_LINE`] bytes, budgeting for the 63-byte host
//! prefix the server will prepend when relaying. An unsent tail is
//! re-enqueued at the front so continuations keep their place in line.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::colors::rewrite_markup;

/// Maximum wire lines transmitted per flood interval.
pub const FLOOD_LINES: usize = 4;

/// The flood window.
pub const FLOOD_INTERVAL: Duration = Duration::from_secs(1);

/// Hard limit for one wire line, terminating CRLF included.
pub const MAX_WIRE_LINE: usize = 512;

/// Bytes reserved for the `:nick!user@host` prefix the server prepends.
const HOST_BUDGET: usize = 63;

/// The verbs a queued line can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `JOIN <target>`
    Join,
    /// `PART <target>`
    Part,
    /// `QUIT :<target>` - the target slot carries the quit reason.
    Quit,
    /// `PRIVMSG <target> :<payload>`
    Privmsg,
    /// `PRIVMSG <target> :\x01ACTION <payload>\x01`
    Action,
}

impl LineKind {
    /// Bytes the verb consumes on the wire before target and payload.
    fn base_len(self) -> usize {
        match self {
            LineKind::Privmsg => 12,
            LineKind::Action => 22,
            _ => 0,
        }
    }

    fn render(self, target: &str, payload: &str) -> String {
        match self {
            LineKind::Join => format!("JOIN {target}\r\n"),
            LineKind::Part => format!("PART {target}\r\n"),
            LineKind::Quit => format!("QUIT :{target}\r\n"),
            LineKind::Privmsg => format!("PRIVMSG {target} :{payload}\r\n"),
            LineKind::Action => format!("PRIVMSG {target} :\x01ACTION {payload}\x01\r\n"),
        }
    }
}

/// One queued outbound line.
#[derive(Debug, Clone)]
pub struct QueuedLine {
    target: String,
    payload: Option<String>,
    kind: LineKind,
}

/// Per-instance FIFO of pending lines plus the flood clock.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: VecDeque<QueuedLine>,
    last_transmit: Option<Instant>,
}

impl OutboundQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a JOIN.
    pub fn join(&mut self, channel: &str) {
        self.push_standard(channel, LineKind::Join);
    }

    /// Queue a PART.
    pub fn part(&mut self, channel: &str) {
        self.push_standard(channel, LineKind::Part);
    }

    /// Queue a QUIT with the given reason.
    pub fn quit(&mut self, reason: &str) {
        self.push_standard(reason, LineKind::Quit);
    }

    /// Queue a PRIVMSG; colour markup is rewritten here.
    pub fn privmsg(&mut self, target: &str, text: &str) {
        self.push_payload(target, text, LineKind::Privmsg);
    }

    /// Queue a CTCP ACTION; colour markup is rewritten here.
    pub fn action(&mut self, target: &str, text: &str) {
        self.push_payload(target, text, LineKind::Action);
    }

    fn push_standard(&mut self, target: &str, kind: LineKind) {
        self.entries.push_back(QueuedLine {
            target: target.to_string(),
            payload: None,
            kind,
        });
    }

    fn push_payload(&mut self, target: &str, text: &str, kind: LineKind) {
        self.entries.push_back(QueuedLine {
            target: target.to_string(),
            payload: Some(rewrite_markup(text)),
            kind,
        });
    }

    /// Number of queued entries (continuation tails count as one).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain up to [`FLOOD_LINES`] wire lines if the flood window allows.
    ///
    /// Returns the rendered lines, CRLF included. A payload too large for
    /// one line is split at UTF-8 boundaries; if the batch fills mid-split
    /// the remaining tail goes back to the front of the queue.
    pub fn drain(&mut self, now: Instant) -> Vec<String> {
        if let Some(last) = self.last_transmit {
            if now.duration_since(last) <= FLOOD_INTERVAL {
                return Vec::new();
            }
        }

        let mut lines = Vec::new();
        while lines.len() < FLOOD_LINES {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };

            match entry.payload {
                None => lines.push(entry.kind.render(&entry.target, "")),
                Some(payload) => {
                    let budget = payload_budget(entry.kind, &entry.target);
                    let mut rest = payload.as_str();
                    while rest.len() > budget {
                        let (head, tail) = split_at_boundary(rest, budget);
                        if head.is_empty() {
                            // A budget smaller than one codepoint; give up
                            // on splitting rather than spin.
                            break;
                        }
                        lines.push(entry.kind.render(&entry.target, head));
                        rest = tail;
                        if lines.len() == FLOOD_LINES {
                            self.entries.push_front(QueuedLine {
                                target: entry.target.clone(),
                                payload: Some(rest.to_string()),
                                kind: entry.kind,
                            });
                            self.last_transmit = Some(now);
                            return lines;
                        }
                    }
                    lines.push(entry.kind.render(&entry.target, rest));
                }
            }
        }

        if !lines.is_empty() {
            self.last_transmit = Some(now);
        }
        lines
    }
}

/// Payload bytes that fit in one wire line for this verb and target.
fn payload_budget(kind: LineKind, target: &str) -> usize {
    MAX_WIRE_LINE
        .saturating_sub(kind.base_len() + target.len() + HOST_BUDGET)
        .max(1)
}

/// Split at the largest UTF-8 boundary not exceeding `max`.
fn split_at_boundary(s: &str, max: usize) -> (&str, &str) {
    let mut end = max.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.split_at(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_standard_lines() {
        let mut q = OutboundQueue::new();
        q.join("#a");
        q.part("#a");
        q.quit("bye");
        let lines = q.drain(Instant::now());
        assert_eq!(lines, vec!["JOIN #a\r\n", "PART #a\r\n", "QUIT :bye\r\n"]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_privmsg_and_action_render() {
        let mut q = OutboundQueue::new();
        q.privmsg("#c", "hello");
        q.action("#c", "waves");
        let lines = q.drain(Instant::now());
        assert_eq!(lines[0], "PRIVMSG #c :hello\r\n");
        assert_eq!(lines[1], "PRIVMSG #c :\x01ACTION waves\x01\r\n");
    }

    #[test]
    fn test_markup_rewritten_at_enqueue() {
        let mut q = OutboundQueue::new();
        q.privmsg("#c", "[B]hi[/B]");
        let lines = q.drain(Instant::now());
        assert_eq!(lines[0], "PRIVMSG #c :\x02hi\x02\r\n");
    }

    #[test]
    fn test_flood_limit_and_window() {
        let start = Instant::now();
        let mut q = OutboundQueue::new();
        for _ in 0..6 {
            q.action("#c", "x");
        }

        assert_eq!(q.drain(start).len(), 4);
        // Within the window nothing more goes out.
        assert!(q.drain(start + Duration::from_millis(500)).is_empty());
        // After the window the remainder drains.
        assert_eq!(q.drain(start + secs(2)).len(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_window_restarts_after_partial_batch() {
        let start = Instant::now();
        let mut q = OutboundQueue::new();
        q.privmsg("#c", "one");
        assert_eq!(q.drain(start).len(), 1);

        q.privmsg("#c", "two");
        // A transmitting drain arms the clock even when under the cap.
        assert!(q.drain(start + Duration::from_millis(100)).is_empty());
        assert_eq!(q.drain(start + secs(2)).len(), 1);
    }

    #[test]
    fn test_long_payload_split_and_reassembled() {
        let mut q = OutboundQueue::new();
        let payload = "abcdefgh".repeat(200); // 1600 bytes
        q.privmsg("#c", &payload);

        let mut collected = String::new();
        let mut now = Instant::now();
        loop {
            let lines = q.drain(now);
            if lines.is_empty() && q.is_empty() {
                break;
            }
            for line in lines {
                assert!(line.len() <= MAX_WIRE_LINE);
                let body = line
                    .strip_prefix("PRIVMSG #c :")
                    .and_then(|s| s.strip_suffix("\r\n"))
                    .unwrap();
                collected.push_str(body);
            }
            now += secs(2);
        }
        assert_eq!(collected, payload);
    }

    #[test]
    fn test_split_honors_utf8_boundaries() {
        let mut q = OutboundQueue::new();
        let payload = "é".repeat(400); // 800 bytes of two-byte chars
        q.privmsg("#c", &payload);

        let mut now = Instant::now();
        let mut collected = String::new();
        loop {
            let lines = q.drain(now);
            if lines.is_empty() && q.is_empty() {
                break;
            }
            for line in lines {
                let body = line
                    .strip_prefix("PRIVMSG #c :")
                    .and_then(|s| s.strip_suffix("\r\n"))
                    .unwrap();
                collected.push_str(body);
            }
            now += secs(2);
        }
        assert_eq!(collected, payload);
    }

    #[test]
    fn test_tail_requeued_at_front() {
        let mut q = OutboundQueue::new();
        let long = "z".repeat(2000);
        q.privmsg("#c", &long);
        q.privmsg("#c", "after");

        let start = Instant::now();
        let first = q.drain(start);
        assert_eq!(first.len(), 4);

        // The continuation precedes the later entry.
        let second = q.drain(start + secs(2));
        let body = second[0]
            .strip_prefix("PRIVMSG #c :")
            .and_then(|s| s.strip_suffix("\r\n"))
            .unwrap();
        assert!(body.starts_with('z'));
        let last = second.last().unwrap();
        assert_eq!(last, "PRIVMSG #c :after\r\n");
    }
}
