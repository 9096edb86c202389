//! Per-class outbound rate limiting.

use std::time::Duration;

use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(1);

/// Traffic that is never rate limited: dropping any of it leaves the server's
/// view of the editor inconsistent.
const EXEMPT_METHODS: &[&str] = &[
    "initialize",
    "initialized",
    "shutdown",
    "exit",
    "textDocument/didOpen",
    "textDocument/didSave",
    "textDocument/didClose",
    "completionItem/resolve",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrafficClass {
    Request,
    Notification,
}

#[derive(Debug, Default)]
struct HitrateCounter {
    count: u32,
    window_end: Option<Instant>,
}

impl HitrateCounter {
    fn admit(&mut self, limit: u32, now: Instant) -> bool {
        match self.window_end {
            Some(end) if now < end => {}
            _ => {
                self.count = 0;
                self.window_end = Some(now + WINDOW);
            }
        }
        if self.count >= limit {
            return false;
        }
        self.count += 1;
        true
    }
}

#[derive(Debug)]
pub(crate) struct Hitrate {
    limit: u32,
    requests: HitrateCounter,
    notifications: HitrateCounter,
}

impl Hitrate {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            requests: HitrateCounter::default(),
            notifications: HitrateCounter::default(),
        }
    }

    /// Count one message of `class` against the current window. Exempt
    /// methods are always admitted and not counted.
    pub fn admit(&mut self, class: TrafficClass, method: &str, now: Instant) -> bool {
        if is_exempt(method) {
            return true;
        }
        let counter = match class {
            TrafficClass::Request => &mut self.requests,
            TrafficClass::Notification => &mut self.notifications,
        };
        counter.admit(self.limit, now)
    }

    pub fn reset(&mut self) {
        self.requests = HitrateCounter::default();
        self.notifications = HitrateCounter::default();
    }
}

fn is_exempt(method: &str) -> bool {
    EXEMPT_METHODS.contains(&method)
}
