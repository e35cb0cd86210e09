//! Last-seen timestamp plus a short-lived "just received" flag.
//!
//! The flag is modelled as a deadline instead of a scheduled reset task: every
//! arrival pushes the deadline out by the window, so the latest arrival always
//! wins and the flag reads false once the window passes with no traffic.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Recency {
    window: Duration,
    last_received: Option<DateTime<Utc>>,
    fresh_until: Option<Instant>,
}

impl Recency {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_received: None,
            fresh_until: None,
        }
    }

    /// Record an inbound message of any kind.
    pub fn mark(&mut self, at: DateTime<Utc>, now: Instant) {
        self.last_received = Some(at);
        self.fresh_until = Some(now + self.window);
    }

    pub fn last_received(&self) -> Option<DateTime<Utc>> {
        self.last_received
    }

    pub fn just_received(&self, now: Instant) -> bool {
        self.fresh_until.is_some_and(|until| now < until)
    }
}
