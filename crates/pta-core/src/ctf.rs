// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! CTF timing window.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Where the competition stands relative to its configured window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CtfStatus {
    /// Before the start time.
    NotStarted,
    /// Inside the window.
    Active,
    /// After the end time.
    Ended,
    /// No window configured; behaves as active.
    NoTiming,
}

impl CtfStatus {
    /// Whether submissions are accepted from non-admins.
    pub fn accepts_submissions(&self) -> bool {
        matches!(self, CtfStatus::Active | CtfStatus::NoTiming)
    }
}

/// Configured start/end times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CtfWindow {
    /// Opening time; open-ended when unset.
    pub start: Option<DateTime<Utc>>,
    /// Closing time; open-ended when unset.
    pub end: Option<DateTime<Utc>>,
}

impl CtfWindow {
    /// Window with optional bounds.
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    /// Status at `now`. Both bounds must be set for timing to apply.
    pub fn status(&self, now: DateTime<Utc>) -> CtfStatus {
        match (self.start, self.end) {
            (Some(start), Some(end)) => {
                if now < start {
                    CtfStatus::NotStarted
                } else if now > end {
                    CtfStatus::Ended
                } else {
                    CtfStatus::Active
                }
            }
            _ => CtfStatus::NoTiming,
        }
    }
}
