// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Percentage of the file sent so far. An empty file counts as complete.
pub fn percent(sent: u32, total: u32) -> f64 {
    if total == 0 {
        return 100.0;
    }
    sent as f64 / total as f64 * 100.0
}

/// Receives the user-facing output of a session
pub trait Reporter: Send {
    /// One line of status text
    fn status(&mut self, message: &str);

    /// Transfer progress after a chunk was written
    fn progress(&mut self, sent: u32, total: u32);
}

/// Prints status lines and keeps a single `Progress: NN.N%` line updated in place
pub struct ConsoleReporter {
    bar: Option<ProgressBar>,
    draw_target: fn() -> ProgressDrawTarget,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        ConsoleReporter {
            bar: None,
            draw_target: ProgressDrawTarget::stdout,
        }
    }
}

fn progress_bar(total: u32, draw_target: ProgressDrawTarget) -> ProgressBar {
    let bar = ProgressBar::with_draw_target(Some(total as u64), draw_target);
    bar.set_style(
        ProgressStyle::with_template("Progress: {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

impl Reporter for ConsoleReporter {
    fn status(&mut self, message: &str) {
        match &self.bar {
            Some(bar) if !bar.is_finished() => bar.suspend(|| println!("{}", message)),
            _ => println!("{}", message),
        }
    }

    fn progress(&mut self, sent: u32, total: u32) {
        let draw_target = self.draw_target;
        let bar = self
            .bar
            .get_or_insert_with(|| progress_bar(total, draw_target()));

        bar.set_position(sent as u64);
        bar.set_message(format!("{:.1}%", percent(sent, total)));
        if sent >= total {
            bar.finish();
        }
    }
}

// ============================================================================
// Recording Reporter for Testing
// ============================================================================

#[cfg(test)]
use std::sync::{Arc, Mutex};

#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Status(String),
    Progress(f64),
}

#[cfg(test)]
#[derive(Clone, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<Event>>>,
}

#[cfg(test)]
impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn progress_values(&self) -> Vec<f64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Progress(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn count_status(&self, needle: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Status(s) if s.contains(needle)))
            .count()
    }
}

#[cfg(test)]
impl Reporter for RecordingReporter {
    fn status(&mut self, message: &str) {
        self.events.lock().unwrap().push(Event::Status(message.to_string()));
    }

    fn progress(&mut self, sent: u32, total: u32) {
        self.events.lock().unwrap().push(Event::Progress(percent(sent, total)));
    }
}
