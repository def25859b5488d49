// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

//! Progress reporting for the watcher lifecycle
//!
//! The watcher publishes listing/sync/watch transitions here; the CLI
//! subscribes to drive its spinner and periodic status lines.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

/// Create a spinner with consistent styling
pub fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.cyan} {msg} {elapsed:.dim}")
    {
        pb.set_style(style);
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(80));
    pb
}

/// Progress update message
#[derive(Clone, Debug)]
pub enum ProgressUpdate {
    /// Full pod listing started
    Listing { generation: usize },
    /// Maps rebuilt from a listing
    Synced {
        generation: usize,
        pods: usize,
        images: usize,
        workloads: usize,
        errors: usize,
        elapsed_ms: u64,
    },
    /// Watch stream opened
    Watching { resource_version: String },
    /// Watch stream ended; `reason` is set when it failed
    StreamClosed { reason: Option<String> },
    /// Maps cleared, relisting
    Resyncing { generation: usize },
}

/// Lifecycle reporter shared between the watcher and its observers
pub struct ProgressReporter {
    sender: broadcast::Sender<ProgressUpdate>,
    /// Completed full listings
    generations: AtomicUsize,
    /// Pod events applied since the last sync
    events: AtomicUsize,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self {
            sender,
            generations: AtomicUsize::new(0),
            events: AtomicUsize::new(0),
        }
    }

    /// Subscribe to progress updates
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.sender.subscribe()
    }

    /// Report a full listing start
    pub fn listing(&self) {
        let generation = self.generations.load(Ordering::SeqCst);
        let _ = self.sender.send(ProgressUpdate::Listing { generation });
    }

    /// Report a completed rebuild and start a new generation
    pub fn synced(
        &self,
        pods: usize,
        images: usize,
        workloads: usize,
        errors: usize,
        elapsed_ms: u64,
    ) {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst);
        self.events.store(0, Ordering::SeqCst);
        let _ = self.sender.send(ProgressUpdate::Synced {
            generation,
            pods,
            images,
            workloads,
            errors,
            elapsed_ms,
        });
    }

    /// Report the watch stream opening
    pub fn watching(&self, resource_version: &str) {
        let _ = self.sender.send(ProgressUpdate::Watching {
            resource_version: resource_version.to_string(),
        });
    }

    /// Count one applied pod event
    pub fn event_applied(&self) {
        self.events.fetch_add(1, Ordering::SeqCst);
    }

    /// Report the watch stream ending
    pub fn stream_closed(&self, reason: Option<String>) {
        let _ = self.sender.send(ProgressUpdate::StreamClosed { reason });
    }

    /// Report a resync
    pub fn resyncing(&self) {
        let generation = self.generations.load(Ordering::SeqCst);
        let _ = self.sender.send(ProgressUpdate::Resyncing { generation });
    }

    /// Get current progress (completed syncs, events since last sync)
    pub fn progress(&self) -> (usize, usize) {
        (
            self.generations.load(Ordering::SeqCst),
            self.events.load(Ordering::SeqCst),
        )
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe handle to progress reporter
pub type ProgressHandle = Arc<ProgressReporter>;

/// Create a new progress reporter handle
pub fn create_progress_handle() -> ProgressHandle {
    Arc::new(ProgressReporter::new())
}
