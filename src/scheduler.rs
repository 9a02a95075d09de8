//! Outbound send queue.
//!
//! Most writes go straight to the transport. Writes flagged `sync`, chopped writes, and
//! anything written while the queue is not empty are queued instead and paced out one
//! entry per reactor turn, so each one leaves as a separate transport write.
use std::{collections::VecDeque, time::Duration};

use bytes::Bytes;

use crate::{Result, WebSocketError};

/// Delay between two paced writes.
pub const QUEUED_WRITE_DELAY: Duration = Duration::from_micros(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendQueueEntry {
    pub bytes: Bytes,
    pub sync: bool,
}

/// What the caller must do after [`SendScheduler::enqueue`].
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// Nothing is pending: write these bytes now.
    WriteNow(Bytes),
    /// The bytes were queued. Start pacing if it is not running yet.
    Queued,
}

/// FIFO of pending writes and the state of the pacing loop.
#[derive(Debug, Default)]
pub struct SendScheduler {
    queue: VecDeque<SendQueueEntry>,
    triggered: bool,
}

impl SendScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `bytes`, or hands them back for a direct write.
    ///
    /// With a `chopsize`, the bytes are split into `chopsize` sized entries that are
    /// always queued.
    pub fn enqueue(&mut self, bytes: Bytes, sync: bool, chopsize: Option<usize>) -> Result<Enqueued> {
        if let Some(chopsize) = chopsize {
            if chopsize == 0 {
                return Err(WebSocketError::InvalidFragmentSize);
            }

            let mut rest = bytes;
            while rest.len() > chopsize {
                let chunk = rest.split_to(chopsize);
                self.queue.push_back(SendQueueEntry {
                    bytes: chunk,
                    sync: true,
                });
            }
            self.queue.push_back(SendQueueEntry {
                bytes: rest,
                sync: true,
            });
            return Ok(Enqueued::Queued);
        }

        if sync || !self.queue.is_empty() {
            self.queue.push_back(SendQueueEntry { bytes, sync });
            Ok(Enqueued::Queued)
        } else {
            Ok(Enqueued::WriteNow(bytes))
        }
    }

    /// Marks the pacing loop as running. Returns `false` when it already was.
    pub fn trigger(&mut self) -> bool {
        !std::mem::replace(&mut self.triggered, true)
    }

    /// Next entry to write. When the queue is empty, the pacing loop stops.
    pub fn pop(&mut self) -> Option<SendQueueEntry> {
        let entry = self.queue.pop_front();
        if entry.is_none() {
            self.triggered = false;
        }
        entry
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Takes every pending entry and stops the pacing loop.
    pub fn drain(&mut self) -> Vec<SendQueueEntry> {
        self.triggered = false;
        self.queue.drain(..).collect()
    }
}
