//! Pending-call correlation and serial allocation.
//!
//! Every outbound method call that wants a reply gets an entry here, keyed
//! by its serial, installed *before* the frame is flushed so a fast peer
//! cannot race the table. Entries die in exactly one of three ways: a
//! matching reply, deadline expiry, or connection shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::message::Message;

/// Wrapping, zero-skipping serial source.
///
/// Serials are allocated from user threads as well as the engine loop, so
/// the counter is atomic. The sequence wraps from `u32::MAX` back to 1;
/// zero is never produced.
#[derive(Debug)]
pub struct SerialAllocator(AtomicU32);

impl Default for SerialAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialAllocator {
    pub fn new() -> Self {
        SerialAllocator(AtomicU32::new(1))
    }

    pub fn next(&self) -> u32 {
        loop {
            let serial = self.0.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }
}

/// Where a reply should go once it arrives.
pub enum PendingCompletion {
    /// Complete a caller-held sink.
    Sink(oneshot::Sender<Result<Message>>),
    /// Deliver the reply through the inbound pipeline instead.
    Route,
}

struct PendingCall {
    deadline: Instant,
    completion: PendingCompletion,
}

/// The per-connection correlation table. Only the engine loop touches it,
/// so it needs no lock.
#[derive(Default)]
pub struct PendingTable {
    calls: HashMap<u32, PendingCall>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Register a call before its frame is flushed.
    pub fn insert(&mut self, serial: u32, timeout: Duration, completion: PendingCompletion) {
        self.calls.insert(
            serial,
            PendingCall {
                deadline: Instant::now() + timeout,
                completion,
            },
        );
    }

    /// Remove and return the completion for `serial`, if registered.
    pub fn complete(&mut self, serial: u32) -> Option<PendingCompletion> {
        self.calls.remove(&serial).map(|call| call.completion)
    }

    /// Drop an entry without completing it (write failure, cancellation).
    pub fn forget(&mut self, serial: u32) {
        self.calls.remove(&serial);
    }

    /// The earliest deadline, for the engine's timer arm.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.calls.values().map(|call| call.deadline).min()
    }

    /// Remove every entry whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<(u32, PendingCompletion)> {
        let expired: Vec<u32> = self
            .calls
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(serial, _)| *serial)
            .collect();
        expired
            .into_iter()
            .filter_map(|serial| self.complete(serial).map(|c| (serial, c)))
            .collect()
    }

    /// Empty the table, failing every sink with `closed`.
    pub fn drain_with_closed(&mut self) {
        for (_, call) in self.calls.drain() {
            if let PendingCompletion::Sink(sink) = call.completion {
                let _ = sink.send(Err(Error::Closed));
            }
        }
    }
}
