//! Readback tickets.
//!
//! A readback is a ticket from `RenderBackend::request_read` plus whatever
//! context the requester wants back on completion. The queue owns both until
//! the data arrives, at which point ownership of the bytes and the context
//! moves to the caller.

use super::handle::{BufferId, ReadbackId};
use super::RenderBackend;
use crate::core::Result;

struct Pending<C> {
    buffer: BufferId,
    ticket: ReadbackId,
    context: C,
}

/// Outstanding reads tagged by source buffer.
pub struct ReadbackQueue<C> {
    pending: Vec<Pending<C>>,
}

impl<C> ReadbackQueue<C> {
    pub fn new() -> Self {
        Self { pending: Vec::new() }
    }

    /// Start a read of `size` bytes at `offset` in `buffer`.
    pub fn submit(
        &mut self,
        backend: &mut dyn RenderBackend,
        buffer: BufferId,
        offset: u64,
        size: u64,
        context: C,
    ) -> Result<()> {
        let ticket = backend.request_read(buffer, offset, size)?;
        self.pending.push(Pending { buffer, ticket, context });
        Ok(())
    }

    /// Collect every read that has completed, in submission order.
    pub fn poll(&mut self, backend: &mut dyn RenderBackend) -> Vec<(C, Result<Vec<u8>>)> {
        let mut done = Vec::new();
        let mut still_pending = Vec::with_capacity(self.pending.len());
        for p in self.pending.drain(..) {
            match backend.poll_read(p.ticket) {
                Some(result) => done.push((p.context, result)),
                None => still_pending.push(p),
            }
        }
        self.pending = still_pending;
        done
    }

    /// Block on every read of `buffer`.
    pub fn complete_for(
        &mut self,
        backend: &mut dyn RenderBackend,
        buffer: BufferId,
    ) -> Vec<(C, Result<Vec<u8>>)> {
        let (mine, rest): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|p| p.buffer == buffer);
        self.pending = rest;
        mine.into_iter()
            .map(|p| (p.context, backend.wait_read(p.ticket)))
            .collect()
    }

    /// Block on everything.
    pub fn complete_all(&mut self, backend: &mut dyn RenderBackend) -> Vec<(C, Result<Vec<u8>>)> {
        self.pending
            .drain(..)
            .map(|p| (p.context, backend.wait_read(p.ticket)))
            .collect()
    }

    pub fn has_pending(&self, buffer: BufferId) -> bool {
        self.pending.iter().any(|p| p.buffer == buffer)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<C> Default for ReadbackQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}
