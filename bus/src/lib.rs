//! Bounded packet bus between one logical writer and one logical reader.
//!
//! Either side may be a pool of threads, each holding its own handle and
//! opening packets one at a time. The packet order the reader observes is
//! the order in which writers *opened* their packets, not the order in
//! which they closed them; a slow writer therefore never reorders the
//! stream, it only delays it. Capacity is a byte budget fixed at creation,
//! and a full bus blocks (or fails with [`BusError::Busy`] for try mode
//! opens) until the reader frees space.
//!
//! Payload bytes live in recycled heap blocks handed out through
//! [`WritePacket::dma`] / [`ReadPacket::dma`], so the common path is one
//! copy from the producer into the block and none on the consumer side.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// The buffer was cancelled. Sticky: every later operation fails the
    /// same way until the buffer is dropped.
    #[error("buffer cancelled")]
    Interrupted,
    /// A try mode open would have to wait for capacity.
    #[error("buffer busy")]
    Busy,
    /// Read or write cursor ran past the packet payload.
    #[error("cursor out of packet bounds")]
    OutOfBounds,
}

enum Slot {
    /// Ticket taken at open, payload not committed yet.
    Open,
    Committed(Vec<u8>),
    Cancelled,
}

struct State {
    used: usize,
    next_seq: u64,
    next_read: u64,
    slots: BTreeMap<u64, Slot>,
    pool: Vec<Vec<u8>>,
    cancelled: bool,
}

struct Shared {
    capacity: usize,
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
}

/// Cheap to clone; clones refer to the same bus.
#[derive(Clone)]
pub struct Buffer(Arc<Shared>);

const POOL_LIMIT: usize = 32;

impl Buffer {
    pub fn new(capacity: usize) -> Self {
        Self(Arc::new(Shared {
            capacity,
            state: Mutex::new(State {
                used: 0,
                next_seq: 0,
                next_read: 0,
                slots: BTreeMap::new(),
                pool: Vec::new(),
                cancelled: false,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
        }))
    }

    pub fn capacity(&self) -> usize {
        self.0.capacity
    }

    /// Poison the bus. Blocked and future operations fail with
    /// [`BusError::Interrupted`]. Idempotent.
    pub fn cancel(&self) {
        let mut state = self.0.state.lock();
        state.cancelled = true;
        self.0.readable.notify_all();
        self.0.writable.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.state.lock().cancelled
    }

    pub fn writer(&self) -> WriteHandle {
        WriteHandle {
            shared: self.0.clone(),
        }
    }

    pub fn reader(&self) -> ReadHandle {
        ReadHandle {
            shared: self.0.clone(),
        }
    }
}

/// One writer thread's endpoint. A thread opens at most one packet at a
/// time; the borrow rules enforce it.
pub struct WriteHandle {
    shared: Arc<Shared>,
}

impl WriteHandle {
    /// Block until the bus has free capacity, then take the next write
    /// ticket. The ticket position is what fixes the packet's place in the
    /// reader's order.
    pub fn open(&mut self) -> Result<WritePacket<'_>, BusError> {
        self.open_inner(false)
    }

    /// Like [`open`](Self::open) but fails with [`BusError::Busy`] instead
    /// of waiting.
    pub fn try_open(&mut self) -> Result<WritePacket<'_>, BusError> {
        self.open_inner(true)
    }

    fn open_inner(&mut self, try_mode: bool) -> Result<WritePacket<'_>, BusError> {
        let (seq, data) = {
            let mut state = self.shared.state.lock();
            loop {
                if state.cancelled {
                    return Err(BusError::Interrupted);
                }
                if state.used < self.shared.capacity {
                    break;
                }
                if try_mode {
                    return Err(BusError::Busy);
                }
                self.shared.writable.wait(&mut state);
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.slots.insert(seq, Slot::Open);
            let data = state.pool.pop().unwrap_or_default();
            (seq, data)
        };

        Ok(WritePacket {
            shared: &self.shared,
            seq,
            data,
            cursor: 0,
            len: 0,
            reserved: 0,
            explicit_size: None,
            try_mode,
            finished: false,
        })
    }
}

/// An open packet on the write side. Dropping it without
/// [`close`](Self::close) discards it.
pub struct WritePacket<'a> {
    shared: &'a Arc<Shared>,
    seq: u64,
    data: Vec<u8>,
    cursor: usize,
    /// Furthest byte written; the implicit commit size.
    len: usize,
    reserved: usize,
    explicit_size: Option<usize>,
    try_mode: bool,
    finished: bool,
}

impl WritePacket<'_> {
    /// Reserve payload bytes against the bus budget, waiting for the reader
    /// when the budget is exhausted. A packet that is the sole holder of
    /// bus bytes may overcommit, so a single oversized packet cannot
    /// deadlock the pipeline.
    fn reserve(&mut self, total: usize) -> Result<(), BusError> {
        if total <= self.reserved {
            return Ok(());
        }

        let need = total - self.reserved;
        let mut state = self.shared.state.lock();
        loop {
            if state.cancelled {
                return Err(BusError::Interrupted);
            }
            if state.used + need <= self.shared.capacity || state.used == self.reserved {
                break;
            }
            if self.try_mode {
                return Err(BusError::Busy);
            }
            self.shared.writable.wait(&mut state);
        }
        state.used += need;
        drop(state);

        self.reserved = total;
        self.data.resize(total, 0);
        Ok(())
    }

    pub fn write(&mut self, src: &[u8]) -> Result<(), BusError> {
        self.reserve(self.cursor + src.len())?;
        self.data[self.cursor..self.cursor + src.len()].copy_from_slice(src);
        self.cursor += src.len();
        self.len = self.len.max(self.cursor);
        Ok(())
    }

    /// Hand out an in-place region of `len` bytes at the cursor for the
    /// caller to fill, advancing the cursor.
    pub fn dma(&mut self, len: usize) -> Result<&mut [u8], BusError> {
        self.reserve(self.cursor + len)?;
        let start = self.cursor;
        self.cursor += len;
        self.len = self.len.max(self.cursor);
        Ok(&mut self.data[start..start + len])
    }

    pub fn seek(&mut self, offset: usize) {
        self.cursor = offset;
    }

    /// Commit size override. Stages that reserve a worst case allocation
    /// call this with the real size before closing.
    pub fn set_size(&mut self, size: usize) -> Result<(), BusError> {
        self.reserve(size)?;
        self.explicit_size = Some(size);
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.explicit_size.unwrap_or(self.len)
    }

    /// Commit. The packet becomes readable in open order.
    pub fn close(mut self) -> Result<(), BusError> {
        let size = self.size();
        let mut data = std::mem::take(&mut self.data);
        data.truncate(size);

        let mut state = self.shared.state.lock();
        self.finished = true;
        if state.cancelled {
            state.used -= self.reserved;
            state.slots.remove(&self.seq);
            return Err(BusError::Interrupted);
        }
        state.used -= self.reserved - size;
        state.slots.insert(self.seq, Slot::Committed(data));
        self.shared.readable.notify_all();
        if size < self.reserved {
            self.shared.writable.notify_all();
        }
        Ok(())
    }

    /// Discard the packet. Equivalent to dropping it.
    pub fn cancel(self) {}
}

impl Drop for WritePacket<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.shared.state.lock();
        state.used -= self.reserved;
        state.slots.insert(self.seq, Slot::Cancelled);
        self.shared.readable.notify_all();
        self.shared.writable.notify_all();
    }
}

/// One reader thread's endpoint.
pub struct ReadHandle {
    shared: Arc<Shared>,
}

impl ReadHandle {
    /// Block until the next packet in open order has been committed and
    /// take it. Cancelled packets are skipped silently.
    pub fn open(&mut self) -> Result<ReadPacket<'_>, BusError> {
        let data = {
            let mut state = self.shared.state.lock();
            loop {
                if state.cancelled {
                    return Err(BusError::Interrupted);
                }

                let seq = state.next_read;
                let ready = matches!(
                    state.slots.get(&seq),
                    Some(Slot::Committed(_) | Slot::Cancelled)
                );
                if !ready {
                    self.shared.readable.wait(&mut state);
                    continue;
                }

                state.next_read += 1;
                if let Some(Slot::Committed(data)) = state.slots.remove(&seq) {
                    break data;
                }
                // A cancelled ticket is skipped silently.
            }
        };

        Ok(ReadPacket {
            shared: &self.shared,
            data,
            cursor: 0,
        })
    }

    /// Take the next committed packet if one is ready, without blocking.
    pub fn try_open(&mut self) -> Result<Option<ReadPacket<'_>>, BusError> {
        let data = {
            let mut state = self.shared.state.lock();
            loop {
                if state.cancelled {
                    return Err(BusError::Interrupted);
                }

                let seq = state.next_read;
                let ready = matches!(
                    state.slots.get(&seq),
                    Some(Slot::Committed(_) | Slot::Cancelled)
                );
                if !ready {
                    return Ok(None);
                }

                state.next_read += 1;
                if let Some(Slot::Committed(data)) = state.slots.remove(&seq) {
                    break data;
                }
            }
        };

        Ok(Some(ReadPacket {
            shared: &self.shared,
            data,
            cursor: 0,
        }))
    }
}

/// A committed packet on the read side. Dropping it frees its bytes from
/// the bus budget.
pub struct ReadPacket<'a> {
    shared: &'a Arc<Shared>,
    data: Vec<u8>,
    cursor: usize,
}

impl ReadPacket<'_> {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn read(&mut self, dst: &mut [u8]) -> Result<(), BusError> {
        let src = self.dma(dst.len())?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Borrow `len` payload bytes in place at the cursor.
    pub fn dma(&mut self, len: usize) -> Result<&[u8], BusError> {
        if self.cursor + len > self.data.len() {
            return Err(BusError::OutOfBounds);
        }
        let start = self.cursor;
        self.cursor += len;
        Ok(&self.data[start..start + len])
    }

    /// Remaining payload from the cursor to the end.
    pub fn rest(&mut self) -> &[u8] {
        let start = self.cursor;
        self.cursor = self.data.len();
        &self.data[start..]
    }

    pub fn close(self) {}
}

impl Drop for ReadPacket<'_> {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        let mut state = self.shared.state.lock();
        state.used = state.used.saturating_sub(data.len());
        if state.pool.len() < POOL_LIMIT {
            let mut data = data;
            data.clear();
            state.pool.push(data);
        }
        self.shared.writable.notify_all();
    }
}
