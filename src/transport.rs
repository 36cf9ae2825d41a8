//! Bounded message transport from probes and hooks to the event consumer.
//!
//! A fixed pool of record buffers backs the queue. Producers take a buffer
//! with [`Transport::acquire_record`], fill the payload and hand it back
//! with [`Transport::flush`]. When every buffer is either being filled or
//! waiting for the consumer, acquisition fails with `Backpressure` and the
//! event is counted as dropped; producers never block. [`Transport::drain`]
//! moves delivered records to the consumer and recycles their buffers.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::event::{Event, HEADER_LEN, RecordKind};

/// When a flushed record becomes visible to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Visible at once.
    Immediate,
    /// Held until the batch fills or [`Transport::flush_batch`] is called.
    Batched,
}

/// A record buffer checked out of the pool. Dropping it unflushed returns
/// the buffer without delivering anything.
pub struct RecordSlot<'a> {
    transport: &'a Transport,
    kind: RecordKind,
    buf: Option<Vec<u8>>,
}

impl RecordSlot<'_> {
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Writable payload area, `max_payload` bytes long.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        match self.buf.as_mut() {
            Some(buf) => &mut buf[HEADER_LEN..],
            None => &mut [],
        }
    }
}

impl Drop for RecordSlot<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.transport.recycle(buf);
        }
    }
}

/// Bounded record queue.
pub struct Transport {
    max_payload: usize,
    batch_size: usize,
    capacity: usize,
    pool: Mutex<Vec<Vec<u8>>>,
    batch: Mutex<Vec<Vec<u8>>>,
    ready: Mutex<VecDeque<Vec<u8>>>,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

impl Transport {
    pub fn new(capacity: usize, max_payload: usize, batch_size: usize) -> Self {
        let pool = (0..capacity)
            .map(|_| alloc::vec![0u8; HEADER_LEN + max_payload])
            .collect();
        Self {
            max_payload,
            batch_size: batch_size.max(1),
            capacity,
            pool: Mutex::new(pool),
            batch: Mutex::new(Vec::new()),
            ready: Mutex::new(VecDeque::with_capacity(capacity)),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.transport_slots, config.max_payload, config.batch_size)
    }

    /// Take a free record buffer for an event of `kind`.
    pub fn acquire_record(&self, kind: RecordKind) -> Result<RecordSlot<'_>> {
        match self.pool.lock().pop() {
            Some(buf) => Ok(RecordSlot {
                transport: self,
                kind,
                buf: Some(buf),
            }),
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(Error::Backpressure)
            }
        }
    }

    /// Seal `slot` with `used` payload bytes and queue it.
    pub fn flush(&self, mut slot: RecordSlot<'_>, used: usize, delivery: Delivery) -> Result<()> {
        let Some(mut buf) = slot.buf.take() else {
            return Err(Error::NotFound);
        };
        if used > self.max_payload {
            self.recycle(buf);
            return Err(Error::InvalidConfig("record payload exceeds max_payload"));
        }
        buf[0..2].copy_from_slice(&(slot.kind as u16).to_le_bytes());
        buf[2..4].copy_from_slice(&(used as u16).to_le_bytes());
        buf.truncate(HEADER_LEN + used);

        match delivery {
            Delivery::Immediate => {
                let mut batch = self.batch.lock();
                let mut ready = self.ready.lock();
                ready.extend(batch.drain(..));
                ready.push_back(buf);
            }
            Delivery::Batched => {
                let mut batch = self.batch.lock();
                batch.push(buf);
                if batch.len() >= self.batch_size {
                    self.ready.lock().extend(batch.drain(..));
                }
            }
        }
        Ok(())
    }

    /// Deliver records held for batching.
    pub fn flush_batch(&self) -> usize {
        let mut batch = self.batch.lock();
        let n = batch.len();
        self.ready.lock().extend(batch.drain(..));
        n
    }

    /// Acquire, encode and flush `event` in one go.
    pub fn emit(&self, event: &Event<'_>, delivery: Delivery) -> Result<()> {
        let mut slot = self.acquire_record(event.kind())?;
        match event.encode(slot.payload_mut()) {
            Some(used) => self.flush(slot, used, delivery),
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("transport: {:?} record larger than {} bytes", event.kind(), self.max_payload);
                Err(Error::InvalidConfig("event larger than max_payload"))
            }
        }
    }

    /// Append every delivered record to `out` and free their buffers.
    /// Returns the number of records moved.
    pub fn drain(&self, out: &mut Vec<u8>) -> usize {
        let records: Vec<Vec<u8>> = self.ready.lock().drain(..).collect();
        let n = records.len();
        for buf in records {
            out.extend_from_slice(&buf);
            self.recycle(buf);
        }
        self.delivered.fetch_add(n as u64, Ordering::Relaxed);
        n
    }

    fn recycle(&self, mut buf: Vec<u8>) {
        buf.resize(HEADER_LEN + self.max_payload, 0);
        self.pool.lock().push(buf);
    }

    /// Events lost to backpressure or oversize payloads.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Records handed to the consumer so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Records waiting for the consumer, batched ones included.
    pub fn pending(&self) -> usize {
        self.batch.lock().len() + self.ready.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

/// One record as read back from a drained stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub kind: u16,
    pub payload: &'a [u8],
}

impl<'a> Record<'a> {
    /// Decode the payload; `None` for unknown kinds.
    pub fn event(&self) -> Option<Event<'a>> {
        Event::decode(self.kind, self.payload)
    }
}

/// Iterates records in a byte stream produced by [`Transport::drain`].
///
/// Stops at a truncated tail, leaving it in [`RecordReader::remaining`].
pub struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Decoded events, skipping records of unknown kinds.
    pub fn events(self) -> impl Iterator<Item = Event<'a>> {
        self.filter_map(|r| r.event())
    }
}

impl<'a> Iterator for RecordReader<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Record<'a>> {
        let rest = &self.buf[self.pos..];
        if rest.len() < HEADER_LEN {
            return None;
        }
        let kind = u16::from_le_bytes([rest[0], rest[1]]);
        let len = u16::from_le_bytes([rest[2], rest[3]]) as usize;
        let payload = rest.get(HEADER_LEN..HEADER_LEN + len)?;
        self.pos += HEADER_LEN + len;
        Some(Record { kind, payload })
    }
}
