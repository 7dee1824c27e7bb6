//! Fixed-capacity wire buffers and the send/receive queues built from them.
//!
//! Outbound messages are built transactionally: bytes written since the last
//! commit are invisible to the socket until [`MessageMinder::commit`], and are
//! rolled back if building fails or the minder is dropped. Inbound bytes
//! accumulate in a [`ReceiveQueue`] until [`FrameAssembler`] can hand a whole
//! frame to the dispatcher.

use std::{collections::VecDeque, io, sync::Arc};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use crate::messages::{FrameHeader, MessageError, RawMessage, is_v49};

/// Bytes held by a single [`WireBuffer`]
pub const WIRE_BUFFER_CAPACITY: usize = 0x4000;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Send queue is over budget; flush before queuing more")]
    FlushRequired,
    #[error("Insufficient resources to buffer message")]
    InsufficientResources,
    #[error("Could not encode message: {0}")]
    Encode(#[from] MessageError),
}

impl From<QueueError> for io::Error {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::InsufficientResources => io::Error::new(io::ErrorKind::OutOfMemory, err),
            err => io::Error::other(err),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame declares a {0} byte payload, more than the {1} byte limit")]
    Oversized(usize, usize),
}

/// A fixed-capacity octet segment.
///
/// Bytes between the read cursor and the commit index are visible to readers;
/// bytes between the commit index and the write cursor are still being
/// assembled.
#[derive(Debug)]
pub struct WireBuffer {
    data: Box<[u8]>,
    next_read: usize,
    next_write: usize,
    commit_index: usize,
}

impl WireBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        WireBuffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            next_read: 0,
            next_write: 0,
            commit_index: 0,
        }
    }
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
    pub fn occupied_bytes(&self) -> usize {
        self.commit_index - self.next_read
    }
    pub fn uncommitted_bytes(&self) -> usize {
        self.next_write - self.commit_index
    }
    pub fn unoccupied_bytes(&self) -> usize {
        self.capacity() - self.next_write
    }
    /// Copy as much of `bytes` as fits, returning how much was taken
    pub fn push_bytes(&mut self, bytes: &[u8]) -> usize {
        let count = bytes.len().min(self.unoccupied_bytes());
        self.data[self.next_write..self.next_write + count].copy_from_slice(&bytes[..count]);
        self.next_write += count;
        count
    }
    pub fn commit(&mut self) {
        self.commit_index = self.next_write;
    }
    pub fn clear_uncommitted(&mut self) {
        self.next_write = self.commit_index;
    }
    /// The committed, unread bytes
    pub fn committed(&self) -> &[u8] {
        &self.data[self.next_read..self.commit_index]
    }
    pub fn consume(&mut self, count: usize) -> usize {
        let count = count.min(self.occupied_bytes());
        self.next_read += count;
        count
    }
    pub fn copy_out(&mut self, dest: &mut [u8]) -> usize {
        let count = dest.len().min(self.occupied_bytes());
        dest[..count].copy_from_slice(&self.data[self.next_read..self.next_read + count]);
        self.next_read += count;
        count
    }
    fn reset(&mut self) {
        self.next_read = 0;
        self.next_write = 0;
        self.commit_index = 0;
    }
}

#[derive(Debug)]
struct PoolInner {
    free: Vec<WireBuffer>,
    outstanding: usize,
    limit: Option<usize>,
}

/// Shared source of [`WireBuffer`]s, optionally capped
#[derive(Debug, Clone)]
pub struct BufferPool {
    buffer_capacity: usize,
    inner: Arc<Mutex<PoolInner>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(WIRE_BUFFER_CAPACITY, None)
    }
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, limit: Option<usize>) -> Self {
        BufferPool {
            buffer_capacity,
            inner: Arc::new(Mutex::new(PoolInner {
                free: Vec::new(),
                outstanding: 0,
                limit,
            })),
        }
    }
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }
    /// Take a buffer, or `None` if the pool is exhausted
    pub fn allocate(&self) -> Option<WireBuffer> {
        let mut inner = self.inner.lock();
        if inner.limit.is_some_and(|limit| inner.outstanding >= limit) {
            return None;
        }
        inner.outstanding += 1;
        Some(
            inner
                .free
                .pop()
                .unwrap_or_else(|| WireBuffer::with_capacity(self.buffer_capacity)),
        )
    }
    pub fn release(&self, mut buffer: WireBuffer) {
        buffer.reset();
        let mut inner = self.inner.lock();
        inner.outstanding = inner.outstanding.saturating_sub(1);
        inner.free.push(buffer);
    }
    /// Buffers currently held by queues
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }
}

/// Outbound byte queue with exactly-once commit semantics
#[derive(Debug)]
pub struct SendQueue {
    pool: BufferPool,
    buffers: VecDeque<WireBuffer>,
    /// Committed bytes waiting for the socket
    pending_bytes: usize,
    /// First buffer holding bytes of the message under construction
    first_uncommitted: Option<usize>,
    block_threshold: usize,
}

impl SendQueue {
    pub fn new(pool: BufferPool, block_threshold: usize) -> Self {
        SendQueue {
            pool,
            buffers: VecDeque::new(),
            pending_bytes: 0,
            first_uncommitted: None,
            block_threshold,
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }
    pub fn is_empty(&self) -> bool {
        self.pending_bytes == 0
    }
    pub fn uncommitted_bytes(&self) -> usize {
        self.buffers.iter().map(WireBuffer::uncommitted_bytes).sum()
    }
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Callers should stop queuing until a flush drains the backlog
    pub fn flush_block_threshold(&self) -> bool {
        self.pending_bytes >= self.block_threshold
    }

    /// Start building a message; dropping the minder without committing
    /// discards everything written through it.
    pub fn begin(&mut self) -> MessageMinder<'_> {
        MessageMinder {
            queue: self,
            committed: false,
        }
    }

    /// Frame and commit one message for a peer speaking `minor_version`
    pub fn push_message(&mut self, message: &RawMessage, minor_version: u16) -> Result<(), QueueError> {
        let size = message.wire_size();
        if self.pending_bytes > 0 && self.pending_bytes + size > self.block_threshold {
            return Err(QueueError::FlushRequired);
        }
        if message.needs_extended_header() && !is_v49(minor_version) {
            return Err(MessageError::OutOfBounds.into());
        }
        let mut minder = self.begin();
        minder.push_bytes(&message.header().to_bytes())?;
        minder.push_bytes(&message.payload)?;
        let padding = size - message.header().size() - message.payload.len();
        minder.push_bytes(&[0u8; 8][..padding])?;
        minder.commit();
        Ok(())
    }

    fn push_bytes(&mut self, mut bytes: &[u8]) -> Result<(), QueueError> {
        while !bytes.is_empty() {
            if self.buffers.back().is_none_or(|b| b.unoccupied_bytes() == 0) {
                let buffer = self
                    .pool
                    .allocate()
                    .ok_or(QueueError::InsufficientResources)?;
                self.buffers.push_back(buffer);
            }
            let index = self.buffers.len() - 1;
            self.first_uncommitted.get_or_insert(index);
            let written = self.buffers[index].push_bytes(bytes);
            bytes = &bytes[written..];
        }
        Ok(())
    }

    fn commit(&mut self) {
        if let Some(first) = self.first_uncommitted.take() {
            for buffer in self.buffers.iter_mut().skip(first) {
                self.pending_bytes += buffer.uncommitted_bytes();
                buffer.commit();
            }
        }
    }

    fn rollback(&mut self) {
        let Some(first) = self.first_uncommitted.take() else {
            return;
        };
        for buffer in self.buffers.iter_mut().skip(first) {
            buffer.clear_uncommitted();
        }
        // Buffers allocated for the abandoned message go back to the pool
        while self.buffers.len() > first && self.buffers.back().is_some_and(|b| b.occupied_bytes() == 0) {
            if let Some(buffer) = self.buffers.pop_back() {
                self.pool.release(buffer);
            }
        }
    }

    /// Remove every committed byte, ready for the socket
    pub fn drain_committed(&mut self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pending_bytes);
        let mut removed = 0;
        while let Some(buffer) = self.buffers.front_mut() {
            out.extend_from_slice(buffer.committed());
            let count = buffer.occupied_bytes();
            buffer.consume(count);
            if buffer.uncommitted_bytes() > 0 {
                break;
            }
            if let Some(buffer) = self.buffers.pop_front() {
                self.pool.release(buffer);
            }
            removed += 1;
        }
        if let Some(first) = self.first_uncommitted.as_mut() {
            *first = first.saturating_sub(removed);
        }
        self.pending_bytes = 0;
        trace!("Drained {} committed bytes", out.len());
        out
    }

    /// Throw away everything, committed or not
    pub fn clear(&mut self) {
        self.first_uncommitted = None;
        self.pending_bytes = 0;
        for buffer in self.buffers.drain(..) {
            self.pool.release(buffer);
        }
    }
}

impl Drop for SendQueue {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Guard over a message under construction in a [`SendQueue`]
pub struct MessageMinder<'a> {
    queue: &'a mut SendQueue,
    committed: bool,
}

impl MessageMinder<'_> {
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<(), QueueError> {
        self.queue.push_bytes(bytes)
    }
    pub fn commit(mut self) {
        self.queue.commit();
        self.committed = true;
    }
}

impl io::Write for MessageMinder<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push_bytes(buf)?;
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MessageMinder<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.queue.rollback();
        }
    }
}

/// Inbound byte queue, with big-endian typed pops
#[derive(Debug)]
pub struct ReceiveQueue {
    pool: BufferPool,
    buffers: VecDeque<WireBuffer>,
    occupied: usize,
}

impl ReceiveQueue {
    pub fn new(pool: BufferPool) -> Self {
        ReceiveQueue {
            pool,
            buffers: VecDeque::new(),
            occupied: 0,
        }
    }

    pub fn occupied_bytes(&self) -> usize {
        self.occupied
    }

    /// Append bytes read from the socket
    pub fn push_bytes(&mut self, mut bytes: &[u8]) -> Result<(), QueueError> {
        while !bytes.is_empty() {
            if self.buffers.back().is_none_or(|b| b.unoccupied_bytes() == 0) {
                let buffer = self
                    .pool
                    .allocate()
                    .ok_or(QueueError::InsufficientResources)?;
                self.buffers.push_back(buffer);
            }
            if let Some(buffer) = self.buffers.back_mut() {
                let written = buffer.push_bytes(bytes);
                buffer.commit();
                self.occupied += written;
                bytes = &bytes[written..];
            }
        }
        Ok(())
    }

    /// Copy the next bytes without consuming them
    pub fn peek(&self, dest: &mut [u8]) -> usize {
        let mut copied = 0;
        for buffer in &self.buffers {
            let available = buffer.committed();
            let count = available.len().min(dest.len() - copied);
            dest[copied..copied + count].copy_from_slice(&available[..count]);
            copied += count;
            if copied == dest.len() {
                break;
            }
        }
        copied
    }

    pub fn copy_out(&mut self, dest: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dest.len() {
            let Some(buffer) = self.buffers.front_mut() else {
                break;
            };
            copied += buffer.copy_out(&mut dest[copied..]);
            if buffer.occupied_bytes() == 0 && buffer.unoccupied_bytes() == 0 {
                if let Some(buffer) = self.buffers.pop_front() {
                    self.pool.release(buffer);
                }
            } else if buffer.occupied_bytes() == 0 {
                break;
            }
        }
        self.occupied -= copied;
        copied
    }

    fn pop_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        if self.occupied < N {
            return None;
        }
        let mut bytes = [0u8; N];
        self.copy_out(&mut bytes);
        Some(bytes)
    }
    pub fn pop_u8(&mut self) -> Option<u8> {
        self.pop_array::<1>().map(|[b]| b)
    }
    pub fn pop_u16(&mut self) -> Option<u16> {
        self.pop_array().map(u16::from_be_bytes)
    }
    pub fn pop_u32(&mut self) -> Option<u32> {
        self.pop_array().map(u32::from_be_bytes)
    }

    pub fn clear(&mut self) {
        self.occupied = 0;
        for buffer in self.buffers.drain(..) {
            self.pool.release(buffer);
        }
    }
}

impl Drop for ReceiveQueue {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Reassembles frames from a byte stream that may split them anywhere
#[derive(Debug)]
pub struct FrameAssembler {
    header: Option<FrameHeader>,
    body: Vec<u8>,
    max_payload: usize,
}

impl FrameAssembler {
    pub fn new(max_payload: usize) -> Self {
        FrameAssembler {
            header: None,
            body: Vec::new(),
            max_payload,
        }
    }

    /// Whether a frame has been started but not completed
    pub fn is_mid_frame(&self) -> bool {
        self.header.is_some()
    }

    /// Pull the next complete frame out of the queue, if one has arrived
    pub fn next_frame(&mut self, queue: &mut ReceiveQueue) -> Result<Option<RawMessage>, FrameError> {
        let header = match self.header {
            Some(header) => header,
            None => {
                let mut bytes = [0u8; FrameHeader::EXTENDED_SIZE];
                let available = queue.peek(&mut bytes[..FrameHeader::SIZE]);
                if available < FrameHeader::SIZE {
                    return Ok(None);
                }
                let extended = bytes[2..4] == [0xFF, 0xFF] && bytes[6..8] == [0, 0];
                let size = if extended {
                    if queue.peek(&mut bytes) < FrameHeader::EXTENDED_SIZE {
                        return Ok(None);
                    }
                    FrameHeader::EXTENDED_SIZE
                } else {
                    FrameHeader::SIZE
                };
                let Some(header) = FrameHeader::peek(&bytes[..size]) else {
                    return Ok(None);
                };
                let declared = header.payload_size as usize;
                if declared > self.max_payload {
                    return Err(FrameError::Oversized(declared, self.max_payload));
                }
                queue.copy_out(&mut bytes[..size]);
                self.body.clear();
                self.body.reserve(declared);
                self.header = Some(header);
                header
            }
        };

        let remaining = header.payload_size as usize - self.body.len();
        if remaining > 0 {
            let start = self.body.len();
            let take = remaining.min(queue.occupied_bytes());
            self.body.resize(start + take, 0);
            queue.copy_out(&mut self.body[start..]);
            if self.body.len() < header.payload_size as usize {
                return Ok(None);
            }
        }
        self.header = None;
        Ok(Some(RawMessage::from_parts(&header, &self.body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{
        AsBytes, CAMessage, CA_MINOR_PROTOCOL_REVISION, Command, EventAddResponse, ReadNotify,
        WriteNotify,
    };

    fn queue(pool: &BufferPool) -> SendQueue {
        SendQueue::new(pool.clone(), 64 * 0x4000)
    }

    fn read_message(id: u32) -> RawMessage {
        ReadNotify {
            data_type: 6,
            data_count: 1,
            server_id: 1,
            client_ioid: id,
        }
        .to_raw()
    }

    #[test]
    fn commit_makes_bytes_visible() {
        let pool = BufferPool::default();
        let mut send = queue(&pool);
        send.push_message(&read_message(1), CA_MINOR_PROTOCOL_REVISION)
            .unwrap();
        assert_eq!(send.pending_bytes(), 16);
        assert_eq!(send.uncommitted_bytes(), 0);

        {
            let mut minder = send.begin();
            minder.push_bytes(&[1, 2, 3]).unwrap();
            assert_eq!(minder.queue.uncommitted_bytes(), 3);
        }
        // Dropped without commit
        assert_eq!(send.uncommitted_bytes(), 0);
        assert_eq!(send.drain_committed(), read_message(1).to_bytes());
        assert!(send.is_empty());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn exhaustion_rolls_back_partial_message() {
        let pool = BufferPool::new(64, Some(2));
        let mut send = SendQueue::new(pool.clone(), 4096);
        send.push_message(&read_message(1), CA_MINOR_PROTOCOL_REVISION)
            .unwrap();
        send.push_message(&read_message(2), CA_MINOR_PROTOCOL_REVISION)
            .unwrap();

        // Needs more than the one remaining buffer
        let big = WriteNotify {
            data_type: 4,
            data_count: 100,
            server_id: 1,
            client_ioid: 3,
            data: vec![7u8; 100],
        }
        .to_raw();
        assert!(matches!(
            send.push_message(&big, CA_MINOR_PROTOCOL_REVISION),
            Err(QueueError::InsufficientResources)
        ));
        assert_eq!(send.uncommitted_bytes(), 0);
        assert_eq!(send.pending_bytes(), 32);

        let mut expected = read_message(1).to_bytes();
        expected.extend(read_message(2).to_bytes());
        assert_eq!(send.drain_committed(), expected);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn rollback_keeps_committed_prefix_in_shared_buffer() {
        let pool = BufferPool::new(24, None);
        let mut send = SendQueue::new(pool.clone(), 4096);
        send.push_message(&read_message(1), CA_MINOR_PROTOCOL_REVISION)
            .unwrap();
        {
            let mut minder = send.begin();
            // Spills over into two more buffers
            minder.push_bytes(&[9u8; 40]).unwrap();
        }
        assert_eq!(send.buffer_count(), 1);
        assert_eq!(send.drain_committed(), read_message(1).to_bytes());
    }

    #[test]
    fn over_budget_asks_for_flush() {
        let pool = BufferPool::default();
        let mut send = SendQueue::new(pool, 40);
        let message = read_message(1);
        send.push_message(&message, CA_MINOR_PROTOCOL_REVISION).unwrap();
        send.push_message(&message, CA_MINOR_PROTOCOL_REVISION).unwrap();
        // Under budget, but the next message would not fit
        assert!(!send.flush_block_threshold());
        assert!(matches!(
            send.push_message(&message, CA_MINOR_PROTOCOL_REVISION),
            Err(QueueError::FlushRequired)
        ));
        assert_eq!(send.drain_committed().len(), 32);
        send.push_message(&message, CA_MINOR_PROTOCOL_REVISION).unwrap();
    }

    #[test]
    fn extended_header_refused_for_old_peers() {
        let pool = BufferPool::default();
        let mut send = queue(&pool);
        let mut large = read_message(1);
        large.field_2_data_count = 0x10000;
        assert!(matches!(
            send.push_message(&large, 8),
            Err(QueueError::Encode(MessageError::OutOfBounds))
        ));
        assert!(send.is_empty());
        send.push_message(&large, 9).unwrap();
        assert_eq!(send.pending_bytes(), 24);
    }

    #[test]
    fn round_trip_through_both_queues() {
        let pool = BufferPool::new(100, None);
        let mut send = SendQueue::new(pool.clone(), 1 << 22);
        let messages = vec![
            read_message(42),
            EventAddResponse {
                data_type: 20,
                data_count: 3,
                status_code: 1,
                subscription_id: 8,
                data: (0..37u8).collect(),
            }
            .to_raw(),
            WriteNotify {
                data_type: 4,
                data_count: 0x1_0001,
                server_id: 5,
                client_ioid: 6,
                data: vec![3u8; 0x1_0001],
            }
            .to_raw(),
        ];
        for message in &messages {
            send.push_message(message, CA_MINOR_PROTOCOL_REVISION).unwrap();
        }
        let bytes = send.drain_committed();

        // Deliver in awkward slices
        let mut receive = ReceiveQueue::new(pool.clone());
        let mut assembler = FrameAssembler::new(1 << 20);
        let mut frames = Vec::new();
        for chunk in bytes.chunks(7) {
            receive.push_bytes(chunk).unwrap();
            while let Some(frame) = assembler.next_frame(&mut receive).unwrap() {
                frames.push(frame);
            }
        }
        assert!(!assembler.is_mid_frame());
        assert_eq!(frames.len(), 3);
        for (frame, original) in frames.iter().zip(&messages) {
            assert_eq!(frame.command, original.command);
            assert_eq!(frame.field_1_data_type, original.field_1_data_type);
            assert_eq!(frame.field_2_data_count, original.field_2_data_count);
            assert_eq!(&frame.payload[..original.payload.len()], original.payload);
        }
        assert_eq!(frames[2].command, Command::WriteNotify as u16);
        drop(receive);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let pool = BufferPool::default();
        let mut receive = ReceiveQueue::new(pool);
        let mut assembler = FrameAssembler::new(16);
        let message = EventAddResponse {
            data_type: 0,
            data_count: 1,
            status_code: 1,
            subscription_id: 1,
            data: vec![0u8; 40],
        };
        receive.push_bytes(&message.as_bytes()).unwrap();
        assert_eq!(
            assembler.next_frame(&mut receive),
            Err(FrameError::Oversized(40, 16))
        );
    }

    #[test]
    fn typed_pops_are_big_endian() {
        let mut receive = ReceiveQueue::new(BufferPool::new(3, None));
        receive.push_bytes(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]).unwrap();
        assert_eq!(receive.pop_u16(), Some(0x0102));
        assert_eq!(receive.pop_u32(), Some(0x03040506));
        assert_eq!(receive.pop_u16(), None);
        assert_eq!(receive.pop_u8(), Some(0x07));
        assert_eq!(receive.occupied_bytes(), 0);
    }
}
