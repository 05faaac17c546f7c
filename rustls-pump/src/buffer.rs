use std::cmp;
use std::collections::VecDeque;
use std::io;

use crate::log::trace;

/// Size of the first chunk a buffer allocates.
pub const INITIAL_CHUNK_SIZE: usize = 1024;

/// Size of the first chunk of an initiator's inbound buffer.
///
/// The server's first flight carries its certificate chain, so a client
/// starts bigger.
pub const INITIAL_CLIENT_CHUNK_SIZE: usize = 4096;

/// Size of every chunk allocated after the first.
pub const GROWTH_CHUNK_SIZE: usize = 16384;

/// At most this many chunks are offered to a single vectored write.
const MAX_IO_SLICES: usize = 64;

struct Chunk {
    data: Box<[u8]>,
    read: usize,
    write: usize,
}

impl Chunk {
    fn new(len: usize) -> Self {
        Self {
            data: vec![0u8; len].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn unread(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    fn room(&self) -> usize {
        self.data.len() - self.write
    }

    fn is_full(&self) -> bool {
        self.write == self.data.len()
    }

    fn is_drained(&self) -> bool {
        self.read == self.write
    }

    fn rewind(&mut self) {
        self.read = 0;
        self.write = 0;
    }
}

/// A growable FIFO of bytes stored in a chain of fixed-size chunks.
///
/// One side of a `SegmentedBuffer` is filled asynchronously (by a transport
/// delivering ciphertext, or by a TLS engine producing it) and the other is
/// drained synchronously, so the buffer stands in for a blocking stream
/// over memory.  Through [`io::Read`] an empty buffer reports
/// [`io::ErrorKind::WouldBlock`] until [`SegmentedBuffer::mark_eof`] is
/// called, after which it reports end of stream.
///
/// Chunks are never enlarged.  The first allocation is
/// `initial_chunk_size` bytes, later ones `growth_chunk_size` bytes.  A
/// chunk whose contents have all been read is kept on a spare list and
/// reused by a later write; [`SegmentedBuffer::free_empty`] trims that list
/// at every write boundary so at most one spare survives.
pub struct SegmentedBuffer {
    // front is read from, back is written to
    chunks: VecDeque<Chunk>,
    spare: Vec<Chunk>,
    length: usize,
    initial_chunk_size: usize,
    growth_chunk_size: usize,
    allocated_once: bool,
    eof: bool,
}

impl SegmentedBuffer {
    /// Make an empty buffer with the default chunk sizes.
    pub fn new() -> Self {
        Self::with_chunk_sizes(INITIAL_CHUNK_SIZE, GROWTH_CHUNK_SIZE)
    }

    /// Make an empty buffer.  Nothing is allocated until the first write.
    pub fn with_chunk_sizes(initial_chunk_size: usize, growth_chunk_size: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            spare: Vec::new(),
            length: 0,
            initial_chunk_size: cmp::max(initial_chunk_size, 1),
            growth_chunk_size: cmp::max(growth_chunk_size, 1),
            allocated_once: false,
            eof: false,
        }
    }

    /// How many unread bytes we're storing.
    pub fn len(&self) -> usize {
        self.length
    }

    /// If we're empty
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Number of chunks currently holding (or ready to hold) data.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Bytes of chunk memory held, spare chunks included.
    pub fn allocated(&self) -> usize {
        self.chunks
            .iter()
            .chain(self.spare.iter())
            .map(Chunk::capacity)
            .sum()
    }

    /// Append a copy of `data`, adding chunks as needed.
    pub fn write(&mut self, data: &[u8]) {
        self.append(data);
    }

    /// Read data out of this object, writing it into `out` and returning
    /// how many bytes were written there.  Returns 0 when empty.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let mut offs = 0;

        while offs < out.len() && !self.is_empty() {
            let Some(front) = self.chunks.front() else {
                break;
            };
            let avail = front.unread();
            let used = cmp::min(avail.len(), out.len() - offs);
            out[offs..offs + used].copy_from_slice(&avail[..used]);
            self.consume(used);
            offs += used;
        }

        offs
    }

    /// The next contiguous run of unread bytes, without consuming it.
    pub fn peek(&self) -> &[u8] {
        self.chunks
            .front()
            .map(Chunk::unread)
            .unwrap_or_default()
    }

    /// Every unread run, in order, as a scatter list.
    pub fn peek_multiple(&self) -> Vec<io::IoSlice<'_>> {
        self.chunks
            .iter()
            .map(Chunk::unread)
            .filter(|run| !run.is_empty())
            .map(io::IoSlice::new)
            .collect()
    }

    /// Consume `used` bytes previously obtained from [`Self::peek`] or
    /// [`Self::peek_multiple`].  Anything beyond the unread length is ignored.
    pub fn commit(&mut self, used: usize) {
        self.consume(used);
    }

    /// Offset of the first `delim` among the next `limit` unread bytes.
    pub fn index_of(&self, delim: u8, limit: usize) -> Option<usize> {
        let mut offset = 0;

        for chunk in &self.chunks {
            if offset >= limit {
                break;
            }
            let run = chunk.unread();
            let window = &run[..cmp::min(run.len(), limit - offset)];
            if let Some(pos) = window.iter().position(|b| *b == delim) {
                return Some(offset + pos);
            }
            offset += window.len();
        }

        None
    }

    /// Discard all contents and release every chunk.  The end-of-stream
    /// marker is cleared too.
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.spare.clear();
        self.length = 0;
        self.eof = false;
    }

    /// Writable memory at the tail of the buffer, for a producer that wants
    /// to fill the buffer in place.  Follow with [`Self::commit_write`].
    ///
    /// If the current tail chunk is full, a new chunk of at least `hint`
    /// bytes is made ready; otherwise the remaining room of the tail chunk is
    /// returned, which may be smaller than `hint`.
    pub fn peek_writable(&mut self, hint: usize) -> &mut [u8] {
        let idx = self.prepare_tail(hint);
        let chunk = &mut self.chunks[idx];
        &mut chunk.data[chunk.write..]
    }

    /// Account for `used` bytes written into memory from
    /// [`Self::peek_writable`].
    pub fn commit_write(&mut self, used: usize) {
        let Some(tail) = self.chunks.back_mut() else {
            return;
        };
        let used = cmp::min(used, tail.room());
        tail.write += used;
        self.length += used;
        self.free_empty();
    }

    /// Drop spare chunks beyond the first.
    pub fn free_empty(&mut self) {
        if self.spare.len() > 1 {
            trace!("releasing {} spare chunks", self.spare.len() - 1);
            self.spare.truncate(1);
        }
    }

    /// Record that no more bytes will be written.
    pub fn mark_eof(&mut self) {
        self.eof = true;
    }

    /// True once [`Self::mark_eof`] has been called.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Read data out of this object, passing it `wr` in one vectored write.
    pub fn write_to(&mut self, wr: &mut dyn io::Write) -> io::Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }

        let mut bufs = [io::IoSlice::new(&[]); MAX_IO_SLICES];
        let mut count = 0;
        for (iov, chunk) in bufs
            .iter_mut()
            .zip(self.chunks.iter().filter(|c| !c.is_drained()))
        {
            *iov = io::IoSlice::new(chunk.unread());
            count += 1;
        }
        let used = wr.write_vectored(&bufs[..count])?;

        self.consume(used);
        Ok(used)
    }

    fn append(&mut self, mut data: &[u8]) -> usize {
        let len = data.len();

        while !data.is_empty() {
            let idx = self.prepare_tail(0);
            let chunk = &mut self.chunks[idx];
            let take = cmp::min(chunk.room(), data.len());
            chunk.data[chunk.write..chunk.write + take].copy_from_slice(&data[..take]);
            chunk.write += take;
            self.length += take;
            data = &data[take..];
        }

        if len > 0 {
            self.free_empty();
        }
        len
    }

    /// Ensure the tail chunk has room, returning its index.
    fn prepare_tail(&mut self, hint: usize) -> usize {
        if self.chunks.back().map_or(true, Chunk::is_full) {
            let chunk = self.next_chunk(hint);
            self.chunks.push_back(chunk);
        }
        self.chunks.len() - 1
    }

    fn next_chunk(&mut self, hint: usize) -> Chunk {
        if let Some(pos) = self
            .spare
            .iter()
            .position(|c| c.capacity() >= hint)
        {
            return self.spare.swap_remove(pos);
        }

        let size = match self.allocated_once {
            true => self.growth_chunk_size,
            false => self.initial_chunk_size,
        };
        self.allocated_once = true;
        trace!("allocating {} byte chunk", cmp::max(size, hint));
        Chunk::new(cmp::max(size, hint))
    }

    fn consume(&mut self, used: usize) {
        let mut used = cmp::min(used, self.length);
        self.length -= used;

        while used > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            let take = cmp::min(front.write - front.read, used);
            front.read += take;
            used -= take;
            self.recycle_drained();
        }
        self.recycle_drained();
    }

    /// Chunks ahead of the tail are always full, so a drained one there is
    /// finished with; a drained tail is rewound in place.
    fn recycle_drained(&mut self) {
        while self.chunks.len() > 1
            && self
                .chunks
                .front()
                .is_some_and(|c| c.is_full() && c.is_drained())
        {
            if let Some(mut chunk) = self.chunks.pop_front() {
                chunk.rewind();
                self.spare.push(chunk);
            }
        }

        if self.chunks.len() == 1 {
            if let Some(tail) = self.chunks.front_mut() {
                if tail.is_drained() {
                    tail.rewind();
                }
            }
        }
    }
}

impl Default for SegmentedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl io::Read for SegmentedBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_empty() && !buf.is_empty() && !self.eof {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(Self::read(self, buf))
    }
}

impl io::Write for SegmentedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.append(buf))
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        Ok(bufs
            .iter()
            .map(|buf| self.append(buf))
            .sum())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
