use crate::{IoError, IoErrorKind, IoResult};

/// Ownership-tracked scatter-gather payload for a single request.
///
/// Segments are owned byte vectors; the descriptor travels with the request
/// and is handed back to the caller through the completion, so passthrough
/// layers never copy. Physical alignment and NUMA placement are the memory
/// allocator collaborator's concern; this type only tracks logical bytes.
#[derive(Debug, Default)]
pub struct IoBuffer {
    segments: Vec<Vec<u8>>,
    len: usize,
}

impl IoBuffer {
    /// Allocate a single zeroed segment of `len` bytes.
    pub fn alloc_zeroed(len: usize) -> Self {
        Self {
            segments: vec![vec![0u8; len]],
            len,
        }
    }

    /// Wrap an existing vector as a one-segment buffer.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            segments: vec![data],
            len,
        }
    }

    /// Build a vectored buffer from pre-sized segments.
    pub fn from_segments(segments: Vec<Vec<u8>>) -> Self {
        let len = segments.iter().map(Vec::len).sum();
        Self { segments, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    pub fn segments_mut(&mut self) -> &mut [Vec<u8>] {
        &mut self.segments
    }

    /// Copy `src` into the buffer starting at byte `offset`.
    pub fn write_at(&mut self, offset: usize, src: &[u8]) -> IoResult<()> {
        if offset + src.len() > self.len {
            return Err(IoError::with_message(
                IoErrorKind::InvalidRange,
                "write past end of buffer",
            ));
        }
        let mut remaining = src;
        let mut skip = offset;
        for segment in &mut self.segments {
            if skip >= segment.len() {
                skip -= segment.len();
                continue;
            }
            let avail = segment.len() - skip;
            let take = avail.min(remaining.len());
            segment[skip..skip + take].copy_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            skip = 0;
            if remaining.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Copy `len` bytes starting at `offset` out of the buffer.
    pub fn read_at(&self, offset: usize, len: usize) -> IoResult<Vec<u8>> {
        if offset + len > self.len {
            return Err(IoError::with_message(
                IoErrorKind::InvalidRange,
                "read past end of buffer",
            ));
        }
        let mut out = Vec::with_capacity(len);
        let mut skip = offset;
        for segment in &self.segments {
            if skip >= segment.len() {
                skip -= segment.len();
                continue;
            }
            let take = (segment.len() - skip).min(len - out.len());
            out.extend_from_slice(&segment[skip..skip + take]);
            skip = 0;
            if out.len() == len {
                break;
            }
        }
        Ok(out)
    }

    /// Flatten the whole payload into one vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        out
    }

    /// Overwrite the whole payload from a flat slice of equal length.
    pub fn fill_from_slice(&mut self, src: &[u8]) -> IoResult<()> {
        if src.len() != self.len {
            return Err(IoError::with_message(
                IoErrorKind::InvalidRange,
                "source length does not match buffer",
            ));
        }
        self.write_at(0, src)
    }
}

/// Provides reusable request payload buffers keyed by slot.
pub trait BufferPool {
    /// Capacity of each pooled buffer in bytes.
    fn buffer_len(&self) -> usize;

    /// Check out a free buffer, failing with `ResourceExhausted` when none remain.
    fn checkout(&mut self) -> IoResult<IoBuffer>;

    /// Return a buffer to the pool.
    fn checkin(&mut self, buf: IoBuffer);
}

/// BufferPool backed by a fixed set of reusable single-segment buffers.
pub struct VecBufferPool {
    free: Vec<IoBuffer>,
    buf_len: usize,
}

impl VecBufferPool {
    pub fn new(count: usize, buf_len: usize) -> Self {
        let free = (0..count).map(|_| IoBuffer::alloc_zeroed(buf_len)).collect();
        Self { free, buf_len }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl BufferPool for VecBufferPool {
    fn buffer_len(&self) -> usize {
        self.buf_len
    }

    fn checkout(&mut self) -> IoResult<IoBuffer> {
        self.free.pop().ok_or_else(|| {
            IoError::with_message(IoErrorKind::ResourceExhausted, "buffer pool empty")
        })
    }

    fn checkin(&mut self, buf: IoBuffer) {
        debug_assert_eq!(buf.len(), self.buf_len);
        self.free.push(buf);
    }
}
