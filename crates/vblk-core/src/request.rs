use crate::{IoBuffer, IoError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Operation kinds carried by an [`IoRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IoType {
    Read,
    Write,
    Flush,
    Unmap,
    WriteZeroes,
    Reset,
    Compare,
}

impl IoType {
    /// Whether this operation carries a data payload.
    pub fn carries_data(self) -> bool {
        matches!(self, IoType::Read | IoType::Write | IoType::Compare)
    }
}

/// Outcome of a completed request.
#[derive(Clone, Debug)]
pub enum IoStatus {
    Ok,
    Err(IoError),
}

impl IoStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, IoStatus::Ok)
    }

    pub fn err(&self) -> Option<&IoError> {
        match self {
            IoStatus::Ok => None,
            IoStatus::Err(err) => Some(err),
        }
    }
}

/// Delivered to the completion callback; hands the payload back to the caller.
#[derive(Debug)]
pub struct IoCompletion {
    pub status: IoStatus,
    pub buffer: Option<IoBuffer>,
}

/// Advisory cancellation flag shared between the submitter and the backend.
///
/// Backends that notice the flag before handing the request to media complete
/// it with `Aborted`; a request already in flight runs to completion.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

type CompletionFn = Box<dyn FnOnce(IoCompletion) + Send>;

/// A single asynchronous block operation against one device channel.
///
/// The request owns its payload until completion; the callback receives the
/// buffer back together with the status and is invoked exactly once, always
/// on the execution context that polls the channel.
pub struct IoRequest {
    pub io_type: IoType,
    pub lba: u64,
    pub num_blocks: u64,
    pub buffer: Option<IoBuffer>,
    pub cancel: Option<CancelToken>,
    on_complete: CompletionFn,
}

impl IoRequest {
    pub fn new(
        io_type: IoType,
        lba: u64,
        num_blocks: u64,
        buffer: Option<IoBuffer>,
        on_complete: impl FnOnce(IoCompletion) + Send + 'static,
    ) -> Self {
        Self {
            io_type,
            lba,
            num_blocks,
            buffer,
            cancel: None,
            on_complete: Box::new(on_complete),
        }
    }

    pub fn read(
        lba: u64,
        num_blocks: u64,
        buffer: IoBuffer,
        on_complete: impl FnOnce(IoCompletion) + Send + 'static,
    ) -> Self {
        Self::new(IoType::Read, lba, num_blocks, Some(buffer), on_complete)
    }

    pub fn write(
        lba: u64,
        num_blocks: u64,
        buffer: IoBuffer,
        on_complete: impl FnOnce(IoCompletion) + Send + 'static,
    ) -> Self {
        Self::new(IoType::Write, lba, num_blocks, Some(buffer), on_complete)
    }

    pub fn compare(
        lba: u64,
        num_blocks: u64,
        buffer: IoBuffer,
        on_complete: impl FnOnce(IoCompletion) + Send + 'static,
    ) -> Self {
        Self::new(IoType::Compare, lba, num_blocks, Some(buffer), on_complete)
    }

    pub fn flush(on_complete: impl FnOnce(IoCompletion) + Send + 'static) -> Self {
        Self::new(IoType::Flush, 0, 0, None, on_complete)
    }

    pub fn unmap(
        lba: u64,
        num_blocks: u64,
        on_complete: impl FnOnce(IoCompletion) + Send + 'static,
    ) -> Self {
        Self::new(IoType::Unmap, lba, num_blocks, None, on_complete)
    }

    pub fn write_zeroes(
        lba: u64,
        num_blocks: u64,
        on_complete: impl FnOnce(IoCompletion) + Send + 'static,
    ) -> Self {
        Self::new(IoType::WriteZeroes, lba, num_blocks, None, on_complete)
    }

    pub fn reset(on_complete: impl FnOnce(IoCompletion) + Send + 'static) -> Self {
        Self::new(IoType::Reset, 0, 0, None, on_complete)
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(CancelToken::is_cancelled)
            .unwrap_or(false)
    }

    /// Number of payload bytes this request moves for `block_size`-sized blocks.
    pub fn byte_len(&self, block_size: u32) -> usize {
        if self.io_type.carries_data() {
            (self.num_blocks as usize) * block_size as usize
        } else {
            0
        }
    }

    /// Run `hook` over the finished completion before the original callback.
    ///
    /// Used by the registry wrapper for stats and by vbdev layers to
    /// transform payloads (e.g. decrypt in place) on the polling context.
    pub fn map_completion(
        mut self,
        hook: impl FnOnce(IoCompletion) -> IoCompletion + Send + 'static,
    ) -> Self {
        let prev = self.on_complete;
        self.on_complete = Box::new(move |completion| prev(hook(completion)));
        self
    }

    /// Complete the request successfully, handing the payload back.
    pub fn complete_ok(self) {
        self.complete(IoStatus::Ok)
    }

    /// Fail the request with `err`.
    pub fn complete_err(self, err: IoError) {
        self.complete(IoStatus::Err(err))
    }

    /// Invoke the completion callback exactly once.
    pub fn complete(self, status: IoStatus) {
        let completion = IoCompletion {
            status,
            buffer: self.buffer,
        };
        (self.on_complete)(completion);
    }
}

impl std::fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRequest")
            .field("io_type", &self.io_type)
            .field("lba", &self.lba)
            .field("num_blocks", &self.num_blocks)
            .field("has_buffer", &self.buffer.is_some())
            .finish()
    }
}
