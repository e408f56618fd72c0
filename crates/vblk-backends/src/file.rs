use anyhow::{Context, ensure, Result};
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;
use vblk_core::{
    check_request, BlockDevice, CompletionQueue, DeviceChannel, DeviceGeometry, IoCapabilities,
    IoError, IoErrorKind, IoRequest, IoResult, IoStatus, IoType, SubmitReject,
};

pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Block device backed by a regular file or block device node.
///
/// Each channel owns a worker thread that performs positioned I/O; finished
/// requests travel back to the owning context over a bounded lock-free
/// queue and complete from `poll`.
pub struct FileDevice {
    name: String,
    file: Arc<std::fs::File>,
    geometry: DeviceGeometry,
    writable: bool,
    queue_depth: usize,
}

impl FileDevice {
    /// Open a file-backed device. Falls back to read-only when the path
    /// cannot be opened for writing.
    pub fn open(name: impl Into<String>, path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        ensure!(
            block_size > 0 && block_size.is_power_of_two(),
            "block size must be a non-zero power of two"
        );
        let name = name.into();
        let path = path.as_ref();
        let path_display = path.display().to_string();

        let (file, writable) = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => (file, true),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem
                ) =>
            {
                let file = OpenOptions::new()
                    .read(true)
                    .open(path)
                    .with_context(|| format!("open {} read-only", path_display))?;
                debug!(path = %path_display, "opened backing file read-only");
                (file, false)
            }
            Err(err) => return Err(err).context(format!("open {}", path_display)),
        };

        let len = file
            .metadata()
            .with_context(|| format!("stat {}", path_display))?
            .len();
        let block_count = len / block_size as u64;
        ensure!(block_count > 0, "backing file smaller than one block");
        debug!(path = %path_display, len, writable, "opened backing file");

        let mut geometry = DeviceGeometry::new(block_size, block_count);
        geometry.write_cache = true;
        Ok(Self {
            name,
            file: Arc::new(file),
            geometry,
            writable,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        })
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }
}

impl BlockDevice for FileDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn product_name(&self) -> &str {
        "File disk"
    }

    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn capabilities(&self) -> IoCapabilities {
        let mut caps = IoCapabilities::READ | IoCapabilities::FLUSH | IoCapabilities::RESET;
        if self.writable {
            caps |= IoCapabilities::WRITE | IoCapabilities::WRITE_ZEROES;
        }
        caps
    }

    fn open_channel(&self) -> IoResult<Box<dyn DeviceChannel>> {
        let (job_tx, job_rx) = async_channel::bounded::<IoRequest>(self.queue_depth);
        let completions = CompletionQueue::new(self.queue_depth);
        let file = self.file.clone();
        let block_size = self.geometry.block_size;
        let worker_queue = completions.clone();
        let worker: JoinHandle<()> = std::thread::Builder::new()
            .name(format!("vblk-file-{}", self.name))
            .spawn(move || {
                while let Ok(mut request) = job_rx.recv_blocking() {
                    let status = execute(&file, block_size, &mut request);
                    let mut item = Completed { request, status };
                    // The owning context drains at least as fast as the
                    // bounded submit window allows; spin until a slot frees.
                    while let Err(back) = worker_queue.push(item) {
                        item = back;
                        std::thread::yield_now();
                    }
                }
            })
            .map_err(|err| {
                IoError::with_message(
                    IoErrorKind::ResourceExhausted,
                    format!("spawn channel worker: {err}"),
                )
            })?;

        Ok(Box::new(FileChannel {
            geometry: self.geometry,
            capabilities: self.capabilities(),
            job_tx: Some(job_tx),
            completions,
            in_flight: 0,
            queue_depth: self.queue_depth,
            worker: Some(worker),
        }))
    }
}

struct Completed {
    request: IoRequest,
    status: IoStatus,
}

fn execute(file: &std::fs::File, block_size: u32, request: &mut IoRequest) -> IoStatus {
    if request.is_cancelled() {
        return IoStatus::Err(IoError::new(IoErrorKind::Aborted));
    }
    let offset = request.lba * block_size as u64;
    let result = match request.io_type {
        IoType::Read => read_vectored(file, offset, request),
        IoType::Write => write_vectored(file, offset, request),
        IoType::WriteZeroes => {
            let len = (request.num_blocks * block_size as u64) as usize;
            file.write_all_at(&vec![0u8; len], offset)
        }
        IoType::Flush => file.sync_data(),
        IoType::Reset => Ok(()),
        IoType::Unmap | IoType::Compare => {
            return IoStatus::Err(IoError::new(IoErrorKind::Unsupported));
        }
    };
    match result {
        Ok(()) => IoStatus::Ok,
        Err(err) => IoStatus::Err(err.into()),
    }
}

fn read_vectored(file: &std::fs::File, mut offset: u64, request: &mut IoRequest) -> io::Result<()> {
    let Some(buffer) = request.buffer.as_mut() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "missing payload"));
    };
    for segment in buffer.segments_mut() {
        file.read_exact_at(segment, offset)?;
        offset += segment.len() as u64;
    }
    Ok(())
}

fn write_vectored(file: &std::fs::File, mut offset: u64, request: &mut IoRequest) -> io::Result<()> {
    let Some(buffer) = request.buffer.as_ref() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "missing payload"));
    };
    for segment in buffer.segments() {
        file.write_all_at(segment, offset)?;
        offset += segment.len() as u64;
    }
    Ok(())
}

struct FileChannel {
    geometry: DeviceGeometry,
    capabilities: IoCapabilities,
    job_tx: Option<async_channel::Sender<IoRequest>>,
    completions: Arc<CompletionQueue<Completed>>,
    in_flight: usize,
    queue_depth: usize,
    worker: Option<JoinHandle<()>>,
}

impl DeviceChannel for FileChannel {
    fn submit(&mut self, request: IoRequest) -> Result<(), SubmitReject> {
        if let Err(err) = check_request(&self.geometry, self.capabilities, &request) {
            return Err(SubmitReject::new(request, err));
        }
        if self.in_flight >= self.queue_depth {
            return Err(SubmitReject::new(
                request,
                IoError::new(IoErrorKind::QueueFull),
            ));
        }
        let Some(job_tx) = self.job_tx.as_ref() else {
            return Err(SubmitReject::new(
                request,
                IoError::with_message(IoErrorKind::Io, "channel is shut down"),
            ));
        };
        match job_tx.try_send(request) {
            Ok(()) => {
                self.in_flight += 1;
                Ok(())
            }
            Err(async_channel::TrySendError::Full(request)) => Err(SubmitReject::new(
                request,
                IoError::new(IoErrorKind::QueueFull),
            )),
            Err(async_channel::TrySendError::Closed(request)) => Err(SubmitReject::new(
                request,
                IoError::with_message(IoErrorKind::Io, "channel worker exited"),
            )),
        }
    }

    fn poll(&mut self) -> usize {
        let mut fired = 0;
        while let Some(done) = self.completions.pop() {
            self.in_flight -= 1;
            done.request.complete(done.status);
            fired += 1;
        }
        fired
    }

    fn in_flight(&self) -> usize {
        self.in_flight
    }
}

impl Drop for FileChannel {
    fn drop(&mut self) {
        // Close the job queue, let the worker finish what it already has,
        // then fail nothing: remaining completions still fire.
        self.job_tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        while let Some(done) = self.completions.pop() {
            self.in_flight = self.in_flight.saturating_sub(1);
            done.request.complete(done.status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::mpsc;
    use vblk_core::{CancelToken, IoBuffer};

    fn temp_device(blocks: u64) -> (tempfile::NamedTempFile, FileDevice) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&vec![0u8; (blocks * 512) as usize]).unwrap();
        tmp.flush().unwrap();
        let device = FileDevice::open("file0", tmp.path(), 512).unwrap();
        (tmp, device)
    }

    fn wait_poll(channel: &mut Box<dyn DeviceChannel>) {
        let mut budget = 1_000_000;
        while channel.in_flight() > 0 && budget > 0 {
            channel.poll();
            budget -= 1;
            std::thread::yield_now();
        }
        assert_eq!(channel.in_flight(), 0, "worker did not complete in time");
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_tmp, device) = temp_device(64);
        let mut channel = device.open_channel().unwrap();

        channel
            .submit(IoRequest::write(
                3,
                2,
                IoBuffer::from_vec(vec![0x5A; 1024]),
                |_| {},
            ))
            .unwrap();
        wait_poll(&mut channel);

        let (tx, rx) = mpsc::channel();
        channel
            .submit(IoRequest::read(
                3,
                2,
                IoBuffer::alloc_zeroed(1024),
                move |c| tx.send(c).unwrap(),
            ))
            .unwrap();
        wait_poll(&mut channel);
        let completion = rx.recv().unwrap();
        assert!(completion.status.is_ok());
        assert!(completion
            .buffer
            .unwrap()
            .to_vec()
            .iter()
            .all(|&b| b == 0x5A));
    }

    #[test]
    fn flush_persists_to_media() {
        let (tmp, device) = temp_device(8);
        let mut channel = device.open_channel().unwrap();
        channel
            .submit(IoRequest::write(
                0,
                1,
                IoBuffer::from_vec(vec![0xC3; 512]),
                |_| {},
            ))
            .unwrap();
        channel.submit(IoRequest::flush(|_| {})).unwrap();
        wait_poll(&mut channel);
        drop(channel);

        let raw = std::fs::read(tmp.path()).unwrap();
        assert!(raw[..512].iter().all(|&b| b == 0xC3));
    }

    #[test]
    fn cancelled_before_pickup_completes_aborted() {
        let (_tmp, device) = temp_device(8);
        let mut channel = device.open_channel().unwrap();
        let token = CancelToken::new();
        token.cancel();
        let (tx, rx) = mpsc::channel();
        channel
            .submit(
                IoRequest::read(0, 1, IoBuffer::alloc_zeroed(512), move |c| {
                    tx.send(c.status).unwrap()
                })
                .with_cancel(token),
            )
            .unwrap();
        wait_poll(&mut channel);
        let status = rx.recv().unwrap();
        assert_eq!(status.err().unwrap().kind(), IoErrorKind::Aborted);
    }

    #[test]
    fn queue_depth_enforced() {
        let (_tmp, device) = temp_device(8);
        let device = device.with_queue_depth(1);
        let mut channel = device.open_channel().unwrap();
        channel
            .submit(IoRequest::read(0, 1, IoBuffer::alloc_zeroed(512), |_| {}))
            .unwrap();
        let reject = channel
            .submit(IoRequest::read(0, 1, IoBuffer::alloc_zeroed(512), |_| {}))
            .unwrap_err();
        assert_eq!(reject.error.kind(), IoErrorKind::QueueFull);
        wait_poll(&mut channel);
    }

    #[test]
    fn unmap_unsupported() {
        let (_tmp, device) = temp_device(8);
        let mut channel = device.open_channel().unwrap();
        let reject = channel.submit(IoRequest::unmap(0, 1, |_| {})).unwrap_err();
        assert_eq!(reject.error.kind(), IoErrorKind::Unsupported);
    }
}
