//! Fault-injecting vbdev.
//!
//! Wraps one child device and applies a runtime-settable [`FaultPolicy`] per
//! operation kind. Failure policies are applied at submission time (the
//! child never sees the request; the error still arrives through the normal
//! completion callback, fired from `poll`). Corruption is applied around the
//! child: read payloads are flipped after a successful child completion,
//! write payloads are flipped in the copy handed to the child so the media
//! ends up corrupted while the caller's buffer stays pristine.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;
use vblk_core::{
    check_request, BlockDevice, ClaimGuard, DeviceChannel, DeviceGeometry, DeviceHandle,
    DeviceRegistry, IoBuffer, IoCapabilities, IoCompletion, IoError, IoErrorKind, IoRequest,
    IoResult, IoStatus, IoType, SubmitReject,
};

/// What to do with submissions of one operation kind.
#[derive(Clone, Debug, PartialEq)]
pub enum FaultPolicy {
    /// Pass through untouched.
    None,
    /// Fail the next `n` submissions, then revert to pass-through.
    FailNext(u32),
    /// Fail each submission independently with the given probability.
    FailWith { probability: f64 },
    /// Let the child run, then flip payload bytes.
    CorruptData,
}

/// Shared, runtime-settable policy table. Clones refer to the same table, so
/// a test can keep one handle while the device owns another.
#[derive(Clone, Default)]
pub struct FaultInjector {
    policies: Arc<Mutex<HashMap<IoType, FaultPolicy>>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, io_type: IoType, policy: FaultPolicy) {
        debug!(?io_type, ?policy, "fault policy set");
        let mut policies = self.policies.lock();
        if policy == FaultPolicy::None {
            policies.remove(&io_type);
        } else {
            policies.insert(io_type, policy);
        }
    }

    pub fn clear(&self, io_type: IoType) {
        self.policies.lock().remove(&io_type);
    }

    pub fn clear_all(&self) {
        self.policies.lock().clear();
    }

    /// Consume one injected failure for this operation kind, if armed.
    fn take_injected(&self, io_type: IoType) -> bool {
        let mut policies = self.policies.lock();
        match policies.get_mut(&io_type) {
            Some(FaultPolicy::FailNext(n)) => {
                if *n == 0 {
                    policies.remove(&io_type);
                    return false;
                }
                *n -= 1;
                if *n == 0 {
                    policies.remove(&io_type);
                }
                true
            }
            Some(FaultPolicy::FailWith { probability }) => {
                let p = probability.clamp(0.0, 1.0);
                rand::thread_rng().gen_bool(p)
            }
            _ => false,
        }
    }

    fn corrupts(&self, io_type: IoType) -> bool {
        matches!(
            self.policies.lock().get(&io_type),
            Some(FaultPolicy::CorruptData)
        )
    }
}

fn injected_error(io_type: IoType) -> IoError {
    IoError::with_message(IoErrorKind::Io, format!("injected {io_type:?} failure"))
}

/// Flip the first byte of every segment. Non-zero XOR guarantees the data
/// differs from what the child produced or was given.
fn corrupt(buffer: &mut IoBuffer) {
    for segment in buffer.segments_mut() {
        if let Some(byte) = segment.first_mut() {
            *byte ^= 0xA5;
        }
    }
}

/// Passthrough block device with fault injection hooks.
pub struct FaultyDevice {
    name: String,
    child: DeviceHandle,
    injector: FaultInjector,
    _claim: Option<ClaimGuard>,
}

impl FaultyDevice {
    pub fn new(name: impl Into<String>, child: DeviceHandle, injector: FaultInjector) -> Self {
        Self {
            name: name.into(),
            child,
            injector,
            _claim: None,
        }
    }

    /// Claim `child_name` and register the wrapper under `name`.
    pub fn register(
        registry: &DeviceRegistry,
        name: impl Into<String>,
        child_name: &str,
        injector: FaultInjector,
    ) -> IoResult<DeviceHandle> {
        let name = name.into();
        let child = registry.lookup(child_name)?;
        let claim = registry.claim(child_name, format!("faulty:{name}"))?;
        debug!(device = %name, child = %child_name, "attaching fault wrapper");
        let device = Self {
            name: name.clone(),
            child,
            injector,
            _claim: Some(claim),
        };
        registry.register(Arc::new(device))?;
        registry.lookup(&name)
    }

    pub fn injector(&self) -> FaultInjector {
        self.injector.clone()
    }
}

impl BlockDevice for FaultyDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn product_name(&self) -> &str {
        "Fault-injection disk"
    }

    fn geometry(&self) -> DeviceGeometry {
        self.child.geometry()
    }

    fn capabilities(&self) -> IoCapabilities {
        self.child.capabilities()
    }

    fn open_channel(&self) -> IoResult<Box<dyn DeviceChannel>> {
        Ok(Box::new(FaultyChannel {
            geometry: self.geometry(),
            capabilities: self.capabilities(),
            child: self.child.open_channel()?,
            injector: self.injector.clone(),
            pending: HashMap::new(),
            done: Arc::new(Mutex::new(VecDeque::new())),
            local: VecDeque::new(),
            next_token: 0,
        }))
    }
}

type DoneQueue = Arc<Mutex<VecDeque<(u64, IoCompletion)>>>;

struct FaultyChannel {
    geometry: DeviceGeometry,
    capabilities: IoCapabilities,
    child: vblk_core::OpenChannel,
    injector: FaultInjector,
    pending: HashMap<u64, IoRequest>,
    done: DoneQueue,
    local: VecDeque<IoRequest>,
    next_token: u64,
}

impl FaultyChannel {
    fn forward(
        &mut self,
        mut parent: IoRequest,
        child_buffer: Option<IoBuffer>,
        buffer_is_parents: bool,
    ) -> Result<(), SubmitReject> {
        let token = self.next_token;
        self.next_token += 1;
        let done = self.done.clone();
        let child_req = IoRequest::new(
            parent.io_type,
            parent.lba,
            parent.num_blocks,
            child_buffer,
            move |completion| {
                done.lock().push_back((token, completion));
            },
        );
        match self.child.submit(child_req) {
            Ok(()) => {
                self.pending.insert(token, parent);
                Ok(())
            }
            Err(mut reject) => {
                if buffer_is_parents {
                    parent.buffer = reject.request.buffer.take();
                }
                Err(SubmitReject::new(parent, reject.error))
            }
        }
    }
}

impl DeviceChannel for FaultyChannel {
    fn submit(&mut self, request: IoRequest) -> Result<(), SubmitReject> {
        if let Err(err) = check_request(&self.geometry, self.capabilities, &request) {
            return Err(SubmitReject::new(request, err));
        }
        if self.injector.take_injected(request.io_type) {
            // Child never sees the request; error fires from our poll.
            self.local.push_back(request);
            return Ok(());
        }
        if request.io_type == IoType::Write && self.injector.corrupts(IoType::Write) {
            let Some(buffer) = request.buffer.as_ref() else {
                return Err(SubmitReject::new(
                    request,
                    IoError::new(IoErrorKind::InvalidRange),
                ));
            };
            let mut copy = IoBuffer::from_vec(buffer.to_vec());
            corrupt(&mut copy);
            return self.forward(request, Some(copy), false);
        }
        let mut request = request;
        let buffer = request.buffer.take();
        self.forward(request, buffer, true)
    }

    fn poll(&mut self) -> usize {
        self.child.poll();
        let mut fired = 0;

        loop {
            let item = self.done.lock().pop_front();
            let Some((token, completion)) = item else {
                break;
            };
            let Some(mut parent) = self.pending.remove(&token) else {
                continue;
            };
            // The corrupt-write path forwarded a copy; only hand the child's
            // buffer back when the parent's own buffer travelled down.
            if parent.buffer.is_none() {
                parent.buffer = completion.buffer;
            }
            if parent.io_type == IoType::Read
                && completion.status.is_ok()
                && self.injector.corrupts(IoType::Read)
            {
                if let Some(buffer) = parent.buffer.as_mut() {
                    corrupt(buffer);
                }
            }
            parent.complete(completion.status);
            fired += 1;
        }

        for request in self.local.drain(..) {
            let err = injected_error(request.io_type);
            request.complete(IoStatus::Err(err));
            fired += 1;
        }
        fired
    }

    fn in_flight(&self) -> usize {
        self.pending.len() + self.local.len()
    }
}
