//! Encrypting vbdev.
//!
//! Wraps one child device: writes are encrypted into a newly-owned buffer
//! before forwarding, reads are forwarded zero-copy and decrypted in place
//! when the child completion returns. The per-block tweak is a pure
//! function of (device key, LBA), so ciphertext is stable and the device
//! carries no per-write nonce state. A cipher failure fails only the one
//! request with `CryptoError`; the device stays usable.

mod cipher;

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;
use vblk_core::{
    check_request, BlockDevice, ClaimGuard, DeviceChannel, DeviceGeometry, DeviceHandle,
    DeviceRegistry, IoBuffer, IoCapabilities, IoCompletion, IoError, IoErrorKind, IoRequest,
    IoResult, IoStatus, IoType, SubmitReject,
};

pub use cipher::apply as apply_cipher;

/// Block device that encrypts all data at rest on its child device.
pub struct CryptoDevice {
    name: String,
    child: DeviceHandle,
    key: [u8; 32],
    _claim: Option<ClaimGuard>,
}

impl CryptoDevice {
    /// Wrap `child` without touching the registry. The caller keeps
    /// responsibility for claims and registration.
    pub fn new(name: impl Into<String>, child: DeviceHandle, key: [u8; 32]) -> Self {
        Self {
            name: name.into(),
            child,
            key,
            _claim: None,
        }
    }

    /// Claim `child_name` and register the wrapper under `name`.
    ///
    /// The claim is held for the wrapper's registered lifetime, so the child
    /// cannot be unregistered out from underneath it.
    pub fn register(
        registry: &DeviceRegistry,
        name: impl Into<String>,
        child_name: &str,
        key: [u8; 32],
    ) -> IoResult<DeviceHandle> {
        let name = name.into();
        let child = registry.lookup(child_name)?;
        let claim = registry.claim(child_name, format!("crypto:{name}"))?;
        debug!(device = %name, child = %child_name, "attaching crypto wrapper");
        let device = Self {
            name: name.clone(),
            child,
            key,
            _claim: Some(claim),
        };
        registry.register(Arc::new(device))?;
        registry.lookup(&name)
    }
}

impl BlockDevice for CryptoDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn product_name(&self) -> &str {
        "Crypto disk"
    }

    fn geometry(&self) -> DeviceGeometry {
        self.child.geometry()
    }

    fn capabilities(&self) -> IoCapabilities {
        // Unmap and write-zeroes would leave child-side zeroes that decrypt
        // to garbage, so they are not offered through the wrapper.
        self.child.capabilities()
            & (IoCapabilities::READ
                | IoCapabilities::WRITE
                | IoCapabilities::FLUSH
                | IoCapabilities::RESET)
    }

    fn open_channel(&self) -> IoResult<Box<dyn DeviceChannel>> {
        Ok(Box::new(CryptoChannel {
            geometry: self.geometry(),
            capabilities: self.capabilities(),
            child: self.child.open_channel()?,
            key: self.key,
            pending: HashMap::new(),
            done: Arc::new(Mutex::new(VecDeque::new())),
            local: VecDeque::new(),
            next_token: 0,
        }))
    }
}

type DoneQueue = Arc<Mutex<VecDeque<(u64, IoCompletion)>>>;

struct CryptoChannel {
    geometry: DeviceGeometry,
    capabilities: IoCapabilities,
    child: vblk_core::OpenChannel,
    key: [u8; 32],
    pending: HashMap<u64, IoRequest>,
    done: DoneQueue,
    local: VecDeque<(IoRequest, IoStatus)>,
    next_token: u64,
}

impl CryptoChannel {
    fn forward(
        &mut self,
        mut parent: IoRequest,
        child_buffer: Option<IoBuffer>,
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
        // Completions fire only from poll on this context, so the parent
        // can be stashed after the child submit is known to stick.
        match self.child.submit(child_req) {
            Ok(()) => {
                self.pending.insert(token, parent);
                Ok(())
            }
            Err(mut reject) => {
                if parent.io_type == IoType::Read {
                    // Hand the zero-copy read buffer back to the caller.
                    parent.buffer = reject.request.buffer.take();
                }
                Err(SubmitReject::new(parent, reject.error))
            }
        }
    }
}

impl DeviceChannel for CryptoChannel {
    fn submit(&mut self, request: IoRequest) -> Result<(), SubmitReject> {
        if let Err(err) = check_request(&self.geometry, self.capabilities, &request) {
            return Err(SubmitReject::new(request, err));
        }
        match request.io_type {
            IoType::Write => {
                let Some(buffer) = request.buffer.as_ref() else {
                    return Err(SubmitReject::new(
                        request,
                        IoError::new(IoErrorKind::InvalidRange),
                    ));
                };
                let mut ciphertext = buffer.to_vec();
                if let Err(err) = cipher::apply(
                    &self.key,
                    request.lba,
                    self.geometry.block_size,
                    &mut ciphertext,
                ) {
                    // Cipher failures are per-request: deliver through the
                    // normal completion path, device stays usable.
                    self.local.push_back((request, IoStatus::Err(err)));
                    return Ok(());
                }
                self.forward(request, Some(IoBuffer::from_vec(ciphertext)))
            }
            IoType::Read => {
                let mut request = request;
                let buffer = request.buffer.take();
                self.forward(request, buffer)
            }
            _ => self.forward(request, None),
        }
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
            match parent.io_type {
                IoType::Read => {
                    let mut status = completion.status;
                    let mut buffer = completion.buffer;
                    if status.is_ok() {
                        if let Some(buf) = buffer.as_mut() {
                            status = decrypt_in_place(
                                &self.key,
                                parent.lba,
                                self.geometry.block_size,
                                buf,
                            );
                        }
                    }
                    parent.buffer = buffer;
                    parent.complete(status);
                }
                _ => {
                    // Writes keep the caller's plaintext buffer; the
                    // ciphertext copy is dropped with the child completion.
                    parent.complete(completion.status);
                }
            }
            fired += 1;
        }

        for (request, status) in self.local.drain(..) {
            request.complete(status);
            fired += 1;
        }
        fired
    }

    fn in_flight(&self) -> usize {
        self.pending.len() + self.local.len()
    }
}

fn decrypt_in_place(key: &[u8; 32], lba: u64, block_size: u32, buffer: &mut IoBuffer) -> IoStatus {
    let result = if buffer.segments().len() == 1 {
        let segment = &mut buffer.segments_mut()[0];
        cipher::apply(key, lba, block_size, segment)
    } else {
        let mut flat = buffer.to_vec();
        cipher::apply(key, lba, block_size, &mut flat).and_then(|()| buffer.fill_from_slice(&flat))
    };
    match result {
        Ok(()) => IoStatus::Ok,
        Err(err) => IoStatus::Err(err),
    }
}
