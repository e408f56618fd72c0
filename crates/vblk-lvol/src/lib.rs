//! Logical volume pool vbdev.
//!
//! A pool claims one base device, reserves [`META_BLOCKS`] blocks at LBA 0
//! for its superblock and extent table, and carves the rest into named
//! volumes. Each volume registers as its own block device whose channel
//! translates volume LBAs through the extent map onto a private base
//! channel. Every metadata mutation is written and flushed to the base
//! device before the in-memory state commits, so a crash mid-operation
//! leaves the previous table on media.

pub mod meta;

use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vblk_core::{
    check_request, BlockDevice, ClaimGuard, DeviceChannel, DeviceGeometry, DeviceHandle,
    DeviceRegistry, IoBuffer, IoCapabilities, IoCompletion, IoError, IoErrorKind, IoRequest,
    IoResult, IoStatus, IoType, OpenChannel, SubmitReject, TEARDOWN_POLL_BUDGET,
};

pub use meta::{Extent, MetaError, PoolMeta, VolumeRecord, FLAG_READ_ONLY, META_BLOCKS};

/// Poll iterations allowed for one synchronous metadata I/O.
const META_POLL_BUDGET: usize = TEARDOWN_POLL_BUDGET;

/// Blocks moved per synchronous copy step while populating a snapshot.
const COPY_CHUNK_BLOCKS: u64 = 128;

/// Controller object for one formatted pool.
///
/// Not itself a block device; it owns the base claim and the registry
/// entries of its volumes.
pub struct LvolPool {
    name: String,
    registry: Arc<DeviceRegistry>,
    base: DeviceHandle,
    block_size: u32,
    meta: Mutex<PoolMeta>,
    // Dedicated channel for metadata reads/writes; volume I/O uses
    // per-channel base channels instead.
    meta_channel: Mutex<OpenChannel>,
    _claim: ClaimGuard,
}

impl LvolPool {
    /// Format `base_name` as a fresh pool and claim it.
    pub fn create(
        registry: &Arc<DeviceRegistry>,
        name: impl Into<String>,
        base_name: &str,
    ) -> IoResult<Self> {
        let name = name.into();
        let (base, claim, channel) = Self::attach(registry, &name, base_name)?;
        let geometry = base.geometry();
        let pool_id: [u8; 16] = rand::thread_rng().gen();
        let meta = PoolMeta::new(pool_id, geometry.block_count);
        let pool = Self {
            name: name.clone(),
            registry: registry.clone(),
            base,
            block_size: geometry.block_size,
            meta: Mutex::new(meta.clone()),
            meta_channel: Mutex::new(channel),
            _claim: claim,
        };
        pool.persist(&meta)?;
        info!(pool = %name, base = %base_name, "formatted lvol pool");
        Ok(pool)
    }

    /// Attach to an already-formatted pool, rediscovering its volumes and
    /// registering a device per volume.
    pub fn open(
        registry: &Arc<DeviceRegistry>,
        name: impl Into<String>,
        base_name: &str,
    ) -> IoResult<Self> {
        let name = name.into();
        let (base, claim, mut channel) = Self::attach(registry, &name, base_name)?;
        let geometry = base.geometry();
        let region_len = region_len(geometry.block_size);

        let buffer = run_sync(
            &mut channel,
            IoType::Read,
            0,
            META_BLOCKS,
            Some(IoBuffer::alloc_zeroed(region_len)),
        )?
        .ok_or_else(|| IoError::with_message(IoErrorKind::Io, "metadata read returned no data"))?;
        let meta = PoolMeta::decode(&buffer.to_vec())?;
        if meta.total_blocks > geometry.block_count {
            return Err(IoError::with_message(
                IoErrorKind::Io,
                format!(
                    "pool spans {} blocks but base only has {}",
                    meta.total_blocks, geometry.block_count
                ),
            ));
        }
        check_extent_table(&meta)?;

        let pool = Self {
            name: name.clone(),
            registry: registry.clone(),
            base,
            block_size: geometry.block_size,
            meta: Mutex::new(meta.clone()),
            meta_channel: Mutex::new(channel),
            _claim: claim,
        };
        for volume in &meta.volumes {
            pool.register_volume(volume)?;
        }
        info!(pool = %name, volumes = meta.volumes.len(), "opened lvol pool");
        Ok(pool)
    }

    fn attach(
        registry: &Arc<DeviceRegistry>,
        name: &str,
        base_name: &str,
    ) -> IoResult<(DeviceHandle, ClaimGuard, OpenChannel)> {
        let base = registry.lookup(base_name)?;
        let geometry = base.geometry();
        if geometry.block_count <= META_BLOCKS {
            return Err(IoError::with_message(
                IoErrorKind::InvalidRange,
                format!(
                    "base device of {} blocks cannot hold a {} block metadata region",
                    geometry.block_count, META_BLOCKS
                ),
            ));
        }
        let claim = registry.claim(base_name, format!("lvolpool:{name}"))?;
        let channel = base.open_channel()?;
        Ok((base, claim, channel))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registry name of a volume's block device.
    pub fn volume_device_name(&self, volume: &str) -> String {
        format!("{}/{}", self.name, volume)
    }

    /// Blocks not yet allocated to any volume.
    pub fn free_blocks(&self) -> u64 {
        let meta = self.meta.lock();
        meta.data_blocks() - allocated_blocks(&meta)
    }

    pub fn volumes(&self) -> Vec<VolumeRecord> {
        self.meta.lock().volumes.clone()
    }

    /// Carve a new volume and register its device.
    pub fn create_volume(&self, volume: &str, blocks: u64) -> IoResult<DeviceHandle> {
        if blocks == 0 {
            return Err(IoError::with_message(
                IoErrorKind::InvalidRange,
                "volume size must be non-zero",
            ));
        }
        if volume.is_empty() || volume.contains('/') {
            return Err(IoError::with_message(
                IoErrorKind::NameConflict,
                "volume name must be non-empty and must not contain '/'",
            ));
        }
        let mut meta = self.meta.lock();
        if meta.volumes.iter().any(|v| v.name == volume) {
            return Err(IoError::with_message(
                IoErrorKind::NameConflict,
                format!("volume {volume} already exists"),
            ));
        }
        let extents = allocate(&meta, blocks)?;
        let record = VolumeRecord {
            name: volume.to_string(),
            flags: 0,
            extents,
        };
        let mut next = meta.clone();
        next.volumes.push(record.clone());
        self.persist(&next)?;
        *meta = next;
        drop(meta);

        debug!(pool = %self.name, volume, blocks, "created volume");
        self.register_volume(&record)?;
        self.registry.lookup(&self.volume_device_name(volume))
    }

    /// Take a read-only point-in-time copy of `volume` named `snapshot`.
    ///
    /// The source must have no open channels so the copy is crash
    /// consistent (`Busy` otherwise). The snapshot occupies its own
    /// extents, registers as `pool/snapshot`, and rejects writes and
    /// resizes; `delete_volume` reclaims it like any other volume.
    pub fn create_snapshot(&self, volume: &str, snapshot: &str) -> IoResult<DeviceHandle> {
        if snapshot.is_empty() || snapshot.contains('/') {
            return Err(IoError::with_message(
                IoErrorKind::NameConflict,
                "snapshot name must be non-empty and must not contain '/'",
            ));
        }
        let mut meta = self.meta.lock();
        if meta.volumes.iter().any(|v| v.name == snapshot) {
            return Err(IoError::with_message(
                IoErrorKind::NameConflict,
                format!("volume {snapshot} already exists"),
            ));
        }
        let source = meta
            .volumes
            .iter()
            .find(|v| v.name == volume)
            .cloned()
            .ok_or_else(|| IoError::new(IoErrorKind::NotFound))?;
        let info = self.registry.device_info(&self.volume_device_name(volume))?;
        if info.open_channels > 0 {
            return Err(IoError::with_message(
                IoErrorKind::Busy,
                format!(
                    "{volume} has {} open channel(s), snapshot needs a quiesced source",
                    info.open_channels
                ),
            ));
        }

        let blocks = source.blocks();
        let extents = allocate(&meta, blocks)?;
        {
            let mut channel = self.meta_channel.lock();
            copy_mapped(
                &mut channel,
                &source.extents,
                &extents,
                blocks,
                self.block_size,
            )?;
        }
        let record = VolumeRecord {
            name: snapshot.to_string(),
            flags: FLAG_READ_ONLY,
            extents,
        };
        let mut next = meta.clone();
        next.volumes.push(record.clone());
        self.persist(&next)?;
        *meta = next;
        drop(meta);

        info!(pool = %self.name, volume, snapshot, "created snapshot");
        self.register_volume(&record)?;
        self.registry.lookup(&self.volume_device_name(snapshot))
    }

    /// Grow or shrink `volume` to `new_blocks`.
    ///
    /// The volume device is re-registered with the new geometry, so the
    /// volume must have no open channels (`Busy` otherwise). Growth
    /// allocates additional extents; shrink trims from the tail.
    pub fn resize_volume(&self, volume: &str, new_blocks: u64) -> IoResult<DeviceHandle> {
        let device_name = self.volume_device_name(volume);
        if new_blocks == 0 {
            return Err(IoError::with_message(
                IoErrorKind::InvalidRange,
                "cannot resize to zero blocks, use delete_volume",
            ));
        }
        let mut meta = self.meta.lock();
        let index = meta
            .volumes
            .iter()
            .position(|v| v.name == volume)
            .ok_or_else(|| IoError::new(IoErrorKind::NotFound))?;
        let old_record = meta.volumes[index].clone();
        if old_record.read_only() {
            return Err(IoError::with_message(
                IoErrorKind::Unsupported,
                format!("{volume} is a read-only snapshot"),
            ));
        }
        if old_record.blocks() == new_blocks {
            return self.registry.lookup(&device_name);
        }

        // Geometry is fixed per registration, so the device comes out of
        // the registry first; Busy propagates while channels are open.
        self.registry.unregister(&device_name)?;

        let result = (|| {
            let mut record = old_record.clone();
            if new_blocks > record.blocks() {
                let extra = allocate(&meta, new_blocks - record.blocks())?;
                record.extents.extend(extra);
            } else {
                shrink_extents(&mut record.extents, new_blocks);
            }
            let mut next = meta.clone();
            next.volumes[index] = record.clone();
            self.persist(&next)?;
            *meta = next;
            Ok(record)
        })();

        match result {
            Ok(record) => {
                drop(meta);
                debug!(pool = %self.name, volume, new_blocks, "resized volume");
                self.register_volume(&record)?;
                self.registry.lookup(&device_name)
            }
            Err(err) => {
                // Metadata is untouched; put the old device back.
                drop(meta);
                self.register_volume(&old_record)?;
                Err(err)
            }
        }
    }

    /// Remove `volume`, freeing its extents.
    pub fn delete_volume(&self, volume: &str) -> IoResult<()> {
        let device_name = self.volume_device_name(volume);
        let mut meta = self.meta.lock();
        let index = meta
            .volumes
            .iter()
            .position(|v| v.name == volume)
            .ok_or_else(|| IoError::new(IoErrorKind::NotFound))?;
        let old_record = meta.volumes[index].clone();

        self.registry.unregister(&device_name)?;

        let mut next = meta.clone();
        next.volumes.remove(index);
        match self.persist(&next) {
            Ok(()) => {
                *meta = next;
                drop(meta);
                debug!(pool = %self.name, volume, "deleted volume");
                Ok(())
            }
            Err(err) => {
                drop(meta);
                self.register_volume(&old_record)?;
                Err(err)
            }
        }
    }

    /// Tear the pool down: unregister all volume devices and release the
    /// base claim.
    ///
    /// Refuses while any volume has open channels, handing the pool back
    /// alongside the `Busy` error so the caller can retry.
    pub fn destroy(self) -> Result<(), (Self, IoError)> {
        let volumes = self.volumes();
        for volume in &volumes {
            let name = self.volume_device_name(&volume.name);
            match self.registry.device_info(&name) {
                Ok(info) if info.open_channels > 0 => {
                    let err = IoError::with_message(
                        IoErrorKind::Busy,
                        format!(
                            "volume {} has {} open channel(s)",
                            volume.name, info.open_channels
                        ),
                    );
                    return Err((self, err));
                }
                Ok(_) => {}
                Err(err) => return Err((self, err)),
            }
        }
        for volume in &volumes {
            if let Err(err) = self.registry.unregister(&self.volume_device_name(&volume.name)) {
                return Err((self, err));
            }
        }
        info!(pool = %self.name, "destroyed lvol pool");
        if let Err(err) = self.meta_channel.into_inner().close() {
            warn!(error = %err, "metadata channel teardown");
        }
        Ok(())
    }

    fn register_volume(&self, record: &VolumeRecord) -> IoResult<()> {
        let base_geometry = self.base.geometry();
        let mut capabilities = self.base.capabilities()
            & (IoCapabilities::READ
                | IoCapabilities::WRITE
                | IoCapabilities::FLUSH
                | IoCapabilities::UNMAP
                | IoCapabilities::WRITE_ZEROES
                | IoCapabilities::RESET
                | IoCapabilities::COMPARE);
        if record.read_only() {
            capabilities &=
                !(IoCapabilities::WRITE | IoCapabilities::UNMAP | IoCapabilities::WRITE_ZEROES);
        }
        let device = LvolDevice {
            name: self.volume_device_name(&record.name),
            product: if record.read_only() {
                "Logical volume snapshot"
            } else {
                "Logical volume"
            },
            base: self.base.clone(),
            geometry: DeviceGeometry {
                block_size: self.block_size,
                block_count: record.blocks(),
                optimal_io_boundary: base_geometry.optimal_io_boundary,
                write_cache: base_geometry.write_cache,
            },
            capabilities,
            extents: record.extents.clone(),
        };
        self.registry.register(Arc::new(device))
    }

    /// Write `next` to the metadata region and flush, without touching the
    /// in-memory table. Callers commit only after this succeeds.
    fn persist(&self, next: &PoolMeta) -> IoResult<()> {
        let bytes = next.encode(region_len(self.block_size))?;
        let mut channel = self.meta_channel.lock();
        run_sync(
            &mut channel,
            IoType::Write,
            0,
            META_BLOCKS,
            Some(IoBuffer::from_vec(bytes)),
        )?;
        if self.base.capabilities().contains(IoCapabilities::FLUSH) {
            run_sync(&mut channel, IoType::Flush, 0, 0, None)?;
        }
        Ok(())
    }
}

fn region_len(block_size: u32) -> usize {
    META_BLOCKS as usize * block_size as usize
}

fn allocated_blocks(meta: &PoolMeta) -> u64 {
    meta.volumes.iter().map(VolumeRecord::blocks).sum()
}

/// Reject an on-media extent table whose extents escape the data area or
/// alias each other. A table this code wrote always passes; a corrupted or
/// foreign one must not silently map two volumes onto the same blocks.
fn check_extent_table(meta: &PoolMeta) -> IoResult<()> {
    let mut spans: Vec<(u64, u64, &str)> = Vec::new();
    for volume in &meta.volumes {
        for extent in &volume.extents {
            if extent.blocks == 0 {
                return Err(IoError::with_message(
                    IoErrorKind::Io,
                    format!("volume {} has an empty extent", volume.name),
                ));
            }
            let end = extent
                .start
                .checked_add(extent.blocks)
                .filter(|end| extent.start >= META_BLOCKS && *end <= meta.total_blocks)
                .ok_or_else(|| {
                    IoError::with_message(
                        IoErrorKind::Io,
                        format!(
                            "volume {} extent [{}, +{}) escapes the data area",
                            volume.name, extent.start, extent.blocks
                        ),
                    )
                })?;
            spans.push((extent.start, end, &volume.name));
        }
    }
    spans.sort_by_key(|(start, _, _)| *start);
    for pair in spans.windows(2) {
        let (_, prev_end, prev_name) = pair[0];
        let (next_start, _, next_name) = pair[1];
        if next_start < prev_end {
            return Err(IoError::with_message(
                IoErrorKind::Io,
                format!("volumes {prev_name} and {next_name} have overlapping extents"),
            ));
        }
    }
    Ok(())
}

/// First-fit allocation over the free gaps between live extents. A request
/// larger than any single gap is satisfied with multiple extents.
fn allocate(meta: &PoolMeta, blocks: u64) -> IoResult<Vec<Extent>> {
    let mut used: Vec<Extent> = meta
        .volumes
        .iter()
        .flat_map(|v| v.extents.iter().copied())
        .collect();
    used.sort_by_key(|e| e.start);
    // Sentinel closing the final gap at the end of the data area.
    used.push(Extent {
        start: meta.total_blocks,
        blocks: 0,
    });

    let mut granted = Vec::new();
    let mut remaining = blocks;
    let mut cursor = META_BLOCKS;
    for extent in &used {
        let gap = extent.start.saturating_sub(cursor);
        if gap > 0 {
            let take = gap.min(remaining);
            granted.push(Extent {
                start: cursor,
                blocks: take,
            });
            remaining -= take;
            if remaining == 0 {
                break;
            }
        }
        cursor = cursor.max(extent.start + extent.blocks);
    }

    if remaining > 0 {
        let free = meta.data_blocks() - allocated_blocks(meta);
        return Err(IoError::with_message(
            IoErrorKind::ResourceExhausted,
            format!("{blocks} blocks requested, {free} free in pool"),
        ));
    }
    Ok(granted)
}

/// Trim extents from the tail until the volume holds `new_blocks`.
fn shrink_extents(extents: &mut Vec<Extent>, new_blocks: u64) {
    let mut total: u64 = extents.iter().map(|e| e.blocks).sum();
    while let Some(last) = extents.last_mut() {
        if total <= new_blocks {
            break;
        }
        let excess = total - new_blocks;
        if last.blocks > excess {
            last.blocks -= excess;
            total -= excess;
        } else {
            total -= last.blocks;
            extents.pop();
        }
    }
}

/// Copy `blocks` volume blocks from the `src` extent map to the `dst` map,
/// one bounded chunk at a time. Each step stays within a single extent on
/// both sides, so chunks shrink at extent seams.
fn copy_mapped(
    channel: &mut OpenChannel,
    src: &[Extent],
    dst: &[Extent],
    blocks: u64,
    block_size: u32,
) -> IoResult<()> {
    let mut copied = 0;
    while copied < blocks {
        let want = (blocks - copied).min(COPY_CHUNK_BLOCKS);
        let (src_lba, src_run, _) = first_piece(src, copied, want)?;
        let (dst_lba, dst_run, _) = first_piece(dst, copied, want)?;
        let run = src_run.min(dst_run);
        let len = (run * block_size as u64) as usize;
        let buffer = run_sync(
            channel,
            IoType::Read,
            src_lba,
            run,
            Some(IoBuffer::alloc_zeroed(len)),
        )?
        .ok_or_else(|| IoError::with_message(IoErrorKind::Io, "copy read returned no data"))?;
        run_sync(channel, IoType::Write, dst_lba, run, Some(buffer))?;
        copied += run;
    }
    Ok(())
}

fn first_piece(extents: &[Extent], lba: u64, num_blocks: u64) -> IoResult<(u64, u64, u64)> {
    map_range(extents, lba, num_blocks)
        .into_iter()
        .next()
        .ok_or_else(|| {
            IoError::with_message(IoErrorKind::InvalidRange, "block range outside extent map")
        })
}

/// Submit one request on `channel` and poll until it completes.
fn run_sync(
    channel: &mut OpenChannel,
    io_type: IoType,
    lba: u64,
    num_blocks: u64,
    buffer: Option<IoBuffer>,
) -> IoResult<Option<IoBuffer>> {
    let slot: Arc<Mutex<Option<IoCompletion>>> = Arc::new(Mutex::new(None));
    let done = slot.clone();
    let request = IoRequest::new(io_type, lba, num_blocks, buffer, move |completion| {
        *done.lock() = Some(completion);
    });
    channel.submit(request).map_err(|reject| reject.error)?;

    let mut budget = META_POLL_BUDGET;
    loop {
        channel.poll();
        if let Some(completion) = slot.lock().take() {
            return match completion.status {
                IoStatus::Ok => Ok(completion.buffer),
                IoStatus::Err(err) => Err(err),
            };
        }
        if budget == 0 {
            warn!(?io_type, "metadata i/o did not complete within poll budget");
            return Err(IoError::with_message(
                IoErrorKind::Io,
                "metadata i/o did not complete",
            ));
        }
        budget -= 1;
        std::thread::yield_now();
    }
}

/// Block device exposing one volume of a pool.
struct LvolDevice {
    name: String,
    product: &'static str,
    base: DeviceHandle,
    geometry: DeviceGeometry,
    capabilities: IoCapabilities,
    /// Volume-LBA-ordered extent map, fixed for this registration.
    extents: Vec<Extent>,
}

impl BlockDevice for LvolDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn product_name(&self) -> &str {
        self.product
    }

    fn geometry(&self) -> DeviceGeometry {
        self.geometry
    }

    fn capabilities(&self) -> IoCapabilities {
        self.capabilities
    }

    fn open_channel(&self) -> IoResult<Box<dyn DeviceChannel>> {
        Ok(Box::new(LvolChannel {
            geometry: self.geometry,
            capabilities: self.capabilities,
            extents: self.extents.clone(),
            base: self.base.open_channel()?,
            pending: HashMap::new(),
            done: Arc::new(Mutex::new(VecDeque::new())),
            next_token: 0,
        }))
    }
}

struct Parent {
    request: IoRequest,
    remaining: usize,
    error: Option<IoError>,
    /// The parent's own buffer travelled down on a single child request and
    /// must be handed back at completion.
    zero_copy: bool,
}

type DoneQueue = Arc<Mutex<VecDeque<(u64, u64, IoCompletion)>>>;

struct LvolChannel {
    geometry: DeviceGeometry,
    capabilities: IoCapabilities,
    extents: Vec<Extent>,
    base: OpenChannel,
    pending: HashMap<u64, Parent>,
    /// (token, byte offset into the parent payload, child completion).
    done: DoneQueue,
    next_token: u64,
}

impl LvolChannel {
    fn child_request(
        &self,
        token: u64,
        io_type: IoType,
        base_lba: u64,
        blocks: u64,
        byte_off: u64,
        buffer: Option<IoBuffer>,
        cancel: Option<&vblk_core::CancelToken>,
    ) -> IoRequest {
        let done = self.done.clone();
        let mut child = IoRequest::new(io_type, base_lba, blocks, buffer, move |completion| {
            done.lock().push_back((token, byte_off, completion));
        });
        if let Some(cancel) = cancel {
            child = child.with_cancel(cancel.clone());
        }
        child
    }
}

impl DeviceChannel for LvolChannel {
    fn submit(&mut self, mut request: IoRequest) -> Result<(), SubmitReject> {
        if let Err(err) = check_request(&self.geometry, self.capabilities, &request) {
            return Err(SubmitReject::new(request, err));
        }
        let token = self.next_token;
        self.next_token += 1;

        // Flush and reset have no range to translate.
        if matches!(request.io_type, IoType::Flush | IoType::Reset) {
            let child = self.child_request(
                token,
                request.io_type,
                0,
                0,
                0,
                None,
                request.cancel.as_ref(),
            );
            return match self.base.submit(child) {
                Ok(()) => {
                    self.pending.insert(
                        token,
                        Parent {
                            request,
                            remaining: 1,
                            error: None,
                            zero_copy: false,
                        },
                    );
                    Ok(())
                }
                Err(reject) => Err(SubmitReject::new(request, reject.error)),
            };
        }

        let pieces = map_range(&self.extents, request.lba, request.num_blocks);
        let block_size = self.geometry.block_size as u64;
        let carries_data = request.io_type.carries_data();

        if pieces.len() == 1 {
            // One extent covers the whole range; the parent's buffer (if
            // any) travels down untouched.
            let (base_lba, blocks, _) = pieces[0];
            let buffer = request.buffer.take();
            let child = self.child_request(
                token,
                request.io_type,
                base_lba,
                blocks,
                0,
                buffer,
                request.cancel.as_ref(),
            );
            return match self.base.submit(child) {
                Ok(()) => {
                    self.pending.insert(
                        token,
                        Parent {
                            request,
                            remaining: 1,
                            error: None,
                            zero_copy: carries_data,
                        },
                    );
                    Ok(())
                }
                Err(mut reject) => {
                    request.buffer = reject.request.buffer.take();
                    Err(SubmitReject::new(request, reject.error))
                }
            };
        }

        // Multi-extent: bounce buffers per piece. Reads land in per-child
        // scratch space and are copied into the parent payload at
        // completion; writes carve the flattened payload into per-child
        // copies up front.
        let flat = if carries_data && request.io_type != IoType::Read {
            request.buffer.as_ref().map(|b| b.to_vec())
        } else {
            None
        };
        let mut submitted = 0usize;
        let mut first_error = None;
        for (base_lba, blocks, block_off) in &pieces {
            let byte_off = block_off * block_size;
            let byte_len = (blocks * block_size) as usize;
            let buffer = if !carries_data {
                None
            } else if let Some(flat) = &flat {
                let start = byte_off as usize;
                Some(IoBuffer::from_vec(flat[start..start + byte_len].to_vec()))
            } else {
                Some(IoBuffer::alloc_zeroed(byte_len))
            };
            let child = self.child_request(
                token,
                request.io_type,
                *base_lba,
                *blocks,
                byte_off,
                buffer,
                request.cancel.as_ref(),
            );
            match self.base.submit(child) {
                Ok(()) => submitted += 1,
                Err(reject) => {
                    first_error = Some(reject.error);
                    break;
                }
            }
        }

        if submitted == 0 {
            let error = first_error
                .unwrap_or_else(|| IoError::new(IoErrorKind::InvalidRange));
            return Err(SubmitReject::new(request, error));
        }
        // Some children are already in flight; the parent completes with
        // the rejection error once they drain.
        self.pending.insert(
            token,
            Parent {
                request,
                remaining: submitted,
                error: first_error,
                zero_copy: false,
            },
        );
        Ok(())
    }

    fn poll(&mut self) -> usize {
        self.base.poll();
        let mut fired = 0;

        loop {
            let item = self.done.lock().pop_front();
            let Some((token, byte_off, completion)) = item else {
                break;
            };
            let Some(parent) = self.pending.get_mut(&token) else {
                continue;
            };
            match completion.status {
                IoStatus::Ok => {
                    if parent.zero_copy {
                        parent.request.buffer = completion.buffer;
                    } else if parent.request.io_type == IoType::Read {
                        if let (Some(dst), Some(src)) =
                            (parent.request.buffer.as_mut(), completion.buffer.as_ref())
                        {
                            if let Err(err) = dst.write_at(byte_off as usize, &src.to_vec()) {
                                parent.error.get_or_insert(err);
                            }
                        }
                    }
                }
                IoStatus::Err(err) => {
                    if parent.zero_copy {
                        parent.request.buffer = completion.buffer;
                    }
                    parent.error.get_or_insert(err);
                }
            }
            parent.remaining -= 1;
            if parent.remaining == 0 {
                let Some(parent) = self.pending.remove(&token) else {
                    continue;
                };
                let status = match parent.error {
                    None => IoStatus::Ok,
                    Some(err) => IoStatus::Err(err),
                };
                parent.request.complete(status);
                fired += 1;
            }
        }
        fired
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }
}

/// Translate a volume block range into (base LBA, blocks, volume block
/// offset from the start of the request) pieces, one per touched extent.
fn map_range(extents: &[Extent], lba: u64, num_blocks: u64) -> Vec<(u64, u64, u64)> {
    let mut pieces = Vec::new();
    let mut extent_base = 0u64;
    let mut pos = lba;
    let mut remaining = num_blocks;
    for extent in extents {
        let extent_end = extent_base + extent.blocks;
        if remaining > 0 && pos < extent_end {
            let within = pos - extent_base;
            let take = remaining.min(extent.blocks - within);
            pieces.push((extent.start + within, take, pos - lba));
            pos += take;
            remaining -= take;
        }
        extent_base = extent_end;
        if remaining == 0 {
            break;
        }
    }
    pieces
}
