use proptest::prelude::*;
use std::sync::Arc;
use vblk_backends::MallocDevice;
use vblk_core::{DeviceRegistry, IoErrorKind};
use vblk_lvol::{Extent, LvolPool, PoolMeta, VolumeRecord, META_BLOCKS};

const BASE_BLOCKS: u64 = 2048;

fn pool_on_fresh_base() -> (Arc<DeviceRegistry>, LvolPool) {
    let registry = Arc::new(DeviceRegistry::new());
    registry
        .register(Arc::new(MallocDevice::new("base0", 512, BASE_BLOCKS).unwrap()))
        .unwrap();
    let pool = LvolPool::create(&registry, "p", "base0").unwrap();
    (registry, pool)
}

fn assert_extent_invariants(pool: &LvolPool) -> Result<(), TestCaseError> {
    let mut spans: Vec<(u64, u64)> = pool
        .volumes()
        .iter()
        .flat_map(|v| v.extents.iter().map(|e| (e.start, e.start + e.blocks)))
        .collect();
    spans.sort_unstable();
    for pair in spans.windows(2) {
        prop_assert!(pair[0].1 <= pair[1].0, "extents overlap: {pair:?}");
    }
    for (start, end) in &spans {
        prop_assert!(*start >= META_BLOCKS, "extent inside metadata region");
        prop_assert!(*end <= BASE_BLOCKS, "extent past end of base device");
    }
    Ok(())
}

proptest! {
    #[test]
    fn volumes_never_overlap_or_escape(sizes in proptest::collection::vec(1u64..500, 1..10)) {
        let (_registry, pool) = pool_on_fresh_base();
        let capacity = BASE_BLOCKS - META_BLOCKS;
        let mut used = 0u64;
        for (i, size) in sizes.iter().enumerate() {
            match pool.create_volume(&format!("v{i}"), *size) {
                Ok(handle) => {
                    used += size;
                    prop_assert_eq!(handle.geometry().block_count, *size);
                }
                Err(err) => {
                    prop_assert_eq!(err.kind(), IoErrorKind::ResourceExhausted);
                    prop_assert!(used + size > capacity);
                }
            }
        }
        prop_assert_eq!(pool.free_blocks(), capacity - used);
        assert_extent_invariants(&pool)?;
    }

    #[test]
    fn churn_keeps_allocation_sound(
        sizes in proptest::collection::vec(1u64..300, 2..8),
        regrow in 1u64..600,
    ) {
        // Create everything, delete every other volume to fragment the free
        // space, then grow the first survivor across the holes.
        let (_registry, pool) = pool_on_fresh_base();
        let mut created = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            let name = format!("v{i}");
            if pool.create_volume(&name, *size).is_ok() {
                created.push(name);
            }
        }
        for name in created.iter().skip(1).step_by(2) {
            pool.delete_volume(name).unwrap();
        }
        if let Some(first) = created.first() {
            let grown = pool
                .volumes()
                .iter()
                .find(|v| &v.name == first)
                .map(|v| v.extents.iter().map(|e| e.blocks).sum::<u64>())
                .unwrap()
                + regrow;
            match pool.resize_volume(first, grown) {
                Ok(handle) => prop_assert_eq!(handle.geometry().block_count, grown),
                Err(err) => prop_assert_eq!(err.kind(), IoErrorKind::ResourceExhausted),
            }
        }
        assert_extent_invariants(&pool)?;
    }

    #[test]
    fn metadata_codec_round_trips(
        volumes in proptest::collection::vec(
            (
                "[a-z]{1,12}",
                any::<bool>(),
                proptest::collection::vec((64u64..10_000, 1u64..5_000), 0..6),
            ),
            0..8,
        )
    ) {
        let mut meta = PoolMeta::new([0x42; 16], 1 << 20);
        for (name, read_only, extents) in volumes {
            meta.volumes.push(VolumeRecord {
                name,
                flags: if read_only { vblk_lvol::FLAG_READ_ONLY } else { 0 },
                extents: extents
                    .into_iter()
                    .map(|(start, blocks)| Extent { start, blocks })
                    .collect(),
            });
        }
        let region = 64 * 512;
        match meta.encode(region) {
            Ok(bytes) => {
                prop_assert_eq!(bytes.len(), region);
                prop_assert_eq!(PoolMeta::decode(&bytes).unwrap(), meta);
            }
            Err(err) => {
                let overflow = matches!(err, vblk_lvol::MetaError::RegionOverflow { .. });
                prop_assert!(overflow, "unexpected encode error: {err}");
            }
        }
    }
}
