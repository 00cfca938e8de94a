//! Binding-set allocator
//!
//! Descriptor pools are grouped by binding layout. Each pool holds a fixed
//! number of sets; when every pool of a layout is full a new one is appended,
//! existing pools are never resized.

use std::collections::HashMap;

use slotmap::{new_key_type, SlotMap};

use crate::render::api::{BindingLayout, DescriptorWrite, GpuBackend, RawDescriptorPool, RawDescriptorSet};
use crate::render::{RenderError, RenderResult};

/// Sets per pool unless configured otherwise
pub const DEFAULT_POOL_CAPACITY: u32 = 50;

new_key_type! {
    /// Handle to an allocated binding set
    pub struct BindingSetHandle;
}

#[derive(Debug)]
struct Pool {
    raw: RawDescriptorPool,
    live: u32,
}

#[derive(Debug, Default)]
struct LayoutPools {
    pools: Vec<Pool>,
    current: usize,
}

#[derive(Debug)]
struct BindingSetEntry {
    raw: RawDescriptorSet,
    layout: BindingLayout,
    pool: usize,
}

/// Growable per-layout descriptor pools
#[derive(Debug)]
pub struct BindingSetAllocator {
    capacity: u32,
    max_pools: Option<u32>,
    layouts: HashMap<BindingLayout, LayoutPools>,
    sets: SlotMap<BindingSetHandle, BindingSetEntry>,
}

impl BindingSetAllocator {
    /// Create an allocator with `capacity` sets per pool
    pub fn new(capacity: u32, max_pools: Option<u32>) -> Self {
        Self {
            capacity: capacity.max(1),
            max_pools,
            layouts: HashMap::new(),
            sets: SlotMap::with_key(),
        }
    }

    /// Allocate a set of `layout`, growing the pool list when needed
    pub fn allocate<B: GpuBackend>(&mut self, backend: &mut B, layout: &BindingLayout) -> RenderResult<BindingSetHandle> {
        let capacity = self.capacity;
        let entry = self.layouts.entry(layout.clone()).or_default();

        // Scan from the current pool so slots freed in older pools are reused
        let count = entry.pools.len();
        for step in 0..count {
            let index = (entry.current + step) % count;
            let pool = &mut entry.pools[index];
            if pool.live >= capacity {
                continue;
            }
            match backend.allocate_descriptor_set(pool.raw, layout) {
                Ok(raw) => {
                    pool.live += 1;
                    entry.current = index;
                    return Ok(self.sets.insert(BindingSetEntry {
                        raw,
                        layout: layout.clone(),
                        pool: index,
                    }));
                }
                Err(RenderError::PoolExhausted) => {
                    log::debug!("Binding pool {index} reported exhaustion with {} live sets", pool.live);
                    pool.live = capacity;
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(limit) = self.max_pools {
            if count >= limit as usize {
                return Err(RenderError::ResourceExhausted(format!(
                    "binding layout reached its limit of {limit} pools"
                )));
            }
        }

        let raw_pool = backend.create_descriptor_pool(layout, capacity)?;
        let raw = match backend.allocate_descriptor_set(raw_pool, layout) {
            Ok(raw) => raw,
            Err(err) => {
                backend.destroy_descriptor_pool(raw_pool);
                return Err(RenderError::ResourceExhausted(format!(
                    "allocation from a fresh binding pool failed: {err}"
                )));
            }
        };

        entry.pools.push(Pool { raw: raw_pool, live: 1 });
        entry.current = count;
        log::debug!("Created binding pool {} ({capacity} sets) for layout {:?}", count, layout.slots());

        Ok(self.sets.insert(BindingSetEntry {
            raw,
            layout: layout.clone(),
            pool: count,
        }))
    }

    /// Return a set to the pool it came from
    pub fn free<B: GpuBackend>(&mut self, backend: &mut B, handle: BindingSetHandle) -> RenderResult<()> {
        let entry = self
            .sets
            .remove(handle)
            .ok_or(RenderError::StaleHandle { kind: "binding set" })?;
        let pools = self
            .layouts
            .get_mut(&entry.layout)
            .ok_or_else(|| RenderError::invalid_operation("binding set layout has no pools"))?;
        let pool = pools
            .pools
            .get_mut(entry.pool)
            .ok_or_else(|| RenderError::invalid_operation("binding set pool index out of range"))?;

        backend.free_descriptor_set(pool.raw, entry.raw)?;
        pool.live = pool.live.saturating_sub(1);
        Ok(())
    }

    /// Point bindings of a set at resources
    pub fn write<B: GpuBackend>(
        &self,
        backend: &mut B,
        handle: BindingSetHandle,
        writes: &[DescriptorWrite],
    ) -> RenderResult<()> {
        backend.write_descriptor_set(self.raw(handle)?, writes)
    }

    /// Backend set behind a handle
    pub fn raw(&self, handle: BindingSetHandle) -> RenderResult<RawDescriptorSet> {
        self.sets
            .get(handle)
            .map(|entry| entry.raw)
            .ok_or(RenderError::StaleHandle { kind: "binding set" })
    }

    /// Index of the pool a set was allocated from, within its layout's pool list
    pub fn pool_of(&self, handle: BindingSetHandle) -> Option<usize> {
        self.sets.get(handle).map(|entry| entry.pool)
    }

    /// Number of pools created for `layout`
    pub fn pool_count(&self, layout: &BindingLayout) -> usize {
        self.layouts.get(layout).map_or(0, |pools| pools.pools.len())
    }

    /// Live sets across every layout
    pub fn live_sets(&self) -> usize {
        self.sets.len()
    }

    /// Destroy every pool and with it every set
    pub fn destroy_all<B: GpuBackend>(&mut self, backend: &mut B) {
        for (_, pools) in self.layouts.drain() {
            for pool in pools.pools {
                backend.destroy_descriptor_pool(pool.raw);
            }
        }
        self.sets.clear();
    }
}

impl Default for BindingSetAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::ShaderStages;
    use crate::render::backends::HeadlessBackend;

    fn material_layout() -> BindingLayout {
        BindingLayout::new().combined_image_sampler(0, ShaderStages::FRAGMENT)
    }

    #[test]
    fn test_pool_grows_on_the_fifty_first_allocation() {
        let mut backend = HeadlessBackend::default();
        let mut allocator = BindingSetAllocator::default();
        let layout = material_layout();

        let handles: Vec<_> = (0..50)
            .map(|_| allocator.allocate(&mut backend, &layout).unwrap())
            .collect();
        assert_eq!(allocator.pool_count(&layout), 1);

        let extra = allocator.allocate(&mut backend, &layout).unwrap();
        assert_eq!(allocator.pool_count(&layout), 2);
        assert_eq!(allocator.pool_of(extra), Some(1));
        assert!(handles.iter().all(|h| allocator.pool_of(*h) == Some(0)));
    }

    #[test]
    fn test_free_returns_set_to_its_pool() {
        let mut backend = HeadlessBackend::default();
        let mut allocator = BindingSetAllocator::new(2, None);
        let layout = material_layout();

        let a = allocator.allocate(&mut backend, &layout).unwrap();
        let _b = allocator.allocate(&mut backend, &layout).unwrap();
        let c = allocator.allocate(&mut backend, &layout).unwrap();
        assert_eq!(allocator.pool_of(c), Some(1));

        allocator.free(&mut backend, a).unwrap();
        assert!(matches!(allocator.raw(a), Err(RenderError::StaleHandle { .. })));

        // Pool 1 still has room, then the freed slot in pool 0 is reused
        let d = allocator.allocate(&mut backend, &layout).unwrap();
        assert_eq!(allocator.pool_of(d), Some(1));
        let e = allocator.allocate(&mut backend, &layout).unwrap();
        assert_eq!(allocator.pool_of(e), Some(0));
        assert_eq!(allocator.pool_count(&layout), 2);
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_layouts_get_separate_pools() {
        let mut backend = HeadlessBackend::default();
        let mut allocator = BindingSetAllocator::new(4, None);
        let scene = BindingLayout::new().uniform_buffer(0, 1, ShaderStages::VERTEX);

        allocator.allocate(&mut backend, &material_layout()).unwrap();
        allocator.allocate(&mut backend, &scene).unwrap();
        assert_eq!(allocator.pool_count(&material_layout()), 1);
        assert_eq!(allocator.pool_count(&scene), 1);
        assert_eq!(allocator.live_sets(), 2);
    }

    #[test]
    fn test_pool_limit_is_resource_exhausted() {
        let mut backend = HeadlessBackend::default();
        let mut allocator = BindingSetAllocator::new(1, Some(2));
        let layout = material_layout();

        allocator.allocate(&mut backend, &layout).unwrap();
        allocator.allocate(&mut backend, &layout).unwrap();
        let err = allocator.allocate(&mut backend, &layout).unwrap_err();
        assert!(matches!(err, RenderError::ResourceExhausted(_)));
    }

    #[test]
    fn test_destroy_all_releases_backend_sets() {
        let mut backend = HeadlessBackend::default();
        let mut allocator = BindingSetAllocator::default();
        allocator.allocate(&mut backend, &material_layout()).unwrap();
        allocator.allocate(&mut backend, &material_layout()).unwrap();
        assert_eq!(backend.live_objects().3, 2);

        allocator.destroy_all(&mut backend);
        assert_eq!(backend.live_objects().3, 0);
        assert_eq!(allocator.live_sets(), 0);
    }
}
