/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::AccelError;
use crate::DeviceIndex;
use crate::Stream;

/// Byte pattern written into fresh allocations. Device memory is not
/// initialized by the allocator; filling it with `0xff` makes reads of memory
/// nobody wrote show up as NaN for floating point data.
const UNINITIALIZED_BYTE: u8 = 0xff;

/// Memory accounting for a device, or for one context on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Allocations that have not been freed yet.
    pub live_allocations: usize,
    /// Bytes held by live allocations.
    pub live_bytes: usize,
    /// Allocations made over the lifetime of the device.
    pub total_allocations: usize,
}

impl MemoryStats {
    fn record_allocation(&mut self, nbytes: usize) {
        self.live_allocations += 1;
        self.live_bytes += nbytes;
        self.total_allocations += 1;
    }

    fn record_free(&mut self, nbytes: usize) {
        self.live_allocations -= 1;
        self.live_bytes -= nbytes;
    }
}

#[derive(Debug)]
struct DeviceState {
    index: DeviceIndex,
    capacity: Option<usize>,
    stats: Mutex<MemoryStats>,
}

/// The accelerator runtime: a fixed pool of devices.
#[derive(Debug, Clone)]
pub struct Runtime {
    devices: Vec<Arc<DeviceState>>,
}

impl Runtime {
    /// Create a runtime with `device_count` devices and no memory limit.
    pub fn new(device_count: usize) -> Self {
        Self::build(device_count, None)
    }

    /// Create a runtime whose devices each hold at most `bytes_per_device`
    /// bytes of live allocations.
    pub fn with_memory_limit(device_count: usize, bytes_per_device: usize) -> Self {
        Self::build(device_count, Some(bytes_per_device))
    }

    fn build(device_count: usize, capacity: Option<usize>) -> Self {
        let devices = (0..device_count)
            .map(|index| {
                Arc::new(DeviceState {
                    index: DeviceIndex(index),
                    capacity,
                    stats: Mutex::new(MemoryStats::default()),
                })
            })
            .collect();
        Self { devices }
    }

    /// Number of devices in the pool.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Bind to the device at `index`. The returned [`Device`] is a new context
    /// through which all later allocations and streams are created. Several
    /// contexts may share a device; each keeps its own memory accounting.
    pub fn select_device(&self, index: DeviceIndex) -> Result<Device, AccelError> {
        if self.devices.is_empty() {
            return Err(AccelError::NoDevice);
        }
        let state = self
            .devices
            .get(index.0)
            .ok_or(AccelError::InvalidDevice(index))?;
        tracing::debug!("selected {}", index);
        Ok(Device {
            state: state.clone(),
            context: Arc::new(Mutex::new(MemoryStats::default())),
        })
    }

    /// Memory held on device `index` across all of its contexts.
    pub fn device_memory_stats(&self, index: DeviceIndex) -> Result<MemoryStats, AccelError> {
        let state = self
            .devices
            .get(index.0)
            .ok_or(AccelError::InvalidDevice(index))?;
        Ok(*state.stats.lock())
    }
}

/// A selected device context. Cheap to clone; all clones share the same
/// context.
#[derive(Clone)]
pub struct Device {
    state: Arc<DeviceState>,
    context: Arc<Mutex<MemoryStats>>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.state.index)
            .finish()
    }
}

impl Device {
    pub fn index(&self) -> DeviceIndex {
        self.state.index
    }

    /// Allocate `nbytes` of device memory. The contents are unspecified until
    /// written.
    pub fn allocate(&self, nbytes: usize) -> Result<DeviceBuffer, AccelError> {
        {
            let mut stats = self.state.stats.lock();
            if let Some(capacity) = self.state.capacity {
                let available = capacity.saturating_sub(stats.live_bytes);
                if nbytes > available {
                    return Err(AccelError::MemoryAllocation {
                        device: self.state.index,
                        requested: nbytes,
                        available,
                    });
                }
            }
            stats.record_allocation(nbytes);
        }
        self.context.lock().record_allocation(nbytes);
        Ok(DeviceBuffer {
            inner: Arc::new(Allocation {
                device: self.state.clone(),
                context: self.context.clone(),
                nbytes,
                data: Mutex::new(vec![UNINITIALIZED_BYTE; nbytes]),
            }),
        })
    }

    /// Synchronously copy `src` into the start of `dst`.
    pub fn copy_host_to_device(&self, dst: &DeviceBuffer, src: &[u8]) -> Result<(), AccelError> {
        self.check_owner(dst)?;
        if src.len() > dst.nbytes() {
            return Err(AccelError::InvalidCopy {
                len: src.len(),
                capacity: dst.nbytes(),
            });
        }
        dst.write_on_device(|bytes| bytes[..src.len()].copy_from_slice(src));
        Ok(())
    }

    /// Synchronously copy the first `dst.len()` bytes of `src` into `dst`.
    pub fn copy_device_to_host(
        &self,
        dst: &mut [u8],
        src: &DeviceBuffer,
    ) -> Result<(), AccelError> {
        self.check_owner(src)?;
        if dst.len() > src.nbytes() {
            return Err(AccelError::InvalidCopy {
                len: dst.len(),
                capacity: src.nbytes(),
            });
        }
        src.read_on_device(|bytes| dst.copy_from_slice(&bytes[..dst.len()]));
        Ok(())
    }

    /// Create a new execution stream on this device.
    pub fn create_stream(&self) -> Result<Stream, AccelError> {
        Stream::new(self.index())
    }

    /// Memory held through this context.
    pub fn memory_stats(&self) -> MemoryStats {
        *self.context.lock()
    }

    fn check_owner(&self, buffer: &DeviceBuffer) -> Result<(), AccelError> {
        if buffer.device() != self.index() {
            return Err(AccelError::DeviceMismatch {
                device: self.index(),
                buffer: buffer.device(),
            });
        }
        Ok(())
    }
}

struct Allocation {
    device: Arc<DeviceState>,
    context: Arc<Mutex<MemoryStats>>,
    nbytes: usize,
    data: Mutex<Vec<u8>>,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.device.stats.lock().record_free(self.nbytes);
        self.context.lock().record_free(self.nbytes);
    }
}

/// A region of device memory.
///
/// Handles are cheap to clone so that work queued on a [`Stream`] can keep the
/// memory alive until it has run; the allocation is released once the last
/// handle is gone. Owners release their handle with [`DeviceBuffer::free`].
#[derive(Clone)]
pub struct DeviceBuffer {
    inner: Arc<Allocation>,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device())
            .field("nbytes", &self.nbytes())
            .finish()
    }
}

impl DeviceBuffer {
    pub fn device(&self) -> DeviceIndex {
        self.inner.device.index
    }

    pub fn nbytes(&self) -> usize {
        self.inner.nbytes
    }

    /// Whether both handles refer to the same allocation.
    pub fn aliases(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Release this handle. The memory is returned to the device once any
    /// work still queued against it has finished.
    pub fn free(self) {
        drop(self)
    }

    /// Device-side read access, for work executing on a stream.
    pub fn read_on_device<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.data.lock())
    }

    /// Device-side write access, for work executing on a stream.
    pub fn write_on_device<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.inner.data.lock())
    }
}
