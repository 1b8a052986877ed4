//! Reusable pools of GPU resources.
//!
//! A pool hands out [`PoolNode`]s. Fixed pools create every node up front
//! and block when all of them are checked out; growable pools create nodes
//! on demand up to a hard cap. Nodes whose fence was submitted are waited on
//! and reset before they are handed out again.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ash::vk;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_FENCE_TIMEOUT;
use crate::device::{
    BitstreamBufferResource, CommandBufferResource, EncodeDevice, ImageDescriptor, ImageResource,
    QueueKind,
};
use crate::error::{PipelineError, Result};

/// A resource a [`ResourcePool`] can create, hand out and destroy.
pub trait PoolResource: Copy + Send + 'static {
    /// What the pool needs to create a node.
    type Descriptor: Clone + fmt::Debug + Send;

    /// Name used in logs and errors.
    const KIND: &'static str;

    fn create(device: &dyn EncodeDevice, descriptor: &Self::Descriptor) -> Result<Self>;

    fn destroy(&self, device: &dyn EncodeDevice);

    /// Fence signalled by GPU work that uses this resource.
    fn fence(&self) -> Option<vk::Fence> {
        None
    }

    /// Combine the current high-water descriptor with a new requirement.
    fn high_water(_current: &Self::Descriptor, requested: &Self::Descriptor) -> Self::Descriptor {
        requested.clone()
    }
}

impl PoolResource for ImageResource {
    type Descriptor = ImageDescriptor;
    const KIND: &'static str = "image";

    fn create(device: &dyn EncodeDevice, descriptor: &ImageDescriptor) -> Result<Self> {
        device.create_image(descriptor)
    }

    fn destroy(&self, device: &dyn EncodeDevice) {
        device.destroy_image(self);
    }
}

impl PoolResource for CommandBufferResource {
    type Descriptor = QueueKind;
    const KIND: &'static str = "command buffer";

    fn create(device: &dyn EncodeDevice, queue: &QueueKind) -> Result<Self> {
        device.create_command_buffer(*queue)
    }

    fn destroy(&self, device: &dyn EncodeDevice) {
        device.destroy_command_buffer(self);
    }

    fn fence(&self) -> Option<vk::Fence> {
        Some(self.fence)
    }
}

impl PoolResource for BitstreamBufferResource {
    type Descriptor = u64;
    const KIND: &'static str = "bitstream buffer";

    fn create(device: &dyn EncodeDevice, size: &u64) -> Result<Self> {
        device.create_bitstream_buffer(*size)
    }

    fn destroy(&self, device: &dyn EncodeDevice) {
        device.destroy_bitstream_buffer(self);
    }

    fn high_water(current: &u64, requested: &u64) -> u64 {
        (*current).max(*requested)
    }
}

/// A checked-out pool resource.
///
/// Hand it back with [`ResourcePool::release`]; the node is deliberately not
/// `Clone` so a resource has exactly one holder.
#[derive(Debug)]
pub struct PoolNode<T> {
    index: usize,
    resource: T,
}

impl<T> PoolNode<T> {
    /// Index of the node inside its pool.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<T> Deref for PoolNode<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.resource
    }
}

struct Slot<T> {
    resource: T,
    checked_out: bool,
    submitted: bool,
}

struct PoolState<T: PoolResource> {
    slots: Vec<Slot<T>>,
    descriptor: T::Descriptor,
}

/// Pool of reusable GPU resources of one kind.
pub struct ResourcePool<T: PoolResource> {
    device: Arc<dyn EncodeDevice>,
    state: Mutex<PoolState<T>>,
    released: Condvar,
    max: usize,
    growable: bool,
    timeout: Duration,
}

impl<T: PoolResource> ResourcePool<T> {
    /// Create a pool of `capacity` nodes that never grows.
    pub fn fixed(
        device: Arc<dyn EncodeDevice>,
        capacity: usize,
        descriptor: T::Descriptor,
    ) -> Result<Self> {
        Self::with_nodes(device, capacity, capacity, false, descriptor)
    }

    /// Create a pool with `preallocate` nodes that grows on demand up to `max`.
    pub fn growable(
        device: Arc<dyn EncodeDevice>,
        preallocate: usize,
        max: usize,
        descriptor: T::Descriptor,
    ) -> Result<Self> {
        if preallocate > max {
            return Err(PipelineError::InvalidInput(format!(
                "{} pool preallocation {} exceeds cap {}",
                T::KIND,
                preallocate,
                max
            )));
        }
        Self::with_nodes(device, preallocate, max, true, descriptor)
    }

    fn with_nodes(
        device: Arc<dyn EncodeDevice>,
        count: usize,
        max: usize,
        growable: bool,
        descriptor: T::Descriptor,
    ) -> Result<Self> {
        let pool = Self {
            device,
            state: Mutex::new(PoolState {
                slots: Vec::with_capacity(max),
                descriptor,
            }),
            released: Condvar::new(),
            max,
            growable,
            timeout: DEFAULT_FENCE_TIMEOUT,
        };

        {
            let mut state = pool.state.lock();
            for _ in 0..count {
                // On error the pool drops and destroys what was created so far.
                let resource = T::create(&*pool.device, &state.descriptor)?;
                state.slots.push(Slot {
                    resource,
                    checked_out: false,
                    submitted: false,
                });
            }
        }

        debug!(
            "Created {} {} pool: {} nodes, max {}",
            if growable { "growable" } else { "fixed" },
            T::KIND,
            count,
            max
        );
        Ok(pool)
    }

    /// Bound for blocking acquires and fence waits.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Take a free node, waiting for its previous GPU work if needed.
    ///
    /// With every node of a fixed pool checked out this waits for a
    /// [`release`](Self::release), not for a fence: backpressure comes from
    /// the consumer releasing finished frames. The wait gives up with
    /// `PoolTimeout` after the pool timeout.
    pub fn acquire(&self) -> Result<PoolNode<T>> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();

        let index = loop {
            if let Some(index) = state.slots.iter().position(|slot| !slot.checked_out) {
                break index;
            }

            if self.growable {
                if state.slots.len() >= self.max {
                    return Err(PipelineError::AllocationFailure(format!(
                        "{} pool exhausted at its cap of {}",
                        T::KIND,
                        self.max
                    )));
                }
                let resource = T::create(&*self.device, &state.descriptor)?;
                state.slots.push(Slot {
                    resource,
                    checked_out: false,
                    submitted: false,
                });
                info!(
                    "Grew {} pool to {} nodes (max {})",
                    T::KIND,
                    state.slots.len(),
                    self.max
                );
                break state.slots.len() - 1;
            }

            if self.released.wait_until(&mut state, deadline).timed_out()
                && state.slots.iter().all(|slot| slot.checked_out)
            {
                return Err(PipelineError::PoolTimeout(format!(
                    "no {} released within {:?}",
                    T::KIND,
                    self.timeout
                )));
            }
        };

        let slot = &mut state.slots[index];
        slot.checked_out = true;
        let submitted = std::mem::replace(&mut slot.submitted, false);
        let resource = slot.resource;
        drop(state);

        if submitted {
            if let Some(fence) = resource.fence() {
                let timeout_ns = u64::try_from(self.timeout.as_nanos()).unwrap_or(u64::MAX);
                let waited = self
                    .device
                    .wait_for_fence(fence, timeout_ns)
                    .and_then(|()| self.device.reset_fence(fence));
                if let Err(err) = waited {
                    let mut state = self.state.lock();
                    let slot = &mut state.slots[index];
                    slot.checked_out = false;
                    slot.submitted = true;
                    self.released.notify_one();
                    return Err(err);
                }
            }
        }

        Ok(PoolNode { index, resource })
    }

    /// Record that GPU work signalling the node's fence was submitted.
    pub fn mark_submitted(&self, node: &PoolNode<T>) {
        if let Some(slot) = self.state.lock().slots.get_mut(node.index) {
            slot.submitted = true;
        }
    }

    /// Return a node to the pool without waiting on its fence.
    pub fn release(&self, node: PoolNode<T>) {
        let mut state = self.state.lock();
        match state.slots.get_mut(node.index) {
            Some(slot) if slot.checked_out => {
                slot.checked_out = false;
                drop(state);
                self.released.notify_one();
            }
            _ => warn!(
                "Released {} node {} that was not checked out",
                T::KIND,
                node.index
            ),
        }
    }

    /// Number of nodes that can be handed out without waiting or growing.
    pub fn available_count(&self) -> usize {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|slot| !slot.checked_out)
            .count()
    }

    /// Largest number of nodes the pool can hold.
    pub fn capacity(&self) -> usize {
        self.max
    }

    /// Number of nodes created so far.
    pub fn allocated_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Raise the descriptor used for nodes created from now on.
    pub fn raise_high_water(&self, descriptor: &T::Descriptor) {
        let mut state = self.state.lock();
        state.descriptor = T::high_water(&state.descriptor, descriptor);
    }
}

impl<T: PoolResource> Drop for ResourcePool<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let outstanding = state.slots.iter().filter(|slot| slot.checked_out).count();
        if outstanding > 0 {
            warn!(
                "Destroying {} pool with {} nodes still checked out",
                T::KIND,
                outstanding
            );
        }
        for slot in state.slots.drain(..) {
            slot.resource.destroy(&*self.device);
        }
    }
}
