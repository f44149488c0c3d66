// Synchronization primitives
//
// One set per frame in flight: the image-available semaphore orders the
// acquire before the draw, the fence tells the CPU when the slot is free.
//
// Render-finished semaphores are keyed by swapchain image instead. Presenting
// image i may still hold its semaphore after the slot fence has fired; it is
// only free again once image i comes back from acquire.

use ash::vk;

use crate::error::{RenderError, RenderResult};

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> RenderResult<Self> {
        // Start signaled so the first wait on a fresh slot returns at once
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let image_available = create_semaphore(device)?;

        let in_flight_fence = match unsafe { device.create_fence(&fence_info, None) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { device.destroy_semaphore(image_available, None) };
                return Err(RenderError::FenceCreation(e));
            }
        };

        Ok(Self {
            image_available,
            in_flight_fence,
        })
    }

    /// # Safety
    /// The slot must not have pending GPU work.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_semaphore(self.image_available, None);
        device.destroy_fence(self.in_flight_fence, None);
    }
}

/// Ring of `FrameSync` slots indexed by the frame synchronizer.
pub struct FrameSyncRing {
    slots: Vec<FrameSync>,
}

impl FrameSyncRing {
    pub fn new(device: &ash::Device, frames_in_flight: usize) -> RenderResult<Self> {
        let mut slots = Vec::with_capacity(frames_in_flight);

        for _ in 0..frames_in_flight.max(1) {
            match FrameSync::new(device) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in &slots {
                        unsafe { slot.destroy(device) };
                    }
                    return Err(e);
                }
            }
        }

        log::info!("Created {} frames in flight", slots.len());
        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> &FrameSync {
        &self.slots[index % self.slots.len()]
    }

    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for slot in self.slots.drain(..) {
            slot.destroy(device);
        }
    }
}

/// Render-finished semaphores, one per swapchain image.
pub struct PresentSemaphores {
    semaphores: Vec<vk::Semaphore>,
}

impl PresentSemaphores {
    pub fn new(device: &ash::Device, image_count: usize) -> RenderResult<Self> {
        let mut present = Self { semaphores: Vec::new() };
        if let Err(e) = present.resize(device, image_count) {
            unsafe { present.destroy(device) };
            return Err(e);
        }
        Ok(present)
    }

    /// Match a rebuilt swapchain's image count.
    ///
    /// The device must be idle, since surplus semaphores are destroyed.
    pub fn resize(&mut self, device: &ash::Device, image_count: usize) -> RenderResult<()> {
        resize_with(
            &mut self.semaphores,
            image_count,
            || create_semaphore(device),
            |semaphore| unsafe { device.destroy_semaphore(semaphore, None) },
        )
    }

    pub fn get(&self, image_index: u32) -> Option<vk::Semaphore> {
        self.semaphores.get(image_index as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.semaphores.len()
    }

    /// # Safety
    /// The device must be idle.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for semaphore in self.semaphores.drain(..) {
            device.destroy_semaphore(semaphore, None);
        }
    }
}

fn create_semaphore(device: &ash::Device) -> RenderResult<vk::Semaphore> {
    let semaphore_info = vk::SemaphoreCreateInfo::builder();
    unsafe { device.create_semaphore(&semaphore_info, None) }.map_err(RenderError::SemaphoreCreation)
}

/// Grow or shrink `items` to `count`, keeping the ones that survive.
///
/// On a creation failure the items made so far stay in `items`.
pub fn resize_with<T>(
    items: &mut Vec<T>,
    count: usize,
    mut create: impl FnMut() -> RenderResult<T>,
    mut destroy: impl FnMut(T),
) -> RenderResult<()> {
    while items.len() > count {
        if let Some(item) = items.pop() {
            destroy(item);
        }
    }
    while items.len() < count {
        items.push(create()?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_grows_and_keeps_existing() {
        let mut items = vec![10, 11];
        let mut next = 12;

        let create = || {
            next += 1;
            Ok(next - 1)
        };
        resize_with(&mut items, 4, create, |_| panic!("nothing to drop")).unwrap();

        assert_eq!(items, vec![10, 11, 12, 13]);
    }

    #[test]
    fn test_resize_shrinks_and_destroys_surplus() {
        let mut items = vec![1, 2, 3];
        let mut destroyed = Vec::new();

        resize_with(&mut items, 1, || Ok(0), |item| destroyed.push(item)).unwrap();

        assert_eq!(items, vec![1]);
        assert_eq!(destroyed, vec![3, 2]);
    }

    #[test]
    fn test_resize_failure_keeps_created_items() {
        let mut items = Vec::new();
        let mut calls = 0;

        let err = resize_with(
            &mut items,
            3,
            || {
                calls += 1;
                if calls == 2 {
                    Err(RenderError::SemaphoreCreation(vk::Result::ERROR_OUT_OF_HOST_MEMORY))
                } else {
                    Ok(calls)
                }
            },
            |_| {},
        )
        .unwrap_err();

        assert!(matches!(err, RenderError::SemaphoreCreation(_)));
        assert_eq!(items, vec![1]);
    }
}
