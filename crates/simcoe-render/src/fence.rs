use std::fmt;
use std::sync::Arc;

use crate::device::Device;
use crate::error::{RenderError, RenderResult};
use crate::hal::{FenceTimeline, RawDevice};
use crate::queue::CommandQueue;

/// Monotonic GPU/CPU synchronization counter.
///
/// A queue signals a value once all work submitted before the signal has
/// executed; the CPU can block until a value is reached.
pub struct Fence {
    name: String,
    timeline: Arc<FenceTimeline>,
    device: Arc<dyn RawDevice>,
    epoch: u64,
}

impl Fence {
    pub fn new(device: &Device, initial: u64, name: &str) -> RenderResult<Self> {
        device.check_alive()?;
        let timeline = device.raw().create_fence(initial)?;
        Ok(Self {
            name: device
                .object_label(name)
                .unwrap_or_else(|| "<unnamed fence>".to_owned()),
            timeline,
            device: Arc::clone(device.raw()),
            epoch: device.epoch(),
        })
    }

    /// Enqueues a signal of `value` on `queue`, after all previously submitted work.
    pub fn signal(&self, queue: &CommandQueue, value: u64) -> RenderResult<()> {
        if queue.epoch() != self.epoch {
            return Err(RenderError::StaleResource {
                name: self.name.clone(),
                resource_epoch: self.epoch,
                device_epoch: queue.epoch(),
            });
        }
        queue.signal_timeline(&self.timeline, value)
    }

    /// Last value the GPU has reached. A removed device reports `u64::MAX`.
    pub fn completed_value(&self) -> u64 {
        self.timeline.completed()
    }

    /// Blocks until the fence reaches `value`. Returns immediately if it already has.
    pub fn wait(&self, value: u64) -> RenderResult<()> {
        if self.device.is_removed() {
            return Err(RenderError::DeviceRemoved(format!(
                "cannot wait on `{}` after device removal",
                self.name
            )));
        }
        if self.timeline.completed() >= value {
            return Ok(());
        }

        self.device.wait_for(&self.timeline, value)?;
        self.timeline.block_until(value);

        if self.device.is_removed() {
            return Err(RenderError::DeviceRemoved(format!(
                "device removed while waiting on `{}` for {value}",
                self.name
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("name", &self.name)
            .field("completed", &self.completed_value())
            .field("epoch", &self.epoch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueDesc;
    use crate::test_support;

    #[test]
    fn signal_then_wait_completes() {
        let device = test_support::device();
        let queue = device.new_command_queue(QueueDesc::direct()).expect("queue");
        let fence = Fence::new(&device, 0, "test fence").expect("fence");

        fence.signal(&queue, 3).expect("signal");
        fence.wait(3).expect("wait");
        assert_eq!(fence.completed_value(), 3);
        // already satisfied
        fence.wait(1).expect("wait");
    }

    #[test]
    fn removal_saturates_and_fails_waits() {
        let device = test_support::device();
        let fence = Fence::new(&device, 0, "test fence").expect("fence");

        device.set_removed();
        assert_eq!(fence.completed_value(), u64::MAX);
        assert!(matches!(fence.wait(1), Err(RenderError::DeviceRemoved(_))));
    }

    #[test]
    fn signal_from_foreign_queue_is_rejected() {
        let first = test_support::device();
        let second = test_support::device();
        let queue = second.new_command_queue(QueueDesc::direct()).expect("queue");
        let fence = Fence::new(&first, 0, "test fence").expect("fence");

        assert!(matches!(
            fence.signal(&queue, 1),
            Err(RenderError::StaleResource { .. })
        ));
    }
}
