//! Compute devices and scoped device leases.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    Cpu,
    Gpu(u32),
}

impl Device {
    /// Value for `CUDA_VISIBLE_DEVICES`; empty hides every accelerator.
    pub fn visible_devices(&self) -> String {
        match self {
            Device::Cpu => String::new(),
            Device::Gpu(id) => id.to_string(),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Gpu(id) => write!(f, "cuda:{id}"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        if s == "cpu" {
            return Ok(Device::Cpu);
        }
        let id = s
            .strip_prefix("cuda:")
            .or_else(|| s.strip_prefix("gpu:"))
            .unwrap_or(&s);
        id.parse()
            .map(Device::Gpu)
            .map_err(|_| format!("invalid device '{s}'; expected cpu, cuda:<n> or <n>"))
    }
}

impl TryFrom<String> for Device {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Device> for String {
    fn from(d: Device) -> Self {
        d.to_string()
    }
}

/// A fixed set of devices handed out one lease at a time.
#[derive(Debug, Clone)]
pub struct DevicePool {
    free: Arc<Mutex<VecDeque<Device>>>,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl DevicePool {
    pub fn new(devices: Vec<Device>) -> Self {
        let capacity = devices.len();
        Self {
            free: Arc::new(Mutex::new(devices.into())),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// `slots` interchangeable CPU leases.
    pub fn cpu(slots: usize) -> Self {
        Self::new(vec![Device::Cpu; slots.max(1)])
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Take a free device without waiting.
    pub fn try_acquire(&self) -> Option<DeviceLease> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok()?;
        let device = self
            .free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()?;
        Some(DeviceLease {
            device,
            free: Arc::clone(&self.free),
            _permit: permit,
        })
    }
}

/// Exclusive use of one device. The device returns to its pool on drop,
/// whichever way the holding trial ends.
#[derive(Debug)]
pub struct DeviceLease {
    device: Device,
    free: Arc<Mutex<VecDeque<Device>>>,
    _permit: OwnedSemaphorePermit,
}

impl DeviceLease {
    pub fn device(&self) -> Device {
        self.device
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.free
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_parse() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("cuda:1".parse::<Device>().unwrap(), Device::Gpu(1));
        assert_eq!("GPU:2".parse::<Device>().unwrap(), Device::Gpu(2));
        assert_eq!("3".parse::<Device>().unwrap(), Device::Gpu(3));
        assert!("tpu".parse::<Device>().is_err());
        assert_eq!(Device::Gpu(0).to_string(), "cuda:0");
        assert_eq!(Device::Gpu(4).visible_devices(), "4");
        assert_eq!(Device::Cpu.visible_devices(), "");
    }

    #[test]
    fn test_lease_returns_device_on_drop() {
        let pool = DevicePool::new(vec![Device::Gpu(0), Device::Gpu(1)]);
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();
        assert_ne!(a.device(), b.device());
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.available(), 1);
        let c = pool.try_acquire().unwrap();
        assert_eq!(c.device(), Device::Gpu(0));
    }

    #[tokio::test]
    async fn test_lease_released_when_task_panics() {
        let pool = DevicePool::cpu(1);
        let lease = pool.try_acquire().unwrap();
        let handle = tokio::spawn(async move {
            let _lease = lease;
            panic!("job crashed");
        });
        assert!(handle.await.is_err());
        assert_eq!(pool.available(), 1);
    }
}
