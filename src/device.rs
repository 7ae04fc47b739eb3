use anyhow::Result;
use candle_core::Device;

/// Metal on Apple Silicon when built with the `metal` feature, else CPU.
pub fn select_device(cpu: bool) -> Device {
    if cpu {
        return Device::Cpu;
    }
    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
        tracing::warn!("Metal device unavailable, falling back to CPU");
    }
    Device::Cpu
}

#[cfg(target_os = "macos")]
pub fn with_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    objc::rc::autoreleasepool(f)
}

#[cfg(not(target_os = "macos"))]
pub fn with_autorelease_pool<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    f()
}
