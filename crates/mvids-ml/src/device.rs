//! Compute device selection for training and inference.

use candle_core::Device;
use tracing::{info, warn};

/// Pick the device a run trains on.
///
/// `force_cpu` pins the run to the CPU. Otherwise the first available GPU
/// back end compiled in (`cuda`, then `metal`) is used, with the CPU as the
/// last resort.
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        info!("GPU back ends disabled by training.force_cpu");
        return Device::Cpu;
    }
    cuda().or_else(metal).unwrap_or(Device::Cpu)
}

/// Short name used in logs and the run summary.
pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

#[cfg(feature = "cuda")]
fn cuda() -> Option<Device> {
    Device::new_cuda(0)
        .map_err(|e| warn!(error = %e, "cuda back end unavailable"))
        .ok()
}

#[cfg(not(feature = "cuda"))]
fn cuda() -> Option<Device> {
    None
}

#[cfg(feature = "metal")]
fn metal() -> Option<Device> {
    Device::new_metal(0)
        .map_err(|e| warn!(error = %e, "metal back end unavailable"))
        .ok()
}

#[cfg(not(feature = "metal"))]
fn metal() -> Option<Device> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_cpu() {
        let device = select_device(true);
        assert!(device.is_cpu());
        assert_eq!(device_label(&device), "cpu");
    }

    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    #[test]
    fn test_cpu_only_build_falls_back_to_cpu() {
        assert!(select_device(false).is_cpu());
    }
}
