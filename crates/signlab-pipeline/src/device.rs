//! Compute device for training and serving.
//!
//! [`Trainer`](crate::training::Trainer) and
//! [`InferenceService`](crate::inference::InferenceService) each pick their
//! device once, when they are constructed. Bundles are plain `f32`
//! safetensors, so a model trained on an accelerator loads on the CPU and
//! the other way round.

use candle_core::Device;

/// Device used for gesture model tensors.
///
/// An accelerator is only tried when the crate is built with the `cuda` or
/// `metal` feature; CUDA wins when both are enabled. Anything else, or an
/// accelerator that fails to initialise, means the CPU.
pub fn select_device() -> Device {
    let device = accelerator().unwrap_or(Device::Cpu);
    tracing::debug!(device = device_name(&device), "Selected compute device");
    device
}

/// Short backend name for log fields.
pub fn device_name(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}

fn accelerator() -> Option<Device> {
    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(0) {
            Ok(device) => return Some(device),
            Err(e) => tracing::warn!(error = %e, "cuda feature enabled but device 0 is unavailable"),
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => return Some(device),
            Err(e) => tracing::warn!(error = %e, "metal feature enabled but device 0 is unavailable"),
        }
    }

    None
}
