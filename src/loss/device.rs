use burn::backend::ndarray::NdArrayDevice;
use burn::backend::wgpu::WgpuDevice;

/// Whether a device is host memory rather than an accelerator.
pub trait DeviceClass {
    fn is_host(&self) -> bool;
}

impl DeviceClass for NdArrayDevice {
    fn is_host(&self) -> bool {
        true
    }
}

impl DeviceClass for WgpuDevice {
    fn is_host(&self) -> bool {
        matches!(self, WgpuDevice::Cpu)
    }
}
