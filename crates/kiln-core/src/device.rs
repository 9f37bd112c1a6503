use std::fmt;

/// Placement of tensor storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Host memory
    #[default]
    Cpu,
    /// Accelerator with device index, served by a kiln queue
    Xpu(usize),
}

impl Device {
    /// Whether this is the host.
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Whether this is an accelerator.
    pub fn is_xpu(&self) -> bool {
        matches!(self, Device::Xpu(_))
    }

    /// Queue index used for kernels on this device. The host maps to 0.
    pub fn index(&self) -> usize {
        match self {
            Device::Cpu => 0,
            Device::Xpu(idx) => *idx,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Xpu(idx) => write!(f, "xpu:{idx}"),
        }
    }
}
