//! Defines usage profiles for allocated memory.

use crate::memory::Properties;

/// Intended usage of the memory an allocation ends up in.
///
/// A usage translates to required, preferred and avoided property flags;
/// the allocator scores every admissible memory type against them and picks
/// the cheapest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryUsage {
    /// No stated intention. Only explicit property flags of the request apply.
    #[default]
    Unknown,

    /// Full speed GPU access.
    /// Optimal for render targets and persistent resources.
    GpuOnly,

    /// Host access is guaranteed, coherently.
    /// Used for staging buffers written once and copied away.
    CpuOnly,

    /// CPU to GPU data flow with mapping.
    /// Used for dynamic data, typically constant buffers.
    /// Prefers memory with fast GPU access.
    CpuToGpu,

    /// GPU to CPU data flow with mapping.
    /// Used for readbacks. Prefers cached host memory.
    GpuToCpu,

    /// Host-side staging copies with no device access on the hot path.
    CpuCopy,

    /// Transient attachments that may never be backed by real memory.
    GpuLazilyAllocated,
}

impl MemoryUsage {
    /// Property flags a memory type must have for this usage.
    pub fn required(self) -> Properties {
        match self {
            MemoryUsage::CpuOnly => Properties::HOST_VISIBLE | Properties::HOST_COHERENT,
            MemoryUsage::CpuToGpu | MemoryUsage::GpuToCpu => Properties::HOST_VISIBLE,
            MemoryUsage::GpuLazilyAllocated => Properties::LAZILY_ALLOCATED,
            MemoryUsage::Unknown | MemoryUsage::GpuOnly | MemoryUsage::CpuCopy => {
                Properties::empty()
            }
        }
    }

    /// Property flags a memory type should have for this usage.
    ///
    /// On integrated GPUs device-local is not worth trading host visibility
    /// for, so the preference is dropped when the caller already prefers
    /// host-visible memory.
    pub fn preferred(self, integrated_gpu: bool, already_preferred: Properties) -> Properties {
        let prefer_device_local =
            !(integrated_gpu && already_preferred.contains(Properties::HOST_VISIBLE));
        match self {
            MemoryUsage::GpuOnly | MemoryUsage::CpuToGpu if prefer_device_local => {
                Properties::DEVICE_LOCAL
            }
            MemoryUsage::GpuToCpu => Properties::HOST_CACHED,
            _ => Properties::empty(),
        }
    }

    /// Property flags a memory type should not have for this usage.
    pub fn not_preferred(self) -> Properties {
        match self {
            MemoryUsage::CpuCopy => Properties::DEVICE_LOCAL,
            _ => Properties::empty(),
        }
    }
}

/// Cost of picking a memory type with `flags` for a request that prefers
/// `preferred` and avoids `not_preferred`. Lower is better; zero is a
/// perfect match.
pub(crate) fn memory_type_cost(
    flags: Properties,
    preferred: Properties,
    not_preferred: Properties,
) -> u32 {
    (preferred & !flags).bits().count_ones() + (flags & not_preferred).bits().count_ones()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_only_prefers_device_local() {
        let preferred = MemoryUsage::GpuOnly.preferred(false, Properties::empty());
        assert_eq!(preferred, Properties::DEVICE_LOCAL);
    }

    #[test]
    fn integrated_gpu_drops_device_local_preference() {
        let preferred = MemoryUsage::GpuOnly.preferred(true, Properties::HOST_VISIBLE);
        assert_eq!(preferred, Properties::empty());
    }

    #[test]
    fn perfect_match_costs_zero() {
        let flags = Properties::DEVICE_LOCAL | Properties::HOST_VISIBLE;
        assert_eq!(memory_type_cost(flags, Properties::DEVICE_LOCAL, Properties::empty()), 0);
        assert_eq!(memory_type_cost(flags, Properties::HOST_CACHED, Properties::empty()), 1);
        assert_eq!(
            memory_type_cost(flags, Properties::HOST_CACHED, Properties::DEVICE_LOCAL),
            2
        );
    }
}
