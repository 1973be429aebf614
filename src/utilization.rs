use crate::memory::Properties;

/// Memory utilization stats.
#[derive(Clone, Copy, Debug)]
pub struct MemoryUtilization {
    /// Total number of bytes allocated from the device.
    pub used: u64,
    /// Effective number of bytes handed out to allocations.
    pub effective: u64,
}

/// Memory utilization of one heap.
#[derive(Clone, Copy, Debug)]
pub struct MemoryHeapUtilization {
    /// Utilization.
    pub utilization: MemoryUtilization,

    /// Memory heap size.
    pub size: u64,
}

/// Memory utilization of one type.
#[derive(Clone, Copy, Debug)]
pub struct MemoryTypeUtilization {
    /// Utilization.
    pub utilization: MemoryUtilization,

    /// Memory type properties.
    pub properties: Properties,

    /// Index of the heap this memory type uses.
    pub heap_index: usize,
}

/// Total memory utilization.
#[derive(Clone, Debug)]
pub struct TotalMemoryUtilization {
    /// Utilization by types.
    pub types: Vec<MemoryTypeUtilization>,

    /// Utilization by heaps.
    pub heaps: Vec<MemoryHeapUtilization>,
}

impl std::fmt::Display for TotalMemoryUtilization {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const MB: u64 = 1024 * 1024;

        for (index, heap) in self.heaps.iter().enumerate() {
            let size = heap.size;
            let MemoryUtilization { used, effective } = heap.utilization;
            let permyriad = if size > 0 { used * 10000 / size } else { 0 };
            let effective = if used > 0 { effective * 10000 / used } else { 10000 };

            writeln!(
                fmt,
                "Heap {}: {:6} / {:<6} or {} {{ effective: {} }}",
                index,
                format!("{}MB", used / MB),
                format!("{}MB", size / MB),
                format_permyriad(permyriad),
                format_permyriad(effective),
            )?;

            for ty in self.types.iter().filter(|ty| ty.heap_index == index) {
                let MemoryUtilization { used, effective } = ty.utilization;
                let permyriad = if size > 0 { used * 10000 / size } else { 0 };
                let effective = if used > 0 { effective * 10000 / used } else { 0 };

                writeln!(
                    fmt,
                    "         {:>6} or {} {{ effective: {} }} | {:?}",
                    format!("{}MB", used / MB),
                    format_permyriad(permyriad),
                    format_permyriad(effective),
                    ty.properties,
                )?;
            }
        }

        Ok(())
    }
}

fn format_permyriad(permyriad: u64) -> String {
    debug_assert!(permyriad <= 10000);
    format!("{:>3}.{:02}%", permyriad / 100, permyriad % 100)
}
