// Memory-type table and selection
//
// A snapshot of the physical device's memory types, reduced to what
// selection needs: index -> property flags.

use ash::vk;

#[derive(Debug, Clone, Default)]
pub struct MemoryTypeTable {
    flags: Vec<vk::MemoryPropertyFlags>,
}

impl MemoryTypeTable {
    #[cfg(test)]
    pub fn new(flags: Vec<vk::MemoryPropertyFlags>) -> Self {
        Self { flags }
    }

    pub fn from_properties(properties: &vk::PhysicalDeviceMemoryProperties) -> Self {
        let count = properties.memory_type_count as usize;
        Self {
            flags: properties.memory_types[..count]
                .iter()
                .map(|ty| ty.property_flags)
                .collect(),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    /// Lowest index `i` with bit `i` set in `type_bits` and
    /// `flags[i] ⊇ required`.
    pub fn find(&self, type_bits: u32, required: vk::MemoryPropertyFlags) -> Option<u32> {
        self.flags
            .iter()
            .enumerate()
            .take(32)
            .find(|(i, flags)| type_bits & (1 << i) != 0 && flags.contains(required))
            .map(|(i, _)| i as u32)
    }

    /// Like [`find`](Self::find), but an unsatisfiable request is fatal.
    ///
    /// # Panics
    /// If no memory type qualifies.
    pub fn select(&self, type_bits: u32, required: vk::MemoryPropertyFlags) -> u32 {
        match self.find(type_bits, required) {
            Some(index) => index,
            None => panic!(
                "no memory type satisfies type bits {:#034b} with flags {:?} ({} types available)",
                type_bits,
                required,
                self.flags.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_VISIBLE;
    const COHERENT: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::HOST_COHERENT;
    const LOCAL: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

    fn table() -> MemoryTypeTable {
        MemoryTypeTable::new(vec![
            LOCAL,
            HOST | COHERENT,
            LOCAL | HOST | COHERENT,
            HOST | COHERENT | vk::MemoryPropertyFlags::HOST_CACHED,
        ])
    }

    #[test]
    fn lowest_qualifying_index_wins() {
        let table = table();
        assert_eq!(table.select(0b1111, HOST | COHERENT), 1);
        assert_eq!(table.select(0b1111, LOCAL), 0);
        assert_eq!(table.select(0b1111, vk::MemoryPropertyFlags::empty()), 0);
    }

    #[test]
    fn type_bits_mask_out_candidates() {
        let table = table();
        // Type 1 is excluded by the mask, so the next superset is type 2
        assert_eq!(table.select(0b1100, HOST | COHERENT), 2);
        assert_eq!(table.select(0b0100, LOCAL), 2);
        assert_eq!(table.find(0b0010, LOCAL), None);
    }

    #[test]
    fn superset_flags_qualify() {
        let table = table();
        assert_eq!(table.select(0b1000, HOST), 3);
        assert_eq!(
            table.find(0b1111, HOST | vk::MemoryPropertyFlags::HOST_CACHED),
            Some(3)
        );
    }

    #[test]
    fn bits_beyond_table_are_ignored() {
        let table = table();
        assert_eq!(table.find(0xFFFF_FFF0, vk::MemoryPropertyFlags::empty()), None);
    }

    #[test]
    #[should_panic(expected = "no memory type satisfies")]
    fn unsatisfiable_request_is_fatal() {
        table().select(0b0001, HOST);
    }

    #[test]
    fn from_properties_respects_type_count() {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 2,
            ..Default::default()
        };
        props.memory_types[0].property_flags = LOCAL;
        props.memory_types[1].property_flags = HOST;
        props.memory_types[2].property_flags = HOST | LOCAL;

        let table = MemoryTypeTable::from_properties(&props);
        assert_eq!(table.len(), 2);
        assert_eq!(table.find(u32::MAX, HOST | LOCAL), None);
    }
}
