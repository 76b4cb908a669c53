use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Routes keys to a fixed number of partitions.
///
/// The partition count is fixed at construction so that a key always lands in the same
/// partition for the lifetime of a table (and across snapshot/restore).
#[derive(Debug, Clone)]
pub struct Partitioner {
    pub num_partitions: u32,
}

impl Partitioner {
    pub fn new(num_partitions: u32) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
        }
    }

    pub fn get_partition<T: Hash + ?Sized>(&self, key: &T) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish();
        (hash % self.num_partitions as u64) as u32
    }
}

impl Default for Partitioner {
    fn default() -> Self {
        Self::new(64)
    }
}
