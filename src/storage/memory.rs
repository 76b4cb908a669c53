//! Partitioned In-Memory Table
//!
//! `PartitionedMap` is the building block for every persisted table in the crate (chunks,
//! decryption shares, progress records, the task queue). Rows are sharded into a fixed set of
//! partitions by key hash, each partition being its own `DashMap`, so unrelated rows never
//! contend on the same lock.
//!
//! All read-modify-write operations (`update`, `compute`, `insert_if_absent`) run while the
//! row's shard lock is held, which is what makes compare-and-set transitions atomic across
//! concurrent workers. Closures passed to these methods must not call back into the same map.

use super::partitioner::Partitioner;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::hash::Hash;

pub struct PartitionedMap<K, V> {
    local_data: DashMap<u32, DashMap<K, V>>,
    partitioner: Partitioner,
}

impl<K, V> PartitionedMap<K, V>
where
    K: Clone + Hash + Eq,
    V: Clone,
{
    pub fn new(num_partitions: u32) -> Self {
        let partitioner = Partitioner::new(num_partitions);
        let local_data = DashMap::new();
        // Partitions are created up front so lookups only ever take the outer read lock.
        for partition in 0..partitioner.num_partitions {
            local_data.insert(partition, DashMap::new());
        }

        Self {
            local_data,
            partitioner,
        }
    }

    pub fn partition_of(&self, key: &K) -> u32 {
        self.partitioner.get_partition(key)
    }

    pub fn num_partitions(&self) -> u32 {
        self.partitioner.num_partitions
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let partition = self.partition_of(key);

        if let Some(partition_map) = self.local_data.get(&partition)
            && let Some(value) = partition_map.get(key)
        {
            return Some(value.clone());
        }

        None
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let partition = self.partition_of(key);
        self.local_data
            .get(&partition)
            .map(|map| map.contains_key(key))
            .unwrap_or(false)
    }

    /// Inserts or replaces a row, returning the previous value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let partition = self.partition_of(&key);
        self.local_data
            .get(&partition)
            .and_then(|map| map.insert(key, value))
    }

    /// Inserts only when the key is absent. Returns `true` when the row was written.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        self.compute(key, |slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let partition = self.partition_of(key);
        self.local_data
            .get(&partition)
            .and_then(|map| map.remove(key).map(|(_, value)| value))
    }

    /// Mutates an existing row in place. Returns `None` when the key is absent.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let partition = self.partition_of(key);
        let partition_map = self.local_data.get(&partition)?;
        let mut entry = partition_map.get_mut(key)?;
        Some(f(entry.value_mut()))
    }

    /// Atomic upsert. The closure sees the current row (or `None`), may replace it, fill it
    /// or clear it, and its return value is passed through.
    pub fn compute<R>(&self, key: K, f: impl FnOnce(&mut Option<V>) -> R) -> R {
        let partition = self.partition_of(&key);
        let partition_map = match self.local_data.get(&partition) {
            Some(map) => map,
            None => self
                .local_data
                .entry(partition)
                .or_insert_with(DashMap::new)
                .downgrade(),
        };

        match partition_map.entry(key) {
            Entry::Occupied(mut occupied) => {
                let mut slot = Some(occupied.get().clone());
                let result = f(&mut slot);
                match slot {
                    Some(value) => {
                        *occupied.get_mut() = value;
                    }
                    None => {
                        occupied.remove();
                    }
                }
                result
            }
            Entry::Vacant(vacant) => {
                let mut slot = None;
                let result = f(&mut slot);
                if let Some(value) = slot {
                    vacant.insert(value);
                }
                result
            }
        }
    }

    /// Keys of one partition whose values match `predicate`, up to `limit` entries.
    pub fn scan_partition(
        &self,
        partition: u32,
        limit: usize,
        predicate: impl Fn(&V) -> bool,
    ) -> Vec<K> {
        let mut keys = Vec::new();
        if let Some(partition_map) = self.local_data.get(&partition) {
            for entry in partition_map.iter() {
                if keys.len() >= limit {
                    break;
                }
                if predicate(entry.value()) {
                    keys.push(entry.key().clone());
                }
            }
        }
        keys
    }

    /// Folds over every row without cloning it.
    pub fn fold<A>(&self, init: A, mut f: impl FnMut(A, &K, &V) -> A) -> A {
        let mut acc = init;
        for partition in self.local_data.iter() {
            for entry in partition.value().iter() {
                acc = f(acc, entry.key(), entry.value());
            }
        }
        acc
    }

    pub fn dump_partition(&self, partition: u32) -> Vec<(K, V)> {
        let mut entries = Vec::new();
        if let Some(partition_map) = self.local_data.get(&partition) {
            for entry in partition_map.iter() {
                entries.push((entry.key().clone(), entry.value().clone()));
            }
        }
        entries
    }

    /// Every row in the table, partition by partition.
    pub fn dump(&self) -> Vec<(K, V)> {
        (0..self.num_partitions())
            .flat_map(|partition| self.dump_partition(partition))
            .collect()
    }

    /// Bulk-loads rows, e.g. when restoring from a snapshot.
    pub fn apply_entries(&self, entries: Vec<(K, V)>) {
        for (key, value) in entries {
            self.insert(key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.local_data
            .iter()
            .map(|entry| entry.value().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
