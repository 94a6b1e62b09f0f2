//! Mock transport for testing
//!
//! This module provides an in-memory address space implementing
//! [`Transport`], with read accounting and fault injection.

use super::{PlatformError, ReadFlags, ScatterEntry, Transport};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Mock memory storage
#[derive(Default)]
struct MockMemory {
    /// Memory regions with their data
    regions: HashMap<u64, Vec<u8>>,
    /// Number of reads that started at each address
    reads: HashMap<u64, usize>,
    /// Canned answers consumed before regular memory is consulted
    scripted: HashMap<u64, VecDeque<Vec<u8>>>,
    /// Addresses whose reads always fail
    failing: HashSet<u64>,
}

impl MockMemory {
    fn write(&mut self, address: u64, data: &[u8]) {
        // Patch an existing region in place when it fully covers the write
        for (&base, region) in self.regions.iter_mut() {
            if address >= base && address + data.len() as u64 <= base + region.len() as u64 {
                let offset = (address - base) as usize;
                region[offset..offset + data.len()].copy_from_slice(data);
                return;
            }
        }

        self.regions.insert(address, data.to_vec());
    }

    fn read(&mut self, address: u64, size: usize) -> Option<Vec<u8>> {
        *self.reads.entry(address).or_default() += 1;

        if self.failing.contains(&address) {
            return None;
        }

        if let Some(queue) = self.scripted.get_mut(&address) {
            if let Some(mut data) = queue.pop_front() {
                data.resize(size, 0);
                return Some(data);
            }
        }

        for (&base, data) in &self.regions {
            if address >= base && address < base + data.len() as u64 {
                let offset = (address - base) as usize;
                let available = data.len() - offset;

                if available >= size {
                    return Some(data[offset..offset + size].to_vec());
                }
            }
        }

        None
    }
}

/// Mock transport implementation for testing
#[derive(Clone)]
pub struct MockTransport {
    memory: Arc<RwLock<MockMemory>>,
    round_trips: Arc<AtomicUsize>,
    alive: Arc<AtomicBool>,
}

impl MockTransport {
    /// Create a new, empty mock address space
    pub fn new() -> Self {
        Self {
            memory: Arc::new(RwLock::new(MockMemory::default())),
            round_trips: Arc::new(AtomicUsize::new(0)),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Write data to mock memory
    pub fn write_memory(&self, address: u64, data: &[u8]) {
        self.memory.write().write(address, data);
    }

    /// Write a POD type to memory
    pub fn write_value<T: bytemuck::Pod>(&self, address: u64, value: &T) {
        self.write_memory(address, bytemuck::bytes_of(value));
    }

    /// Write a slice of POD values contiguously
    pub fn write_slice<T: bytemuck::Pod>(&self, address: u64, values: &[T]) {
        self.write_memory(address, bytemuck::cast_slice(values));
    }

    /// Queue answers returned, one per read, before real memory is used
    pub fn script_reads(&self, address: u64, answers: Vec<Vec<u8>>) {
        self.memory
            .write()
            .scripted
            .entry(address)
            .or_default()
            .extend(answers);
    }

    /// Make every read at `address` fail
    pub fn fail_reads_at(&self, address: u64) {
        self.memory.write().failing.insert(address);
    }

    /// Number of reads that started at `address`
    pub fn reads_at(&self, address: u64) -> usize {
        self.memory.read().reads.get(&address).copied().unwrap_or(0)
    }

    /// Total reads across all addresses
    pub fn total_reads(&self) -> usize {
        self.memory.read().reads.values().sum()
    }

    /// Number of transport calls made so far
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    /// Simulate the target process exiting (or coming back)
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn read_into(&self, address: u64, buffer: &mut [u8], _flags: ReadFlags) -> Result<(), PlatformError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);

        let data = self
            .memory
            .write()
            .read(address, buffer.len())
            .ok_or(PlatformError::MemoryReadFailed {
                address,
                size: buffer.len(),
                reason: "Address not found in mock memory".to_string(),
            })?;

        buffer.copy_from_slice(&data);
        Ok(())
    }

    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<(), PlatformError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        self.write_memory(address, data);
        Ok(())
    }

    fn read_scatter(&self, entries: &mut [ScatterEntry], _flags: ReadFlags) -> Result<(), PlatformError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);

        let mut memory = self.memory.write();
        for entry in entries.iter_mut() {
            match memory.read(entry.address, entry.buffer.len()) {
                Some(data) => {
                    entry.buffer.copy_from_slice(&data);
                    entry.ok = true;
                }
                None => entry.ok = false,
            }
        }

        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_transport() {
        let transport = MockTransport::new();

        let test_data = vec![0x01, 0x02, 0x03, 0x04, 0x05];
        transport.write_memory(0x10000, &test_data);

        let mut result = [0u8; 5];
        transport.read_into(0x10000, &mut result, ReadFlags::CACHED).unwrap();
        assert_eq!(result.to_vec(), test_data);

        // Reading from the middle of a region
        let mut result = [0u8; 2];
        transport.read_into(0x10002, &mut result, ReadFlags::CACHED).unwrap();
        assert_eq!(result, [0x03, 0x04]);
    }

    #[test]
    fn test_write_patches_existing_region() {
        let transport = MockTransport::new();
        transport.write_memory(0x20000, &[0u8; 16]);
        transport.write_value(0x20004, &0xAABBCCDDu32);

        let mut result = [0u8; 8];
        transport.read_into(0x20000, &mut result, ReadFlags::CACHED).unwrap();
        assert_eq!(result, [0, 0, 0, 0, 0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn test_scripted_reads_take_priority() {
        let transport = MockTransport::new();
        transport.write_value(0x30000, &7u32);
        transport.script_reads(0x30000, vec![vec![1, 0, 0, 0]]);

        let mut buffer = [0u8; 4];
        transport.read_into(0x30000, &mut buffer, ReadFlags::UNCACHED).unwrap();
        assert_eq!(u32::from_le_bytes(buffer), 1);

        transport.read_into(0x30000, &mut buffer, ReadFlags::UNCACHED).unwrap();
        assert_eq!(u32::from_le_bytes(buffer), 7);
        assert_eq!(transport.reads_at(0x30000), 2);
    }

    #[test]
    fn test_scatter_is_one_round_trip() {
        let transport = MockTransport::new();
        transport.write_value(0x40000, &1u64);
        transport.write_value(0x40008, &2u64);

        let mut entries = vec![
            ScatterEntry::new(0x40000, 8),
            ScatterEntry::new(0x40008, 8),
            ScatterEntry::new(0x90000, 8),
        ];
        transport.read_scatter(&mut entries, ReadFlags::CACHED).unwrap();

        assert_eq!(transport.round_trips(), 1);
        assert!(entries[0].ok && entries[1].ok);
        assert!(!entries[2].ok);
    }
}
