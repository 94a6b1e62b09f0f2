//! Scatter batches
//!
//! A batch accumulates reads (and optionally writes) and moves them in a
//! single transport round trip. Results are looked up by the address and type
//! they were prepared with.

use super::{address, read_failure, Memory};
use crate::platform::{ReadFlags, ScatterEntry};
use crate::Result;
use bytemuck::Pod;
use std::collections::HashMap;
use tracing::debug;

/// Reads and writes pending for one round trip
pub struct ScatterBatch<'m> {
    memory: &'m Memory,
    flags: ReadFlags,
    entries: Vec<ScatterEntry>,
    index: HashMap<(u64, usize), usize>,
    writes: Vec<(u64, Vec<u8>)>,
}

impl<'m> ScatterBatch<'m> {
    pub(super) fn new(memory: &'m Memory, flags: ReadFlags) -> Self {
        Self {
            memory,
            flags,
            entries: Vec::new(),
            index: HashMap::new(),
            writes: Vec::new(),
        }
    }

    /// Queue a raw read of `size` bytes
    ///
    /// Addresses outside the valid range are dropped here and simply show up
    /// as missing in the results. Repeated requests are read once.
    pub fn prepare_bytes(&mut self, address: u64, size: usize) -> &mut Self {
        if size == 0 || size > self.memory.config().max_read_size {
            return self;
        }
        if address::check_range(address, size).is_err() {
            return self;
        }

        let next = self.entries.len();
        self.index.entry((address, size)).or_insert_with(|| {
            self.entries.push(ScatterEntry::new(address, size));
            next
        });
        self
    }

    /// Queue a read of one `T`
    pub fn prepare<T: Pod>(&mut self, address: u64) -> &mut Self {
        self.prepare_bytes(address, std::mem::size_of::<T>())
    }

    /// Queue a write of one `T`, performed after the reads
    pub fn prepare_write<T: Pod>(&mut self, address: u64, value: &T) -> &mut Self {
        if address::check_range(address, std::mem::size_of::<T>()).is_ok() {
            self.writes.push((address, bytemuck::bytes_of(value).to_vec()));
        }
        self
    }

    /// Number of distinct reads queued
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.writes.is_empty()
    }

    /// Perform every queued operation
    ///
    /// Reads share one round trip. A failed write is logged and counted in
    /// [`ScatterResults::failed_writes`]; only a failure of the whole read
    /// round trip is an error.
    pub fn execute(self) -> Result<ScatterResults> {
        let ScatterBatch {
            memory,
            flags,
            mut entries,
            index,
            writes,
        } = self;

        if !entries.is_empty() {
            memory
                .transport()
                .read_scatter(&mut entries, flags)
                .map_err(read_failure)?;
        }

        let mut failed_writes = 0;
        for (address, data) in &writes {
            if let Err(e) = memory.transport().write_bytes(*address, data) {
                debug!(address = format_args!("{:#x}", address), error = %e, "Scatter write failed");
                failed_writes += 1;
            }
        }

        Ok(ScatterResults {
            entries,
            index,
            failed_writes,
        })
    }

    /// Execute and hand the results to `complete`
    pub fn execute_then<F, R>(self, complete: F) -> Result<R>
    where
        F: FnOnce(&ScatterResults) -> R,
    {
        let results = self.execute()?;
        Ok(complete(&results))
    }
}

/// Completed scatter round trip
#[derive(Debug, Default)]
pub struct ScatterResults {
    entries: Vec<ScatterEntry>,
    index: HashMap<(u64, usize), usize>,
    failed_writes: usize,
}

impl ScatterResults {
    /// Raw bytes for a prepared read, if it succeeded
    pub fn bytes(&self, address: u64, size: usize) -> Option<&[u8]> {
        let entry = &self.entries[*self.index.get(&(address, size))?];
        entry.ok.then_some(entry.buffer.as_slice())
    }

    /// The `T` read at `address`, if it was prepared and succeeded
    pub fn read<T: Pod>(&self, address: u64) -> Option<T> {
        self.bytes(address, std::mem::size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
    }

    /// A pointer read at `address`, if it is in range
    pub fn read_ptr(&self, address: u64) -> Option<u64> {
        self.read::<u64>(address).filter(|&value| address::is_valid(value))
    }

    /// Number of reads that completed
    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|entry| entry.ok).count()
    }

    /// Number of writes the transport rejected
    pub fn failed_writes(&self) -> usize {
        self.failed_writes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockTransport;
    use std::sync::Arc;

    fn memory() -> (MockTransport, Memory) {
        let transport = MockTransport::new();
        let memory = Memory::new(Arc::new(transport.clone()));
        (transport, memory)
    }

    #[test]
    fn test_batch_is_single_round_trip() {
        let (transport, memory) = memory();
        transport.write_value(0x10000, &1.5f32);
        transport.write_value(0x10010, &42u64);
        transport.write_slice(0x20000, &[1.0f32; 16]);

        let mut batch = memory.scatter(ReadFlags::CACHED);
        batch
            .prepare::<f32>(0x10000)
            .prepare::<u64>(0x10010)
            .prepare::<[f32; 16]>(0x20000);
        assert_eq!(batch.len(), 3);

        let results = batch.execute().unwrap();
        assert_eq!(transport.round_trips(), 1);
        assert_eq!(results.read::<f32>(0x10000), Some(1.5));
        assert_eq!(results.read::<u64>(0x10010), Some(42));
        assert_eq!(results.read::<[f32; 16]>(0x20000), Some([1.0; 16]));
        assert_eq!(results.succeeded(), 3);
    }

    #[test]
    fn test_unprepared_and_failed_reads_are_missing() {
        let (transport, memory) = memory();
        transport.write_value(0x10000, &7u32);

        let mut batch = memory.scatter(ReadFlags::CACHED);
        batch.prepare::<u32>(0x10000).prepare::<u32>(0x60000);
        let results = batch.execute().unwrap();

        assert_eq!(results.read::<u32>(0x10000), Some(7));
        assert_eq!(results.read::<u32>(0x60000), None);
        // Same address, different size: never prepared
        assert_eq!(results.read::<u64>(0x10000), None);
    }

    #[test]
    fn test_invalid_addresses_skip_transport() {
        let (transport, memory) = memory();

        let mut batch = memory.scatter(ReadFlags::CACHED);
        batch.prepare::<u64>(0).prepare::<u64>(0xFFFF_FFFF_FFFF_0000);
        assert!(batch.is_empty());

        let results = batch.execute().unwrap();
        assert_eq!(results.read::<u64>(0), None);
        assert_eq!(transport.round_trips(), 0);
    }

    #[test]
    fn test_duplicate_reads_are_merged() {
        let (transport, memory) = memory();
        transport.write_value(0x10000, &5u32);

        let mut batch = memory.scatter(ReadFlags::CACHED);
        batch.prepare::<u32>(0x10000).prepare::<u32>(0x10000);
        assert_eq!(batch.len(), 1);

        batch.execute().unwrap();
        assert_eq!(transport.reads_at(0x10000), 1);
    }

    #[test]
    fn test_execute_then_and_writes() {
        let (transport, memory) = memory();
        transport.write_value(0x10000, &0x20000u64);
        transport.write_value(0x30000, &0u32);

        let mut batch = memory.scatter(ReadFlags::UNCACHED);
        batch.prepare::<u64>(0x10000).prepare_write(0x30000, &9u32);

        let pointer = batch.execute_then(|results| results.read_ptr(0x10000)).unwrap();
        assert_eq!(pointer, Some(0x20000));
        assert_eq!(memory.read_value::<u32>(0x30000, ReadFlags::UNCACHED).unwrap(), 9);
    }
}
