//! Offset tables and structured remote reads
//!
//! Struct layouts in the target process are data, not code: consumers load
//! an [`OffsetTable`] (usually from config) and read fields by name through
//! a [`StructReader`]. The hook engine itself never sees an offset.

use std::collections::HashMap;

use crate::error::{MemoryError, MemoryResult};
use crate::process::RemoteProcess;

/// Named field offsets for one remote struct layout
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetTable {
    fields: HashMap<String, usize>,
}

impl OffsetTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a field offset, replacing any previous entry
    pub fn insert(&mut self, field: impl Into<String>, offset: usize) -> &mut Self {
        self.fields.insert(field.into(), offset);
        self
    }

    /// Look up a field offset
    pub fn get(&self, field: &str) -> Option<usize> {
        self.fields.get(field).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    fn require(&self, field: &str) -> MemoryResult<usize> {
        self.get(field)
            .ok_or_else(|| MemoryError::UnknownField(field.to_string()))
    }
}

impl<S: Into<String>> FromIterator<(S, usize)> for OffsetTable {
    fn from_iter<I: IntoIterator<Item = (S, usize)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Reads named fields of one struct instance in the target process
pub struct StructReader<'a, P: RemoteProcess + ?Sized> {
    process: &'a P,
    table: &'a OffsetTable,
    base: usize,
}

impl<'a, P: RemoteProcess + ?Sized> StructReader<'a, P> {
    pub fn new(process: &'a P, table: &'a OffsetTable, base: usize) -> Self {
        Self {
            process,
            table,
            base,
        }
    }

    /// Base address of the struct instance
    pub fn base(&self) -> usize {
        self.base
    }

    /// Absolute address of a named field
    pub fn field_addr(&self, field: &str) -> MemoryResult<usize> {
        Ok(self.base + self.table.require(field)?)
    }

    pub fn read_u32(&self, field: &str) -> MemoryResult<u32> {
        self.process.read_u32(self.field_addr(field)?)
    }

    pub fn read_u64(&self, field: &str) -> MemoryResult<u64> {
        self.process.read_u64(self.field_addr(field)?)
    }

    pub fn read_f32(&self, field: &str) -> MemoryResult<f32> {
        self.process.read_f32(self.field_addr(field)?)
    }

    pub fn read_ptr(&self, field: &str) -> MemoryResult<usize> {
        self.process.read_ptr(self.field_addr(field)?)
    }

    /// Read three consecutive `f32`s starting at a named field (positions)
    pub fn read_vec3(&self, field: &str) -> MemoryResult<[f32; 3]> {
        let addr = self.field_addr(field)?;
        Ok([
            self.process.read_f32(addr)?,
            self.process.read_f32(addr + 4)?,
            self.process.read_f32(addr + 8)?,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeProcess, FAKE_BASE};

    fn sample_table() -> OffsetTable {
        OffsetTable::from_iter([("id", 0x08usize), ("position", 0x10)])
    }

    #[test]
    fn test_struct_reader_reads_fields() {
        let fake = FakeProcess::new();
        let base = FAKE_BASE + 0x1000;
        fake.write_u32(base + 0x08, 42).unwrap();
        fake.write_bytes(base + 0x10, &1.5f32.to_le_bytes()).unwrap();
        fake.write_bytes(base + 0x14, &(-2.0f32).to_le_bytes()).unwrap();
        fake.write_bytes(base + 0x18, &3.25f32.to_le_bytes()).unwrap();

        let table = sample_table();
        let reader = StructReader::new(&fake, &table, base);
        assert_eq!(reader.read_u32("id").unwrap(), 42);
        assert_eq!(reader.read_vec3("position").unwrap(), [1.5, -2.0, 3.25]);
    }

    #[test]
    fn test_unknown_field_is_an_error() {
        let fake = FakeProcess::new();
        let table = sample_table();
        let reader = StructReader::new(&fake, &table, FAKE_BASE);
        let err = reader.read_u32("health").unwrap_err();
        assert!(matches!(err, MemoryError::UnknownField(f) if f == "health"));
    }
}
