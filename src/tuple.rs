//! Tuples, tuple schemas, and record identities.
//!
//! A [`TupleDesc`] is an ordered list of `(DataType, optional name)` items;
//! two descriptors are equal iff their type sequences match (names are
//! documentation, not identity). A [`Tuple`] is a fixed-width row: its
//! descriptor, one [`Value`] per field, and an optional [`RecordId`]
//! back-reference to the slot it currently occupies on disk. The record id
//! is a weak reference for lookup only; pages rewrite it whenever they move
//! a tuple between slots.

use crate::errors::DbError;
use crate::storage::PageId;
use crate::types::{DataType, Value};
use eyre::{ensure, Result};
use std::fmt;
use std::sync::Arc;

/// Location of a stored tuple: the page holding it and the slot within.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: usize,
}

impl RecordId {
    pub fn new(page_id: PageId, slot: usize) -> Self {
        Self { page_id, slot }
    }
}

#[derive(Debug, Clone)]
struct TupleDescItem {
    data_type: DataType,
    name: Option<String>,
}

/// Schema of a tuple: field types in order, with optional field names.
#[derive(Debug, Clone)]
pub struct TupleDesc {
    items: Arc<Vec<TupleDescItem>>,
}

impl TupleDesc {
    pub fn new(types: Vec<DataType>, names: Vec<Option<String>>) -> Self {
        assert_eq!(types.len(), names.len(), "one name slot per type");
        let items = types
            .into_iter()
            .zip(names)
            .map(|(data_type, name)| TupleDescItem { data_type, name })
            .collect();
        Self { items: Arc::new(items) }
    }

    pub fn unnamed(types: Vec<DataType>) -> Self {
        let names = vec![None; types.len()];
        Self::new(types, names)
    }

    pub fn num_fields(&self) -> usize {
        self.items.len()
    }

    pub fn field_type(&self, i: usize) -> DataType {
        self.items[i].data_type
    }

    pub fn field_name(&self, i: usize) -> Option<&str> {
        self.items[i].name.as_deref()
    }

    /// Index of the first field with the given name.
    pub fn field_index(&self, name: &str) -> Result<usize> {
        self.items
            .iter()
            .position(|item| item.name.as_deref() == Some(name))
            .ok_or_else(|| DbError::NotFound.into())
    }

    /// Byte width of a tuple with this schema.
    pub fn size(&self) -> usize {
        self.items.iter().map(|item| item.data_type.size()).sum()
    }

    /// Concatenation: all of `a`'s fields followed by all of `b`'s.
    pub fn merge(a: &TupleDesc, b: &TupleDesc) -> TupleDesc {
        let types = a
            .items
            .iter()
            .chain(b.items.iter())
            .map(|item| item.data_type)
            .collect();
        let names = a
            .items
            .iter()
            .chain(b.items.iter())
            .map(|item| item.name.clone())
            .collect();
        TupleDesc::new(types, names)
    }
}

impl PartialEq for TupleDesc {
    fn eq(&self, other: &Self) -> bool {
        self.num_fields() == other.num_fields()
            && self
                .items
                .iter()
                .zip(other.items.iter())
                .all(|(a, b)| a.data_type == b.data_type)
    }
}

impl Eq for TupleDesc {}

impl fmt::Display for TupleDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match &item.name {
                Some(name) => write!(f, "{}({})", item.data_type, name)?,
                None => write!(f, "{}", item.data_type)?,
            }
        }
        Ok(())
    }
}

/// A fixed-width row: schema, field values, and storage location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    desc: TupleDesc,
    values: Vec<Value>,
    record_id: Option<RecordId>,
}

impl Tuple {
    pub fn new(desc: TupleDesc, values: Vec<Value>) -> Result<Self> {
        ensure!(
            values.len() == desc.num_fields(),
            "tuple has {} values for a {}-field schema",
            values.len(),
            desc.num_fields()
        );
        for (i, v) in values.iter().enumerate() {
            ensure!(
                v.data_type() == desc.field_type(i),
                "field {} is {}, schema expects {}",
                i,
                v.data_type(),
                desc.field_type(i)
            );
        }
        Ok(Self { desc, values, record_id: None })
    }

    pub fn desc(&self) -> &TupleDesc {
        &self.desc
    }

    pub fn value(&self, i: usize) -> &Value {
        &self.values[i]
    }

    pub fn set_value(&mut self, i: usize, v: Value) -> Result<()> {
        ensure!(
            v.data_type() == self.desc.field_type(i),
            "field {} is {}, schema expects {}",
            i,
            v.data_type(),
            self.desc.field_type(i)
        );
        self.values[i] = v;
        Ok(())
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.record_id
    }

    pub fn set_record_id(&mut self, rid: Option<RecordId>) {
        self.record_id = rid;
    }

    /// Writes the tuple's fields back-to-back into `out`, which must be
    /// exactly `desc().size()` bytes.
    pub fn serialize_into(&self, out: &mut [u8]) -> Result<()> {
        ensure!(
            out.len() == self.desc.size(),
            "tuple buffer is {} bytes, expected {}",
            out.len(),
            self.desc.size()
        );
        let mut offset = 0;
        for v in &self.values {
            let width = v.data_type().size();
            v.serialize_into(&mut out[offset..offset + width])?;
            offset += width;
        }
        Ok(())
    }

    /// Parses a tuple of the given schema from `data`. The record id is left
    /// unset; the containing page stamps it.
    pub fn deserialize(desc: &TupleDesc, data: &[u8]) -> Result<Tuple> {
        ensure!(
            data.len() == desc.size(),
            "tuple buffer is {} bytes, expected {}",
            data.len(),
            desc.size()
        );
        let mut values = Vec::with_capacity(desc.num_fields());
        let mut offset = 0;
        for i in 0..desc.num_fields() {
            let data_type = desc.field_type(i);
            let width = data_type.size();
            values.push(Value::deserialize(data_type, &data[offset..offset + width])?);
            offset += width;
        }
        Tuple::new(desc.clone(), values)
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, "\t")?;
            }
            write!(f, "{}", v)?;
        }
        Ok(())
    }
}
