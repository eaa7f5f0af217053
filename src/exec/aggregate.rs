//! Aggregation: MIN / MAX / SUM / AVG / COUNT with optional grouping.

use crate::errors::DbError;
use crate::tuple::{Tuple, TupleDesc};
use crate::types::{DataType, Value};
use eyre::{bail, Result};
use std::collections::HashMap;
use std::fmt;

use super::{OpIterator, TupleIterator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Min,
    Max,
    Sum,
    Avg,
    Count,
}

impl fmt::Display for AggregateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::Sum => "sum",
            AggregateOp::Avg => "avg",
            AggregateOp::Count => "count",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    value: i64,
    count: i64,
}

impl Accumulator {
    fn merge(&mut self, op: AggregateOp, v: i64) {
        if self.count == 0 {
            self.value = v;
        } else {
            self.value = match op {
                AggregateOp::Min => self.value.min(v),
                AggregateOp::Max => self.value.max(v),
                AggregateOp::Sum | AggregateOp::Avg => self.value + v,
                AggregateOp::Count => self.value,
            };
        }
        self.count += 1;
    }

    fn result(&self, op: AggregateOp) -> i64 {
        match op {
            AggregateOp::Count => self.count,
            AggregateOp::Avg => self.value / self.count,
            _ => self.value,
        }
    }
}

/// Folds tuples into per-group accumulators. Int fields support every
/// operator; Text fields support Count only. With no tuples merged, the
/// result stream is empty.
pub struct Aggregator {
    group_field: Option<usize>,
    group_type: Option<DataType>,
    field: usize,
    op: AggregateOp,
    groups: HashMap<Value, Accumulator>,
    group_order: Vec<Value>,
    ungrouped: Accumulator,
}

impl Aggregator {
    pub fn new(
        group_field: Option<usize>,
        group_type: Option<DataType>,
        field: usize,
        op: AggregateOp,
    ) -> Self {
        Self {
            group_field,
            group_type,
            field,
            op,
            groups: HashMap::new(),
            group_order: Vec::new(),
            ungrouped: Accumulator::default(),
        }
    }

    pub fn merge(&mut self, tuple: &Tuple) -> Result<()> {
        let contribution = match tuple.value(self.field) {
            Value::Int(v) => i64::from(*v),
            Value::Text(_) => {
                if self.op != AggregateOp::Count {
                    bail!("cannot compute {} over a text field", self.op);
                }
                0
            }
        };

        match self.group_field {
            None => self.ungrouped.merge(self.op, contribution),
            Some(group_field) => {
                let key = tuple.value(group_field).clone();
                let acc = self.groups.entry(key.clone()).or_insert_with(|| {
                    self.group_order.push(key);
                    Accumulator::default()
                });
                acc.merge(self.op, contribution);
            }
        }
        Ok(())
    }

    /// Result rows: `(group, aggregate)` per group in first-seen order, or
    /// a single `(aggregate)` row when ungrouped; empty if nothing merged.
    pub fn iter(&self) -> Result<TupleIterator> {
        match self.group_field {
            None => {
                let desc = TupleDesc::unnamed(vec![DataType::Int]);
                let mut rows = Vec::new();
                if self.ungrouped.count > 0 {
                    let v = self.ungrouped.result(self.op);
                    rows.push(Tuple::new(desc.clone(), vec![Value::Int(v as i32)])?);
                }
                Ok(TupleIterator::new(desc, rows))
            }
            Some(_) => {
                let group_type = self.group_type.ok_or(DbError::SchemaMismatch)?;
                let desc = TupleDesc::unnamed(vec![group_type, DataType::Int]);
                let mut rows = Vec::with_capacity(self.groups.len());
                for key in &self.group_order {
                    let acc = self.groups[key];
                    let v = acc.result(self.op);
                    rows.push(Tuple::new(
                        desc.clone(),
                        vec![key.clone(), Value::Int(v as i32)],
                    )?);
                }
                Ok(TupleIterator::new(desc, rows))
            }
        }
    }
}

/// Aggregate operator: drains its child on open, then streams the
/// accumulated results.
pub struct Aggregate<'a> {
    child: Box<dyn OpIterator + 'a>,
    group_field: Option<usize>,
    field: usize,
    op: AggregateOp,
    desc: TupleDesc,
    results: Option<TupleIterator>,
}

impl<'a> Aggregate<'a> {
    pub fn new(
        child: Box<dyn OpIterator + 'a>,
        group_field: Option<usize>,
        field: usize,
        op: AggregateOp,
    ) -> Self {
        let desc = match group_field {
            None => TupleDesc::unnamed(vec![DataType::Int]),
            Some(g) => {
                TupleDesc::unnamed(vec![child.tuple_desc().field_type(g), DataType::Int])
            }
        };
        Self { child, group_field, field, op, desc, results: None }
    }
}

impl OpIterator for Aggregate<'_> {
    fn open(&mut self) -> Result<()> {
        self.child.open()?;
        let group_type = self
            .group_field
            .map(|g| self.child.tuple_desc().field_type(g));
        let mut aggregator = Aggregator::new(self.group_field, group_type, self.field, self.op);
        while self.child.has_next()? {
            aggregator.merge(&self.child.next()?)?;
        }
        let mut results = aggregator.iter()?;
        results.open()?;
        self.results = Some(results);
        Ok(())
    }

    fn has_next(&mut self) -> Result<bool> {
        self.results.as_mut().ok_or(DbError::NotOpen)?.has_next()
    }

    fn next(&mut self) -> Result<Tuple> {
        self.results.as_mut().ok_or(DbError::NotOpen)?.next()
    }

    fn rewind(&mut self) -> Result<()> {
        self.results.as_mut().ok_or(DbError::NotOpen)?.rewind()
    }

    fn close(&mut self) {
        self.child.close();
        self.results = None;
    }

    fn tuple_desc(&self) -> &TupleDesc {
        &self.desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_col(values: &[(i32, i32)]) -> (TupleDesc, Vec<Tuple>) {
        let desc = TupleDesc::unnamed(vec![DataType::Int, DataType::Int]);
        let tuples = values
            .iter()
            .map(|(g, v)| {
                Tuple::new(desc.clone(), vec![Value::Int(*g), Value::Int(*v)]).unwrap()
            })
            .collect();
        (desc, tuples)
    }

    fn run(agg: &mut Aggregate<'_>) -> Vec<Vec<Value>> {
        agg.open().unwrap();
        let mut out = Vec::new();
        while agg.has_next().unwrap() {
            let t = agg.next().unwrap();
            out.push(
                (0..t.desc().num_fields())
                    .map(|i| t.value(i).clone())
                    .collect(),
            );
        }
        out
    }

    #[test]
    fn ungrouped_sum_min_max_count_avg() {
        let (desc, tuples) = two_col(&[(0, 1), (0, 5), (0, 3)]);
        for (op, expected) in [
            (AggregateOp::Sum, 9),
            (AggregateOp::Min, 1),
            (AggregateOp::Max, 5),
            (AggregateOp::Count, 3),
            (AggregateOp::Avg, 3),
        ] {
            let child = Box::new(TupleIterator::new(desc.clone(), tuples.clone()));
            let mut agg = Aggregate::new(child, None, 1, op);
            assert_eq!(run(&mut agg), vec![vec![Value::Int(expected)]], "{}", op);
        }
    }

    #[test]
    fn grouped_counts_by_key() {
        let (desc, tuples) = two_col(&[(1, 10), (2, 20), (1, 30), (1, 40)]);
        let child = Box::new(TupleIterator::new(desc, tuples));
        let mut agg = Aggregate::new(child, Some(0), 1, AggregateOp::Count);
        assert_eq!(
            run(&mut agg),
            vec![
                vec![Value::Int(1), Value::Int(3)],
                vec![Value::Int(2), Value::Int(1)],
            ]
        );
    }

    #[test]
    fn grouped_avg_divides_at_iteration_time() {
        let (desc, tuples) = two_col(&[(1, 1), (1, 2), (2, 10)]);
        let child = Box::new(TupleIterator::new(desc, tuples));
        let mut agg = Aggregate::new(child, Some(0), 1, AggregateOp::Avg);
        assert_eq!(
            run(&mut agg),
            vec![
                vec![Value::Int(1), Value::Int(1)],
                vec![Value::Int(2), Value::Int(10)],
            ]
        );
    }

    #[test]
    fn empty_input_produces_no_rows() {
        let (desc, _) = two_col(&[]);
        let child = Box::new(TupleIterator::new(desc, Vec::new()));
        let mut agg = Aggregate::new(child, None, 1, AggregateOp::Min);
        assert!(run(&mut agg).is_empty());
    }

    #[test]
    fn text_group_keys_with_count() {
        let desc = TupleDesc::unnamed(vec![DataType::Text, DataType::Int]);
        let tuples: Vec<Tuple> = [("a", 1), ("b", 2), ("a", 3)]
            .iter()
            .map(|(g, v)| {
                Tuple::new(
                    desc.clone(),
                    vec![Value::Text((*g).into()), Value::Int(*v)],
                )
                .unwrap()
            })
            .collect();
        let child = Box::new(TupleIterator::new(desc, tuples));
        let mut agg = Aggregate::new(child, Some(0), 1, AggregateOp::Count);
        assert_eq!(
            run(&mut agg),
            vec![
                vec![Value::Text("a".into()), Value::Int(2)],
                vec![Value::Text("b".into()), Value::Int(1)],
            ]
        );
    }

    #[test]
    fn non_count_over_text_field_is_rejected() {
        let desc = TupleDesc::unnamed(vec![DataType::Text]);
        let t = Tuple::new(desc, vec![Value::Text("x".into())]).unwrap();
        let mut aggregator = Aggregator::new(None, None, 0, AggregateOp::Sum);
        assert!(aggregator.merge(&t).is_err());

        let mut counter = Aggregator::new(None, None, 0, AggregateOp::Count);
        counter.merge(&t).unwrap();
        let mut iter = counter.iter().unwrap();
        iter.open().unwrap();
        assert_eq!(iter.next().unwrap().value(0), &Value::Int(1));
    }
}
