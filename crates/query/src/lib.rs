//! # Query builder/executor (C10)
//!
//! A [`Query`] declares a target collection, filter conditions, ordering,
//! paging, text search, joins, and aggregation; [`QueryExecutor::execute`]
//! plans and runs it against a [`DocumentSource`] (the storage engine) plus
//! an [`index::IndexManager`] for index-usable conditions (§4.10).
//!
//! The executor has no knowledge of how documents are stored — like
//! `index::IndexManager`, it depends on a narrow trait (`DocumentSource`)
//! supplied by the caller, keeping the dependency arrow pointing the same
//! direction as `txn::StorageBackend` and `index`'s back-fill iterator.

use index::{IndexError, IndexManager};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use value::Value;

/// Errors raised while planning or executing a query.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("condition on `{field}` with op {op:?} requires a structured value it did not get")]
    MalformedCondition { field: String, op: CompareOp },
}

/// Comparison operators a [`Condition`] may use (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Ge,
    Lt,
    Le,
    /// Inclusive range; `value` must be `Value::List([low, high])`.
    Between,
    /// Membership; `value` must be `Value::List([..])`.
    In,
    /// Substring match (string fields) or element membership (list fields).
    Contains,
}

/// A single filter condition: `field op value`.
#[derive(Debug, Clone)]
pub struct Condition {
    pub field: String,
    pub op: CompareOp,
    pub value: Value,
}

impl Condition {
    #[must_use]
    pub fn new(field: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Condition {
            field: field.into(),
            op,
            value,
        }
    }

    /// Whether this condition's `field` holds for `doc`.
    fn matches(&self, doc: &Value) -> bool {
        let field_val = field_value(doc, &self.field);
        match self.op {
            CompareOp::Eq => field_val == self.value,
            CompareOp::Neq => field_val != self.value,
            CompareOp::Gt => field_val.cmp(&self.value) == std::cmp::Ordering::Greater,
            CompareOp::Ge => field_val.cmp(&self.value) != std::cmp::Ordering::Less,
            CompareOp::Lt => field_val.cmp(&self.value) == std::cmp::Ordering::Less,
            CompareOp::Le => field_val.cmp(&self.value) != std::cmp::Ordering::Greater,
            CompareOp::Between => match &self.value {
                Value::List(bounds) if bounds.len() == 2 => {
                    field_val.cmp(&bounds[0]) != std::cmp::Ordering::Less
                        && field_val.cmp(&bounds[1]) != std::cmp::Ordering::Greater
                }
                _ => false,
            },
            CompareOp::In => match &self.value {
                Value::List(items) => items.iter().any(|v| *v == field_val),
                _ => false,
            },
            CompareOp::Contains => match (&field_val, &self.value) {
                (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                (Value::List(items), needle) => items.iter().any(|v| v == needle),
                _ => false,
            },
        }
    }

    /// Whether this condition can be satisfied entirely by an index lookup.
    fn is_index_usable(&self, collection: &str, indexes: &IndexManager) -> bool {
        matches!(
            self.op,
            CompareOp::Eq
                | CompareOp::Gt
                | CompareOp::Ge
                | CompareOp::Lt
                | CompareOp::Le
                | CompareOp::Between
        ) && indexes.has_index(collection, &self.field)
    }
}

/// `(field, descending)` sort key (§4.10).
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub field: String,
    pub desc: bool,
}

/// A join to another collection: equality-lookup `other[foreign_field] ==
/// doc[local_field]`, attached as `_joined_<other_collection>`.
#[derive(Debug, Clone)]
pub struct JoinSpec {
    pub other_collection: String,
    pub local_field: String,
    pub foreign_field: String,
}

/// Aggregation operator (§4.10). `Count(None)` counts every candidate
/// document; `Count(Some(field))` counts only those where `field` is
/// present and non-null.
#[derive(Debug, Clone)]
pub enum AggregateOp {
    Count(Option<String>),
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
    Distinct(String),
}

/// A planned query against one collection.
#[derive(Debug, Clone)]
pub struct Query {
    pub collection: String,
    pub conditions: Vec<Condition>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub text_search: Option<(String, Option<String>)>,
    pub joins: Vec<JoinSpec>,
    pub aggregate: Option<AggregateOp>,
    pub group_by: Option<String>,
}

impl Query {
    #[must_use]
    pub fn new(collection: impl Into<String>) -> Self {
        Query {
            collection: collection.into(),
            conditions: Vec::new(),
            order_by: None,
            limit: None,
            offset: None,
            text_search: None,
            joins: Vec::new(),
            aggregate: None,
            group_by: None,
        }
    }

    #[must_use]
    pub fn where_cond(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    #[must_use]
    pub fn where_equals(self, field: impl Into<String>, value: Value) -> Self {
        self.where_cond(Condition::new(field, CompareOp::Eq, value))
    }

    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, desc: bool) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            desc,
        });
        self
    }

    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    #[must_use]
    pub fn offset(mut self, n: usize) -> Self {
        self.offset = Some(n);
        self
    }

    #[must_use]
    pub fn text_search(mut self, query: impl Into<String>, field: Option<String>) -> Self {
        self.text_search = Some((query.into(), field));
        self
    }

    #[must_use]
    pub fn join(mut self, other_collection: impl Into<String>, local_field: impl Into<String>, foreign_field: impl Into<String>) -> Self {
        self.joins.push(JoinSpec {
            other_collection: other_collection.into(),
            local_field: local_field.into(),
            foreign_field: foreign_field.into(),
        });
        self
    }

    #[must_use]
    pub fn aggregate(mut self, op: AggregateOp) -> Self {
        self.aggregate = Some(op);
        self
    }

    #[must_use]
    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by = Some(field.into());
        self
    }
}

/// Result of running an aggregation over a set of documents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateOutcome {
    pub count: Option<u64>,
    pub sum: Option<f64>,
    pub avg: Option<f64>,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub distinct_count: Option<u64>,
    pub distinct_values: Option<Vec<Value>>,
}

/// One bucket of a `group_by` result.
#[derive(Debug, Clone)]
pub struct GroupBucket {
    pub key: Value,
    pub documents: Vec<(String, Value)>,
    pub aggregate: Option<AggregateOutcome>,
}

/// What running a [`Query`] produces.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Documents(Vec<(String, Value)>),
    Aggregate(AggregateOutcome),
    Grouped(Vec<GroupBucket>),
}

/// Narrow read interface the executor needs from the storage engine: decode
/// a single document, or every document in a collection. The executor never
/// reaches into WAL/memtable/SSTable internals directly.
pub trait DocumentSource: Send + Sync {
    fn get_document(&self, collection: &str, doc_id: &str) -> Option<Value>;
    fn scan_collection(&self, collection: &str) -> Vec<(String, Value)>;
}

/// Plans and runs [`Query`]s against a [`DocumentSource`] and [`IndexManager`].
pub struct QueryExecutor {
    source: Arc<dyn DocumentSource>,
    indexes: Arc<IndexManager>,
}

impl QueryExecutor {
    #[must_use]
    pub fn new(source: Arc<dyn DocumentSource>, indexes: Arc<IndexManager>) -> Self {
        QueryExecutor { source, indexes }
    }

    /// Plans and executes `query` per §4.10's numbered steps.
    #[tracing::instrument(skip(self, query), fields(collection = %query.collection))]
    pub fn execute(&self, query: &Query) -> Result<QueryOutcome, QueryError> {
        let (mut docs, residual) = self.candidates(query)?;
        tracing::debug!(candidates = docs.len(), "query candidates collected");

        docs.retain(|(_, doc)| residual.iter().all(|c| c.matches(doc)));

        if let Some((needle, field)) = &query.text_search {
            docs.retain(|(_, doc)| matches_text_search(doc, needle, field.as_deref()));
        }

        self.apply_joins(&mut docs, &query.joins);

        if let Some(ob) = &query.order_by {
            docs.sort_by(|(_, a), (_, b)| {
                let ordering = field_value(a, &ob.field).cmp(&field_value(b, &ob.field));
                if ob.desc {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        if let Some(offset) = query.offset {
            docs = docs.into_iter().skip(offset).collect();
        }
        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }

        if let Some(group_field) = &query.group_by {
            return Ok(QueryOutcome::Grouped(group_documents(docs, group_field, query.aggregate.as_ref())));
        }
        if let Some(op) = &query.aggregate {
            return Ok(QueryOutcome::Aggregate(compute_aggregate(&docs, op)));
        }
        Ok(QueryOutcome::Documents(docs))
    }

    /// Planning steps 1–2: partition conditions, seed candidate documents.
    fn candidates(&self, query: &Query) -> Result<(Vec<(String, Value)>, Vec<Condition>), QueryError> {
        let (index_usable, residual): (Vec<Condition>, Vec<Condition>) = query
            .conditions
            .iter()
            .cloned()
            .partition(|c| c.is_index_usable(&query.collection, &self.indexes));

        if !index_usable.is_empty() {
            let mut candidate_ids: Option<HashSet<String>> = None;
            for cond in &index_usable {
                let ids: HashSet<String> = self.ids_for_condition(&query.collection, cond)?.into_iter().collect();
                candidate_ids = Some(match candidate_ids {
                    None => ids,
                    Some(existing) => existing.intersection(&ids).cloned().collect(),
                });
            }
            let ids = candidate_ids.unwrap_or_default();
            let docs = ids
                .into_iter()
                .filter_map(|id| {
                    self.source
                        .get_document(&query.collection, &id)
                        .map(|doc| (id, doc))
                })
                .collect();
            return Ok((docs, residual));
        }

        if let Some(ob) = &query.order_by {
            if self.indexes.has_index(&query.collection, &ob.field) {
                let ids = self
                    .indexes
                    .find_range(&query.collection, &ob.field, None, None, true, true)?;
                let docs = ids
                    .into_iter()
                    .filter_map(|id| {
                        self.source
                            .get_document(&query.collection, &id)
                            .map(|doc| (id, doc))
                    })
                    .collect();
                return Ok((docs, query.conditions.clone()));
            }
        }

        Ok((self.source.scan_collection(&query.collection), query.conditions.clone()))
    }

    fn ids_for_condition(&self, collection: &str, cond: &Condition) -> Result<Vec<String>, QueryError> {
        match cond.op {
            CompareOp::Eq => Ok(self.indexes.find_equals(collection, &cond.field, &cond.value)?),
            CompareOp::Gt => Ok(self
                .indexes
                .find_range(collection, &cond.field, Some(&cond.value), None, false, true)?),
            CompareOp::Ge => Ok(self
                .indexes
                .find_range(collection, &cond.field, Some(&cond.value), None, true, true)?),
            CompareOp::Lt => Ok(self
                .indexes
                .find_range(collection, &cond.field, None, Some(&cond.value), true, false)?),
            CompareOp::Le => Ok(self
                .indexes
                .find_range(collection, &cond.field, None, Some(&cond.value), true, true)?),
            CompareOp::Between => match &cond.value {
                Value::List(bounds) if bounds.len() == 2 => Ok(self.indexes.find_range(
                    collection,
                    &cond.field,
                    Some(&bounds[0]),
                    Some(&bounds[1]),
                    true,
                    true,
                )?),
                _ => Err(QueryError::MalformedCondition {
                    field: cond.field.clone(),
                    op: cond.op,
                }),
            },
            _ => unreachable!("is_index_usable excludes this op"),
        }
    }

    /// Planning step 5: attach `_joined_<other_collection>` to each document.
    fn apply_joins(&self, docs: &mut [(String, Value)], joins: &[JoinSpec]) {
        for join in joins {
            for (_, doc) in docs.iter_mut() {
                let local_val = field_value(doc, &join.local_field);
                let joined_ids = match self.indexes.find_equals(&join.other_collection, &join.foreign_field, &local_val) {
                    Ok(ids) => ids,
                    Err(IndexError::Missing { .. }) => Vec::new(),
                    Err(_) => Vec::new(),
                };
                let joined_docs: Vec<Value> = joined_ids
                    .into_iter()
                    .filter_map(|id| self.source.get_document(&join.other_collection, &id))
                    .collect();
                if let Value::Map(fields) = doc {
                    fields.insert(format!("_joined_{}", join.other_collection), Value::List(joined_docs));
                }
            }
        }
    }
}

/// Extracts `doc[field]`, or `Value::Null` if absent — matching
/// `index::IndexManager`'s "absent field sorts with nulls" convention.
fn field_value(doc: &Value, field: &str) -> Value {
    match doc {
        Value::Map(fields) => fields.get(field).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// §4.10 step 4: substring match on the named field, or recursively on all
/// string leaves if no field is named.
fn matches_text_search(doc: &Value, needle: &str, field: Option<&str>) -> bool {
    let needle = needle.to_lowercase();
    match field {
        Some(f) => match field_value(doc, f) {
            Value::String(s) => s.to_lowercase().contains(&needle),
            _ => false,
        },
        None => {
            let mut strings = Vec::new();
            doc.collect_strings(&mut strings);
            strings.iter().any(|s| s.to_lowercase().contains(&needle))
        }
    }
}

fn group_documents(docs: Vec<(String, Value)>, field: &str, aggregate: Option<&AggregateOp>) -> Vec<GroupBucket> {
    let mut order: Vec<Vec<u8>> = Vec::new();
    let mut groups: HashMap<Vec<u8>, GroupBucket> = HashMap::new();

    for (id, doc) in docs {
        let key_val = field_value(&doc, field);
        let key_bytes = key_val.encode_key();
        groups
            .entry(key_bytes.clone())
            .or_insert_with(|| {
                order.push(key_bytes.clone());
                GroupBucket {
                    key: key_val,
                    documents: Vec::new(),
                    aggregate: None,
                }
            })
            .documents
            .push((id, doc));
    }

    let mut buckets: Vec<GroupBucket> = order
        .into_iter()
        .filter_map(|k| groups.remove(&k))
        .collect();

    if let Some(op) = aggregate {
        for bucket in &mut buckets {
            bucket.aggregate = Some(compute_aggregate(&bucket.documents, op));
        }
    }
    buckets
}

fn compute_aggregate(docs: &[(String, Value)], op: &AggregateOp) -> AggregateOutcome {
    match op {
        AggregateOp::Count(field) => {
            let count = match field {
                Some(f) => docs.iter().filter(|(_, d)| !field_value(d, f).is_null()).count(),
                None => docs.len(),
            };
            AggregateOutcome {
                count: Some(count as u64),
                ..Default::default()
            }
        }
        AggregateOp::Sum(field) => {
            let sum = docs.iter().filter_map(|(_, d)| field_value(d, field).as_f64()).sum();
            AggregateOutcome {
                sum: Some(sum),
                ..Default::default()
            }
        }
        AggregateOp::Avg(field) => {
            let nums: Vec<f64> = docs.iter().filter_map(|(_, d)| field_value(d, field).as_f64()).collect();
            let avg = if nums.is_empty() {
                None
            } else {
                Some(nums.iter().sum::<f64>() / nums.len() as f64)
            };
            AggregateOutcome {
                avg,
                ..Default::default()
            }
        }
        AggregateOp::Min(field) => {
            let min = docs
                .iter()
                .map(|(_, d)| field_value(d, field))
                .filter(|v| !v.is_null())
                .min();
            AggregateOutcome {
                min,
                ..Default::default()
            }
        }
        AggregateOp::Max(field) => {
            let max = docs
                .iter()
                .map(|(_, d)| field_value(d, field))
                .filter(|v| !v.is_null())
                .max();
            AggregateOutcome {
                max,
                ..Default::default()
            }
        }
        AggregateOp::Distinct(field) => {
            let mut seen = HashSet::new();
            let mut values = Vec::new();
            for (_, d) in docs {
                let v = field_value(d, field);
                if seen.insert(v.encode_key()) {
                    values.push(v);
                }
            }
            AggregateOutcome {
                distinct_count: Some(values.len() as u64),
                distinct_values: Some(values),
                ..Default::default()
            }
        }
    }
}

#[cfg(test)]
mod tests;
