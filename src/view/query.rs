//! Index queries: key ranges, key sets, grouping and reduce.
//!
//! Descending order swaps the range bounds (and their inclusivity) and
//! flips `ORDER BY`; there is no separate sort pass. Rows with equal keys
//! are ordered by document ID, which is what `start_key_doc_id` and
//! `end_key_doc_id` break ties on when paging.
//!
//! # Grouping
//!
//! With `group_level = n`, two array keys fall in the same group when their
//! first `n` elements collate equal; the group's key is that prefix. Keys
//! that are not arrays, or are shorter than `n`, must match exactly.
//! `group = true` with level 0 groups by the whole key. Without grouping a
//! reduce yields one row keyed `null`.

use super::View;
use crate::collate::{collate, Collation};
use crate::database::{parse_body, Database};
use crate::error::{CoreError, Result};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tracing::{debug, instrument};

/// Options for [`View::query`] and [`View::full_text_query`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub start_key: Option<Value>,
    pub end_key: Option<Value>,
    pub start_key_doc_id: Option<String>,
    pub end_key_doc_id: Option<String>,
    /// Only rows with exactly these keys, returned in this order.
    pub keys: Option<Vec<Value>>,
    pub descending: bool,
    pub inclusive_start: bool,
    pub inclusive_end: bool,
    pub skip: usize,
    pub limit: Option<usize>,
    pub group: bool,
    pub group_level: usize,
    /// Apply the reduce function when the view has one.
    pub reduce: bool,
    pub include_docs: bool,
    pub full_text_query: Option<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            start_key: None,
            end_key: None,
            start_key_doc_id: None,
            end_key_doc_id: None,
            keys: None,
            descending: false,
            inclusive_start: true,
            inclusive_end: true,
            skip: 0,
            limit: None,
            group: false,
            group_level: 0,
            reduce: true,
            include_docs: false,
            full_text_query: None,
        }
    }
}

impl QueryOptions {
    fn grouped(&self) -> bool {
        self.group || self.group_level > 0
    }
}

/// One row of a map or reduce query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub key: Value,
    pub value: Value,
    /// Emitting document; `None` for reduced rows.
    pub doc_id: Option<String>,
    /// Sequence of the emitting revision; 0 for reduced rows.
    pub sequence: u64,
    /// With `include_docs`: the emitting document, or the document linked
    /// by the value's `_id` (and optional `_rev`).
    pub document: Option<Map<String, Value>>,
}

/// One matched term in a full-text row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextMatch {
    /// Index of the query term that matched.
    pub term: usize,
    /// Byte offset into the indexed text.
    pub offset: usize,
    pub length: usize,
}

/// One row of a full-text query.
#[derive(Debug, Clone, PartialEq)]
pub struct FullTextQueryRow {
    pub doc_id: String,
    pub sequence: u64,
    pub full_text_id: i64,
    pub matches: Vec<TextMatch>,
    pub value: Value,
}

/// Key bounds after applying `descending`.
struct Range<'a> {
    min: Option<&'a Value>,
    max: Option<&'a Value>,
    min_doc_id: Option<&'a str>,
    max_doc_id: Option<&'a str>,
    inclusive_min: bool,
    inclusive_max: bool,
}

impl<'a> Range<'a> {
    fn from_options(options: &'a QueryOptions) -> Self {
        let range = Range {
            min: options.start_key.as_ref(),
            max: options.end_key.as_ref(),
            min_doc_id: options.start_key_doc_id.as_deref(),
            max_doc_id: options.end_key_doc_id.as_deref(),
            inclusive_min: options.inclusive_start,
            inclusive_max: options.inclusive_end,
        };
        if options.descending {
            Range {
                min: range.max,
                max: range.min,
                min_doc_id: range.max_doc_id,
                max_doc_id: range.min_doc_id,
                inclusive_min: range.inclusive_max,
                inclusive_max: range.inclusive_min,
            }
        } else {
            range
        }
    }
}

enum Param {
    Int(i64),
    Text(String),
}

/// Map-row SQL for `options`, with its bind parameters in order.
fn map_query_sql(view_id: i64, collation: Collation, options: &QueryOptions, paged_in_sql: bool) -> Result<(String, Vec<Param>)> {
    let key = format!("maps.key COLLATE {}", collation.sqlite_name());
    let mut sql = String::from(
        "SELECT maps.key, maps.value, docs.docid, maps.sequence, revs.revid, revs.json
         FROM maps
         JOIN revs ON revs.sequence = maps.sequence
         JOIN docs ON docs.doc_id = revs.doc_id
         WHERE maps.view_id = ? AND maps.fulltext_id IS NULL",
    );
    let mut params = vec![Param::Int(view_id)];

    if let Some(keys) = &options.keys {
        let placeholders = vec!["?"; keys.len()].join(", ");
        sql.push_str(&format!(" AND {key} IN ({placeholders})"));
        for k in keys {
            params.push(Param::Text(serde_json::to_string(k)?));
        }
    }

    let range = Range::from_options(options);
    if let Some(min) = range.min {
        let min = serde_json::to_string(min)?;
        let op = if range.inclusive_min { ">=" } else { ">" };
        match range.min_doc_id {
            Some(doc_id) => {
                sql.push_str(&format!(" AND ({key} > ? OR ({key} = ? AND docs.docid {op} ?))"));
                params.push(Param::Text(min.clone()));
                params.push(Param::Text(min));
                params.push(Param::Text(doc_id.to_string()));
            }
            None => {
                sql.push_str(&format!(" AND {key} {op} ?"));
                params.push(Param::Text(min));
            }
        }
    }
    if let Some(max) = range.max {
        let max = serde_json::to_string(max)?;
        let op = if range.inclusive_max { "<=" } else { "<" };
        match range.max_doc_id {
            Some(doc_id) => {
                sql.push_str(&format!(" AND ({key} < ? OR ({key} = ? AND docs.docid {op} ?))"));
                params.push(Param::Text(max.clone()));
                params.push(Param::Text(max));
                params.push(Param::Text(doc_id.to_string()));
            }
            None => {
                sql.push_str(&format!(" AND {key} {op} ?"));
                params.push(Param::Text(max));
            }
        }
    }

    let direction = if options.descending { "DESC" } else { "ASC" };
    sql.push_str(&format!(" ORDER BY {key} {direction}, docs.docid {direction}"));
    if paged_in_sql {
        sql.push_str(" LIMIT ? OFFSET ?");
        let limit = options.limit.map(|l| l as i64).unwrap_or(-1);
        params.push(Param::Int(limit));
        params.push(Param::Int(options.skip as i64));
    }
    Ok((sql, params))
}

type MapRow = (String, Option<String>, String, i64, String, Option<String>);

/// True when `a` and `b` reduce into the same group at `group_level`.
pub fn group_together(a: &Value, b: &Value, group_level: usize, collation: Collation) -> bool {
    if group_level == 0 {
        return collate(a, b, collation) == Ordering::Equal;
    }
    match (a, b) {
        (Value::Array(a), Value::Array(b)) if a.len() >= group_level && b.len() >= group_level => a
            [..group_level]
            .iter()
            .zip(&b[..group_level])
            .all(|(x, y)| collate(x, y, collation) == Ordering::Equal),
        _ => collate(a, b, collation) == Ordering::Equal,
    }
}

/// Key reported for a group: the first `group_level` elements of an array.
pub fn group_key(key: &Value, group_level: usize) -> Value {
    match key {
        Value::Array(items) if group_level > 0 && items.len() > group_level => {
            Value::Array(items[..group_level].to_vec())
        }
        other => other.clone(),
    }
}

/// Reduces one group in batches so no single call sees more than
/// `batch_size` rows. Partial results are combined with a rereduce.
struct ReduceBatcher<'a> {
    reduce: &'a (dyn Fn(&[Value], &[Value], bool) -> Value + Send + Sync),
    batch_size: usize,
    keys: Vec<Value>,
    values: Vec<Value>,
    partials: Vec<Value>,
}

impl<'a> ReduceBatcher<'a> {
    fn new(reduce: &'a (dyn Fn(&[Value], &[Value], bool) -> Value + Send + Sync), batch_size: usize) -> Self {
        Self {
            reduce,
            batch_size: batch_size.max(1),
            keys: Vec::new(),
            values: Vec::new(),
            partials: Vec::new(),
        }
    }

    fn push(&mut self, key: Value, value: Value) {
        self.keys.push(key);
        self.values.push(value);
        if self.values.len() >= self.batch_size {
            let partial = (self.reduce)(&self.keys, &self.values, false);
            self.partials.push(partial);
            self.keys.clear();
            self.values.clear();
        }
    }

    fn finish(mut self) -> Value {
        if self.partials.is_empty() {
            return (self.reduce)(&self.keys, &self.values, false);
        }
        if !self.values.is_empty() {
            let partial = (self.reduce)(&self.keys, &self.values, false);
            self.partials.push(partial);
        }
        let keys = vec![Value::Null; self.partials.len()];
        (self.reduce)(&keys, &self.partials, true)
    }
}

fn parse_value(text: Option<&str>) -> Result<Value> {
    match text {
        Some(text) => Ok(serde_json::from_str(text)?),
        None => Ok(Value::Null),
    }
}

/// Byte offsets from SQLite's `offsets()`: groups of
/// `column term offset length`.
pub(crate) fn parse_offsets(offsets: &str) -> Vec<TextMatch> {
    let numbers: Vec<usize> = offsets
        .split_whitespace()
        .filter_map(|n| n.parse().ok())
        .collect();
    numbers
        .chunks_exact(4)
        .map(|c| TextMatch {
            term: c[1],
            offset: c[2],
            length: c[3],
        })
        .collect()
}

impl View {
    /// Query the index as of its last update. Call
    /// [`update_index`](View::update_index) first for fresh results.
    #[instrument(skip(self, options), fields(view = %self.name))]
    pub async fn query(&self, options: &QueryOptions) -> Result<Vec<QueryRow>> {
        if options.full_text_query.is_some() {
            return Err(CoreError::Config(
                "full_text_query requires View::full_text_query".into(),
            ));
        }
        let db = self.database()?;
        let reducer = self.reduce_fn().filter(|_| options.reduce);
        if options.include_docs && reducer.is_some() && options.reduce {
            return Err(CoreError::Config(
                "include_docs is not valid for a reduce query; set reduce = false".into(),
            ));
        }
        let aggregate = reducer.is_some() || options.grouped();
        // Paging applies to output rows, so it moves out of SQL when rows
        // are grouped or reordered by `keys`.
        let paged_in_sql = !aggregate && options.keys.is_none();

        let (sql, params) = map_query_sql(self.view_id(), self.collation(), options, paged_in_sql)?;
        let mut query = sqlx::query_as::<_, MapRow>(&sql);
        for param in params {
            query = match param {
                Param::Int(n) => query.bind(n),
                Param::Text(s) => query.bind(s),
            };
        }
        let rows = query.fetch_all(db.pool()).await?;
        debug!(rows = rows.len(), aggregate, "Read index rows");

        let mut out = if aggregate {
            self.reduce_rows(rows, options, reducer.as_deref())?
        } else {
            let mut out = Vec::with_capacity(rows.len());
            for (key, value, doc_id, sequence, rev_id, json) in rows {
                let value = parse_value(value.as_deref())?;
                let document = if options.include_docs {
                    self.document_for_row(&db, &doc_id, &rev_id, json.as_deref(), &value).await?
                } else {
                    None
                };
                out.push(QueryRow {
                    key: serde_json::from_str(&key)?,
                    value,
                    doc_id: Some(doc_id),
                    sequence: sequence as u64,
                    document,
                });
            }
            out
        };

        if let Some(keys) = &options.keys {
            let collation = self.collation();
            let position = |k: &Value| {
                keys.iter()
                    .position(|candidate| collate(candidate, k, collation) == Ordering::Equal)
                    .unwrap_or(usize::MAX)
            };
            out.sort_by_key(|row| position(&row.key));
        }
        if !paged_in_sql {
            let limit = options.limit.unwrap_or(usize::MAX);
            out = out.into_iter().skip(options.skip).take(limit).collect();
        }
        Ok(out)
    }

    fn reduce_rows(
        &self,
        rows: Vec<MapRow>,
        options: &QueryOptions,
        reducer: Option<&(dyn Fn(&[Value], &[Value], bool) -> Value + Send + Sync)>,
    ) -> Result<Vec<QueryRow>> {
        let collation = self.collation();
        let grouped = options.grouped();
        let batch_size = self.database()?.config().views.reduce_batch_size;

        let mut out = Vec::new();
        let mut current: Option<(Value, Option<ReduceBatcher<'_>>)> = None;
        for (key, value, ..) in rows {
            let key: Value = serde_json::from_str(&key)?;
            let value = parse_value(value.as_deref())?;
            let starts_group = match &current {
                None => true,
                Some((group_first, _)) => {
                    grouped && !group_together(group_first, &key, options.group_level, collation)
                }
            };
            if starts_group {
                if let Some(finished) = current.take() {
                    out.push(finish_group(finished, grouped, options.group_level));
                }
                current = Some((key.clone(), reducer.map(|r| ReduceBatcher::new(r, batch_size))));
            }
            if let Some((_, Some(batcher))) = current.as_mut() {
                batcher.push(key, value);
            }
        }
        if let Some(finished) = current {
            out.push(finish_group(finished, grouped, options.group_level));
        }
        Ok(out)
    }

    /// The document to attach with `include_docs`.
    async fn document_for_row(
        &self,
        db: &Database,
        doc_id: &str,
        rev_id: &str,
        json: Option<&str>,
        value: &Value,
    ) -> Result<Option<Map<String, Value>>> {
        if let Some(linked_id) = value.get("_id").and_then(Value::as_str) {
            let linked = match value.get("_rev").and_then(Value::as_str) {
                Some(linked_rev) => db.get_revision(linked_id, linked_rev).await?,
                None => db.get_document(linked_id).await?,
            };
            return Ok(linked.map(|r| r.properties()));
        }
        let mut props = parse_body(json)?.unwrap_or_default();
        props.insert("_id".into(), Value::String(doc_id.to_string()));
        props.insert("_rev".into(), Value::String(rev_id.to_string()));
        Ok(Some(props))
    }

    /// Search the full-text entries of this view. Rows come back in index
    /// insertion order, not ranked by relevance.
    #[instrument(skip(self, options), fields(view = %self.name))]
    pub async fn full_text_query(&self, options: &QueryOptions) -> Result<Vec<FullTextQueryRow>> {
        let text = options
            .full_text_query
            .as_deref()
            .ok_or_else(|| CoreError::Config("full_text_query not set".into()))?;
        let db = self.database()?;
        let direction = if options.descending { "DESC" } else { "ASC" };
        let sql = format!(
            "SELECT docs.docid, maps.sequence, maps.fulltext_id, maps.value, offsets(fulltext)
             FROM maps
             JOIN fulltext ON fulltext.rowid = maps.fulltext_id
             JOIN revs ON revs.sequence = maps.sequence
             JOIN docs ON docs.doc_id = revs.doc_id
             WHERE fulltext MATCH ? AND maps.view_id = ?
             ORDER BY maps.sequence {direction}
             LIMIT ? OFFSET ?"
        );
        let limit = options.limit.map(|l| l as i64).unwrap_or(-1);
        let rows: Vec<(String, i64, i64, Option<String>, String)> = sqlx::query_as(&sql)
            .bind(text)
            .bind(self.view_id())
            .bind(limit)
            .bind(options.skip as i64)
            .fetch_all(db.pool())
            .await?;

        rows.into_iter()
            .map(|(doc_id, sequence, full_text_id, value, offsets)| {
                Ok(FullTextQueryRow {
                    doc_id,
                    sequence: sequence as u64,
                    full_text_id,
                    matches: parse_offsets(&offsets),
                    value: parse_value(value.as_deref())?,
                })
            })
            .collect()
    }
}

fn finish_group(group: (Value, Option<ReduceBatcher<'_>>), grouped: bool, group_level: usize) -> QueryRow {
    let (first_key, batcher) = group;
    let key = if grouped {
        group_key(&first_key, group_level)
    } else {
        Value::Null
    };
    QueryRow {
        key,
        value: batcher.map(ReduceBatcher::finish).unwrap_or(Value::Null),
        doc_id: None,
        sequence: 0,
        document: None,
    }
}
