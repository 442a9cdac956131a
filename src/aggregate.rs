//! Typed aggregation pipelines over JSON documents.
//!
//! A [`Pipeline`] is a list of stage descriptors (match, limit, project,
//! unwind, group) that any [`crate::store::Session`] can execute. The
//! descriptors also carry their own evaluation so in-process stores can run
//! them directly with document-store semantics:
//!
//! - dotted paths traverse arrays, so `dat.ts` over `dat: [{ts: [..]}, ..]`
//!   resolves to an array of arrays
//! - `unwind` drops documents whose field is missing, null or an empty array,
//!   and passes non-array values through unchanged
//! - `concat_arrays` yields null when any input is missing or null
//! - a `ne` condition on an array path holds only if no element is equal

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use serde_json::{Map, Number, Value};

/// A single stored or intermediate document.
pub type Document = Map<String, Value>;

/// Comparison applied to the values found at a document path.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
}

impl Condition {
    fn matches(&self, candidates: &[Value]) -> bool {
        match self {
            Self::Eq(v) => contains(candidates, v),
            Self::Ne(v) => !contains(candidates, v),
            Self::Gt(v) => any_ordering(candidates, v, |o| o == Ordering::Greater),
            Self::Gte(v) => any_ordering(candidates, v, |o| o != Ordering::Less),
            Self::Lt(v) => any_ordering(candidates, v, |o| o == Ordering::Less),
            Self::Lte(v) => any_ordering(candidates, v, |o| o != Ordering::Greater),
        }
    }
}

/// Conjunction of path conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<String>, condition: Condition) -> Self {
        self.conditions.push((path.into(), condition));
        self
    }

    pub fn eq(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Condition::Eq(value.into()))
    }

    pub fn ne(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Condition::Ne(value.into()))
    }

    pub fn gt(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Condition::Gt(value.into()))
    }

    pub fn conditions(&self) -> &[(String, Condition)] {
        &self.conditions
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|(path, condition)| {
            let mut candidates = Vec::new();
            let segments: Vec<&str> = path.split('.').collect();
            if let Some((head, rest)) = segments.split_first() {
                if let Some(value) = doc.get(*head) {
                    collect_candidates(value, rest, &mut candidates);
                }
            }
            condition.matches(&candidates)
        })
    }

    /// Top-level equality conditions as a document. Upserts seed new
    /// documents from these.
    pub fn equality_fields(&self) -> Document {
        self.conditions
            .iter()
            .filter_map(|(path, condition)| match condition {
                Condition::Eq(v) if !path.contains('.') => Some((path.clone(), v.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Value expression evaluated against one document.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Field(String),
    Literal(Value),
    ConcatArrays(Vec<Expr>),
    Object(Vec<(String, Expr)>),
}

impl Expr {
    pub fn field(path: impl Into<String>) -> Self {
        Self::Field(path.into())
    }

    pub fn concat(parts: Vec<Expr>) -> Self {
        Self::ConcatArrays(parts)
    }

    pub fn object<K: Into<String>>(fields: Vec<(K, Expr)>) -> Self {
        Self::Object(fields.into_iter().map(|(k, e)| (k.into(), e)).collect())
    }

    /// Evaluates the expression. `None` means the value is missing.
    pub fn eval(&self, doc: &Document) -> Option<Value> {
        match self {
            Self::Field(path) => resolve_path(doc, path),
            Self::Literal(v) => Some(v.clone()),
            Self::ConcatArrays(parts) => {
                let mut merged = Vec::new();
                for part in parts {
                    match part.eval(doc) {
                        Some(Value::Array(items)) => merged.extend(items),
                        _ => return Some(Value::Null),
                    }
                }
                Some(Value::Array(merged))
            }
            Self::Object(fields) => Some(Value::Object(
                fields
                    .iter()
                    .filter_map(|(name, expr)| expr.eval(doc).map(|v| (name.clone(), v)))
                    .collect(),
            )),
        }
    }
}

/// Field specification inside a project stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    /// Keep the field as it is.
    Include,
    /// Replace the field with a computed value.
    Computed(Expr),
}

/// Group accumulator.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    First(Expr),
    Last(Expr),
    Sum(Expr),
    Push(Expr),
    AddToSet(Expr),
}

impl Accumulator {
    pub fn first(path: &str) -> Self {
        Self::First(Expr::field(path))
    }

    pub fn last(path: &str) -> Self {
        Self::Last(Expr::field(path))
    }

    pub fn sum(path: &str) -> Self {
        Self::Sum(Expr::field(path))
    }

    pub fn push(path: &str) -> Self {
        Self::Push(Expr::field(path))
    }

    pub fn add_to_set(path: &str) -> Self {
        Self::AddToSet(Expr::field(path))
    }
}

/// One stage of an aggregation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    Limit(usize),
    Project(Vec<(String, Projection)>),
    Unwind(String),
    Group {
        id: Expr,
        fields: Vec<(String, Accumulator)>,
    },
}

impl Stage {
    fn apply(&self, docs: Vec<Document>) -> Vec<Document> {
        match self {
            Self::Match(filter) => docs.into_iter().filter(|d| filter.matches(d)).collect(),
            Self::Limit(n) => docs.into_iter().take(*n).collect(),
            Self::Project(fields) => docs.iter().map(|d| project(d, fields)).collect(),
            Self::Unwind(field) => unwind(docs, field),
            Self::Group { id, fields } => group(docs, id, fields),
        }
    }
}

/// Ordered list of stages plus execution hints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    stages: Vec<Stage>,
    allow_disk_use: bool,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn match_on(self, filter: Filter) -> Self {
        self.stage(Stage::Match(filter))
    }

    pub fn limit(self, n: usize) -> Self {
        self.stage(Stage::Limit(n))
    }

    pub fn project<K: Into<String>>(self, fields: Vec<(K, Projection)>) -> Self {
        self.stage(Stage::Project(
            fields.into_iter().map(|(k, p)| (k.into(), p)).collect(),
        ))
    }

    pub fn unwind(self, field: impl Into<String>) -> Self {
        self.stage(Stage::Unwind(field.into()))
    }

    pub fn group<K: Into<String>>(self, id: Expr, fields: Vec<(K, Accumulator)>) -> Self {
        self.stage(Stage::Group {
            id,
            fields: fields.into_iter().map(|(k, a)| (k.into(), a)).collect(),
        })
    }

    /// Lets the store spill large intermediate results to disk.
    pub fn allow_disk_use(mut self) -> Self {
        self.allow_disk_use = true;
        self
    }

    pub fn allows_disk_use(&self) -> bool {
        self.allow_disk_use
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Runs every stage over `docs` in memory.
    ///
    /// A run of unwinds directly followed by a group is evaluated as one
    /// pass: each expansion is fed to the accumulators and discarded, so the
    /// unwound arrays are never materialized as separate documents.
    pub fn run(&self, docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
        let mut docs: Vec<Document> = docs.into_iter().collect();
        let mut stages = self.stages.as_slice();

        while let Some((stage, rest)) = stages.split_first() {
            let unwinds: Vec<&str> = stages
                .iter()
                .map_while(|s| match s {
                    Stage::Unwind(field) => Some(field.as_str()),
                    _ => None,
                })
                .collect();

            match stages.get(unwinds.len()) {
                Some(Stage::Group { id, fields }) if !unwinds.is_empty() => {
                    let mut grouper = Grouper::new(id, fields);
                    for mut doc in docs {
                        expand(&mut doc, &unwinds, &mut |d| grouper.add(d));
                    }
                    docs = grouper.finish();
                    stages = &stages[unwinds.len() + 1..];
                }
                _ => {
                    docs = stage.apply(docs);
                    stages = rest;
                }
            }
        }
        docs
    }

    /// Runs the pipeline over a borrowed collection. A leading match is
    /// evaluated in place so only matching documents are copied.
    pub fn run_over(&self, docs: &[Document]) -> Vec<Document> {
        match self.stages.split_first() {
            Some((Stage::Match(filter), rest)) => Pipeline {
                stages: rest.to_vec(),
                allow_disk_use: self.allow_disk_use,
            }
            .run(docs.iter().filter(|d| filter.matches(d)).cloned()),
            _ => self.run(docs.iter().cloned()),
        }
    }
}

fn project(doc: &Document, fields: &[(String, Projection)]) -> Document {
    let mut out = Document::new();
    if !fields.iter().any(|(name, _)| name == "_id") {
        if let Some(id) = doc.get("_id") {
            out.insert("_id".into(), id.clone());
        }
    }
    for (name, projection) in fields {
        let value = match projection {
            Projection::Include => doc.get(name).cloned(),
            Projection::Computed(expr) => expr.eval(doc),
        };
        if let Some(value) = value {
            out.insert(name.clone(), value);
        }
    }
    out
}

fn unwind(docs: Vec<Document>, field: &str) -> Vec<Document> {
    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        expand(&mut doc, &[field], &mut |d| out.push(d.clone()));
    }
    out
}

/// Calls `sink` once per expansion of `doc` over the unwound `fields`.
///
/// The document is reused: each array is taken out, its elements are moved
/// in one at a time and the array is put back, so `doc` is unchanged on
/// return and sibling fields are never copied.
fn expand(doc: &mut Document, fields: &[&str], sink: &mut dyn FnMut(&Document)) {
    let Some((field, rest)) = fields.split_first() else {
        sink(doc);
        return;
    };
    let Some(value) = doc.remove(*field) else {
        return;
    };

    match value {
        Value::Array(mut items) => {
            for i in 0..items.len() {
                doc.insert(field.to_string(), std::mem::take(&mut items[i]));
                expand(doc, rest, sink);
                if let Some(item) = doc.remove(*field) {
                    items[i] = item;
                }
            }
            doc.insert(field.to_string(), Value::Array(items));
        }
        Value::Null => {
            doc.insert(field.to_string(), Value::Null);
        }
        other => {
            doc.insert(field.to_string(), other);
            expand(doc, rest, sink);
        }
    }
}

enum AccState {
    First(Option<Value>),
    Last(Value),
    Sum { int: i64, float: f64, fractional: bool },
    Push(Vec<Value>),
    AddToSet {
        items: Vec<Value>,
        seen: HashSet<String>,
    },
}

impl AccState {
    fn new(acc: &Accumulator) -> Self {
        match acc {
            Accumulator::First(_) => Self::First(None),
            Accumulator::Last(_) => Self::Last(Value::Null),
            Accumulator::Sum(_) => Self::Sum {
                int: 0,
                float: 0.0,
                fractional: false,
            },
            Accumulator::Push(_) => Self::Push(Vec::new()),
            Accumulator::AddToSet(_) => Self::AddToSet {
                items: Vec::new(),
                seen: HashSet::new(),
            },
        }
    }

    fn update(&mut self, acc: &Accumulator, doc: &Document) {
        match (self, acc) {
            (Self::First(slot), Accumulator::First(expr)) => {
                if slot.is_none() {
                    *slot = Some(expr.eval(doc).unwrap_or(Value::Null));
                }
            }
            (Self::Last(slot), Accumulator::Last(expr)) => {
                *slot = expr.eval(doc).unwrap_or(Value::Null);
            }
            (
                Self::Sum {
                    int,
                    float,
                    fractional,
                },
                Accumulator::Sum(expr),
            ) => {
                if let Some(Value::Number(n)) = expr.eval(doc) {
                    if let Some(i) = n.as_i64() {
                        *int = int.saturating_add(i);
                    } else if let Some(f) = n.as_f64() {
                        *float += f;
                        *fractional = true;
                    }
                }
            }
            (Self::Push(items), Accumulator::Push(expr)) => {
                if let Some(v) = expr.eval(doc) {
                    items.push(v);
                }
            }
            (Self::AddToSet { items, seen }, Accumulator::AddToSet(expr)) => {
                if let Some(v) = expr.eval(doc) {
                    if seen.insert(set_key(&v)) {
                        items.push(v);
                    }
                }
            }
            _ => {}
        }
    }

    fn finish(self) -> Value {
        match self {
            Self::First(v) => v.unwrap_or(Value::Null),
            Self::Last(v) => v,
            Self::Sum {
                int,
                float,
                fractional,
            } => {
                if fractional {
                    Number::from_f64(int as f64 + float)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                } else {
                    Value::from(int)
                }
            }
            Self::Push(items) | Self::AddToSet { items, .. } => Value::Array(items),
        }
    }
}

/// Hash key under which set members compare equal. Numbers compare by
/// value, so `1` and `1.0` collide.
fn set_key(value: &Value) -> String {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if f == 0.0 => "n:0".to_string(),
            Some(f) => format!("n:{f}"),
            None => format!("n:{n}"),
        },
        other => other.to_string(),
    }
}

/// Incremental state of one group stage.
struct Grouper<'a> {
    id: &'a Expr,
    fields: &'a [(String, Accumulator)],
    groups: Vec<(Value, Vec<AccState>)>,
    index: HashMap<String, usize>,
}

impl<'a> Grouper<'a> {
    fn new(id: &'a Expr, fields: &'a [(String, Accumulator)]) -> Self {
        Self {
            id,
            fields,
            groups: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn add(&mut self, doc: &Document) {
        let key = self.id.eval(doc).unwrap_or(Value::Null);
        let slot = match self.index.get(&key.to_string()) {
            Some(slot) => *slot,
            None => {
                self.index.insert(key.to_string(), self.groups.len());
                self.groups.push((
                    key,
                    self.fields.iter().map(|(_, acc)| AccState::new(acc)).collect(),
                ));
                self.groups.len() - 1
            }
        };
        for (state, (_, acc)) in self.groups[slot].1.iter_mut().zip(self.fields) {
            state.update(acc, doc);
        }
    }

    fn finish(self) -> Vec<Document> {
        let fields = self.fields;
        self.groups
            .into_iter()
            .map(|(key, states)| {
                let mut out = Document::new();
                out.insert("_id".into(), key);
                for (state, (name, _)) in states.into_iter().zip(fields) {
                    out.insert(name.clone(), state.finish());
                }
                out
            })
            .collect()
    }
}

fn group(docs: Vec<Document>, id: &Expr, fields: &[(String, Accumulator)]) -> Vec<Document> {
    let mut grouper = Grouper::new(id, fields);
    for doc in &docs {
        grouper.add(doc);
    }
    grouper.finish()
}

/// Resolves a dotted path from the document root.
pub fn resolve_path(doc: &Document, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let (head, rest) = segments.split_first()?;
    doc.get(*head).and_then(|v| resolve(v, rest))
}

fn resolve(value: &Value, path: &[&str]) -> Option<Value> {
    let Some((head, rest)) = path.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) => map.get(*head).and_then(|v| resolve(v, rest)),
        Value::Array(items) => Some(Value::Array(
            items.iter().filter_map(|item| resolve(item, path)).collect(),
        )),
        _ => None,
    }
}

fn collect_candidates(value: &Value, path: &[&str], out: &mut Vec<Value>) {
    match path.split_first() {
        None => {
            if let Value::Array(items) = value {
                out.extend(items.iter().cloned());
            }
            out.push(value.clone());
        }
        Some((head, rest)) => match value {
            Value::Object(map) => {
                if let Some(v) = map.get(*head) {
                    collect_candidates(v, rest, out);
                }
            }
            Value::Array(items) => {
                for item in items {
                    collect_candidates(item, path, out);
                }
            }
            _ => {}
        },
    }
}

fn contains(candidates: &[Value], target: &Value) -> bool {
    if target.is_null() && candidates.is_empty() {
        return true;
    }
    candidates.iter().any(|c| values_equal(c, target))
}

fn any_ordering(candidates: &[Value], target: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    candidates
        .iter()
        .filter_map(|c| compare(c, target))
        .any(accept)
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_ne_over_array_path() {
        let clean = doc(json!({"dat": [{"tls": {"strobe": false}}, {"http": {}}]}));
        let flagged = doc(json!({"dat": [{"tls": {"strobe": false}}, {"tls": {"strobe": true}}]}));
        let filter = Filter::new().ne("dat.tls.strobe", true);

        assert!(filter.matches(&clean));
        assert!(!filter.matches(&flagged));
        assert!(filter.matches(&doc(json!({"src": "10.0.0.1"}))));
    }

    #[test]
    fn test_eq_and_gt() {
        let d = doc(json!({"src": "10.0.0.1", "count": 12}));
        assert!(Filter::new().eq("src", "10.0.0.1").gt("count", 11).matches(&d));
        assert!(!Filter::new().gt("count", 12).matches(&d));
        assert!(!Filter::new().eq("src", "10.0.0.2").matches(&d));
    }

    #[test]
    fn test_field_resolves_through_arrays() {
        let d = doc(json!({"dat": [{"ts": [1, 2]}, {"ts": [3]}, {"other": 1}]}));
        assert_eq!(Expr::field("dat.ts").eval(&d), Some(json!([[1, 2], [3]])));
        assert_eq!(Expr::field("missing").eval(&d), None);
    }

    #[test]
    fn test_concat_arrays_null_on_missing() {
        let d = doc(json!({"a": [1], "b": [2, 3]}));
        let both = Expr::concat(vec![Expr::field("a"), Expr::field("b")]);
        let missing = Expr::concat(vec![Expr::field("a"), Expr::field("c")]);

        assert_eq!(both.eval(&d), Some(json!([1, 2, 3])));
        assert_eq!(missing.eval(&d), Some(Value::Null));
    }

    #[test]
    fn test_unwind_semantics() {
        let docs = vec![
            doc(json!({"_id": 1, "v": [1, 2]})),
            doc(json!({"_id": 2, "v": []})),
            doc(json!({"_id": 3, "v": null})),
            doc(json!({"_id": 4})),
            doc(json!({"_id": 5, "v": 7})),
        ];
        let out = Pipeline::new().unwind("v").run(docs);
        let values: Vec<Value> = out.iter().map(|d| d["v"].clone()).collect();
        assert_eq!(values, vec![json!(1), json!(2), json!(7)]);
    }

    #[test]
    fn test_group_accumulators() {
        let docs = vec![
            doc(json!({"k": "a", "n": 1, "t": 10})),
            doc(json!({"k": "a", "n": 2, "t": 10})),
            doc(json!({"k": "b", "n": 5, "t": 20})),
            doc(json!({"k": "a", "n": 3, "t": 30})),
        ];
        let out = Pipeline::new()
            .group(
                Expr::field("k"),
                vec![
                    ("first", Accumulator::first("n")),
                    ("last", Accumulator::last("n")),
                    ("total", Accumulator::sum("n")),
                    ("all", Accumulator::push("t")),
                    ("set", Accumulator::add_to_set("t")),
                ],
            )
            .run(docs);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["_id"], json!("a"));
        assert_eq!(out[0]["first"], json!(1));
        assert_eq!(out[0]["last"], json!(3));
        assert_eq!(out[0]["total"], json!(6));
        assert_eq!(out[0]["all"], json!([10, 10, 30]));
        assert_eq!(out[0]["set"], json!([10, 30]));
        assert_eq!(out[1]["_id"], json!("b"));
    }

    #[test]
    fn test_project_keeps_id_by_default() {
        let d = doc(json!({"_id": "x", "a": 1, "b": 2}));
        let out = Pipeline::new()
            .project(vec![
                ("a", Projection::Include),
                ("c", Projection::Computed(Expr::field("b"))),
            ])
            .run(vec![d]);
        assert_eq!(Value::Object(out[0].clone()), json!({"_id": "x", "a": 1, "c": 2}));
    }

    #[test]
    fn test_empty_input_yields_no_groups() {
        let out = Pipeline::new()
            .group(Expr::field("_id"), vec![("n", Accumulator::sum("n"))])
            .run(Vec::new());
        assert!(out.is_empty());
    }

    #[test]
    fn test_unwinds_into_group_cover_every_combination() {
        let docs = vec![
            doc(json!({"_id": 1, "a": [1, 2], "b": ["x", "y"], "keep": [9, 9, 9]})),
            doc(json!({"_id": 2, "a": [], "b": ["z"]})),
            doc(json!({"_id": 3, "a": [3], "b": "w"})),
        ];
        let out = Pipeline::new()
            .unwind("a")
            .unwind("b")
            .group(
                Expr::field("_id"),
                vec![
                    ("as", Accumulator::push("a")),
                    ("bs", Accumulator::push("b")),
                    ("keep", Accumulator::first("keep")),
                ],
            )
            .run(docs);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["_id"], json!(1));
        assert_eq!(out[0]["as"], json!([1, 1, 2, 2]));
        assert_eq!(out[0]["bs"], json!(["x", "y", "x", "y"]));
        assert_eq!(out[0]["keep"], json!([9, 9, 9]));
        assert_eq!(out[1]["_id"], json!(3));
        assert_eq!(out[1]["bs"], json!(["w"]));
    }

    #[test]
    fn test_nested_unwind_then_group_over_large_arrays() {
        let chunks: Vec<Vec<i64>> = (0..20)
            .map(|c| (0..1_000).map(|i| c * 1_000 + i).collect())
            .collect();
        let sizes: Vec<Vec<i64>> = chunks.iter().map(|c| vec![512; c.len()]).collect();
        let d = doc(json!({"_id": "pair", "ts": chunks, "bytes": sizes}));

        let out = Pipeline::new()
            .unwind("ts")
            .unwind("ts")
            .group(
                Expr::field("_id"),
                vec![
                    ("bytes", Accumulator::first("bytes")),
                    ("ts", Accumulator::add_to_set("ts")),
                    ("ts_full", Accumulator::push("ts")),
                ],
            )
            .unwind("bytes")
            .unwind("bytes")
            .group(
                Expr::field("_id"),
                vec![
                    ("ts", Accumulator::first("ts")),
                    ("bytes", Accumulator::push("bytes")),
                ],
            )
            .run(vec![d]);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["ts"].as_array().unwrap().len(), 20_000);
        assert_eq!(out[0]["bytes"].as_array().unwrap().len(), 20_000);
    }

    #[test]
    fn test_add_to_set_compares_numbers_by_value() {
        let docs = vec![
            doc(json!({"k": 1, "v": 1})),
            doc(json!({"k": 1, "v": 1.0})),
            doc(json!({"k": 1, "v": "1"})),
            doc(json!({"k": 1, "v": 2})),
        ];
        let out = Pipeline::new()
            .group(Expr::field("k"), vec![("set", Accumulator::add_to_set("v"))])
            .run(docs);
        assert_eq!(out[0]["set"], json!([1, "1", 2]));
    }

    #[test]
    fn test_leading_match_runs_over_borrowed_docs() {
        let docs = vec![
            doc(json!({"src": "10.0.0.1", "n": [1, 2]})),
            doc(json!({"src": "10.0.0.2", "n": [5]})),
        ];
        let pipeline = Pipeline::new()
            .match_on(Filter::new().eq("src", "10.0.0.2"))
            .unwind("n")
            .group(Expr::field("src"), vec![("n", Accumulator::sum("n"))]);

        let out = pipeline.run_over(&docs);
        assert_eq!(out, pipeline.run(docs.clone()));
        assert_eq!(out[0]["n"], json!(5));
    }
}
