//! In-memory namespace tree of a day-file.
//!
//! Nodes live in an arena indexed by [`NodeId`]. Ids are assigned in
//! creation order and a parent is always created before its children, so
//! replaying nodes in id order rebuilds the same tree.

use crate::error::{Result, StoreError};
use crate::types::{domain_of, BoundedText, Timestamp, Value, ValueKind};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

/// Index of a node in the namespace arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The implicit root node.
    pub const ROOT: NodeId = NodeId(0);
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Value column of a series.
#[derive(Clone, Debug)]
pub enum Column {
    Float(Vec<f64>),
    Text(Vec<BoundedText>),
}

impl Column {
    pub fn new(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Float => Column::Float(Vec::new()),
            ValueKind::Text => Column::Text(Vec::new()),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Column::Float(_) => ValueKind::Float,
            Column::Text(_) => ValueKind::Text,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Float(v) => v.len(),
            Column::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at `index`, if any.
    pub fn get(&self, index: usize) -> Option<Value> {
        match self {
            Column::Float(v) => v.get(index).map(|x| Value::Float(*x)),
            Column::Text(v) => v.get(index).cloned().map(Value::Text),
        }
    }

    fn push(&mut self, value: Value) -> std::result::Result<(), ValueKind> {
        match (self, value) {
            (Column::Float(col), Value::Float(v)) => col.push(v),
            (Column::Text(col), Value::Text(t)) => col.push(t),
            (_, value) => return Err(value.kind()),
        }
        Ok(())
    }

    fn extend(&mut self, other: Column) -> std::result::Result<(), ValueKind> {
        match (self, other) {
            (Column::Float(col), Column::Float(more)) => col.extend(more),
            (Column::Text(col), Column::Text(more)) => col.extend(more),
            (_, other) => return Err(other.kind()),
        }
        Ok(())
    }
}

// Compares floats bitwise so NaN sentinels are equal.
impl PartialEq for Column {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Column::Float(a), Column::Float(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Column::Text(a), Column::Text(b)) => a == b,
            _ => false,
        }
    }
}

/// The `timestamp` and `value` columns of one entity.
///
/// Both columns always have the same length.
#[derive(Clone, Debug, PartialEq)]
pub struct Series {
    timestamps: Vec<Timestamp>,
    values: Column,
}

impl Series {
    pub fn new(kind: ValueKind) -> Self {
        Self {
            timestamps: Vec::new(),
            values: Column::new(kind),
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.values.kind()
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps
    }

    pub fn values(&self) -> &Column {
        &self.values
    }

    /// Last observation, if any.
    pub fn last(&self) -> Option<(&Timestamp, Value)> {
        let ts = self.timestamps.last()?;
        let value = self.values.get(self.len() - 1)?;
        Some((ts, value))
    }

    /// Grow both columns by one observation.
    pub(crate) fn push(&mut self, timestamp: Timestamp, value: Value) -> std::result::Result<(), ValueKind> {
        self.values.push(value)?;
        self.timestamps.push(timestamp);
        Ok(())
    }

    /// Grow both columns by a block of observations of equal length.
    pub(crate) fn extend(
        &mut self,
        timestamps: Vec<Timestamp>,
        values: Column,
    ) -> std::result::Result<(), ValueKind> {
        self.values.extend(values)?;
        self.timestamps.extend(timestamps);
        Ok(())
    }
}

/// One node of the namespace tree.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    /// Path segment of this node.
    pub name: String,

    /// Parent node (`None` for the root).
    pub parent: Option<NodeId>,

    /// Children by name.
    pub children: BTreeMap<String, NodeId>,

    /// Side-channel attributes, overwritten in place.
    pub attrs: BTreeMap<String, JsonValue>,

    /// Columns, present once the first value was written.
    pub series: Option<Series>,
}

impl Node {
    fn new(name: impl Into<String>, parent: Option<NodeId>) -> Self {
        Self {
            name: name.into(),
            parent,
            children: BTreeMap::new(),
            attrs: BTreeMap::new(),
            series: None,
        }
    }
}

/// Arena of namespace nodes rooted at [`NodeId::ROOT`].
#[derive(Clone, Debug, PartialEq)]
pub struct Namespace {
    nodes: Vec<Node>,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace {
    /// Create a namespace holding only the root.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new("", None)],
        }
    }

    /// Number of nodes including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether only the root exists.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn get(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0 as usize)
            .ok_or(StoreError::NodeNotFound(id.0))
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0 as usize)
            .ok_or(StoreError::NodeNotFound(id.0))
    }

    /// Child of `parent` named `name`.
    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes
            .get(parent.0 as usize)
            .and_then(|node| node.children.get(name).copied())
    }

    /// Resolve a path of segments from the root.
    pub fn resolve(&self, segments: &[&str]) -> Option<NodeId> {
        segments
            .iter()
            .try_fold(NodeId::ROOT, |node, segment| self.child(node, segment))
    }

    /// Id the next inserted node will get.
    pub(crate) fn next_id(&self) -> NodeId {
        NodeId(self.nodes.len() as u32)
    }

    /// Insert a node with a known id.
    ///
    /// `id` must be the next free id, `parent` must exist and must not
    /// already have a child named `name`.
    pub(crate) fn insert(&mut self, id: NodeId, parent: NodeId, name: &str) -> Result<()> {
        if id != self.next_id() {
            return Err(StoreError::Corruption(format!(
                "node {:?} out of order (expected {:?})",
                id,
                self.next_id()
            )));
        }
        let parent_node = self.get_mut(parent)?;
        if parent_node.children.contains_key(name) {
            return Err(StoreError::Corruption(format!(
                "duplicate node {:?} under {:?}",
                name, parent
            )));
        }
        parent_node.children.insert(name.to_string(), id);
        self.nodes.push(Node::new(name, Some(parent)));
        Ok(())
    }

    /// Slash-separated path of a node (`/sensor/sensor.temp`).
    pub fn path_of(&self, id: NodeId) -> Result<String> {
        let mut segments = Vec::new();
        let mut current = id;
        while let Some(parent) = self.get(current)?.parent {
            segments.push(self.get(current)?.name.as_str());
            current = parent;
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    /// Node id of a series by entity identifier.
    pub fn series_node(&self, entity_id: &str) -> Option<NodeId> {
        let domain = domain_of(entity_id);
        self.resolve(&[domain.as_str(), entity_id])
    }

    /// Series by entity identifier.
    pub fn series(&self, entity_id: &str) -> Option<&Series> {
        self.series_node(entity_id)
            .and_then(|id| self.nodes.get(id.0 as usize))
            .and_then(|node| node.series.as_ref())
    }

    /// Attributes of a series node by entity identifier.
    pub fn attributes(&self, entity_id: &str) -> Option<&BTreeMap<String, JsonValue>> {
        self.series_node(entity_id)
            .and_then(|id| self.nodes.get(id.0 as usize))
            .map(|node| &node.attrs)
    }

    /// All nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (NodeId(i as u32), node))
    }

    /// Nodes that carry columns, in id order.
    pub fn series_nodes(&self) -> impl Iterator<Item = (NodeId, &Node, &Series)> {
        self.nodes()
            .filter_map(|(id, node)| node.series.as_ref().map(|s| (id, node, s)))
    }

    /// Number of series in the tree.
    pub fn series_count(&self) -> usize {
        self.series_nodes().count()
    }

    /// Total number of observations across all series.
    pub fn point_count(&self) -> usize {
        self.series_nodes().map(|(_, _, s)| s.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> Timestamp {
        Timestamp::parse(s).unwrap()
    }

    #[test]
    fn test_insert_and_resolve() {
        let mut ns = Namespace::new();
        ns.insert(NodeId(1), NodeId::ROOT, "sensor").unwrap();
        ns.insert(NodeId(2), NodeId(1), "sensor.temp").unwrap();

        assert_eq!(ns.resolve(&["sensor", "sensor.temp"]), Some(NodeId(2)));
        assert_eq!(ns.series_node("sensor.temp"), Some(NodeId(2)));
        assert_eq!(ns.path_of(NodeId(2)).unwrap(), "/sensor/sensor.temp");
        assert_eq!(ns.path_of(NodeId::ROOT).unwrap(), "/");
        assert!(ns.resolve(&["light"]).is_none());
    }

    #[test]
    fn test_insert_rejects_out_of_order_and_duplicates() {
        let mut ns = Namespace::new();
        assert!(matches!(
            ns.insert(NodeId(5), NodeId::ROOT, "sensor"),
            Err(StoreError::Corruption(_))
        ));
        ns.insert(NodeId(1), NodeId::ROOT, "sensor").unwrap();
        assert!(matches!(
            ns.insert(NodeId(2), NodeId::ROOT, "sensor"),
            Err(StoreError::Corruption(_))
        ));
        assert!(matches!(
            ns.insert(NodeId(2), NodeId(9), "x"),
            Err(StoreError::NodeNotFound(9))
        ));
    }

    #[test]
    fn test_series_columns_stay_aligned() {
        let mut series = Series::new(ValueKind::Float);
        series
            .push(ts("2026-10-15T00:00:00.000000Z"), Value::Float(1.0))
            .unwrap();

        let err = series
            .push(
                ts("2026-10-15T00:01:00.000000Z"),
                Value::Text(BoundedText::new("on")),
            )
            .unwrap_err();
        assert_eq!(err, ValueKind::Text);
        assert_eq!(series.len(), 1);
        assert_eq!(series.values().len(), 1);
    }

    #[test]
    fn test_nan_columns_compare_equal() {
        let a = Column::Float(vec![1.0, f64::NAN]);
        let b = Column::Float(vec![1.0, f64::NAN]);
        assert_eq!(a, b);
        assert_ne!(a, Column::Float(vec![1.0]));
    }
}
