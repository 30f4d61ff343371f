//! A k-d tree over descriptor vectors.
//!
//! Nodes live in a flat arena and refer to their children by index. The tree is never
//! rebalanced, so its shape depends on insertion order, but query results do not: equal
//! distances are ordered by payload index.

use crate::{Error, Result};
use float_ord::FloatOrd;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One result of a nearest neighbor query.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Neighbor {
    /// The payload index given when the point was inserted.
    pub index: usize,
    /// Euclidean distance to the query.
    pub distance: f32,
}

#[derive(Debug, Clone)]
struct KdNode {
    point: Vec<f32>,
    index: usize,
    left: Option<usize>,
    right: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct KdTree {
    dimensions: usize,
    nodes: Vec<KdNode>,
}

impl KdTree {
    /// Creates an empty tree of points with `dimensions` coordinates.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            nodes: vec![],
        }
    }

    /// Builds a tree where each point's payload index is its position in `points`.
    pub fn from_points<'a, I>(dimensions: usize, points: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a [f32]>,
    {
        let mut tree = Self::new(dimensions);
        for (index, point) in points.into_iter().enumerate() {
            tree.insert(point, index)?;
        }
        Ok(tree)
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a point, splitting on coordinate `depth % dimensions` at every level.
    /// Coordinates smaller than the node's go left, all others go right.
    pub fn insert(&mut self, point: &[f32], index: usize) -> Result<()> {
        self.check_dimensions(point)?;
        let new = self.nodes.len();
        if new != 0 {
            let mut current = 0;
            let mut depth = 0;
            loop {
                let axis = depth % self.dimensions;
                let node = &mut self.nodes[current];
                let child = if point[axis] < node.point[axis] {
                    &mut node.left
                } else {
                    &mut node.right
                };
                match *child {
                    Some(next) => {
                        current = next;
                        depth += 1;
                    }
                    None => {
                        *child = Some(new);
                        break;
                    }
                }
            }
        }
        self.nodes.push(KdNode {
            point: point.to_vec(),
            index,
            left: None,
            right: None,
        });
        Ok(())
    }

    /// The `count` points closest to `query`, nearest first.
    ///
    /// Fewer than `count` neighbors are returned only when the tree holds fewer points.
    pub fn nearest(&self, query: &[f32], count: usize) -> Result<Vec<Neighbor>> {
        self.check_dimensions(query)?;
        if count == 0 || self.nodes.is_empty() {
            return Ok(vec![]);
        }
        // (squared distance, payload index), sorted ascending.
        let mut best: Vec<(f32, usize)> = Vec::with_capacity(count + 1);
        // (node, depth, squared lower bound on the distance of anything below it)
        let mut stack = vec![(0usize, 0usize, 0f32)];
        while let Some((current, depth, bound)) = stack.pop() {
            if best.len() == count && bound > best[count - 1].0 {
                continue;
            }
            let node = &self.nodes[current];
            offer(&mut best, count, squared_distance(query, &node.point), node.index);

            let axis = depth % self.dimensions;
            let diff = query[axis] - node.point[axis];
            let (near, far) = if diff < 0.0 {
                (node.left, node.right)
            } else {
                (node.right, node.left)
            };
            // The near side is popped first.
            if let Some(far) = far {
                stack.push((far, depth + 1, diff * diff));
            }
            if let Some(near) = near {
                stack.push((near, depth + 1, 0.0));
            }
        }
        Ok(best
            .into_iter()
            .map(|(squared, index)| Neighbor {
                index,
                distance: squared.sqrt(),
            })
            .collect())
    }

    fn check_dimensions(&self, point: &[f32]) -> Result<()> {
        if point.len() != self.dimensions || self.dimensions == 0 {
            return Err(Error::DimensionMismatch {
                expected: self.dimensions,
                actual: point.len(),
            });
        }
        Ok(())
    }
}

/// Inserts a candidate into the bounded best list, keeping it sorted.
fn offer(best: &mut Vec<(f32, usize)>, count: usize, squared: f32, index: usize) {
    let key = (FloatOrd(squared), index);
    let position = best.partition_point(|&(s, i)| (FloatOrd(s), i) < key);
    if position < count {
        best.insert(position, (squared, index));
        best.truncate(count);
    }
}

pub(crate) fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Euclidean distance between two descriptors.
pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    squared_distance(a, b).sqrt()
}
