use crate::kdtree::{euclidean, KdTree, Neighbor};
use crate::{Error, Feature, Result};
use float_ord::FloatOrd;
use log::*;

#[cfg(feature = "rayon")]
use rayon::prelude::*;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A correspondence between feature `index_a` of the first list and feature `index_b`
/// of the second.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Match {
    pub index_a: usize,
    pub index_b: usize,
    /// Euclidean distance between the two descriptors.
    pub distance: f32,
}

/// Nearest neighbor descriptor matching with Lowe's ratio test.
///
/// A query is matched to its nearest neighbor only if the nearest distance divided by the
/// second nearest distance is below `ratio_threshold`. With `cross_check` a pair is kept
/// only when each side is the accepted match of the other.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Matcher {
    pub ratio_threshold: f32,
    pub cross_check: bool,
}

impl Default for Matcher {
    fn default() -> Self {
        Self {
            ratio_threshold: 0.75,
            cross_check: true,
        }
    }
}

impl Matcher {
    /// A cross-checking matcher with the given ratio threshold.
    pub fn new(ratio_threshold: f32) -> Self {
        Self {
            ratio_threshold,
            ..Default::default()
        }
    }

    /// Uses a ratio of `0.3`, which keeps only very distinctive matches.
    pub fn strict() -> Self {
        Self::new(0.3)
    }

    /// Match the descriptors of two feature lists.
    pub fn match_features(&self, a: &[Feature], b: &[Feature]) -> Result<Vec<Match>> {
        let a: Vec<&[f32]> = a.iter().map(|f| f.descriptor.as_slice()).collect();
        let b: Vec<&[f32]> = b.iter().map(|f| f.descriptor.as_slice()).collect();
        self.match_descriptors(&a, &b)
    }

    /// Match two lists of equally sized descriptors.
    ///
    /// The result is sorted by `index_a` and holds at most one match per feature of `a`
    /// (and, with `cross_check`, per feature of `b`). It does not depend on scheduling.
    pub fn match_descriptors<D>(&self, a: &[D], b: &[D]) -> Result<Vec<Match>>
    where
        D: AsRef<[f32]> + Sync,
    {
        if a.is_empty() || b.is_empty() {
            return Ok(vec![]);
        }
        let dimensions = a[0].as_ref().len();
        let tree_b = KdTree::from_points(dimensions, b.iter().map(AsRef::as_ref))?;
        let forward = self.sweep(a, &tree_b)?;
        let backward = if self.cross_check {
            let tree_a = KdTree::from_points(dimensions, a.iter().map(AsRef::as_ref))?;
            Some(self.sweep(b, &tree_a)?)
        } else {
            None
        };
        let matches: Vec<Match> = forward
            .into_iter()
            .enumerate()
            .filter_map(|(index_a, neighbor)| {
                let neighbor = neighbor?;
                let symmetric = backward.as_ref().map_or(true, |backward| {
                    backward[neighbor.index].map(|n| n.index) == Some(index_a)
                });
                symmetric.then(|| Match {
                    index_a,
                    index_b: neighbor.index,
                    distance: neighbor.distance,
                })
            })
            .collect();
        debug!(
            "Matched {} of {} x {} descriptors.",
            matches.len(),
            a.len(),
            b.len()
        );
        Ok(matches)
    }

    /// The ratio-tested nearest neighbor in `tree` of every query.
    fn sweep<D>(&self, queries: &[D], tree: &KdTree) -> Result<Vec<Option<Neighbor>>>
    where
        D: AsRef<[f32]> + Sync,
    {
        #[cfg(not(feature = "rayon"))]
        {
            queries
                .iter()
                .map(|query| self.ratio_test(tree, query.as_ref()))
                .collect()
        }
        #[cfg(feature = "rayon")]
        {
            queries
                .par_iter()
                .map(|query| self.ratio_test(tree, query.as_ref()))
                .collect()
        }
    }

    fn ratio_test(&self, tree: &KdTree, query: &[f32]) -> Result<Option<Neighbor>> {
        let neighbors = tree.nearest(query, 2)?;
        Ok(match neighbors.as_slice() {
            [first, second] if first.distance / second.distance < self.ratio_threshold => {
                Some(*first)
            }
            _ => None,
        })
    }
}

/// Brute force matching of every descriptor of `a` against all of `b`.
///
/// A match is reported when the nearest distance is below `ratio_threshold` times the
/// second nearest. No cross-check is performed.
pub fn knn_match<D>(a: &[D], b: &[D], ratio_threshold: f32) -> Result<Vec<Match>>
where
    D: AsRef<[f32]>,
{
    let mut matches = vec![];
    for (index_a, query) in a.iter().enumerate() {
        let query = query.as_ref();
        let mut distances = b
            .iter()
            .enumerate()
            .map(|(index_b, candidate)| {
                let candidate = candidate.as_ref();
                if candidate.len() != query.len() {
                    return Err(Error::DimensionMismatch {
                        expected: query.len(),
                        actual: candidate.len(),
                    });
                }
                Ok((euclidean(query, candidate), index_b))
            })
            .collect::<Result<Vec<(f32, usize)>>>()?;
        distances.sort_by_key(|&(distance, index)| (FloatOrd(distance), index));
        if let [(first, index_b), (second, _), ..] = distances[..] {
            if first < ratio_threshold * second {
                matches.push(Match {
                    index_a,
                    index_b,
                    distance: first,
                });
            }
        }
    }
    Ok(matches)
}

/// The `count` matches with the smallest distances, best first.
pub fn best_matches(matches: &[Match], count: usize) -> Vec<Match> {
    let mut sorted = matches.to_vec();
    sorted.sort_by_key(|m| FloatOrd(m.distance));
    sorted.truncate(count);
    sorted
}
