use crate::transform::{PointMatch, Transform};
use crate::{Error, Feature, Match, Result};
use cv_core::sample_consensus::{Consensus, Estimator, Model};
use cv_core::{FeatureMatch, ImagePoint};
use log::*;
use rand::RngCore;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Plain RANSAC with a fixed number of iterations.
///
/// Every iteration draws `max(sample_size, E::MIN_SAMPLES)` distinct data points, fits
/// all models the estimator proposes and counts the data with a residual below
/// `inlier_threshold`. The model with the most inliers wins; on a tie the earlier one is
/// kept. The random number generator is owned, so a seeded generator makes runs
/// reproducible.
#[derive(Debug, Clone)]
pub struct Ransac<R> {
    pub iterations: usize,
    pub inlier_threshold: f64,
    /// Points drawn per hypothesis. Values below the estimator minimum use the minimum.
    pub sample_size: usize,
    pub rng: R,
}

/// The outcome of geometric verification of a list of matches.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Verification {
    /// `None` if no hypothesis had a single inlier.
    pub transform: Option<Transform>,
    /// The consistent subset of the input matches, in input order.
    pub inliers: Vec<Match>,
}

impl<R> Ransac<R>
where
    R: RngCore,
{
    /// 1000 iterations and an inlier threshold of 5 pixels.
    pub fn new(rng: R) -> Self {
        Self {
            iterations: 1000,
            inlier_threshold: 5.0,
            sample_size: 0,
            rng,
        }
    }

    pub fn iterations(self, iterations: usize) -> Self {
        Self { iterations, ..self }
    }

    pub fn inlier_threshold(self, inlier_threshold: f64) -> Self {
        Self {
            inlier_threshold,
            ..self
        }
    }

    pub fn sample_size(self, sample_size: usize) -> Self {
        Self {
            sample_size,
            ..self
        }
    }

    /// Filters `matches` between `features_a` and `features_b` down to those consistent
    /// with a single transform.
    ///
    /// Fails with [`Error::InsufficientMatches`] if there are fewer matches than points
    /// per sample.
    pub fn verify<E>(
        &mut self,
        estimator: &E,
        matches: &[Match],
        features_a: &[Feature],
        features_b: &[Feature],
    ) -> Result<Verification>
    where
        E: Estimator<PointMatch, Model = Transform>,
    {
        let required = self.sample_size.max(E::MIN_SAMPLES);
        if matches.len() < required {
            return Err(Error::InsufficientMatches {
                required,
                actual: matches.len(),
            });
        }
        let data = matches
            .iter()
            .map(|m| {
                Ok(FeatureMatch(
                    image_point(features_a, m.index_a)?,
                    image_point(features_b, m.index_b)?,
                ))
            })
            .collect::<Result<Vec<PointMatch>>>()?;
        Ok(match self.best_model(estimator, data.iter().copied()) {
            Some((transform, inliers)) => {
                info!(
                    "Verified {} of {} matches with a {:?} transform.",
                    inliers.len(),
                    matches.len(),
                    transform.kind
                );
                Verification {
                    transform: Some(transform),
                    inliers: inliers.into_iter().map(|ix| matches[ix]).collect(),
                }
            }
            None => {
                info!("No transform is consistent with any of {} matches.", matches.len());
                Verification {
                    transform: None,
                    inliers: vec![],
                }
            }
        })
    }

    fn best_model<E, Data, I>(
        &mut self,
        estimator: &E,
        data: I,
    ) -> Option<(E::Model, Vec<usize>)>
    where
        E: Estimator<Data>,
        Data: Clone,
        I: Iterator<Item = Data>,
    {
        let data: Vec<Data> = data.collect();
        let sample_size = self.sample_size.max(E::MIN_SAMPLES);
        if data.len() < sample_size {
            return None;
        }
        let mut best: Option<(E::Model, Vec<usize>)> = None;
        let mut best_count = 0;
        for iteration in 0..self.iterations {
            let sample =
                rand::seq::index::sample(&mut self.rng, data.len(), sample_size).into_vec();
            for model in estimator.estimate(sample.iter().map(|&ix| data[ix].clone())) {
                let inliers: Vec<usize> = data
                    .iter()
                    .enumerate()
                    .filter(|(_, datum)| model.residual(datum) < self.inlier_threshold)
                    .map(|(ix, _)| ix)
                    .collect();
                if inliers.len() > best_count {
                    trace!(
                        "Iteration {}: new best hypothesis with {} inliers.",
                        iteration,
                        inliers.len()
                    );
                    best_count = inliers.len();
                    best = Some((model, inliers));
                }
            }
        }
        debug!(
            "RANSAC kept {} of {} data after {} iterations.",
            best_count,
            data.len(),
            self.iterations
        );
        best
    }
}

impl<E, R, Data> Consensus<E, Data> for Ransac<R>
where
    E: Estimator<Data>,
    R: RngCore,
    Data: Clone,
{
    type Inliers = Vec<usize>;

    fn model<I>(&mut self, estimator: &E, data: I) -> Option<E::Model>
    where
        I: Iterator<Item = Data> + Clone,
    {
        self.best_model(estimator, data).map(|(model, _)| model)
    }

    fn model_inliers<I>(&mut self, estimator: &E, data: I) -> Option<(E::Model, Self::Inliers)>
    where
        I: Iterator<Item = Data> + Clone,
    {
        self.best_model(estimator, data)
    }
}

fn image_point(features: &[Feature], index: usize) -> Result<nalgebra::Point2<f64>> {
    features
        .get(index)
        .map(ImagePoint::image_point)
        .ok_or(Error::IndexOutOfRange {
            index,
            len: features.len(),
        })
}
