use nalgebra::{Matrix3, Point2};
use cv_core::sample_consensus::Consensus;
use cv_core::FeatureMatch;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use sift::transform::PointMatch;
use sift::{
    AffineEstimator, DetectionSite, Error, Feature, HomographyEstimator, Match, Ransac,
    Transform, TransformKind,
};

const INLIERS: usize = 100;
const OUTLIERS: usize = 15;

/// Matches under `truth` followed by matches whose second point is pushed 50 to 100
/// pixels away from where `truth` maps it.
fn contaminated(truth: &Transform, rng: &mut Pcg64) -> Vec<PointMatch> {
    (0..INLIERS + OUTLIERS)
        .map(|i| {
            let from = Point2::new(rng.gen_range(0.0..640.0), rng.gen_range(0.0..480.0));
            let mut to = truth.apply(&from).unwrap();
            if i >= INLIERS {
                let angle = rng.gen_range(0.0..std::f64::consts::TAU);
                let distance = rng.gen_range(50.0..100.0);
                to.x += distance * angle.cos();
                to.y += distance * angle.sin();
            }
            FeatureMatch(from, to)
        })
        .collect()
}

fn assert_close(actual: &Matrix3<f64>, expected: &Matrix3<f64>) {
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert!((a - e).abs() < 1e-3, "{} vs {}", actual, expected);
    }
}

#[test]
fn affine_inliers_are_recovered() {
    let _ = pretty_env_logger::try_init_timed();
    let truth = Transform::affine(Matrix3::new(
        0.95, -0.25, 30.0, 0.2, 1.05, -12.0, 0.0, 0.0, 1.0,
    ));
    let mut rng = Pcg64::seed_from_u64(0);
    let data = contaminated(&truth, &mut rng);
    let mut ransac = Ransac::new(Pcg64::seed_from_u64(1)).iterations(200);
    let (model, inliers) = ransac
        .model_inliers(&AffineEstimator, data.iter().copied())
        .unwrap();
    assert_eq!(model.kind, TransformKind::Affine);
    assert_eq!(inliers, (0..INLIERS).collect::<Vec<_>>());
    assert_close(&model.matrix, &truth.matrix);
}

#[test]
fn homography_inliers_are_recovered() {
    let _ = pretty_env_logger::try_init_timed();
    let truth = Transform::homography(Matrix3::new(
        1.02, 0.08, -15.0, -0.05, 0.97, 25.0, 2e-5, -3e-5, 1.0,
    ));
    let mut rng = Pcg64::seed_from_u64(2);
    let data = contaminated(&truth, &mut rng);
    let mut ransac = Ransac::new(Pcg64::seed_from_u64(3)).iterations(300);
    let (model, inliers) = ransac
        .model_inliers(&HomographyEstimator, data.iter().copied())
        .unwrap();
    assert_eq!(model.kind, TransformKind::Homography);
    assert_eq!(inliers, (0..INLIERS).collect::<Vec<_>>());
    assert_close(&model.matrix, &truth.matrix);
}

fn feature_at(x: f32, y: f32) -> Feature {
    Feature {
        x,
        y,
        scale: 1.0,
        orientation: 0.0,
        descriptor: vec![],
        site: DetectionSite::default(),
    }
}

#[test]
fn verification_filters_matches_between_features() {
    let mut rng = Pcg64::seed_from_u64(4);
    let mut a = vec![];
    let mut b = vec![];
    let mut matches = vec![];
    for i in 0..40 {
        let x: f32 = rng.gen_range(0.0..200.0);
        let y: f32 = rng.gen_range(0.0..200.0);
        a.push(feature_at(x, y));
        // Every fifth match points somewhere unrelated.
        if i % 5 == 4 {
            b.push(feature_at(x + 80.0, 300.0 - y));
        } else {
            b.push(feature_at(x + 12.0, y - 7.0));
        }
        matches.push(Match {
            index_a: i,
            index_b: i,
            distance: 0.0,
        });
    }
    let mut ransac = Ransac::new(Pcg64::seed_from_u64(5)).iterations(100);
    let verification = ransac.verify(&AffineEstimator, &matches, &a, &b).unwrap();
    let transform = verification.transform.unwrap();
    assert!((transform.matrix[(0, 2)] - 12.0).abs() < 1e-3);
    assert!((transform.matrix[(1, 2)] + 7.0).abs() < 1e-3);
    let expected: Vec<Match> = matches.iter().copied().filter(|m| m.index_a % 5 != 4).collect();
    assert_eq!(verification.inliers, expected);
}

#[test]
fn verification_needs_enough_valid_matches() {
    let a = vec![feature_at(0.0, 0.0), feature_at(1.0, 0.0), feature_at(0.0, 1.0)];
    let pair = |i| Match {
        index_a: i,
        index_b: i,
        distance: 0.0,
    };
    let mut ransac = Ransac::new(Pcg64::seed_from_u64(6));
    assert_eq!(
        ransac.verify(&HomographyEstimator, &[pair(0), pair(1), pair(2)], &a, &a),
        Err(Error::InsufficientMatches {
            required: 4,
            actual: 3
        })
    );
    assert_eq!(
        ransac.verify(&AffineEstimator, &[pair(0), pair(1), pair(7)], &a, &a),
        Err(Error::IndexOutOfRange { index: 7, len: 3 })
    );
}
