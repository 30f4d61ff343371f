use nalgebra::Vector2;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;
use sift::{AffineEstimator, Feature, GrayFloatImage, Matcher, Ransac, Sift};

/// Shift between the two views. Multiples of 8 keep the pixel grids of the first octaves
/// aligned, so interior features come out identical.
const SHIFT: (usize, usize) = (16, 8);

struct Blob {
    x: f32,
    y: f32,
    sigma: f32,
    amplitude: f32,
}

fn random_blobs(rng: &mut Pcg64, count: usize, extent: f32) -> Vec<Blob> {
    (0..count)
        .map(|_| Blob {
            x: rng.gen_range(0.0..extent),
            y: rng.gen_range(0.0..extent),
            sigma: rng.gen_range(1.5..4.0),
            amplitude: rng.gen_range(0.3..1.0) * if rng.gen() { 1.0 } else { -1.0 },
        })
        .collect()
}

/// Renders the blobs seen through a window whose top left corner is at `origin`.
fn render(blobs: &[Blob], size: usize, origin: (usize, usize)) -> GrayFloatImage {
    let mut image = GrayFloatImage::new(size, size);
    for y in 0..size {
        for x in 0..size {
            let wx = (x + origin.0) as f32;
            let wy = (y + origin.1) as f32;
            let value: f32 = blobs
                .iter()
                .map(|b| {
                    let r2 = (wx - b.x).powi(2) + (wy - b.y).powi(2);
                    b.amplitude * (-r2 / (2.0 * b.sigma * b.sigma)).exp()
                })
                .sum();
            image.put(x, y, 0.5 + 0.4 * value);
        }
    }
    image
}

fn views() -> (Vec<Feature>, Vec<Feature>) {
    let mut rng = Pcg64::seed_from_u64(7);
    let blobs = random_blobs(&mut rng, 60, 144.0);
    let sift = Sift::default();
    let a = sift.extract(&render(&blobs, 128, (SHIFT.0, SHIFT.1))).unwrap();
    let b = sift.extract(&render(&blobs, 128, (0, 0))).unwrap();
    (a, b)
}

#[test]
fn shifted_views_are_matched_and_verified() {
    let _ = pretty_env_logger::try_init_timed();
    let (a, b) = views();
    assert!(a.len() > 10 && b.len() > 10);

    let matches = Matcher::default().match_features(&a, &b).unwrap();
    assert!(matches.len() >= 10, "only {} matches", matches.len());
    assert!(matches.windows(2).all(|pair| pair[0].index_a < pair[1].index_a));

    let mut ransac = Ransac::new(Pcg64::seed_from_u64(0)).inlier_threshold(1.0);
    let verification = ransac
        .verify(&AffineEstimator, &matches, &a, &b)
        .unwrap();
    let transform = verification.transform.unwrap();
    let translation = Vector2::new(transform.matrix[(0, 2)], transform.matrix[(1, 2)]);
    assert!((translation - Vector2::new(SHIFT.0 as f64, SHIFT.1 as f64)).norm() < 0.1);
    assert!((transform.matrix[(0, 0)] - 1.0).abs() < 0.01);
    assert!((transform.matrix[(1, 1)] - 1.0).abs() < 0.01);
    assert!(verification.inliers.len() >= 10);
    for inlier in &verification.inliers {
        let fa = &a[inlier.index_a];
        let fb = &b[inlier.index_b];
        assert!((fb.x - fa.x - SHIFT.0 as f32).abs() < 1.0);
        assert!((fb.y - fa.y - SHIFT.1 as f32).abs() < 1.0);
    }
}

#[test]
fn strict_matching_is_a_subset_of_default_matching() {
    let (a, b) = views();
    let default = Matcher::default().match_features(&a, &b).unwrap();
    let strict = Matcher::strict().match_features(&a, &b).unwrap();
    assert!(strict.len() <= default.len());
    // Every strict match passes the looser ratio too, and cross-checking
    // keeps each side unique.
    for m in &strict {
        assert!(default
            .iter()
            .any(|d| d.index_a == m.index_a && d.index_b == m.index_b));
    }
    let mut seen_b: Vec<usize> = default.iter().map(|m| m.index_b).collect();
    seen_b.sort_unstable();
    seen_b.dedup();
    assert_eq!(seen_b.len(), default.len());
}
