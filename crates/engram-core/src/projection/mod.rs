//! PCA Projector
//!
//! Projects up to 500 embedding vectors (D=1024) down to 2 or 3 dimensions
//! for visualization. Works on the N×N Gram matrix instead of the D×D
//! covariance, so cost scales with the sample count, and extracts components
//! by power iteration with deflation. The starting vector is deterministic so
//! repeated projections of the same memories land on the same points.

use serde::{Deserialize, Serialize};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Power iteration rounds per component
const POWER_ITERATIONS: usize = 100;

/// Below this max coordinate the projection is considered degenerate
const DEGENERATE_EPSILON: f64 = 1e-10;

// ============================================================================
// TYPES
// ============================================================================

/// Result of a projection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Projection2D3D {
    /// One coordinate row per input vector, each of length 2 or 3,
    /// rescaled so the largest absolute coordinate is 1
    pub points: Vec<Vec<f64>>,
    /// Per-component share of total variance; populated for 3D only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variance_explained: Option<Vec<f64>>,
}

// ============================================================================
// PROJECTION
// ============================================================================

/// Project `vectors` to `dimensions` ∈ {2, 3} principal components
pub fn project(vectors: &[Vec<f32>], dimensions: usize) -> Projection2D3D {
    let n = vectors.len();
    let k = dimensions.clamp(2, 3);
    if n == 0 {
        return Projection2D3D {
            points: vec![],
            variance_explained: (k == 3).then(|| vec![0.0; k]),
        };
    }
    let d = vectors[0].len();

    // Center by mean
    let mut mean = vec![0.0f64; d];
    for vector in vectors {
        for (m, v) in mean.iter_mut().zip(vector.iter()) {
            *m += *v as f64;
        }
    }
    for m in &mut mean {
        *m /= n as f64;
    }
    let centered: Vec<Vec<f64>> = vectors
        .iter()
        .map(|vector| {
            vector
                .iter()
                .zip(mean.iter())
                .map(|(v, m)| *v as f64 - m)
                .collect()
        })
        .collect();

    // N×N Gram matrix G = X Xᵀ
    let mut gram = vec![vec![0.0f64; n]; n];
    for i in 0..n {
        for j in i..n {
            let dot: f64 = centered[i]
                .iter()
                .zip(centered[j].iter())
                .map(|(a, b)| a * b)
                .sum();
            gram[i][j] = dot;
            gram[j][i] = dot;
        }
    }
    let trace: f64 = (0..n).map(|i| gram[i][i]).sum();

    // Dominant eigenpairs by power iteration + deflation
    let mut coordinates = vec![vec![0.0f64; k]; n];
    let mut eigenvalues = vec![0.0f64; k];
    for component in 0..k {
        let (eigenvalue, eigenvector) = power_iteration(&gram, n);
        eigenvalues[component] = eigenvalue;

        // Coordinates for the component: v · sqrt(λ), indexed by memory
        let scale = eigenvalue.max(0.0).sqrt();
        for (point, v) in coordinates.iter_mut().zip(eigenvector.iter()) {
            point[component] = v * scale;
        }

        // Deflate G ← G - λ v vᵀ
        for i in 0..n {
            for j in 0..n {
                gram[i][j] -= eigenvalue * eigenvector[i] * eigenvector[j];
            }
        }
    }

    // Rescale so the largest |coordinate| is exactly 1
    let max_abs = coordinates
        .iter()
        .flat_map(|point| point.iter())
        .fold(0.0f64, |acc, c| acc.max(c.abs()));
    if max_abs < DEGENERATE_EPSILON {
        // Degenerate cloud (all points identical): spread deterministic
        // jitter instead of emitting NaNs
        for (i, point) in coordinates.iter_mut().enumerate() {
            for (component, c) in point.iter_mut().enumerate() {
                *c = (0.37 * (i as f64 + 1.0) + 1.7 * (component as f64 + 1.0)).sin() * 0.01;
            }
        }
    } else {
        for point in &mut coordinates {
            for c in point.iter_mut() {
                *c /= max_abs;
            }
        }
    }

    let variance_explained = (k == 3).then(|| {
        eigenvalues
            .iter()
            .map(|eigenvalue| {
                if trace > 0.0 {
                    (eigenvalue / trace).max(0.0)
                } else {
                    0.0
                }
            })
            .collect()
    });

    Projection2D3D {
        points: coordinates,
        variance_explained,
    }
}

/// Dominant eigenpair of a symmetric matrix by power iteration.
/// The starting vector `v_i = sin(0.7 i + 1.3)` keeps runs reproducible.
fn power_iteration(matrix: &[Vec<f64>], n: usize) -> (f64, Vec<f64>) {
    let mut v: Vec<f64> = (0..n).map(|i| (0.7 * i as f64 + 1.3).sin()).collect();
    normalize(&mut v);

    for _ in 0..POWER_ITERATIONS {
        let mut next = vec![0.0f64; n];
        for (i, row) in matrix.iter().enumerate() {
            next[i] = row.iter().zip(v.iter()).map(|(m, x)| m * x).sum();
        }
        if normalize(&mut next) < DEGENERATE_EPSILON {
            return (0.0, v);
        }
        v = next;
    }

    // Rayleigh quotient λ = vᵀ G v (v is unit length)
    let eigenvalue: f64 = matrix
        .iter()
        .enumerate()
        .map(|(i, row)| v[i] * row.iter().zip(v.iter()).map(|(m, x)| m * x).sum::<f64>())
        .sum();
    (eigenvalue, v)
}

fn normalize(v: &mut [f64]) -> f64 {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    norm
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::mock_embedding;

    #[test]
    fn test_empty_input() {
        let projection = project(&[], 2);
        assert!(projection.points.is_empty());
        assert!(projection.variance_explained.is_none());
    }

    #[test]
    fn test_projection_shape_and_bounds() {
        let vectors: Vec<Vec<f32>> = ["alpha", "beta", "gamma", "delta", "epsilon"]
            .iter()
            .map(|t| mock_embedding(t))
            .collect();

        let projection = project(&vectors, 2);
        assert_eq!(projection.points.len(), 5);
        for point in &projection.points {
            assert_eq!(point.len(), 2);
            for c in point {
                assert!(c.abs() <= 1.0 + 1e-9);
                assert!(c.is_finite());
            }
        }
        let max_abs = projection
            .points
            .iter()
            .flat_map(|p| p.iter())
            .fold(0.0f64, |acc, c| acc.max(c.abs()));
        assert!((max_abs - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_projection_deterministic() {
        let vectors: Vec<Vec<f32>> = ["one", "two", "three"]
            .iter()
            .map(|t| mock_embedding(t))
            .collect();
        let a = project(&vectors, 2);
        let b = project(&vectors, 2);
        assert_eq!(a.points, b.points);
    }

    #[test]
    fn test_three_dimensions_reports_variance() {
        let vectors: Vec<Vec<f32>> = (0..6)
            .map(|i| mock_embedding(&format!("vector number {}", i)))
            .collect();
        let projection = project(&vectors, 3);
        assert_eq!(projection.points[0].len(), 3);

        let variance = projection.variance_explained.unwrap();
        assert_eq!(variance.len(), 3);
        // First component explains the most variance, shares are in [0, 1]
        assert!(variance[0] >= variance[1]);
        assert!(variance.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(variance.iter().sum::<f64>() <= 1.0 + 1e-9);
    }

    #[test]
    fn test_identical_vectors_jitter_instead_of_nan() {
        let vectors = vec![mock_embedding("same"); 4];
        let projection = project(&vectors, 2);
        for point in &projection.points {
            for c in point {
                assert!(c.is_finite());
            }
        }
        // Jittered points are distinct
        assert_ne!(projection.points[0], projection.points[1]);
    }

    #[test]
    fn test_separated_clusters_stay_separated() {
        // Two tight clusters along different axes must not collapse
        let mut cluster_a: Vec<Vec<f32>> = vec![];
        let mut cluster_b: Vec<Vec<f32>> = vec![];
        for i in 0..3 {
            let mut a = vec![0.0f32; 16];
            a[0] = 1.0;
            a[1] = i as f32 * 0.01;
            cluster_a.push(a);
            let mut b = vec![0.0f32; 16];
            b[2] = -1.0;
            b[3] = i as f32 * 0.01;
            cluster_b.push(b);
        }
        let vectors: Vec<Vec<f32>> = cluster_a.into_iter().chain(cluster_b).collect();
        let projection = project(&vectors, 2);

        // Distance between cluster means in projected space is large
        let mean = |points: &[Vec<f64>]| {
            let mut m = [0.0f64; 2];
            for p in points {
                m[0] += p[0];
                m[1] += p[1];
            }
            [m[0] / points.len() as f64, m[1] / points.len() as f64]
        };
        let mean_a = mean(&projection.points[..3]);
        let mean_b = mean(&projection.points[3..]);
        let distance =
            ((mean_a[0] - mean_b[0]).powi(2) + (mean_a[1] - mean_b[1]).powi(2)).sqrt();
        assert!(distance > 0.5, "clusters collapsed: {}", distance);
    }
}
