//! Shape-proportion comparison by Mahalanobis distance over ratios of
//! inter-landmark distances.
//!
//! Every outline yields a vector of distances between landmark pairs,
//! each divided by one benchmark distance so the vector is scale free.
//! Statistics over the whole catalog give a covariance matrix; its
//! leading eigenvectors ("eigen-ratios") span the directions in which
//! real individuals actually differ. Two vectors are compared by their
//! covariance-normalized distance in that reduced space, which stays
//! well defined even when the full covariance is singular.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::outline::{FeaturePointType, Outline};
use crate::types::EngineError;

/// Eigenvalues at or below this fraction of the largest are treated as
/// zero variance and dropped.
const RELATIVE_EIGEN_FLOOR: f64 = 1e-10;

/// Which distances make up a ratio vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatioSpec {
    /// Endpoints of the distance every other distance is divided by.
    pub benchmark: (FeaturePointType, FeaturePointType),
    /// Landmarks whose pairwise distances form the ratios.
    pub landmarks: Vec<FeaturePointType>,
    /// Explicit pairs to use instead of every landmark pair.
    #[serde(default)]
    pub pairs: Option<Vec<(FeaturePointType, FeaturePointType)>>,
    /// Number of principal directions kept.
    pub desired_ratios: usize,
}

impl RatioSpec {
    /// The landmark pairs measured, in vector order. Without explicit
    /// pairs this is every unordered landmark pair except the benchmark.
    #[must_use]
    pub fn ratio_pairs(&self) -> Vec<(FeaturePointType, FeaturePointType)> {
        if let Some(pairs) = &self.pairs {
            return pairs.clone();
        }
        let (b0, b1) = self.benchmark;
        let mut pairs = Vec::new();
        for (i, &a) in self.landmarks.iter().enumerate() {
            for &b in &self.landmarks[i + 1..] {
                if (a, b) != (b0, b1) && (a, b) != (b1, b0) {
                    pairs.push((a, b));
                }
            }
        }
        pairs
    }

    /// Every feature point the ratios read.
    #[must_use]
    pub fn dependencies(&self) -> Vec<FeaturePointType> {
        let mut deps = vec![self.benchmark.0, self.benchmark.1];
        for (a, b) in self.ratio_pairs() {
            deps.extend([a, b]);
        }
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    /// The ratio vector of one outline.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::MissingFeaturePoint`] for an unset landmark
    /// and [`EngineError::DegenerateContour`] when the benchmark points
    /// coincide.
    pub fn ratios(&self, outline: &Outline) -> Result<Vec<f64>, EngineError> {
        let coordinate = |kind| {
            outline
                .feature_point_coordinate(kind)
                .ok_or(EngineError::MissingFeaturePoint(kind))
        };
        let benchmark = coordinate(self.benchmark.0)?.distance(coordinate(self.benchmark.1)?);
        if benchmark <= f64::EPSILON {
            return Err(EngineError::DegenerateContour);
        }
        self.ratio_pairs()
            .into_iter()
            .map(|(a, b)| Ok(coordinate(a)?.distance(coordinate(b)?) / benchmark))
            .collect()
    }
}

/// Catalog-wide ratio statistics, computed once per match run and
/// read-only afterward.
#[derive(Debug, Clone)]
pub struct RatioStatistics {
    spec: RatioSpec,
    mean: DVector<f64>,
    /// Columns are the kept eigenvectors, strongest first.
    basis: DMatrix<f64>,
    /// Variance along each kept eigenvector.
    variances: Vec<f64>,
}

impl RatioStatistics {
    /// Gather ratio vectors from every outline that has the needed
    /// landmarks and build the reduced covariance model.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InsufficientCatalog`] when fewer than two
    /// outlines qualify or their ratios never vary, and
    /// [`EngineError::InvalidConfig`] when no ratio pairs are configured.
    pub fn from_catalog<'a, I>(spec: RatioSpec, outlines: I) -> Result<Self, EngineError>
    where
        I: IntoIterator<Item = &'a Outline>,
    {
        let dim = spec.ratio_pairs().len();
        if dim == 0 || spec.desired_ratios == 0 {
            return Err(EngineError::InvalidConfig(
                "ratio comparison needs at least one ratio".to_owned(),
            ));
        }
        let samples: Vec<DVector<f64>> = outlines
            .into_iter()
            .filter_map(|o| spec.ratios(o).ok())
            .map(DVector::from_vec)
            .collect();
        if samples.len() < 2 {
            return Err(EngineError::InsufficientCatalog);
        }

        #[allow(clippy::cast_precision_loss)]
        let n = samples.len() as f64;
        let mean = samples
            .iter()
            .fold(DVector::zeros(dim), |acc, s| acc + s)
            / n;
        let mut covariance = DMatrix::<f64>::zeros(dim, dim);
        for s in &samples {
            let d = s - &mean;
            covariance += &d * d.transpose();
        }
        covariance /= n - 1.0;

        let eigen = covariance.symmetric_eigen();
        let mut order: Vec<usize> = (0..dim).collect();
        order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
        let largest = eigen.eigenvalues[order[0]];
        if largest <= 0.0 {
            return Err(EngineError::InsufficientCatalog);
        }
        let kept: Vec<usize> = order
            .into_iter()
            .filter(|&i| eigen.eigenvalues[i] > largest * RELATIVE_EIGEN_FLOOR)
            .take(spec.desired_ratios)
            .collect();

        let basis = DMatrix::from_columns(
            &kept
                .iter()
                .map(|&i| eigen.eigenvectors.column(i).into_owned())
                .collect::<Vec<_>>(),
        );
        let variances: Vec<f64> = kept.iter().map(|&i| eigen.eigenvalues[i]).collect();
        info!(
            samples = samples.len(),
            ratios = dim,
            components = variances.len(),
            "built ratio statistics"
        );
        debug!(?variances, "ratio eigenvalues kept");
        Ok(Self {
            spec,
            mean,
            basis,
            variances,
        })
    }

    #[must_use]
    pub const fn spec(&self) -> &RatioSpec {
        &self.spec
    }

    /// Catalog mean ratio vector.
    #[must_use]
    pub fn mean(&self) -> &[f64] {
        self.mean.as_slice()
    }

    /// Number of principal directions in use.
    #[must_use]
    pub fn components(&self) -> usize {
        self.variances.len()
    }

    /// Mahalanobis distance between two ratio vectors in the reduced
    /// space.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] when a vector has the wrong
    /// length.
    pub fn distance(&self, a: &[f64], b: &[f64]) -> Result<f64, EngineError> {
        let dim = self.mean.len();
        if a.len() != dim || b.len() != dim {
            return Err(EngineError::InvalidConfig(format!(
                "ratio vectors must have {dim} entries, got {} and {}",
                a.len(),
                b.len()
            )));
        }
        let diff = DVector::from_iterator(dim, a.iter().zip(b).map(|(x, y)| x - y));
        let projected = self.basis.transpose() * diff;
        let sum: f64 = projected
            .iter()
            .zip(&self.variances)
            .map(|(z, var)| z * z / var)
            .sum();
        Ok(sum.sqrt())
    }
}
