//! Parametric semivariogram models and fitting them to binned estimates.

use std::collections::HashMap;

use color_eyre::Result;
use tiny_solver::Optimizer as _;
use tiny_solver::factors::na::{self, RealField};

/// The smallest nugget a fitted model may have.
const MIN_NUGGET: f64 = 1e-5;

/// Maximum number of Levenberg-Marquardt iterations.
const MAX_ITERATIONS: usize = 500;

/// Residuals larger than this are down-weighted, like a soft L1 loss with unit scale.
const ROBUST_SCALE: f64 = 1.0;

/// Name of the parameter block in the solver problem.
const PARAMETERS: &str = "variogram";

/// The shape of a semivariogram.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum VariogramKind {
    /// Approaches the sill asymptotically, reaching 95% of it at `range`.
    Exponential,
    /// Reaches the sill exactly at `range`.
    Spherical,
}

impl VariogramKind {
    /// Semivariance at lag `h`. Generic so the fit can differentiate it automatically.
    fn evaluate<T: RealField>(self, partial_sill: T, range: T, nugget: T, h: T) -> T {
        if range <= T::zero() {
            return partial_sill + nugget;
        }

        let ratio = h / range;
        match self {
            Self::Exponential => {
                let three = na::convert::<f64, T>(3.0);
                partial_sill * (T::one() - (-(three * ratio)).exp()) + nugget
            }
            Self::Spherical => {
                if ratio <= T::one() {
                    let linear = na::convert::<f64, T>(1.5);
                    let cubic = na::convert::<f64, T>(0.5);
                    partial_sill * (linear * ratio.clone() - cubic * ratio.powi(3)) + nugget
                } else {
                    partial_sill + nugget
                }
            }
        }
    }
}

impl std::fmt::Display for VariogramKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exponential => formatter.write_str("exponential"),
            Self::Spherical => formatter.write_str("spherical"),
        }
    }
}

/// A fitted semivariogram. `sill` is the full sill, so it includes the nugget.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VariogramModel {
    /// The model shape.
    pub kind: VariogramKind,
    /// Semivariance at large distances.
    pub sill: f64,
    /// Distance, in meters, over which samples are correlated.
    pub range: f64,
    /// Semivariance at infinitesimal distances.
    pub nugget: f64,
}

impl VariogramModel {
    /// The part of the sill that is spatially correlated.
    pub fn partial_sill(&self) -> f64 {
        self.sill - self.nugget
    }

    /// Semivariance at lag `h`, in meters.
    pub fn evaluate(&self, h: f64) -> f64 {
        self.kind.evaluate(self.partial_sill(), self.range, self.nugget, h)
    }

    /// Fit the model to binned `(lag, semivariance)` points by robust least squares, starting
    /// from `[max - min, max_lag / 4, min]` and keeping partial sill within `[0, 10 max]`, range
    /// within `(0, max_lag]` and nugget within `[0, max]`.
    pub fn fit(kind: VariogramKind, lags: &[f64], semivariances: &[f64]) -> Result<Self> {
        if lags.is_empty() || lags.len() != semivariances.len() {
            color_eyre::eyre::bail!(
                "Can't fit a variogram to {} lags and {} semivariances",
                lags.len(),
                semivariances.len()
            );
        }

        let max_lag = lags.iter().copied().fold(f64::MIN, f64::max);
        let max_value = semivariances.iter().copied().fold(f64::MIN, f64::max);
        let min_value = semivariances.iter().copied().fold(f64::MAX, f64::min);
        let bounds = Bounds {
            lower: [0.0, max_lag * 1e-6, 0.0],
            upper: [
                10.0 * max_value.max(MIN_NUGGET),
                max_lag.max(f64::MIN_POSITIVE),
                max_value.max(MIN_NUGGET),
            ],
        };
        let initial = [max_value - min_value, 0.25 * max_lag, min_value];

        let mut problem = tiny_solver::Problem::new();
        for (lag, semivariance) in lags.iter().zip(semivariances) {
            problem.add_residual_block(
                1,
                &[PARAMETERS],
                Box::new(LagFactor {
                    kind,
                    lag: *lag,
                    semivariance: *semivariance,
                    bounds,
                }),
                Some(Box::new(tiny_solver::loss_functions::HuberLoss::new(
                    ROBUST_SCALE,
                ))),
            );
        }

        let mut initial_values = HashMap::<String, na::DVector<f64>>::new();
        initial_values.insert(
            PARAMETERS.to_owned(),
            na::DVector::from_vec(bounds.unbound(initial).to_vec()),
        );
        let options = tiny_solver::OptimizerOptions {
            max_iteration: MAX_ITERATIONS,
            verbosity_level: 0,
            ..Default::default()
        };
        let Some(solution) = tiny_solver::LevenbergMarquardtOptimizer::default().optimize(
            &problem,
            &initial_values,
            Some(options),
        ) else {
            color_eyre::eyre::bail!("The {kind} variogram fit did not converge");
        };
        let Some(free) = solution.get(PARAMETERS) else {
            color_eyre::eyre::bail!("The {kind} variogram fit lost its parameters");
        };
        let [partial_sill, range, fitted_nugget] = match free.as_slice() {
            [first, second, third] => bounds.bound([*first, *second, *third]),
            other => color_eyre::eyre::bail!("Expected 3 variogram parameters, got {other:?}"),
        };
        if ![partial_sill, range, fitted_nugget]
            .iter()
            .all(|value| value.is_finite())
        {
            color_eyre::eyre::bail!("The {kind} variogram fit diverged");
        }

        let nugget = fitted_nugget.max(MIN_NUGGET);
        let model = Self {
            kind,
            sill: partial_sill + nugget,
            range,
            nugget,
        };
        tracing::info!("Fitted variogram: {model:?}");

        Ok(model)
    }

    /// Load from disk.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Save to disk.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        crate::store::write_atomically(path, json.as_bytes())?;
        Ok(())
    }
}

/// Box constraints for partial sill, range and nugget. The solver works on unbounded values
/// that are squashed into the box with a logistic curve.
#[derive(Debug, Clone, Copy)]
struct Bounds {
    /// Lowest value of each parameter.
    lower: [f64; 3],
    /// Highest value of each parameter.
    upper: [f64; 3],
}

impl Bounds {
    /// Map unbounded solver values into the box.
    fn bound<T: RealField>(&self, free: [T; 3]) -> [T; 3] {
        let mut index = 0;
        free.map(|value| {
            let (lower, upper) = self.limits(index);
            index += 1;
            let squashed = T::one() / (T::one() + (-value).exp());
            na::convert::<f64, T>(lower) + na::convert::<f64, T>(upper - lower) * squashed
        })
    }

    /// Map values in the box to unbounded solver values.
    fn unbound(&self, values: [f64; 3]) -> [f64; 3] {
        let mut index = 0;
        values.map(|value| {
            let (lower, upper) = self.limits(index);
            index += 1;
            let fraction = ((value - lower) / (upper - lower)).clamp(1e-6, 1.0 - 1e-6);
            (fraction / (1.0 - fraction)).ln()
        })
    }

    /// Lower and upper limit of one parameter.
    fn limits(&self, index: usize) -> (f64, f64) {
        match (self.lower.get(index), self.upper.get(index)) {
            (Some(lower), Some(upper)) => (*lower, *upper),
            _ => (0.0, 1.0),
        }
    }
}

/// The residual of one binned lag.
#[derive(Debug, Clone)]
struct LagFactor {
    /// The model being fitted.
    kind: VariogramKind,
    /// Mean distance of the bin.
    lag: f64,
    /// Mean semivariance of the bin.
    semivariance: f64,
    /// Parameter box.
    bounds: Bounds,
}

impl<T: RealField> tiny_solver::factors::Factor<T> for LagFactor {
    fn residual_func(&self, params: &[na::DVector<T>]) -> na::DVector<T> {
        let free = params.first().map_or_else(
            || [T::zero(), T::zero(), T::zero()],
            |block| {
                let mut values = block.iter().cloned();
                [(); 3].map(|()| values.next().unwrap_or_else(T::zero))
            },
        );
        let [partial_sill, range, nugget] = self.bounds.bound(free);
        let modelled = self
            .kind
            .evaluate(partial_sill, range, nugget, na::convert::<f64, T>(self.lag));
        na::DVector::from_vec(vec![modelled - na::convert::<f64, T>(self.semivariance)])
    }
}

#[expect(
    clippy::default_numeric_fallback,
    clippy::unwrap_used,
    reason = "These are just tests"
)]
