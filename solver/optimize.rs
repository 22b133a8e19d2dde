//! BFGS driver shared by every variance-component fit.
//!
//! Objectives only provide a cost. Gradients are taken by central finite
//! differences, the best point ever evaluated is remembered, and a failed line
//! search falls back to that point instead of aborting the fit.

use super::SolverError;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Cost returned in place of failed or non-finite evaluations.
const PENALTY_COST: f64 = 1e10;

/// Gradients with a larger norm are rescaled before being handed to the line search.
const MAX_GRADIENT_NORM: f64 = 100.0;

/// Settings for the quasi-Newton variance-component optimisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Step of the central finite-difference gradient.
    pub gradient_step: f64,
    /// Number of points of the initial one-dimensional grid search.
    pub grid_points: usize,
    /// Every coordinate is clamped to `[-bound, bound]` before evaluation.
    pub bound: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-7,
            max_iterations: 200,
            gradient_step: 1e-5,
            grid_points: 41,
            bound: 18.0,
        }
    }
}

/// A scalar function to be minimised over an unconstrained parameter vector.
pub trait Objective: Send + Sync + 'static {
    fn cost(&self, x: &Array1<f64>) -> Result<f64, SolverError>;
}

/// Final state of one minimisation.
#[derive(Debug, Clone)]
pub struct Minimum {
    pub point: Array1<f64>,
    pub value: f64,
    pub iterations: usize,
    /// `false` when the optimiser stopped early and the best evaluated point was used.
    pub converged: bool,
}

/// Evaluates the objective, mapping failures to a large finite cost.
fn guarded_cost<O: Objective>(objective: &O, x: &Array1<f64>) -> f64 {
    match objective.cost(x) {
        Ok(cost) if cost.is_finite() => cost,
        Ok(cost) => {
            log::debug!("Non-finite cost {cost} at {:?}, returning penalty.", x.to_vec());
            PENALTY_COST
        }
        Err(e) => {
            log::debug!("Cost evaluation failed at {:?}: {e}", x.to_vec());
            PENALTY_COST
        }
    }
}

fn clamp(x: &Array1<f64>, bound: f64) -> Array1<f64> {
    x.mapv(|v| v.clamp(-bound, bound))
}

fn central_gradient<O: Objective>(objective: &O, x: &Array1<f64>, step: f64) -> Array1<f64> {
    let mut grad = Array1::zeros(x.len());
    let mut probe = x.clone();
    for i in 0..x.len() {
        let origin = probe[i];
        probe[i] = origin + step;
        let forward = guarded_cost(objective, &probe);
        probe[i] = origin - step;
        let backward = guarded_cost(objective, &probe);
        probe[i] = origin;
        grad[i] = (forward - backward) / (2.0 * step);
    }
    let norm = grad.dot(&grad).sqrt();
    if norm > MAX_GRADIENT_NORM {
        grad.mapv_inplace(|g| g * MAX_GRADIENT_NORM / norm);
    }
    grad
}

/// Picks the lowest-cost point among `candidates`.
pub fn best_on_grid<O, I>(objective: &O, candidates: I) -> Option<(Array1<f64>, f64)>
where
    O: Objective,
    I: IntoIterator<Item = Array1<f64>>,
{
    candidates
        .into_iter()
        .map(|x| {
            let cost = guarded_cost(objective, &x);
            (x, cost)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

/// Minimises `objective` starting from `x0`.
pub fn minimize<O: Objective>(
    objective: Arc<O>,
    x0: Array1<f64>,
    config: &OptimizerConfig,
) -> Minimum {
    let bound = config.bound;
    let step = config.gradient_step;
    let start = clamp(&x0, bound);
    let start_cost = guarded_cost(objective.as_ref(), &start);
    let best = Arc::new(Mutex::new((start.clone(), start_cost)));

    if start.is_empty() {
        return Minimum {
            point: start,
            value: start_cost,
            iterations: 0,
            converged: true,
        };
    }

    let objective_for_closure = Arc::clone(&objective);
    let best_for_closure = Arc::clone(&best);
    let cost_and_grad = move |x: &Array1<f64>| -> (f64, Array1<f64>) {
        let safe_x = clamp(x, bound);
        let cost = guarded_cost(objective_for_closure.as_ref(), &safe_x);
        if let Ok(mut guard) = best_for_closure.lock() {
            if cost < guard.1 {
                *guard = (safe_x.clone(), cost);
            }
        }
        let grad = central_gradient(objective_for_closure.as_ref(), &safe_x, step);
        (cost, grad)
    };

    let outcome = Bfgs::new(start, cost_and_grad)
        .with_tolerance(config.tolerance)
        .with_max_iterations(config.max_iterations)
        .run();

    let (tracked_point, tracked_cost) = match best.lock() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };

    match outcome {
        Ok(BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        }) => {
            let final_point = clamp(&final_point, bound);
            log::debug!("BFGS converged in {iterations} iterations with cost {final_value:.6}.");
            if final_value.is_finite() && final_value <= tracked_cost {
                Minimum {
                    point: final_point,
                    value: final_value,
                    iterations,
                    converged: true,
                }
            } else {
                Minimum {
                    point: tracked_point,
                    value: tracked_cost,
                    iterations,
                    converged: true,
                }
            }
        }
        Err(e) => {
            log::warn!(
                "BFGS stopped early ({e:?}); keeping the best evaluated point with cost {tracked_cost:.6}."
            );
            Minimum {
                point: tracked_point,
                value: tracked_cost,
                iterations: config.max_iterations,
                converged: false,
            }
        }
    }
}

/// Logistic map from the real line onto `(0, 1)`.
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    struct Coupled;

    impl Objective for Coupled {
        fn cost(&self, x: &Array1<f64>) -> Result<f64, SolverError> {
            Ok((x[0] - 1.0).powi(2) + 10.0 * (x[1] + 2.0).powi(2) + x[0] * x[1])
        }
    }

    struct Bowl;

    impl Objective for Bowl {
        fn cost(&self, x: &Array1<f64>) -> Result<f64, SolverError> {
            if x[0] > 5.0 {
                return Err(SolverError::NonFiniteLml("bowl"));
            }
            Ok((x[0] - 2.0).powi(2) + 3.0)
        }
    }

    #[test]
    fn minimize_finds_coupled_quadratic_minimum() {
        let minimum = minimize(Arc::new(Coupled), array![0.0, 0.0], &OptimizerConfig::default());
        assert_abs_diff_eq!(minimum.point[0], 80.0 / 39.0, epsilon = 1e-3);
        assert_abs_diff_eq!(minimum.point[1], -82.0 / 39.0, epsilon = 1e-3);
    }

    #[test]
    fn failed_evaluations_are_penalised_not_fatal() {
        let minimum = minimize(Arc::new(Bowl), array![0.0], &OptimizerConfig::default());
        assert_abs_diff_eq!(minimum.point[0], 2.0, epsilon = 1e-4);
        assert_abs_diff_eq!(minimum.value, 3.0, epsilon = 1e-8);
    }

    #[test]
    fn grid_search_returns_lowest_point() {
        let grid = (0..9).map(|i| array![i as f64 * 0.5]);
        let (point, cost) = best_on_grid(&Bowl, grid).unwrap();
        assert_abs_diff_eq!(point[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cost, 3.0, epsilon = 1e-12);
    }

    #[test]
    fn sigmoid_inverts_logit() {
        for p in [1e-6, 0.1, 0.5, 0.9, 1.0 - 1e-6] {
            assert_abs_diff_eq!(sigmoid(logit(p)), p, epsilon = 1e-12);
        }
        assert!(sigmoid(-800.0) >= 0.0);
        assert!(sigmoid(800.0) <= 1.0);
    }
}
