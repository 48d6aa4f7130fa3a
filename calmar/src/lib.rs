mod config;
use log::{debug, info};
use snafu::prelude::*;

use std::collections::BTreeMap;

pub use crate::config::*;

pub mod builder;
pub mod datatable;
pub mod manual;
pub mod margin_file;
pub mod store;

/// The name of the margin holding the total population.
pub const TOTAL_POPULATION: &str = "totalpop";

// Beyond this, exp() overflows.
const MAX_EXPONENT: f64 = 700.0;

// Number of times a Newton step may be halved before giving up.
const MAX_STEP_HALVINGS: u32 = 30;

// **** Private structures ****

// The system solved by the Newton iterations.
#[derive(PartialEq, Debug, Clone)]
struct CalibrationSystem {
    keys: Vec<(String, Modality)>,
    // columns[k][i]: value of unit i for margin k
    columns: Vec<Vec<f64>>,
    targets: Vec<f64>,
    adjusted_targets: Vec<f64>,
}

impl CalibrationSystem {
    fn len(&self) -> usize {
        self.targets.len()
    }
}

#[derive(PartialEq, Debug, Clone)]
struct Iterate {
    lambda: Vec<f64>,
    weights: Vec<f64>,
    achieved: Vec<f64>,
    // Sum of the squared relative gaps, used to accept a step.
    gap: f64,
}

/// The weight ratio and its derivative for the given linear predictor.
fn ratio_function(params: &CalibrationParams, u: f64) -> (f64, f64) {
    let (lower, upper) = (params.lower, params.upper);
    match params.method {
        CalibrationMethod::Linear => clip(1.0 + u, 1.0, lower, upper),
        CalibrationMethod::RakingRatio => {
            let r = u.min(MAX_EXPONENT).exp();
            clip(r, r, lower, upper)
        }
        CalibrationMethod::Logit if upper - lower <= f64::EPSILON => (lower, 0.0),
        CalibrationMethod::Logit => {
            // F(u) = L + (U - L) * sigmoid(A u + c), with F(0) = 1
            let a = (upper - lower) / ((1.0 - lower) * (upper - 1.0));
            let c = ((1.0 - lower) / (upper - 1.0)).ln();
            let s = sigmoid(a * u + c);
            (lower + (upper - lower) * s, (upper - lower) * a * s * (1.0 - s))
        }
    }
}

fn clip(r: f64, derivative: f64, lower: f64, upper: f64) -> (f64, f64) {
    if r < lower {
        (lower, 0.0)
    } else if r > upper {
        (upper, 0.0)
    } else {
        (r, derivative)
    }
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

fn check_params(
    baseline: &[f64],
    constraints: &[Constraint],
    params: &CalibrationParams,
) -> Result<(), CalibrationError> {
    let (lower, upper) = (params.lower, params.upper);
    let valid_range = lower.is_finite() && lower >= 0.0 && !upper.is_nan() && lower <= upper;
    let valid_logit = (lower < 1.0 && 1.0 < upper && upper.is_finite()) || upper - lower <= f64::EPSILON;
    ensure!(
        valid_range && (params.method != CalibrationMethod::Logit || valid_logit),
        InvalidBoundsSnafu {
            method: params.method,
            lower,
            upper
        }
    );
    for c in constraints.iter() {
        ensure!(
            c.values.len() == baseline.len(),
            DimensionMismatchSnafu {
                variable: c.variable.clone(),
                expected: baseline.len(),
                found: c.values.len()
            }
        );
    }
    Ok(())
}

/// Assembles the constraints, the total population and the proportional rescaling.
fn assemble_system(
    baseline: &[f64],
    constraints: &[Constraint],
    params: &CalibrationParams,
) -> CalibrationSystem {
    let total_population = params
        .total_population
        .unwrap_or_else(|| baseline.iter().sum());

    // Sum of the targets of each categorical variable.
    let mut categorical_sums: BTreeMap<&str, f64> = BTreeMap::new();
    for c in constraints.iter() {
        if let Modality::Code(_) = c.modality {
            *categorical_sums.entry(c.variable.as_str()).or_insert(0.0) += c.target;
        }
    }

    let mut system = CalibrationSystem {
        keys: Vec::new(),
        columns: Vec::new(),
        targets: Vec::new(),
        adjusted_targets: Vec::new(),
    };
    for c in constraints.iter() {
        let adjusted = match (c.modality, categorical_sums.get(c.variable.as_str())) {
            (Modality::Code(_), Some(s)) if params.use_proportions && *s > 0.0 => {
                c.target * total_population / s
            }
            _ => c.target,
        };
        system.keys.push((c.variable.clone(), c.modality));
        system.columns.push(c.values.clone());
        system.targets.push(c.target);
        system.adjusted_targets.push(adjusted);
    }
    if let Some(tp) = params.total_population {
        system.keys.push((TOTAL_POPULATION.to_string(), Modality::Total));
        system.columns.push(vec![1.0; baseline.len()]);
        system.targets.push(tp);
        system.adjusted_targets.push(tp);
    }
    system
}

fn evaluate(
    baseline: &[f64],
    system: &CalibrationSystem,
    params: &CalibrationParams,
    lambda: Vec<f64>,
) -> (Iterate, Vec<f64>) {
    let n = baseline.len();
    let mut weights = Vec::with_capacity(n);
    let mut derivatives = Vec::with_capacity(n);
    for (i, d) in baseline.iter().enumerate() {
        let u: f64 = system
            .columns
            .iter()
            .zip(lambda.iter())
            .map(|(col, l)| col[i] * l)
            .sum();
        let (r, dr) = ratio_function(params, u);
        weights.push(d * r);
        derivatives.push(d * dr);
    }
    let achieved: Vec<f64> = system
        .columns
        .iter()
        .map(|col| col.iter().zip(weights.iter()).map(|(x, w)| x * w).sum())
        .collect();
    let gap: f64 = achieved
        .iter()
        .zip(system.adjusted_targets.iter())
        .map(|(a, t)| ((a - t) / t.abs().max(1.0)).powi(2))
        .sum();
    (
        Iterate {
            lambda,
            weights,
            achieved,
            gap,
        },
        derivatives,
    )
}

fn has_converged(it: &Iterate, system: &CalibrationSystem, tolerance: f64) -> bool {
    it.achieved
        .iter()
        .zip(system.adjusted_targets.iter())
        .all(|(a, t)| (a - t).abs() <= tolerance * t.abs().max(1.0))
}

/// The Newton direction: solves (H + μI) δ = t - achieved, with H = Σ d_i F'(u_i) x_i x_iᵀ.
///
/// The small ridge term keeps the system solvable when the margins are
/// redundant (for instance all the modalities of a variable together with
/// the total population). Returns None when H vanishes or is singular.
#[allow(clippy::needless_range_loop)]
fn newton_direction(
    system: &CalibrationSystem,
    it: &Iterate,
    derivatives: &[f64],
) -> Option<Vec<f64>> {
    let k = system.len();
    let mut h = vec![vec![0.0; k]; k];
    for (i, di) in derivatives.iter().enumerate() {
        if *di == 0.0 {
            continue;
        }
        for a in 0..k {
            let xa = system.columns[a][i];
            if xa == 0.0 {
                continue;
            }
            for b in a..k {
                h[a][b] += di * xa * system.columns[b][i];
            }
        }
    }
    for a in 0..k {
        for b in 0..a {
            h[a][b] = h[b][a];
        }
    }
    let max_diag = (0..k).map(|a| h[a][a]).fold(0.0, f64::max);
    if max_diag <= f64::MIN_POSITIVE {
        return None;
    }
    for a in 0..k {
        h[a][a] += 1e-10 * max_diag;
    }
    let rhs: Vec<f64> = system
        .adjusted_targets
        .iter()
        .zip(it.achieved.iter())
        .map(|(t, a)| t - a)
        .collect();
    solve_linear_system(h, rhs, max_diag)
}

/// Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_linear_system(mut a: Vec<Vec<f64>>, mut b: Vec<f64>, scale: f64) -> Option<Vec<f64>> {
    let n = b.len();
    for i in 0..n {
        let mut max_row = i;
        for r in (i + 1)..n {
            if a[r][i].abs() > a[max_row][i].abs() {
                max_row = r;
            }
        }
        a.swap(i, max_row);
        b.swap(i, max_row);
        if a[i][i].abs() <= 1e-14 * scale {
            return None;
        }
        for r in (i + 1)..n {
            let factor = a[r][i] / a[i][i];
            for c in i..n {
                a[r][c] -= factor * a[i][c];
            }
            b[r] -= factor * b[i];
        }
    }
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        x[i] = b[i];
        for c in (i + 1)..n {
            x[i] -= a[i][c] * x[c];
        }
        x[i] /= a[i][i];
    }
    Some(x)
}

fn to_outcome(
    system: &CalibrationSystem,
    it: Iterate,
    iterations: u32,
    converged: bool,
) -> CalibrationOutcome {
    let margins = system
        .keys
        .iter()
        .enumerate()
        .map(|(k, (variable, modality))| AchievedMargin {
            variable: variable.clone(),
            modality: *modality,
            target: system.targets[k],
            adjusted_target: system.adjusted_targets[k],
            achieved: it.achieved[k],
        })
        .collect();
    CalibrationOutcome {
        weights: it.weights,
        margins,
        iterations,
        converged,
    }
}

/// Calibrates the baseline weights on the given margins.
///
/// The new weight of a household unit is its baseline weight times a ratio
/// F(x·λ) that depends on the method. The coefficients λ are found by damped
/// Newton iterations, until every margin is within the tolerance of its
/// target. Reaching the maximum number of iterations is not an error: the
/// best weights are returned with `converged` set to false.
///
/// Arguments:
/// * `baseline` the baseline weight of every household unit
/// * `constraints` the margins to calibrate on
/// * `params` the method, bounds and total population target
///
/// ```
/// use calmar::*;
///
/// let params = CalibrationParams {
///     total_population: Some(12.0),
///     ..CalibrationParams::with_bounds(CalibrationMethod::Linear, 0.5, 2.0)
/// };
/// let outcome = calibrate(&[1.0, 2.0, 3.0], &[], &params)?;
/// assert!(outcome.converged);
/// let total: f64 = outcome.weights.iter().sum();
/// assert!((total - 12.0).abs() < 1e-6);
///
/// # Ok::<(), CalibrationError>(())
/// ```
pub fn calibrate(
    baseline: &[f64],
    constraints: &[Constraint],
    params: &CalibrationParams,
) -> Result<CalibrationOutcome, CalibrationError> {
    check_params(baseline, constraints, params)?;
    let system = assemble_system(baseline, constraints, params);
    info!(
        "Calibrating {} household units on {} margins, method: {}, bounds: [{}, {}]",
        baseline.len(),
        system.len(),
        params.method,
        params.lower,
        params.upper
    );
    if system.targets.is_empty() {
        return Ok(CalibrationOutcome {
            weights: baseline.to_vec(),
            margins: Vec::new(),
            iterations: 0,
            converged: true,
        });
    }

    let (mut current, mut derivatives) = evaluate(baseline, &system, params, vec![0.0; system.len()]);
    let mut iterations: u32 = 0;
    while iterations < params.max_iterations {
        if has_converged(&current, &system, params.tolerance) {
            info!("Calibration converged after {} iterations", iterations);
            return Ok(to_outcome(&system, current, iterations, true));
        }
        iterations += 1;
        let direction = match newton_direction(&system, &current, &derivatives) {
            Some(d) => d,
            None => {
                debug!("calibrate: iteration {}: singular system", iterations);
                break;
            }
        };

        // Halve the step until the gap decreases.
        let mut scale = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_STEP_HALVINGS {
            let lambda: Vec<f64> = current
                .lambda
                .iter()
                .zip(direction.iter())
                .map(|(l, d)| l + scale * d)
                .collect();
            let (trial, trial_derivatives) = evaluate(baseline, &system, params, lambda);
            if trial.gap < current.gap {
                accepted = Some((trial, trial_derivatives));
                break;
            }
            scale *= 0.5;
        }
        match accepted {
            Some((trial, trial_derivatives)) => {
                debug!(
                    "calibrate: iteration {}: gap {:e} -> {:e} (step scale {})",
                    iterations, current.gap, trial.gap, scale
                );
                current = trial;
                derivatives = trial_derivatives;
            }
            None => {
                debug!("calibrate: iteration {}: no improving step", iterations);
                break;
            }
        }
    }

    let converged = has_converged(&current, &system, params.tolerance);
    if converged {
        info!("Calibration converged after {} iterations", iterations);
    } else {
        info!(
            "Calibration did not converge after {} iterations (gap: {:e})",
            iterations, current.gap
        );
    }
    Ok(to_outcome(&system, current, iterations, converged))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol * b.abs().max(1.0)
    }

    // 6 household units, one categorical variable with 2 modalities and one
    // amount.
    fn constraints(target_a: f64, target_b: f64, target_income: f64) -> Vec<Constraint> {
        vec![
            Constraint {
                variable: "zone".to_string(),
                modality: Modality::Code(1),
                values: vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0],
                target: target_a,
            },
            Constraint {
                variable: "zone".to_string(),
                modality: Modality::Code(2),
                values: vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
                target: target_b,
            },
            Constraint {
                variable: "income".to_string(),
                modality: Modality::Total,
                values: vec![10.0, 20.0, 30.0, 15.0, 25.0, 35.0],
                target: target_income,
            },
        ]
    }

    const BASELINE: [f64; 6] = [10.0, 10.0, 10.0, 10.0, 10.0, 10.0];

    #[test]
    fn no_margins_is_identity() {
        init();
        let params = CalibrationParams::DEFAULT_PARAMS;
        let outcome = calibrate(&[1.0, 2.0, 3.0], &[], &params).unwrap();
        assert_eq!(outcome.weights, vec![1.0, 2.0, 3.0]);
        assert!(outcome.converged);
        assert_eq!(outcome.iterations, 0);
        assert!(outcome.margins.is_empty());
    }

    #[test]
    fn linear_total_population() {
        init();
        let params = CalibrationParams {
            total_population: Some(12.0),
            ..CalibrationParams::with_bounds(CalibrationMethod::Linear, 0.5, 2.0)
        };
        let outcome = calibrate(&[1.0, 2.0, 3.0], &[], &params).unwrap();
        assert!(outcome.converged);
        let total: f64 = outcome.weights.iter().sum();
        assert!((total - 12.0).abs() < 1e-6);
        assert_eq!(outcome.margins.len(), 1);
        assert_eq!(outcome.margins[0].variable, TOTAL_POPULATION);
    }

    #[test]
    fn pinned_bounds_keep_baseline() {
        init();
        for method in [
            CalibrationMethod::Linear,
            CalibrationMethod::RakingRatio,
            CalibrationMethod::Logit,
        ] {
            let params = CalibrationParams {
                total_population: Some(12.0),
                ..CalibrationParams::with_bounds(method, 1.0, 1.0)
            };
            let outcome = calibrate(&[1.0, 2.0, 3.0], &[], &params).unwrap();
            assert_eq!(outcome.weights, vec![1.0, 2.0, 3.0], "{}", method);
            assert!(outcome.did_not_converge(), "{}", method);
        }
    }

    #[test]
    fn pinned_bounds_already_on_target() {
        let params = CalibrationParams {
            total_population: Some(6.0),
            ..CalibrationParams::with_bounds(CalibrationMethod::Linear, 1.0, 1.0)
        };
        let outcome = calibrate(&[1.0, 2.0, 3.0], &[], &params).unwrap();
        assert!(outcome.converged);
        assert_eq!(outcome.weights, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn all_methods_hit_the_margins() {
        init();
        for method in [
            CalibrationMethod::Linear,
            CalibrationMethod::RakingRatio,
            CalibrationMethod::Logit,
        ] {
            let params = CalibrationParams::with_bounds(method, 0.2, 5.0);
            let cs = constraints(40.0, 25.0, 1500.0);
            let outcome = calibrate(&BASELINE, &cs, &params).unwrap();
            assert!(outcome.converged, "{}", method);
            for m in outcome.margins.iter() {
                assert!(close(m.achieved, m.target, 1e-6), "{}: {:?}", method, m);
            }
            for (w, d) in outcome.weights.iter().zip(BASELINE.iter()) {
                let r = w / d;
                assert!((0.2..=5.0).contains(&r), "{}: ratio {}", method, r);
            }
        }
    }

    #[test]
    fn raking_only_categorical_is_proportional() {
        // With only categorical margins, raking scales every modality uniformly.
        let params = CalibrationParams::with_bounds(CalibrationMethod::RakingRatio, 0.1, 10.0);
        let cs: Vec<Constraint> = constraints(60.0, 15.0, 0.0).into_iter().take(2).collect();
        let outcome = calibrate(&BASELINE, &cs, &params).unwrap();
        assert!(outcome.converged);
        for w in outcome.weights[..3].iter() {
            assert!(close(*w, 20.0, 1e-5));
        }
        for w in outcome.weights[3..].iter() {
            assert!(close(*w, 5.0, 1e-5));
        }
    }

    #[test]
    fn logit_stays_strictly_within_bounds() {
        let params = CalibrationParams::with_bounds(CalibrationMethod::Logit, 0.5, 1.5);
        let cs: Vec<Constraint> = constraints(42.0, 18.0, 0.0).into_iter().take(2).collect();
        let outcome = calibrate(&BASELINE, &cs, &params).unwrap();
        assert!(outcome.converged);
        for (w, d) in outcome.weights.iter().zip(BASELINE.iter()) {
            let r = w / d;
            assert!(r > 0.5 && r < 1.5, "ratio {}", r);
        }
    }

    #[test]
    fn logit_out_of_reach() {
        let params = CalibrationParams::with_bounds(CalibrationMethod::Logit, 0.5, 1.5);
        // 100 is out of reach for 3 units of weight 10 with a ratio below 1.5.
        let cs: Vec<Constraint> = constraints(100.0, 10.0, 0.0).into_iter().take(2).collect();
        let outcome = calibrate(&BASELINE, &cs, &params).unwrap();
        assert!(outcome.did_not_converge());
        for (w, d) in outcome.weights.iter().zip(BASELINE.iter()) {
            let r = w / d;
            assert!((0.5..=1.5).contains(&r), "ratio {}", r);
        }
    }

    #[test]
    fn linear_bounds_clip_the_ratio() {
        let params = CalibrationParams::with_bounds(CalibrationMethod::Linear, 0.8, 1.2);
        let cs: Vec<Constraint> = constraints(45.0, 30.0, 0.0).into_iter().take(2).collect();
        let outcome = calibrate(&BASELINE, &cs, &params).unwrap();
        assert!(outcome.did_not_converge());
        for w in outcome.weights[..3].iter() {
            assert!(close(*w, 12.0, 1e-9));
        }
        for w in outcome.weights[3..].iter() {
            assert!(close(*w, 10.0, 1e-9));
        }
    }

    #[test]
    fn proportions_are_rescaled_to_the_population() {
        let params = CalibrationParams {
            use_proportions: true,
            total_population: Some(90.0),
            ..CalibrationParams::with_bounds(CalibrationMethod::RakingRatio, 0.1, 10.0)
        };
        // Shares of the population rather than counts.
        let cs: Vec<Constraint> = constraints(0.4, 0.6, 0.0).into_iter().take(2).collect();
        let outcome = calibrate(&BASELINE, &cs, &params).unwrap();
        assert!(outcome.converged);
        assert!(close(outcome.margins[0].adjusted_target, 36.0, 1e-12));
        assert!(close(outcome.margins[1].adjusted_target, 54.0, 1e-12));
        assert_eq!(outcome.margins[0].target, 0.4);
        assert!(close(outcome.margins[0].achieved, 36.0, 1e-6));
        let total: f64 = outcome.weights.iter().sum();
        assert!(close(total, 90.0, 1e-6));
    }

    #[test]
    fn max_iterations_returns_best_weights() {
        let params = CalibrationParams {
            max_iterations: 1,
            ..CalibrationParams::with_bounds(CalibrationMethod::Logit, 0.2, 5.0)
        };
        let cs = constraints(40.0, 25.0, 1500.0);
        let outcome = calibrate(&BASELINE, &cs, &params).unwrap();
        assert_eq!(outcome.iterations, 1);
        assert!(outcome.did_not_converge());
        assert_eq!(outcome.weights.len(), BASELINE.len());
    }

    #[test]
    fn invalid_parameters() {
        let params = CalibrationParams::with_bounds(CalibrationMethod::Linear, 2.0, 1.0);
        assert!(matches!(
            calibrate(&BASELINE, &[], &params),
            Err(CalibrationError::InvalidBounds { .. })
        ));
        let params = CalibrationParams::with_bounds(CalibrationMethod::Logit, 1.0, 2.0);
        assert!(matches!(
            calibrate(&BASELINE, &[], &params),
            Err(CalibrationError::InvalidBounds { .. })
        ));
        let params = CalibrationParams::DEFAULT_PARAMS;
        let cs = vec![Constraint {
            variable: "x".to_string(),
            modality: Modality::Total,
            values: vec![1.0],
            target: 1.0,
        }];
        assert_eq!(
            calibrate(&BASELINE, &cs, &params),
            Err(CalibrationError::DimensionMismatch {
                variable: "x".to_string(),
                expected: 6,
                found: 1
            })
        );
    }
}
