//! Central difference quotients with Richardson extrapolation.

/// Ratio between successive step sizes.
const STEP_RATIO: f64 = 2.;
/// Number of step sizes, and therefore extrapolation levels.
const LEVELS: usize = 5;
/// Initial step size.
const INITIAL_STEP: f64 = 0.1;

/// Compute `$f'(x)$` numerically.
///
/// The central difference quotient `$D(h) = (f(x + h) - f(x - h)) / 2h$`
/// has an error expansion in even powers of `$h$`. It is evaluated for a
/// sequence of halved step sizes and the leading error terms are
/// eliminated by Richardson extrapolation.
///
/// Returns `None` if `f` fails or the result is not finite.
pub fn derivative(x: f64, mut f: impl FnMut(f64) -> Option<f64>) -> Option<f64> {
    let mut table = [[0.; LEVELS]; LEVELS];
    let mut h = INITIAL_STEP;
    for i in 0..LEVELS {
        table[i][0] = (f(x + h)? - f(x - h)?) / (2. * h);
        let mut factor = STEP_RATIO * STEP_RATIO;
        for j in 1..=i {
            table[i][j] = table[i][j - 1] + (table[i][j - 1] - table[i - 1][j - 1]) / (factor - 1.);
            factor *= STEP_RATIO * STEP_RATIO;
        }
        h /= STEP_RATIO;
    }
    let estimate = table[LEVELS - 1][LEVELS - 1];
    estimate.is_finite().then_some(estimate)
}
