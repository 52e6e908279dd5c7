use nalgebra::DVector;

use crate::error::Result;
use crate::Function;

pub(crate) mod finite_difference;

/// Compute a [numerical approximation](https://en.wikipedia.org/wiki/Numerical_differentiation)
/// to the gradient of `function` at the global vector `x` for testing.
///
/// You can check the derivatives of your [`Term`](crate::Term) and
/// [`ChangeOfVariables`](crate::ChangeOfVariables) implementations by
/// comparing with [`Function::evaluate_with_gradient`].
///
/// Each partial derivative is a central difference quotient refined by
/// Richardson extrapolation. This is far more expensive than the analytic
/// gradient and its error is larger than the floating point precision,
/// typically around `$10^{-10}$` relative to the magnitude of `$f$`.
/// Components where the function could not be differentiated, for example
/// because it is not finite close to `x`, are NaN.
///
/// Fails if evaluating the function fails.
pub fn differentiate_numerically(function: &mut Function, x: &DVector<f64>) -> Result<DVector<f64>> {
    let mut gradient = DVector::zeros(x.len());
    let mut point = x.clone();
    for i in 0..x.len() {
        let mut failure = None;
        let derivative = finite_difference::derivative(x[i], |xi| {
            point[i] = xi;
            match function.evaluate(&point) {
                Ok(value) => Some(value),
                Err(error) => {
                    failure = Some(error);
                    None
                }
            }
        });
        if let Some(error) = failure {
            return Err(error);
        }
        point[i] = x[i];
        gradient[i] = derivative.unwrap_or(f64::NAN);
    }
    Ok(gradient)
}
