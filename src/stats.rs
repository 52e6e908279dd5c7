use core::fmt;
use std::time::Duration;

/// Counters and cumulative timings of the evaluations of a [`Function`](crate::Function).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationStats {
    /// Evaluations of the value only, including interval evaluations.
    pub evaluations_without_gradient: usize,
    /// Evaluations of the value together with derivatives.
    pub evaluations_with_gradient: usize,
    /// Time spent evaluating terms for the value only.
    pub evaluate_time: Duration,
    /// Time spent evaluating terms together with their derivatives.
    pub evaluate_with_hessian_time: Duration,
    /// Time spent assembling the global gradient and Hessian.
    pub write_gradient_hessian_time: Duration,
    /// Time spent copying between the global vector, local storage and user values.
    pub copy_time: Duration,
}

impl fmt::Display for EvaluationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Function evaluations without gradient : {}",
            self.evaluations_without_gradient
        )?;
        writeln!(
            f,
            "Function evaluations with gradient    : {}",
            self.evaluations_with_gradient
        )?;
        writeln!(f, "Function evaluate time            : {:?}", self.evaluate_time)?;
        writeln!(
            f,
            "Function evaluate time (with g/H) : {:?}",
            self.evaluate_with_hessian_time
        )?;
        writeln!(
            f,
            "Function write g/H time           : {:?}",
            self.write_gradient_hessian_time
        )?;
        writeln!(f, "Function copy data time           : {:?}", self.copy_time)
    }
}
