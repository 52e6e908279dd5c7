use core::ops::{Index, Range};

use nalgebra::{DMatrix, DVector};

use crate::{Interval, TermError};

/// Read-only view of the current values of the variables bound to a term.
///
/// `x[i]` is the value of the `i`-th variable of the term, in user space.
#[derive(Clone, Copy)]
pub struct Arguments<'a, T> {
    data: &'a [T],
    ranges: &'a [Range<usize>],
}

impl<'a, T> Arguments<'a, T> {
    pub(crate) fn new(data: &'a [T], ranges: &'a [Range<usize>]) -> Self {
        Self { data, ranges }
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a [T]> + 'a {
        let data = self.data;
        self.ranges.iter().map(move |range| &data[range.clone()])
    }
}

impl<'a, T> Index<usize> for Arguments<'a, T> {
    type Output = [T];

    fn index(&self, var: usize) -> &[T] {
        &self.data[self.ranges[var].clone()]
    }
}

/// A differentiable summand of the objective.
///
/// A term is bound to a fixed, ordered list of variables when it is added
/// to a [`Function`](crate::Function). Variable `i` of the term has
/// dimension `variable_dimension(i)`.
///
/// Terms are evaluated concurrently from several threads. Each call gets
/// its own output buffers, so implementations only need to be `Sync`.
///
/// The gradient buffers passed to the term have one entry per variable,
/// entry `i` with exactly `variable_dimension(i)` rows; they are zeroed
/// before the call. The Hessian blocks are `hessian[i][j]`, of shape
/// `variable_dimension(i) × variable_dimension(j)`, also zeroed. A term
/// which replaces a buffer by one of another shape fails with a
/// [`TermError`].
pub trait Term: Send + Sync {
    /// Number of variables the term depends on.
    fn number_of_variables(&self) -> usize;

    /// Dimension of variable `var`.
    fn variable_dimension(&self, var: usize) -> usize;

    /// Compute the value of the term.
    fn evaluate(&self, x: &Arguments<'_, f64>) -> Result<f64, TermError>;

    /// Compute the value and write the gradient with respect to each variable.
    fn evaluate_gradient(
        &self,
        x: &Arguments<'_, f64>,
        gradient: &mut [DVector<f64>],
    ) -> Result<f64, TermError>;

    /// Compute the value, the gradient and the Hessian blocks.
    ///
    /// The default implementation reports that second derivatives are not available.
    fn evaluate_hessian(
        &self,
        x: &Arguments<'_, f64>,
        gradient: &mut [DVector<f64>],
        hessian: &mut [Vec<DMatrix<f64>>],
    ) -> Result<f64, TermError> {
        let _ = (x, gradient, hessian);
        Err(TermError::new("term does not implement the Hessian"))
    }

    /// Enclose the range of the term over a box.
    ///
    /// The default implementation reports that interval evaluation is not available.
    fn evaluate_interval(&self, x: &Arguments<'_, Interval>) -> Result<Interval, TermError> {
        let _ = x;
        Err(TermError::new("term does not implement interval evaluation"))
    }
}
