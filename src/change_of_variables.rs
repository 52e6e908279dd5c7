//! Reparameterization of variables.
//!
//! A variable with a change of variables has two representations: the
//! _user_ value `$\vec{x}$` that terms see, and the _solver_ value `$\vec{t}$`
//! stored in the global state vector, related by `$\vec{x} = \phi(\vec{t})$`.
//! The gradient is transferred with the chain rule
//! ```math
//!   \nabla_{\vec{t}} f = \mathbf{J}_\phi(\vec{t})^\top \nabla_{\vec{x}} f.
//! ```

/// A bijection between the user and solver representation of a variable.
pub trait ChangeOfVariables: Send + Sync {
    /// Dimension of `$\vec{x}$`.
    fn user_dimension(&self) -> usize;

    /// Dimension of `$\vec{t}$`.
    fn solver_dimension(&self) -> usize;

    /// Compute `$\vec{x} = \phi(\vec{t})$`.
    fn to_user(&self, t: &[f64], x: &mut [f64]);

    /// Compute `$\vec{t} = \phi^{-1}(\vec{x})$`.
    fn to_solver(&self, x: &[f64], t: &mut [f64]);

    /// Add `$\mathbf{J}_\phi(\vec{t})^\top \nabla_{\vec{x}} f$` to `t_gradient`.
    fn update_gradient(&self, t_gradient: &mut [f64], t: &[f64], x_gradient: &[f64]);
}

/// How a registered variable maps between the global vector and user space.
pub(crate) enum Parameterization {
    Identity,
    Changed(Box<dyn ChangeOfVariables>),
}

impl Parameterization {
    pub fn is_identity(&self) -> bool {
        matches!(self, Parameterization::Identity)
    }

    pub fn to_user(&self, t: &[f64], x: &mut [f64]) {
        match self {
            Parameterization::Identity => x.copy_from_slice(t),
            Parameterization::Changed(change) => change.to_user(t, x),
        }
    }

    pub fn to_solver(&self, x: &[f64], t: &mut [f64]) {
        match self {
            Parameterization::Identity => t.copy_from_slice(x),
            Parameterization::Changed(change) => change.to_solver(x, t),
        }
    }

    pub fn update_gradient(&self, t_gradient: &mut [f64], t: &[f64], x_gradient: &[f64]) {
        match self {
            Parameterization::Identity => {
                for (g, dx) in t_gradient.iter_mut().zip(x_gradient) {
                    *g += dx;
                }
            }
            Parameterization::Changed(change) => change.update_gradient(t_gradient, t, x_gradient),
        }
    }
}

impl From<Option<Box<dyn ChangeOfVariables>>> for Parameterization {
    fn from(change: Option<Box<dyn ChangeOfVariables>>) -> Self {
        match change {
            Some(change) => Parameterization::Changed(change),
            None => Parameterization::Identity,
        }
    }
}

/// Keep every component above a bound, `$x_i = b + e^{t_i}$`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GreaterThan {
    dimension: usize,
    bound: f64,
}

impl GreaterThan {
    pub fn new(dimension: usize, bound: f64) -> Self {
        Self { dimension, bound }
    }
}

impl ChangeOfVariables for GreaterThan {
    fn user_dimension(&self) -> usize {
        self.dimension
    }

    fn solver_dimension(&self) -> usize {
        self.dimension
    }

    fn to_user(&self, t: &[f64], x: &mut [f64]) {
        for (x, t) in x.iter_mut().zip(t) {
            *x = self.bound + t.exp();
        }
    }

    fn to_solver(&self, x: &[f64], t: &mut [f64]) {
        for (t, x) in t.iter_mut().zip(x) {
            *t = (x - self.bound).ln();
        }
    }

    fn update_gradient(&self, t_gradient: &mut [f64], t: &[f64], x_gradient: &[f64]) {
        for ((g, t), dx) in t_gradient.iter_mut().zip(t).zip(x_gradient) {
            *g += t.exp() * dx;
        }
    }
}

/// Keep every component in the open interval `$(a, b)$` using a logistic map,
/// `$x_i = a + (b - a) / (1 + e^{-t_i})$`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounded {
    dimension: usize,
    lower: f64,
    upper: f64,
}

impl Bounded {
    /// # Panics
    ///
    /// Panics if `$\mathtt{lower} \geq \mathtt{upper}$`.
    pub fn new(dimension: usize, lower: f64, upper: f64) -> Self {
        assert!(lower < upper, "lower must be < upper");
        Self {
            dimension,
            lower,
            upper,
        }
    }

    fn logistic(t: f64) -> f64 {
        1. / (1. + (-t).exp())
    }
}

impl ChangeOfVariables for Bounded {
    fn user_dimension(&self) -> usize {
        self.dimension
    }

    fn solver_dimension(&self) -> usize {
        self.dimension
    }

    fn to_user(&self, t: &[f64], x: &mut [f64]) {
        let scale = self.upper - self.lower;
        for (x, &t) in x.iter_mut().zip(t) {
            *x = self.lower + scale * Self::logistic(t);
        }
    }

    fn to_solver(&self, x: &[f64], t: &mut [f64]) {
        for (t, &x) in t.iter_mut().zip(x) {
            *t = ((x - self.lower) / (self.upper - x)).ln();
        }
    }

    fn update_gradient(&self, t_gradient: &mut [f64], t: &[f64], x_gradient: &[f64]) {
        let scale = self.upper - self.lower;
        for ((g, &t), dx) in t_gradient.iter_mut().zip(t).zip(x_gradient) {
            let s = Self::logistic(t);
            *g += scale * s * (1. - s) * dx;
        }
    }
}
