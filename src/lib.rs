//! Assembly and evaluation of objective functions for unconstrained
//! optimization using [nalgebra](https://nalgebra.org).
//!
//! The objective is a sum of _terms_
//! ```math
//! f(\vec{x}_1, \ldots, \vec{x}_n) = \sum_{k=1}^m f_k\bigl(\vec{x}_{k_1}, \ldots, \vec{x}_{k_{a_k}}\bigr),
//! ```
//! where every term depends on a small, fixed list of _variables_
//! `$\vec{x}_i$`. A [`Function`] stacks all variables into one global
//! vector, evaluates the terms (in parallel) and assembles the value, the
//! gradient and a dense or sparse Hessian with respect to the global
//! vector. Optimization algorithms only ever see the global vector.
//!
//! # Inputs
//!
//! You must provide an implementation of [`Term`] for every kind of
//! summand. A term reports its number of variables and their dimensions,
//! and computes its value and gradient, optionally its Hessian blocks and
//! an interval enclosure of its range.
//!
//! Variables may be reparameterized with a [`ChangeOfVariables`], for
//! example to keep them positive ([`GreaterThan`]) or inside a box
//! ([`Bounded`]). Terms then see the user representation while the global
//! vector holds the solver representation.
//!
//! # Usage Example
//!
//! We use the [Rosenbrock function](https://en.wikipedia.org/wiki/Rosenbrock_function)
//! `$f(a, b) \coloneqq (1 - a)^2 + 100(b - a^2)^2$` with two scalar variables.
//!
//! ```
//! # use std::sync::Arc;
//! # use nalgebra::DVector;
//! # use termopt::{Arguments, Function, Term, TermError};
//! struct Rosenbrock;
//!
//! impl Term for Rosenbrock {
//!     fn number_of_variables(&self) -> usize {
//!         2
//!     }
//!
//!     fn variable_dimension(&self, _var: usize) -> usize {
//!         1
//!     }
//!
//!     fn evaluate(&self, x: &Arguments<'_, f64>) -> Result<f64, TermError> {
//!         let (a, b) = (x[0][0], x[1][0]);
//!         Ok((1. - a).powi(2) + 100. * (b - a * a).powi(2))
//!     }
//!
//!     fn evaluate_gradient(
//!         &self,
//!         x: &Arguments<'_, f64>,
//!         gradient: &mut [DVector<f64>],
//!     ) -> Result<f64, TermError> {
//!         let (a, b) = (x[0][0], x[1][0]);
//!         gradient[0][0] = -2. * (1. - a) - 400. * a * (b - a * a);
//!         gradient[1][0] = 200. * (b - a * a);
//!         self.evaluate(x)
//!     }
//! }
//!
//! let mut function = Function::new();
//! let a = function.add_variable(&[-1.2]);
//! let b = function.add_variable(&[1.]);
//! function.add_term(Arc::new(Rosenbrock), &[a, b])?;
//!
//! // The global vector of the current user values
//! let mut x = DVector::zeros(0);
//! function.copy_user_to_global(&mut x);
//!
//! let mut gradient = DVector::zeros(0);
//! let value = function.evaluate_with_gradient(&x, &mut gradient)?;
//! assert!((value - 24.2).abs() < 1e-12);
//!
//! // Take a small gradient step and hand the result back to the variables
//! x -= 1e-4 * &gradient;
//! function.copy_global_to_user(&x)?;
//! assert!(function.evaluate_user_values()? < value);
//! # Ok::<(), termopt::FunctionError>(())
//! ```
//!
//! # Derivative checking
//!
//! Use [`differentiate_numerically`] to compare the gradient of a function
//! with a finite difference approximation.
//!
//! # Features
//!
//! - `parallel` (default): evaluate terms on a [rayon](https://docs.rs/rayon)
//!   pool of [`Function::number_of_threads`] workers. Without it, terms are
//!   evaluated sequentially.

mod change_of_variables;
mod error;
mod function;
mod interval;
mod stats;
mod term;
mod utils;

pub use change_of_variables::{Bounded, ChangeOfVariables, GreaterThan};
pub use error::{ErrorKind, FunctionError, Result, TermError};
pub use function::{Function, TermId, VariableId};
pub use interval::Interval;
pub use stats::EvaluationStats;
pub use term::{Arguments, Term};

pub use utils::differentiate_numerically;
