//! Evaluation of the function and assembly of its derivatives.
use std::time::Instant;

use faer::sparse::{SparseColMat, Triplet};
use nalgebra::{DMatrix, DVector};
use num_traits::Zero;
use tracing::trace;

use super::storage::Worker;
use super::{hessian_blocks, AddedTerm, AddedVariable, Function};
use crate::error::{FunctionError, Result};
use crate::{Arguments, Interval, TermError};

impl Function {
    /// Compute `$f(\vec{x})$` at the global vector `x`.
    pub fn evaluate(&mut self, x: &DVector<f64>) -> Result<f64> {
        self.check_global_dimension(x.len())?;
        self.copy_global_to_local(x);
        self.evaluate_from_local_storage()
    }

    /// Compute the function at the current user values of the variables.
    pub fn evaluate_user_values(&mut self) -> Result<f64> {
        self.copy_user_to_local();
        self.evaluate_from_local_storage()
    }

    fn evaluate_from_local_storage(&mut self) -> Result<f64> {
        self.stats.evaluations_without_gradient += 1;
        self.ensure_local_storage()?;
        let start = Instant::now();

        let Function {
            terms,
            local,
            storage,
            ..
        } = self;
        let local: &[f64] = local;
        storage.reset(false);
        storage.dispatch(terms, |first, chunk, worker| {
            for (k, added) in chunk.iter().enumerate() {
                match added.term.evaluate(&Arguments::new(local, &added.local_ranges)) {
                    Ok(value) => worker.value += value,
                    Err(error) => worker.record_fault(first + k, error),
                }
            }
        });
        let value = storage.collect_value()?;

        self.stats.evaluate_time += start.elapsed();
        Ok(value)
    }

    /// Compute `$f(\vec{x})$` and write `$\nabla f(\vec{x})$` to `gradient`.
    ///
    /// `gradient` is resized to `number_of_scalars()` if necessary.
    pub fn evaluate_with_gradient(
        &mut self,
        x: &DVector<f64>,
        gradient: &mut DVector<f64>,
    ) -> Result<f64> {
        self.evaluate_with_derivatives(x, gradient, false)
    }

    /// Compute `$f(\vec{x})$`, its gradient and its dense Hessian.
    ///
    /// Fails if Hessians are disabled or if a variable used by a term has a
    /// change of variables.
    pub fn evaluate_with_hessian(
        &mut self,
        x: &DVector<f64>,
        gradient: &mut DVector<f64>,
        hessian: &mut DMatrix<f64>,
    ) -> Result<f64> {
        self.check_hessian_supported("dense Hessian assembly")?;
        let value = self.evaluate_with_derivatives(x, gradient, true)?;

        let start = Instant::now();
        let n = self.number_of_scalars;
        if hessian.shape() != (n, n) {
            *hessian = DMatrix::zeros(n, n);
        } else {
            hessian.fill(0.);
        }
        for added in self.terms.iter() {
            for (var0, &index0) in added.variables.iter().enumerate() {
                let offset0 = self.variables[index0].global_index;
                for (var1, &index1) in added.variables.iter().enumerate() {
                    let offset1 = self.variables[index1].global_index;
                    let block = &added.hessian[var0][var1];
                    let mut target = hessian.view_mut((offset0, offset1), block.shape());
                    target += block;
                }
            }
        }
        self.stats.write_gradient_hessian_time += start.elapsed();
        Ok(value)
    }

    /// Compute `$f(\vec{x})$`, its gradient and its sparse Hessian.
    ///
    /// Every entry of every term Hessian is stored; entries of different
    /// terms at the same position are summed.
    pub fn evaluate_with_sparse_hessian(
        &mut self,
        x: &DVector<f64>,
        gradient: &mut DVector<f64>,
    ) -> Result<(f64, SparseColMat<usize, f64>)> {
        self.check_hessian_supported("sparse Hessian assembly")?;
        let value = self.evaluate_with_derivatives(x, gradient, true)?;

        let start = Instant::now();
        let hessian = self.assemble_sparse(|added, var0, var1, i, j| {
            added.hessian[var0][var1][(i, j)]
        });
        self.stats.write_gradient_hessian_time += start.elapsed();
        Ok((value, hessian?))
    }

    /// The structure of the sparse Hessian, without evaluating any term.
    ///
    /// Every position a term can write to is present. The stored values
    /// are placeholders. Fails like [`Function::evaluate_with_sparse_hessian`]
    /// if a variable used by a term has a change of variables.
    pub fn sparse_hessian_pattern(&mut self) -> Result<SparseColMat<usize, f64>> {
        self.check_identity_parameterization("sparse Hessian pattern")?;
        self.assemble_sparse(|_, _, _, _, _| 1.)
    }

    fn assemble_sparse(
        &mut self,
        entry: impl Fn(&AddedTerm, usize, usize, usize, usize) -> f64,
    ) -> Result<SparseColMat<usize, f64>> {
        let mut triplets = Vec::with_capacity(self.number_of_hessian_elements);
        for added in self.terms.iter() {
            for (var0, &index0) in added.variables.iter().enumerate() {
                let variable0 = &self.variables[index0];
                for (var1, &index1) in added.variables.iter().enumerate() {
                    let variable1 = &self.variables[index1];
                    for i in 0..variable0.user_dimension {
                        for j in 0..variable1.user_dimension {
                            triplets.push(Triplet::new(
                                variable0.global_index + i,
                                variable1.global_index + j,
                                entry(added, var0, var1, i, j),
                            ));
                        }
                    }
                }
            }
        }
        self.number_of_hessian_elements = triplets.len();

        let n = self.number_of_scalars;
        SparseColMat::try_new_from_triplets(n, n, &triplets)
            .map_err(|e| FunctionError::SparseAssembly(e.to_string()))
    }

    /// Enclose the range of the function over the box `x`.
    ///
    /// Terms are evaluated sequentially. Changes of variables are not supported.
    pub fn evaluate_interval(&mut self, x: &[Interval]) -> Result<Interval> {
        self.stats.evaluations_without_gradient += 1;
        self.check_global_dimension(x.len())?;
        self.check_identity_parameterization("interval evaluation")?;
        let start = Instant::now();

        let mut ranges = vec![];
        let mut value = Interval::zero();
        for (index, added) in self.terms.iter().enumerate() {
            ranges.clear();
            ranges.extend(
                added
                    .variables
                    .iter()
                    .map(|&variable| self.variables[variable].global_range()),
            );
            value += added
                .term
                .evaluate_interval(&Arguments::new(x, &ranges))
                .map_err(|source| FunctionError::TermFailed {
                    term: index,
                    source,
                })?;
        }

        self.stats.evaluate_time += start.elapsed();
        Ok(value)
    }

    fn evaluate_with_derivatives(
        &mut self,
        x: &DVector<f64>,
        gradient: &mut DVector<f64>,
        with_hessian: bool,
    ) -> Result<f64> {
        self.stats.evaluations_with_gradient += 1;
        self.check_global_dimension(x.len())?;
        self.ensure_local_storage()?;
        self.copy_global_to_local(x);
        trace!(
            terms = self.terms.len(),
            with_hessian,
            "evaluating with derivatives"
        );
        let start = Instant::now();

        let Function {
            variables,
            terms,
            local,
            storage,
            ..
        } = self;
        let variables: &[AddedVariable] = variables;
        let local: &[f64] = local;
        let x = x.as_slice();
        storage.reset(true);
        storage.dispatch(terms, |first, chunk, worker| {
            for (k, added) in chunk.iter_mut().enumerate() {
                match evaluate_term(added, variables, local, x, worker, with_hessian) {
                    Ok(value) => worker.value += value,
                    Err(error) => worker.record_fault(first + k, error),
                }
            }
        });
        let value = storage.collect_value()?;
        self.stats.evaluate_with_hessian_time += start.elapsed();

        let start = Instant::now();
        self.storage.collect_gradient(self.number_of_scalars, gradient);
        self.stats.write_gradient_hessian_time += start.elapsed();
        Ok(value)
    }

    fn ensure_local_storage(&mut self) -> Result<()> {
        if self.storage.is_allocated() {
            return Ok(());
        }
        let max_arity = self
            .terms
            .iter()
            .map(|added| added.variables.len())
            .max()
            .unwrap_or(0)
            .max(1);
        let max_dimension = self
            .variables
            .iter()
            .map(|variable| variable.user_dimension)
            .max()
            .unwrap_or(0)
            .max(1);
        self.storage.allocate(
            self.number_of_threads,
            self.number_of_scalars,
            max_arity,
            max_dimension,
        )
    }

    fn check_hessian_supported(&self, operation: &'static str) -> Result<()> {
        if !self.hessian_enabled {
            return Err(FunctionError::HessianDisabled);
        }
        self.check_identity_parameterization(operation)
    }

    /// Fail if a variable used by a term has a change of variables.
    fn check_identity_parameterization(&self, operation: &'static str) -> Result<()> {
        let changed = self.terms.iter().any(|added| {
            added
                .variables
                .iter()
                .any(|&variable| !self.variables[variable].parameterization.is_identity())
        });
        if changed {
            return Err(FunctionError::ChangeOfVariablesUnsupported(operation));
        }
        Ok(())
    }
}

/// Evaluate one term and add its gradient to the gradient of the worker.
///
/// The Hessian blocks, if requested, stay with the term until assembly.
/// Buffers the term resized are reported as a fault of that term and
/// restored before the next call.
fn evaluate_term(
    added: &mut AddedTerm,
    variables: &[AddedVariable],
    local: &[f64],
    x: &[f64],
    worker: &mut Worker,
    with_hessian: bool,
) -> core::result::Result<f64, TermError> {
    let arguments = Arguments::new(local, &added.local_ranges);
    let scratch = &mut worker.scratch[..added.variables.len()];
    for (g, &index) in scratch.iter_mut().zip(&added.variables) {
        let dimension = variables[index].user_dimension;
        if g.len() == dimension {
            g.fill(0.);
        } else {
            *g = DVector::zeros(dimension);
        }
    }
    let value = if with_hessian {
        let arity = added.variables.len();
        if added.hessian.iter().any(|row| row.len() != arity) {
            added.hessian = hessian_blocks(added.term.as_ref());
        }
        for (row, &index0) in added.hessian.iter_mut().zip(&added.variables) {
            for (block, &index1) in row.iter_mut().zip(&added.variables) {
                let shape = (
                    variables[index0].user_dimension,
                    variables[index1].user_dimension,
                );
                if block.shape() == shape {
                    block.fill(0.);
                } else {
                    *block = DMatrix::zeros(shape.0, shape.1);
                }
            }
        }
        added
            .term
            .evaluate_hessian(&arguments, scratch, &mut added.hessian)?
    } else {
        added.term.evaluate_gradient(&arguments, scratch)?
    };

    for (slot, (g, &index)) in scratch.iter().zip(&added.variables).enumerate() {
        let expected = variables[index].user_dimension;
        if g.len() != expected {
            return Err(TermError::new(format!(
                "gradient of variable {} has length {}, expected {}",
                slot,
                g.len(),
                expected
            )));
        }
    }
    if with_hessian {
        for (i, (row, &index0)) in added.hessian.iter().zip(&added.variables).enumerate() {
            if row.len() != added.variables.len() {
                return Err(TermError::new(format!(
                    "Hessian row {} has {} blocks, expected {}",
                    i,
                    row.len(),
                    added.variables.len()
                )));
            }
            for (j, (block, &index1)) in row.iter().zip(&added.variables).enumerate() {
                let expected = (
                    variables[index0].user_dimension,
                    variables[index1].user_dimension,
                );
                if block.shape() != expected {
                    return Err(TermError::new(format!(
                        "Hessian block ({}, {}) has shape {:?}, expected {:?}",
                        i,
                        j,
                        block.shape(),
                        expected
                    )));
                }
            }
        }
    }

    for (g, &index) in scratch.iter().zip(&added.variables) {
        let variable = &variables[index];
        let range = variable.global_range();
        variable.parameterization.update_gradient(
            &mut worker.gradient[range.clone()],
            &x[range],
            g.as_slice(),
        );
    }
    Ok(value)
}
