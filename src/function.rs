//! The objective function: registry of variables and terms.
use core::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nalgebra::{DMatrix, DVector};
use tracing::{debug, trace};

use crate::change_of_variables::Parameterization;
use crate::error::{FunctionError, Result};
use crate::{ChangeOfVariables, EvaluationStats, Term};

use storage::LocalStorage;

mod evaluate;
mod storage;

#[cfg(test)]
mod test_evaluate;

/// Source of the instance tags which make handles of different functions distinct.
static NEXT_FUNCTION: AtomicUsize = AtomicUsize::new(0);

/// Handle of a variable, returned when it is added to a [`Function`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariableId {
    function: usize,
    index: usize,
}

/// Handle of a term, returned when it is added to a [`Function`].
///
/// The index is the position of the term in evaluation order and is the
/// one reported by [`FunctionError::TermFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TermId(usize);

impl TermId {
    pub fn index(&self) -> usize {
        self.0
    }
}

struct AddedVariable {
    /// The value in user space, as last set by the user or by `copy_global_to_user`.
    value: Vec<f64>,
    user_dimension: usize,
    solver_dimension: usize,
    global_index: usize,
    /// Offset of the evaluation scratch of this variable in the local storage.
    local_index: usize,
    parameterization: Parameterization,
}

impl AddedVariable {
    fn global_range(&self) -> Range<usize> {
        self.global_index..self.global_index + self.solver_dimension
    }

    fn local_range(&self) -> Range<usize> {
        self.local_index..self.local_index + self.user_dimension
    }
}

struct AddedTerm {
    term: Arc<dyn Term>,
    /// Arena slots of the bound variables, in term order.
    variables: Vec<usize>,
    local_ranges: Vec<Range<usize>>,
    /// `hessian[i][j]` is the block of variables `i` and `j`. Empty if Hessians are disabled.
    hessian: Vec<Vec<DMatrix<f64>>>,
}

/// A sum of terms over a set of variables.
///
/// Variables are stacked into a single global vector which is what
/// optimization algorithms work with. Each variable occupies
/// `solver_dimension` consecutive scalars starting at its global index, in
/// the order the variables were added.
///
/// Terms are evaluated in parallel on a pool of `number_of_threads`
/// workers when the `parallel` feature is enabled.
pub struct Function {
    instance: usize,
    variables: Vec<AddedVariable>,
    terms: Vec<AddedTerm>,
    number_of_scalars: usize,
    /// User space values of all variables, the input of the terms.
    local: Vec<f64>,
    hessian_enabled: bool,
    number_of_threads: usize,
    storage: LocalStorage,
    /// Number of triplets produced by the last sparse assembly.
    number_of_hessian_elements: usize,
    stats: EvaluationStats,
}

impl Function {
    pub fn new() -> Self {
        let number_of_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            instance: NEXT_FUNCTION.fetch_add(1, Ordering::Relaxed),
            variables: vec![],
            terms: vec![],
            number_of_scalars: 0,
            local: vec![],
            hessian_enabled: true,
            number_of_threads,
            storage: LocalStorage::new(),
            number_of_hessian_elements: 0,
            stats: EvaluationStats::default(),
        }
    }

    /// Enable or disable storage for term Hessians.
    ///
    /// Without it, the function uses less memory but the Hessian
    /// evaluations fail.
    pub fn with_hessian_enabled(mut self, hessian_enabled: bool) -> Self {
        self.hessian_enabled = hessian_enabled;
        for added in self.terms.iter_mut() {
            added.hessian = if hessian_enabled {
                hessian_blocks(added.term.as_ref())
            } else {
                vec![]
            };
        }
        self
    }

    /// Set the number of worker threads used for evaluation.
    ///
    /// # Panics
    ///
    /// Panics if `$\mathtt{number\_of\_threads} = 0$`.
    pub fn with_number_of_threads(mut self, number_of_threads: usize) -> Self {
        assert!(number_of_threads > 0, "number_of_threads must be > 0");
        self.number_of_threads = number_of_threads;
        self.storage.invalidate();
        self
    }

    /// Set the number of worker threads used for evaluation.
    ///
    /// Fails and keeps the current setting if `number_of_threads` is zero.
    pub fn set_number_of_threads(&mut self, number_of_threads: usize) -> Result<()> {
        if number_of_threads == 0 {
            return Err(FunctionError::InvalidThreadCount(number_of_threads));
        }
        debug!(number_of_threads, "setting number of threads");
        self.number_of_threads = number_of_threads;
        self.storage.invalidate();
        Ok(())
    }

    pub fn number_of_threads(&self) -> usize {
        self.number_of_threads
    }

    pub fn is_hessian_enabled(&self) -> bool {
        self.hessian_enabled
    }

    /// Add a variable with initial value `value`.
    ///
    /// The dimension of the variable is `value.len()`.
    pub fn add_variable(&mut self, value: &[f64]) -> VariableId {
        self.register(value, Parameterization::Identity, value.len())
    }

    /// Add a variable which the solver sees through a change of variables.
    ///
    /// `value` is the initial value in user space and must have the user
    /// dimension of `change`.
    pub fn add_variable_with_change_of_variables(
        &mut self,
        value: &[f64],
        change: Box<dyn ChangeOfVariables>,
    ) -> Result<VariableId> {
        if change.user_dimension() != value.len() {
            return Err(FunctionError::DimensionMismatch {
                expected: change.user_dimension(),
                found: value.len(),
            });
        }
        let solver_dimension = change.solver_dimension();
        Ok(self.register(
            value,
            Parameterization::Changed(change),
            solver_dimension,
        ))
    }

    fn register(
        &mut self,
        value: &[f64],
        parameterization: Parameterization,
        solver_dimension: usize,
    ) -> VariableId {
        self.storage.invalidate();
        let index = self.variables.len();
        self.variables.push(AddedVariable {
            value: value.to_vec(),
            user_dimension: value.len(),
            solver_dimension,
            global_index: self.number_of_scalars,
            local_index: self.local.len(),
            parameterization,
        });
        self.local.extend_from_slice(value);
        self.number_of_scalars += solver_dimension;
        trace!(
            index,
            user_dimension = value.len(),
            solver_dimension,
            "added variable"
        );
        VariableId {
            function: self.instance,
            index,
        }
    }

    /// Replace the change of variables of a variable, or remove it with `None`.
    ///
    /// The position of the variable in the global vector is fixed, so the
    /// new transform must have the same user and solver dimensions as the
    /// old one. Nothing is changed if this fails.
    pub fn set_change_of_variables(
        &mut self,
        id: VariableId,
        change: Option<Box<dyn ChangeOfVariables>>,
    ) -> Result<()> {
        let index = self.index_of(id)?;
        let variable = &self.variables[index];
        let (user_dimension, solver_dimension) = match &change {
            Some(change) => (change.user_dimension(), change.solver_dimension()),
            None => (variable.user_dimension, variable.user_dimension),
        };
        if user_dimension != variable.user_dimension {
            return Err(FunctionError::DimensionMismatch {
                expected: variable.user_dimension,
                found: user_dimension,
            });
        }
        if solver_dimension != variable.solver_dimension {
            return Err(FunctionError::SolverDimensionMismatch {
                expected: variable.solver_dimension,
                found: solver_dimension,
            });
        }
        self.storage.invalidate();
        self.variables[index].parameterization = change.into();
        Ok(())
    }

    fn index_of(&self, id: VariableId) -> Result<usize> {
        if id.function != self.instance || id.index >= self.variables.len() {
            return Err(FunctionError::UnknownVariable);
        }
        Ok(id.index)
    }

    /// Add a term depending on `variables`.
    ///
    /// The variables must have been added to this function, and their
    /// number and dimensions must match what `term` expects. Nothing is
    /// changed if this fails.
    ///
    /// The same term may be added several times with different variables.
    pub fn add_term(&mut self, term: Arc<dyn Term>, variables: &[VariableId]) -> Result<TermId> {
        let arity = term.number_of_variables();
        if arity != variables.len() {
            return Err(FunctionError::ArityMismatch {
                expected: arity,
                found: variables.len(),
            });
        }
        let slots = variables
            .iter()
            .map(|&id| self.index_of(id))
            .collect::<Result<Vec<_>>>()?;
        for (slot, &index) in slots.iter().enumerate() {
            let expected = term.variable_dimension(slot);
            let found = self.variables[index].user_dimension;
            if expected != found {
                return Err(FunctionError::TermDimensionMismatch {
                    slot,
                    expected,
                    found,
                });
            }
        }

        self.storage.invalidate();
        let local_ranges = slots
            .iter()
            .map(|&index| self.variables[index].local_range())
            .collect();
        let hessian = if self.hessian_enabled {
            hessian_blocks(term.as_ref())
        } else {
            vec![]
        };
        self.terms.push(AddedTerm {
            term,
            variables: slots,
            local_ranges,
            hessian,
        });
        Ok(TermId(self.terms.len() - 1))
    }

    pub fn number_of_variables(&self) -> usize {
        self.variables.len()
    }

    /// Length of the global vector.
    pub fn number_of_scalars(&self) -> usize {
        self.number_of_scalars
    }

    pub fn number_of_terms(&self) -> usize {
        self.terms.len()
    }

    pub fn user_dimension(&self, id: VariableId) -> Result<usize> {
        Ok(self.variables[self.index_of(id)?].user_dimension)
    }

    pub fn solver_dimension(&self, id: VariableId) -> Result<usize> {
        Ok(self.variables[self.index_of(id)?].solver_dimension)
    }

    /// Offset of the variable in the global vector.
    pub fn global_index(&self, id: VariableId) -> Result<usize> {
        Ok(self.variables[self.index_of(id)?].global_index)
    }

    /// Current user space value of a variable.
    pub fn value(&self, id: VariableId) -> Result<&[f64]> {
        Ok(&self.variables[self.index_of(id)?].value)
    }

    pub fn set_value(&mut self, id: VariableId, value: &[f64]) -> Result<()> {
        let index = self.index_of(id)?;
        let variable = &mut self.variables[index];
        if value.len() != variable.user_dimension {
            return Err(FunctionError::DimensionMismatch {
                expected: variable.user_dimension,
                found: value.len(),
            });
        }
        variable.value.copy_from_slice(value);
        Ok(())
    }

    /// Write the user values of all variables into a global vector.
    ///
    /// `x` is resized to `number_of_scalars()` if necessary.
    pub fn copy_user_to_global(&mut self, x: &mut DVector<f64>) {
        let start = Instant::now();
        if x.len() != self.number_of_scalars {
            *x = DVector::zeros(self.number_of_scalars);
        }
        let x = x.as_mut_slice();
        for variable in self.variables.iter() {
            variable
                .parameterization
                .to_solver(&variable.value, &mut x[variable.global_range()]);
        }
        self.stats.copy_time += start.elapsed();
    }

    /// Set the user values of all variables from a global vector.
    pub fn copy_global_to_user(&mut self, x: &DVector<f64>) -> Result<()> {
        self.check_global_dimension(x.len())?;
        let start = Instant::now();
        let x = x.as_slice();
        for variable in self.variables.iter_mut() {
            let range = variable.global_range();
            variable
                .parameterization
                .to_user(&x[range], &mut variable.value);
        }
        self.stats.copy_time += start.elapsed();
        Ok(())
    }

    fn copy_global_to_local(&mut self, x: &DVector<f64>) {
        let start = Instant::now();
        let x = x.as_slice();
        for variable in self.variables.iter() {
            variable
                .parameterization
                .to_user(&x[variable.global_range()], &mut self.local[variable.local_range()]);
        }
        self.stats.copy_time += start.elapsed();
    }

    fn copy_user_to_local(&mut self) {
        let start = Instant::now();
        for variable in self.variables.iter() {
            self.local[variable.local_range()].copy_from_slice(&variable.value);
        }
        self.stats.copy_time += start.elapsed();
    }

    fn check_global_dimension(&self, found: usize) -> Result<()> {
        if found != self.number_of_scalars {
            return Err(FunctionError::GlobalDimensionMismatch {
                expected: self.number_of_scalars,
                found,
            });
        }
        Ok(())
    }

    /// Counters and timings of the evaluations so far.
    pub fn stats(&self) -> &EvaluationStats {
        &self.stats
    }

    /// Return the statistics collected so far and start over.
    pub fn reset_stats(&mut self) -> EvaluationStats {
        core::mem::take(&mut self.stats)
    }
}

fn hessian_blocks(term: &dyn Term) -> Vec<Vec<DMatrix<f64>>> {
    let arity = term.number_of_variables();
    (0..arity)
        .map(|i| {
            (0..arity)
                .map(|j| DMatrix::zeros(term.variable_dimension(i), term.variable_dimension(j)))
                .collect()
        })
        .collect()
}

impl Default for Function {
    fn default() -> Self {
        Self::new()
    }
}
