//! Per-worker scratch space for term evaluation.
//!
//! Every worker owns a private value accumulator, a gradient accumulator
//! over the whole global vector and a gradient scratch for the term it is
//! currently evaluating. Workers never write to shared memory; their
//! results are combined sequentially after all of them have finished.
use nalgebra::DVector;
use tracing::debug;

use crate::error::{FunctionError, Result};
use crate::TermError;

pub(crate) struct Worker {
    pub value: f64,
    pub gradient: Vec<f64>,
    /// One entry per term slot, each as long as the largest variable.
    pub scratch: Vec<DVector<f64>>,
    fault: Option<(usize, TermError)>,
}

impl Worker {
    fn new(number_of_scalars: usize, max_arity: usize, max_dimension: usize) -> Self {
        Self {
            value: 0.,
            gradient: vec![0.; number_of_scalars],
            scratch: vec![DVector::zeros(max_dimension); max_arity],
            fault: None,
        }
    }

    /// Remember a failed term. Terms of a chunk are visited in order, so
    /// the first fault is the one with the lowest index.
    pub fn record_fault(&mut self, term: usize, error: TermError) {
        if self.fault.is_none() {
            self.fault = Some((term, error));
        }
    }
}

pub(crate) struct LocalStorage {
    workers: Vec<Worker>,
    allocated: bool,
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
}

impl LocalStorage {
    pub fn new() -> Self {
        Self {
            workers: vec![],
            allocated: false,
            #[cfg(feature = "parallel")]
            pool: None,
        }
    }

    /// Force reallocation before the next evaluation.
    pub fn invalidate(&mut self) {
        self.allocated = false;
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    pub fn allocate(
        &mut self,
        number_of_threads: usize,
        number_of_scalars: usize,
        max_arity: usize,
        max_dimension: usize,
    ) -> Result<()> {
        debug!(
            number_of_threads,
            number_of_scalars, max_arity, max_dimension, "allocating local storage"
        );
        self.workers = (0..number_of_threads)
            .map(|_| Worker::new(number_of_scalars, max_arity, max_dimension))
            .collect();
        #[cfg(feature = "parallel")]
        {
            let current = self.pool.as_ref().map(|pool| pool.current_num_threads());
            if number_of_threads <= 1 {
                self.pool = None;
            } else if current != Some(number_of_threads) {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(number_of_threads)
                    .build()
                    .map_err(|e| FunctionError::ThreadPool(e.to_string()))?;
                self.pool = Some(pool);
            }
        }
        self.allocated = true;
        Ok(())
    }

    /// Clear the accumulators of all workers.
    pub fn reset(&mut self, with_gradient: bool) {
        for worker in self.workers.iter_mut() {
            worker.value = 0.;
            worker.fault = None;
            if with_gradient {
                worker.gradient.fill(0.);
            }
        }
    }

    /// Sum of the values of all workers, or the fault of the lowest-indexed failed term.
    pub fn collect_value(&mut self) -> Result<f64> {
        let fault = self
            .workers
            .iter_mut()
            .filter_map(|worker| worker.fault.take())
            .min_by_key(|(term, _)| *term);
        if let Some((term, source)) = fault {
            debug!(term, error = %source, "term evaluation failed");
            return Err(FunctionError::TermFailed { term, source });
        }
        Ok(self.workers.iter().map(|worker| worker.value).sum())
    }

    /// Write the sum of the gradients of all workers to `gradient`.
    pub fn collect_gradient(&self, number_of_scalars: usize, gradient: &mut DVector<f64>) {
        if gradient.len() != number_of_scalars {
            *gradient = DVector::zeros(number_of_scalars);
        } else {
            gradient.fill(0.);
        }
        for worker in self.workers.iter() {
            for (g, w) in gradient.iter_mut().zip(worker.gradient.iter()) {
                *g += w;
            }
        }
    }
}

fn chunk_size(items: usize, workers: usize) -> usize {
    items.div_ceil(workers.max(1)).max(1)
}

cfg_if::cfg_if! {
    if #[cfg(feature = "parallel")] {
        use rayon::prelude::*;

        impl LocalStorage {
            /// Split `items` into one contiguous chunk per worker and run `f`
            /// on every chunk, in parallel when a pool is available.
            ///
            /// `f` receives the index of the first item of its chunk.
            pub fn dispatch<T, F>(&mut self, items: &mut [T], f: F)
            where
                T: Send,
                F: Fn(usize, &mut [T], &mut Worker) + Send + Sync,
            {
                let size = chunk_size(items.len(), self.workers.len());
                let workers = &mut self.workers;
                match &self.pool {
                    Some(pool) => pool.install(|| {
                        items
                            .par_chunks_mut(size)
                            .zip(workers.par_iter_mut())
                            .enumerate()
                            .for_each(|(chunk, (items, worker))| f(chunk * size, items, worker));
                    }),
                    None => {
                        for (chunk, (items, worker)) in
                            items.chunks_mut(size).zip(workers.iter_mut()).enumerate()
                        {
                            f(chunk * size, items, worker);
                        }
                    }
                }
            }
        }
    } else {
        impl LocalStorage {
            /// Split `items` into one contiguous chunk per worker and run `f`
            /// on every chunk.
            ///
            /// `f` receives the index of the first item of its chunk.
            pub fn dispatch<T, F>(&mut self, items: &mut [T], f: F)
            where
                F: Fn(usize, &mut [T], &mut Worker),
            {
                let size = chunk_size(items.len(), self.workers.len());
                for (chunk, (items, worker)) in
                    items.chunks_mut(size).zip(self.workers.iter_mut()).enumerate()
                {
                    f(chunk * size, items, worker);
                }
            }
        }
    }
}
