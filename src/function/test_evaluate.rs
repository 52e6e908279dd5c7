use std::sync::Arc;

use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};
use pcg_rand::Pcg64;
use rand::Rng;

use super::test_helpers::{
    Assigning, Distance, Failing, MisbehavingOnce, Misbehavior, MockCall, Product, Quadratic,
    SplitScalar, Square, SquaredNorm,
};
use crate::{
    differentiate_numerically, Bounded, ErrorKind, EvaluationStats, Function, FunctionError,
    GreaterThan, Interval, VariableId,
};

fn quadratic(threads: usize) -> (Function, Arc<Quadratic>) {
    let term = Arc::new(Quadratic::new());
    let mut function = Function::new().with_number_of_threads(threads);
    let a = function.add_variable(&[0.]);
    let b = function.add_variable(&[0.]);
    function.add_term(term.clone(), &[a, b]).unwrap();
    (function, term)
}

/// A chain of `n` variables of dimension 3 with random distance terms between neighbours.
fn chain(n: usize, threads: usize, rng: &mut Pcg64) -> (Function, DVector<f64>) {
    let mut function = Function::new().with_number_of_threads(threads);
    let variables: Vec<VariableId> = (0..n)
        .map(|_| function.add_variable(&[rng.gen(), rng.gen(), rng.gen()]))
        .collect();
    for pair in variables.windows(2) {
        let term = Distance {
            dimension: 3,
            weight: rng.gen_range(0.5..2.0),
        };
        function.add_term(Arc::new(term), pair).unwrap();
    }
    let mut x = DVector::zeros(0);
    function.copy_user_to_global(&mut x);
    (function, x)
}

#[test]
fn value_gradient_and_hessian() {
    let (mut function, term) = quadratic(1);
    let x = DVector::from_vec(vec![0., 0.]);
    assert_eq!(function.evaluate(&x).unwrap(), 1.);

    let mut gradient = DVector::zeros(0);
    let mut hessian = DMatrix::zeros(0, 0);
    let value = function
        .evaluate_with_hessian(&x, &mut gradient, &mut hessian)
        .unwrap();
    assert_eq!(value, 1.);
    assert_eq!(gradient.as_slice(), &[-2., 0.]);
    assert_eq!(hessian, DMatrix::from_row_slice(2, 2, &[22., -20., -20., 20.]));

    let x = DVector::from_vec(vec![2., 1.]);
    assert_eq!(function.evaluate_with_gradient(&x, &mut gradient).unwrap(), 11.);
    assert_eq!(gradient.as_slice(), &[22., -20.]);

    assert_eq!(
        term.calls(),
        [MockCall::Evaluate, MockCall::Hessian, MockCall::Gradient]
    );
}

#[test]
fn quadratic_with_one_and_four_threads() {
    let x = DVector::from_vec(vec![0., 0.]);
    let mut results = vec![];
    for threads in [1, 4] {
        let (mut function, _) = quadratic(threads);
        let mut gradient = DVector::zeros(0);
        let mut hessian = DMatrix::zeros(0, 0);
        let value = function
            .evaluate_with_hessian(&x, &mut gradient, &mut hessian)
            .unwrap();
        results.push((value, gradient, hessian));
    }
    assert_eq!(results[0], results[1]);
}

#[test]
fn evaluate_user_values_reads_the_variables() {
    let mut function = Function::new();
    let a = function.add_variable(&[2.]);
    let b = function.add_variable(&[1.]);
    function.add_term(Arc::new(Quadratic::new()), &[a, b]).unwrap();
    assert_eq!(function.evaluate_user_values().unwrap(), 11.);
    function.set_value(b, &[2.]).unwrap();
    assert_eq!(function.evaluate_user_values().unwrap(), 1.);
}

#[test]
fn empty_function() {
    let mut function = Function::new();
    let x = DVector::zeros(0);
    let mut gradient = DVector::from_vec(vec![1.]);
    assert_eq!(function.evaluate(&x).unwrap(), 0.);
    assert_eq!(function.evaluate_with_gradient(&x, &mut gradient).unwrap(), 0.);
    assert_eq!(gradient.len(), 0);
}

#[test]
fn unused_variables_have_zero_gradient() {
    let mut function = Function::new();
    let a = function.add_variable(&[1.]);
    function.add_variable(&[5., 6.]);
    let c = function.add_variable(&[2.]);
    function.add_term(Arc::new(Quadratic::new()), &[a, c]).unwrap();

    let mut x = DVector::zeros(0);
    function.copy_user_to_global(&mut x);
    let mut gradient = DVector::zeros(0);
    let mut hessian = DMatrix::zeros(0, 0);
    let value = function
        .evaluate_with_hessian(&x, &mut gradient, &mut hessian)
        .unwrap();
    assert_eq!(value, 10.);
    assert_eq!(gradient.as_slice(), &[-20., 0., 0., 20.]);
    for i in 0..4 {
        for j in 1..3 {
            assert_eq!(hessian[(i, j)], 0.);
            assert_eq!(hessian[(j, i)], 0.);
        }
    }
    assert_eq!(hessian[(0, 3)], -20.);
    assert_eq!(hessian[(3, 3)], 20.);
}

#[test]
fn global_vector_must_have_the_right_length() {
    let (mut function, _) = quadratic(1);
    let mut gradient = DVector::zeros(0);
    let x = DVector::zeros(3);
    assert!(matches!(
        function.evaluate(&x),
        Err(FunctionError::GlobalDimensionMismatch {
            expected: 2,
            found: 3
        })
    ));
    assert!(function.evaluate_with_gradient(&x, &mut gradient).is_err());
    assert!(function
        .evaluate_interval(&[Interval::point(0.)])
        .is_err());
}

#[test]
fn thread_count_does_not_change_results() {
    let (mut sequential, x) = chain(101, 1, &mut Pcg64::new_unseeded());
    let (mut parallel, _) = chain(101, 4, &mut Pcg64::new_unseeded());

    let mut g1 = DVector::zeros(0);
    let mut g4 = DVector::zeros(0);
    let mut h1 = DMatrix::zeros(0, 0);
    let mut h4 = DMatrix::zeros(0, 0);
    let f1 = sequential.evaluate_with_hessian(&x, &mut g1, &mut h1).unwrap();
    let f4 = parallel.evaluate_with_hessian(&x, &mut g4, &mut h4).unwrap();
    assert_relative_eq!(f1, f4, epsilon = 1e-12);
    assert_relative_eq!(g1, g4, epsilon = 1e-12);
    assert_eq!(h1, h4);
    assert_relative_eq!(
        sequential.evaluate(&x).unwrap(),
        parallel.evaluate(&x).unwrap(),
        epsilon = 1e-12
    );
}

#[test]
fn more_threads_than_terms() {
    let (mut function, _) = quadratic(16);
    let x = DVector::from_vec(vec![2., 1.]);
    let mut gradient = DVector::zeros(0);
    assert_eq!(function.evaluate(&x).unwrap(), 11.);
    assert_eq!(function.evaluate_with_gradient(&x, &mut gradient).unwrap(), 11.);
    assert_eq!(gradient.as_slice(), &[22., -20.]);
}

#[test]
fn first_failing_term_is_reported() {
    for threads in [1, 4] {
        let mut function = Function::new().with_number_of_threads(threads);
        let a = function.add_variable(&[1.]);
        for k in 0..12 {
            if k == 5 || k == 9 {
                let message = if k == 5 { "first" } else { "second" };
                function.add_term(Arc::new(Failing(message)), &[a]).unwrap();
            } else {
                function.add_term(Arc::new(Square), &[a]).unwrap();
            }
        }
        let x = DVector::from_vec(vec![1.]);
        let mut gradient = DVector::zeros(0);
        for result in [
            function.evaluate(&x),
            function.evaluate_with_gradient(&x, &mut gradient),
        ] {
            let error = result.unwrap_err();
            assert_eq!(error.kind(), ErrorKind::TermFault);
            match error {
                FunctionError::TermFailed { term, source } => {
                    assert_eq!(term, 5);
                    assert_eq!(source.message(), "first");
                }
                other => panic!("unexpected error {}", other),
            }
        }
    }
}

#[test]
fn function_recovers_after_a_fault() {
    let mut function = Function::new().with_number_of_threads(2);
    let a = function.add_variable(&[-1.]);
    function.add_term(Arc::new(Square), &[a]).unwrap();
    function
        .add_term(
            Arc::new(Distance {
                dimension: 1,
                weight: 1.,
            }),
            &[a, a],
        )
        .unwrap();
    let x = DVector::from_vec(vec![3.]);
    let mut gradient = DVector::zeros(0);
    let mut hessian = DMatrix::zeros(0, 0);
    // Square has no Hessian
    assert!(matches!(
        function.evaluate_with_hessian(&x, &mut gradient, &mut hessian),
        Err(FunctionError::TermFailed { term: 0, .. })
    ));
    assert_eq!(function.evaluate_with_gradient(&x, &mut gradient).unwrap(), 9.);
    assert_eq!(gradient.as_slice(), &[6.]);
}

#[test]
fn terms_of_mixed_dimensions_share_workers() {
    for threads in [1, 2] {
        let mut function = Function::new().with_number_of_threads(threads);
        let a = function.add_variable(&[3.]);
        let b = function.add_variable(&[1., -2., 0.5]);
        let c = function.add_variable(&[4., -1.]);
        function.add_term(Arc::new(Assigning), &[a]).unwrap();
        function.add_term(Arc::new(SquaredNorm(3)), &[b]).unwrap();
        function.add_term(Arc::new(Assigning), &[a]).unwrap();
        function.add_term(Arc::new(SquaredNorm(2)), &[c]).unwrap();
        function.add_term(Arc::new(SquaredNorm(3)), &[b]).unwrap();

        let mut x = DVector::zeros(0);
        function.copy_user_to_global(&mut x);
        let mut gradient = DVector::zeros(0);
        for _ in 0..2 {
            let value = function.evaluate_with_gradient(&x, &mut gradient).unwrap();
            assert_eq!(value, 18. + 2. * 5.25 + 17.);
            assert_eq!(gradient.as_slice(), &[12., 4., -8., 2., 8., -2.]);
        }
    }
}

#[test]
fn resized_gradient_is_a_term_fault() {
    for threads in [1, 2] {
        let mut function = Function::new().with_number_of_threads(threads);
        let a = function.add_variable(&[2.]);
        let b = function.add_variable(&[1., 1., 1.]);
        function.add_term(Arc::new(SquaredNorm(3)), &[b]).unwrap();
        function
            .add_term(Arc::new(MisbehavingOnce::new(Misbehavior::LongGradient)), &[a])
            .unwrap();
        function.add_term(Arc::new(SquaredNorm(3)), &[b]).unwrap();

        let mut x = DVector::zeros(0);
        function.copy_user_to_global(&mut x);
        let mut gradient = DVector::zeros(0);
        let error = function
            .evaluate_with_gradient(&x, &mut gradient)
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::TermFault);
        match error {
            FunctionError::TermFailed { term, source } => {
                assert_eq!(term, 1);
                assert!(source.message().contains("length 2, expected 1"));
            }
            other => panic!("unexpected error {}", other),
        }

        assert_eq!(function.evaluate_with_gradient(&x, &mut gradient).unwrap(), 10.);
        assert_eq!(gradient.as_slice(), &[4., 4., 4., 4.]);
    }
}

/// Two scalar variables, with the misbehaving term between two well-behaved ones.
fn misshaped_hessian(misbehavior: Misbehavior) -> (Function, DVector<f64>) {
    let mut function = Function::new().with_number_of_threads(2);
    let a = function.add_variable(&[2.]);
    let b = function.add_variable(&[-1.]);
    function.add_term(Arc::new(Quadratic::new()), &[a, b]).unwrap();
    function
        .add_term(Arc::new(MisbehavingOnce::new(misbehavior)), &[b])
        .unwrap();
    function.add_term(Arc::new(SquaredNorm(1)), &[a]).unwrap();
    let mut x = DVector::zeros(0);
    function.copy_user_to_global(&mut x);
    (function, x)
}

#[test]
fn misshaped_hessian_block_is_a_term_fault() {
    let expected_hessian = DMatrix::from_row_slice(2, 2, &[24., -20., -20., 22.]);
    for (misbehavior, message) in [
        (Misbehavior::LargeBlock, "has shape (2, 2), expected (1, 1)"),
        (Misbehavior::MissingBlocks, "Hessian row 0 has 0 blocks, expected 1"),
    ] {
        let (mut function, x) = misshaped_hessian(misbehavior);
        let mut gradient = DVector::zeros(0);
        let mut hessian = DMatrix::zeros(0, 0);
        match function.evaluate_with_hessian(&x, &mut gradient, &mut hessian) {
            Err(FunctionError::TermFailed { term, source }) => {
                assert_eq!(term, 1);
                assert!(source.message().contains(message), "{}", source.message());
            }
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
        let value = function
            .evaluate_with_hessian(&x, &mut gradient, &mut hessian)
            .unwrap();
        assert_eq!(value, 91. + 1. + 4.);
        assert_eq!(gradient.as_slice(), &[66., -62.]);
        assert_eq!(hessian, expected_hessian);

        let (mut function, x) = misshaped_hessian(misbehavior);
        assert!(matches!(
            function.evaluate_with_sparse_hessian(&x, &mut gradient),
            Err(FunctionError::TermFailed { term: 1, .. })
        ));
        let (value, sparse) = function
            .evaluate_with_sparse_hessian(&x, &mut gradient)
            .unwrap();
        assert_eq!(value, 96.);
        let dense = sparse.as_ref().to_dense();
        for i in 0..2 {
            for j in 0..2 {
                assert_eq!(dense[(i, j)], expected_hessian[(i, j)]);
            }
        }
    }
}

#[test]
fn hessian_can_be_disabled() {
    let mut function = Function::new().with_hessian_enabled(false);
    let a = function.add_variable(&[0.]);
    let b = function.add_variable(&[0.]);
    function.add_term(Arc::new(Quadratic::new()), &[a, b]).unwrap();

    let x = DVector::from_vec(vec![2., 1.]);
    let mut gradient = DVector::zeros(0);
    let mut hessian = DMatrix::zeros(0, 0);
    let error = function
        .evaluate_with_hessian(&x, &mut gradient, &mut hessian)
        .unwrap_err();
    assert!(matches!(error, FunctionError::HessianDisabled));
    assert_eq!(error.kind(), ErrorKind::NotSupported);
    assert!(matches!(
        function.evaluate_with_sparse_hessian(&x, &mut gradient),
        Err(FunctionError::HessianDisabled)
    ));
    assert_eq!(function.evaluate_with_gradient(&x, &mut gradient).unwrap(), 11.);
}

#[test]
fn hessian_enabled_after_adding_terms() {
    let (function, _) = quadratic(1);
    let mut function = function.with_hessian_enabled(false).with_hessian_enabled(true);
    let x = DVector::from_vec(vec![0., 0.]);
    let mut gradient = DVector::zeros(0);
    let mut hessian = DMatrix::zeros(0, 0);
    function
        .evaluate_with_hessian(&x, &mut gradient, &mut hessian)
        .unwrap();
    assert_eq!(hessian[(0, 0)], 22.);
}

#[test]
fn hessian_rejects_changed_variables() {
    let mut function = Function::new();
    let a = function
        .add_variable_with_change_of_variables(&[1.], Box::new(GreaterThan::new(1, 0.)))
        .unwrap();
    let b = function.add_variable(&[0.]);
    function.add_term(Arc::new(Quadratic::new()), &[a, b]).unwrap();

    let mut x = DVector::zeros(0);
    function.copy_user_to_global(&mut x);
    let mut gradient = DVector::zeros(0);
    let mut hessian = DMatrix::zeros(0, 0);
    let error = function
        .evaluate_with_hessian(&x, &mut gradient, &mut hessian)
        .unwrap_err();
    assert!(matches!(error, FunctionError::ChangeOfVariablesUnsupported(_)));
    assert_eq!(error.kind(), ErrorKind::NotSupported);
    assert!(function.evaluate_with_sparse_hessian(&x, &mut gradient).is_err());
    assert!(function
        .evaluate_interval(&[Interval::point(0.), Interval::point(0.)])
        .is_err());

    function.set_change_of_variables(a, None).unwrap();
    function.copy_user_to_global(&mut x);
    function
        .evaluate_with_hessian(&x, &mut gradient, &mut hessian)
        .unwrap();
}

#[test]
fn sparse_hessian_matches_dense() {
    let mut function = Function::new().with_number_of_threads(3);
    let a = function.add_variable(&[0.5, -1.]);
    let b = function.add_variable(&[1., 2., 3.]);
    let c = function.add_variable(&[0.25, 0.5]);
    let s = function.add_variable(&[2.]);
    let t = function.add_variable(&[-1.]);
    function.add_term(Arc::new(Product), &[a, b]).unwrap();
    function.add_term(Arc::new(Product), &[c, b]).unwrap();
    function
        .add_term(
            Arc::new(Distance {
                dimension: 2,
                weight: 3.,
            }),
            &[a, c],
        )
        .unwrap();
    function.add_term(Arc::new(Quadratic::new()), &[s, t]).unwrap();

    let mut x = DVector::zeros(0);
    function.copy_user_to_global(&mut x);
    let mut gradient = DVector::zeros(0);
    let mut dense = DMatrix::zeros(0, 0);
    let value = function
        .evaluate_with_hessian(&x, &mut gradient, &mut dense)
        .unwrap();
    let mut sparse_gradient = DVector::zeros(0);
    let (sparse_value, sparse) = function
        .evaluate_with_sparse_hessian(&x, &mut sparse_gradient)
        .unwrap();
    assert_eq!(value, sparse_value);
    assert_eq!(gradient, sparse_gradient);

    let n = function.number_of_scalars();
    assert_eq!((sparse.nrows(), sparse.ncols()), (n, n));
    let converted = sparse.as_ref().to_dense();
    for i in 0..n {
        for j in 0..n {
            assert_relative_eq!(converted[(i, j)], dense[(i, j)]);
        }
    }
    // shared variable b collects both Product terms
    assert_eq!(dense[(0, 2)], 1.);
    assert_eq!(dense[(2, 2)], 0.);
    assert_eq!(dense[(0, 0)], 2. + 6.);
}

#[test]
fn sparse_pattern_covers_all_blocks() {
    let mut function = Function::new();
    let a = function.add_variable(&[0.]);
    function.add_variable(&[0., 0.]);
    let c = function.add_variable(&[0.]);
    function
        .add_term(
            Arc::new(Distance {
                dimension: 1,
                weight: 1.,
            }),
            &[a, c],
        )
        .unwrap();
    function.add_term(Arc::new(Quadratic::new()), &[a, c]).unwrap();

    let pattern = function.sparse_hessian_pattern().unwrap().as_ref().to_dense();
    for i in 0..4 {
        for j in 0..4 {
            let expected = match (i, j) {
                (0 | 3, 0 | 3) => 2.,
                _ => 0.,
            };
            assert_eq!(pattern[(i, j)], expected);
        }
    }
}

#[test]
fn sparse_pattern_rejects_changed_variables() {
    let mut function = Function::new();
    let a = function
        .add_variable_with_change_of_variables(&[1.], Box::new(SplitScalar))
        .unwrap();
    let b = function.add_variable(&[0.]);
    function.add_term(Arc::new(Quadratic::new()), &[a, b]).unwrap();
    assert_eq!(function.number_of_scalars(), 3);

    let error = function.sparse_hessian_pattern().unwrap_err();
    assert!(matches!(error, FunctionError::ChangeOfVariablesUnsupported(_)));
    assert_eq!(error.kind(), ErrorKind::NotSupported);

    // an unused transform does not matter
    let mut function = Function::new();
    function
        .add_variable_with_change_of_variables(&[1.], Box::new(SplitScalar))
        .unwrap();
    let b = function.add_variable(&[0.]);
    function.add_term(Arc::new(Square), &[b]).unwrap();
    let pattern = function.sparse_hessian_pattern().unwrap().as_ref().to_dense();
    assert_eq!(pattern[(2, 2)], 1.);
    assert_eq!(pattern[(0, 0)], 0.);
}

#[test]
fn interval_encloses_the_values() {
    let (mut function, term) = quadratic(1);
    let range = function
        .evaluate_interval(&[Interval::new(0., 1.), Interval::new(0., 1.)])
        .unwrap();
    assert_eq!(range, Interval::new(0., 11.));
    assert_eq!(term.calls(), [MockCall::Interval]);

    let mut rng = Pcg64::new_unseeded();
    for _ in 0..100 {
        let x = DVector::from_vec(vec![rng.gen(), rng.gen()]);
        assert!(range.contains(function.evaluate(&x).unwrap()));
    }

    let point = function
        .evaluate_interval(&[Interval::point(2.), Interval::point(1.)])
        .unwrap();
    assert_eq!(point, Interval::point(11.));
}

#[test]
fn interval_requires_term_support() {
    let mut function = Function::new();
    let a = function.add_variable(&[0.]);
    function.add_term(Arc::new(Quadratic::new()), &[a, a]).unwrap();
    function.add_term(Arc::new(Square), &[a]).unwrap();
    assert!(matches!(
        function.evaluate_interval(&[Interval::new(-1., 1.)]),
        Err(FunctionError::TermFailed { term: 1, .. })
    ));
}

#[test]
fn gradient_through_changes_of_variables() {
    let mut function = Function::new().with_number_of_threads(2);
    let a = function
        .add_variable_with_change_of_variables(&[1.5], Box::new(GreaterThan::new(1, 1.)))
        .unwrap();
    let b = function
        .add_variable_with_change_of_variables(&[0.2], Box::new(Bounded::new(1, -1., 1.)))
        .unwrap();
    let c = function
        .add_variable_with_change_of_variables(&[-0.7], Box::new(SplitScalar))
        .unwrap();
    function.add_term(Arc::new(Quadratic::new()), &[a, b]).unwrap();
    function.add_term(Arc::new(Quadratic::new()), &[c, a]).unwrap();
    assert_eq!(function.number_of_scalars(), 4);

    let mut x = DVector::zeros(0);
    function.copy_user_to_global(&mut x);
    x[3] = 0.3;
    let mut gradient = DVector::zeros(0);
    let value = function.evaluate_with_gradient(&x, &mut gradient).unwrap();
    assert_relative_eq!(value, function.evaluate(&x).unwrap());

    let numeric = differentiate_numerically(&mut function, &x).unwrap();
    assert_relative_eq!(gradient, numeric, epsilon = 1e-6, max_relative = 1e-7);
    // both solver scalars of the split variable see the same derivative
    assert_relative_eq!(gradient[2], gradient[3]);
}

#[test]
fn differentiate_numerically_reports_failures() {
    let mut function = Function::new();
    let a = function.add_variable(&[1.]);
    function.add_term(Arc::new(Failing("nope")), &[a]).unwrap();
    assert!(matches!(
        differentiate_numerically(&mut function, &DVector::from_vec(vec![1.])),
        Err(FunctionError::TermFailed { term: 0, .. })
    ));
}

#[test]
fn stats_count_evaluations() {
    let (mut function, _) = quadratic(2);
    let x = DVector::from_vec(vec![2., 1.]);
    let mut gradient = DVector::zeros(0);
    let mut hessian = DMatrix::zeros(0, 0);
    function.evaluate(&x).unwrap();
    function.evaluate(&x).unwrap();
    function.evaluate_with_gradient(&x, &mut gradient).unwrap();
    function
        .evaluate_with_hessian(&x, &mut gradient, &mut hessian)
        .unwrap();
    function
        .evaluate_interval(&[Interval::point(2.), Interval::point(1.)])
        .unwrap();

    let stats = function.reset_stats();
    assert_eq!(stats.evaluations_without_gradient, 3);
    assert_eq!(stats.evaluations_with_gradient, 2);
    assert!(stats.to_string().contains("evaluations with gradient    : 2"));
    assert_eq!(function.stats().evaluations_with_gradient, 0);
    assert_eq!(*function.stats(), EvaluationStats::default());
}
