pub mod matrix;
pub mod runner;
pub mod suite;

/// Expands to one test module per suite case, each running the case under both JIT modes with
/// and without validation on `$backend`. `$register` must make `$backend` resolvable by name.
#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $backend:expr, $register:expr) => {
        #[cfg(test)]
        mod $module {
            use $crate::runner::check_case;
            use tensorkit::JitPolicy;

            fn run(case: &str, jit: JitPolicy, validate: bool) {
                ($register)();
                if let Err(err) = check_case($backend, case, jit, validate) {
                    panic!("{err:#}");
                }
            }

            macro_rules! suite_case {
                ($name:ident) => {
                    mod $name {
                        use super::{run, JitPolicy};

                        #[test]
                        fn jit_all_validate() {
                            run(stringify!($name), JitPolicy::ForceCompiled, true);
                        }

                        #[test]
                        fn jit_all_no_validate() {
                            run(stringify!($name), JitPolicy::ForceCompiled, false);
                        }

                        #[test]
                        fn jit_none_validate() {
                            run(stringify!($name), JitPolicy::ForceEager, true);
                        }

                        #[test]
                        fn jit_none_no_validate() {
                            run(stringify!($name), JitPolicy::ForceEager, false);
                        }
                    }
                };
            }

            suite_case!(broadcast_add);
            suite_case!(unary_chain);
            suite_case!(binary_promotion);
            suite_case!(comparisons_and_logic);
            suite_case!(reductions);
            suite_case!(matmul_batched);
            suite_case!(shape_manipulation);
            suite_case!(seeded_random);
            suite_case!(value_and_grad);
            suite_case!(uniform_distribution);
            suite_case!(uniform_tensor_bounds);
            suite_case!(in_place_updates);
            suite_case!(nested_regions);
            suite_case!(shape_mismatch);
            suite_case!(integer_divide_by_zero);
            suite_case!(non_finite_output);
            suite_case!(data_dependent_branch);

            #[test]
            fn every_suite_case_is_listed() {
                let listed = [
                    "broadcast_add",
                    "unary_chain",
                    "binary_promotion",
                    "comparisons_and_logic",
                    "reductions",
                    "matmul_batched",
                    "shape_manipulation",
                    "seeded_random",
                    "value_and_grad",
                    "uniform_distribution",
                    "uniform_tensor_bounds",
                    "in_place_updates",
                    "nested_regions",
                    "shape_mismatch",
                    "integer_divide_by_zero",
                    "non_finite_output",
                    "data_dependent_branch",
                ];
                let known: Vec<&str> = $crate::suite::case_names().collect();
                assert_eq!(known, listed);
            }
        }
    };
}
