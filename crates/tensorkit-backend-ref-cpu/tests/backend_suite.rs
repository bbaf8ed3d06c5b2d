tensorkit_backend_tests::define_backend_tests!(
    cpu_backend,
    "cpu",
    tensorkit_backend_ref_cpu::register_cpu_backend
);
