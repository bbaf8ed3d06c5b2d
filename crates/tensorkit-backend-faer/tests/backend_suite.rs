tensorkit_backend_tests::define_backend_tests!(
    faer_backend,
    "faer",
    tensorkit_backend_faer::register_faer_backend
);
