mod forwarding_tests;
mod lifecycle_tests;
