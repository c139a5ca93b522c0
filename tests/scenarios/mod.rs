mod capture_tests;
mod relay_tests;
