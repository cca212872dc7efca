mod common;
mod job_tests;
mod proxy_pool_tests;
mod scheduler_tests;
