pub mod common;
mod redis_store_tests;
