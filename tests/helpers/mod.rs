#![allow(dead_code)]

pub mod app;
pub mod builders;
pub mod db;

pub use app::{header_str, json_body, TestApp, TEST_HOST};
pub use builders::{ClientBuilder, RedirectLocationBuilder, UserBuilder};
pub use db::{seed_bearer, TestDb};
