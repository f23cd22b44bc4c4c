pub mod common;
pub mod decision;
pub mod service;
