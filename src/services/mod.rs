//! Resource engine services.

pub mod causality_service;
pub mod check_service;
pub mod resource_service;
pub mod scanner;
pub mod scope_service;
pub mod tracker;
pub mod version_service;
