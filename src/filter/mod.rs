//! Filter metadata, coefficient loading and auto-selection.

pub mod config;
pub mod selector;

pub use config::{FilterConfig, load_coefficients};
pub use selector::{PhaseType, resolve_filter_path};
