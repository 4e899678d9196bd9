//! Embedded control templates
//!
//! Compiled into the binary from .hbs files at build time.

use tracing::debug;

/// SQL*Loader control file
pub const SQLLDR: &str = include_str!("../../templates/sqlldr.ctl.hbs");

/// Get the embedded template by name
pub fn get_embedded(name: &str) -> Option<&'static str> {
    debug!(%name, "get_embedded: called");
    match name {
        "sqlldr" => Some(SQLLDR),
        _ => None,
    }
}
