/*!
 * devgate Core
 *
 * This crate provides the data model, error taxonomy and value coercion
 * shared by every devgate driver and message bus.
 */

pub mod coercion;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// devgate core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
