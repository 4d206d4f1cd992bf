//! Version information for volley.

/// Volley version from Cargo.toml
pub const VOLLEY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// User agent sent by the default transport unless the request overrides it.
pub fn default_user_agent() -> String {
    format!("volley/{}", VOLLEY_VERSION)
}
