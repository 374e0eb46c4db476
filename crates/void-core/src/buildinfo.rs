//! Version and build information.
//!
//! `COMMIT` is injected at build time via the `VOID_COMMIT` environment
//! variable; the fallback keeps plain `cargo build` and tests working.

/// Crate version from Cargo metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Source commit the binary was built from, or `"unknown"`.
pub const COMMIT: &str = match option_env!("VOID_COMMIT") {
    Some(commit) => commit,
    None => "unknown",
};
