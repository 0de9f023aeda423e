// Trestle - composable handler chains for async HTTP services
//
// Requests run through chains of handlers that share a layered,
// type-indexed registry. This crate re-exports the core pipeline and,
// behind the `testing` feature, the request fixture harness.

// Re-export core functionality
pub use trestle_core::*;

#[cfg(feature = "testing")]
pub use trestle_testing;
