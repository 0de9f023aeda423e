//! Testing utilities for Trestle handlers.
//!
//! [`RequestFixture`] runs a handler or chain against a simulated request
//! and reports the first thing it did: send a response, render a value,
//! call `next` past the end of the chain, or raise a client or server
//! error.
//!
//! ```
//! use trestle_testing::*;
//! use trestle_core::handler;
//!
//! # tokio_test::block_on(async {
//! let result = RequestFixture::new()
//!     .uri("/users/42")
//!     .handle_chain(|chain| {
//!         chain.get("users/:id", handler(|ctx| async move {
//!             let id = ctx.path_tokens().get("id").unwrap_or_default().to_string();
//!             ctx.render(id).await
//!         }))
//!     })
//!     .await
//!     .unwrap();
//!
//! assert_eq!(result.rendered::<String>().map(String::as_str), Some("42"));
//! # });
//! ```
//!
//! Client errors are recorded rather than rendered:
//!
//! ```
//! use trestle_testing::*;
//! use trestle_core::handlers;
//!
//! # tokio_test::block_on(async {
//! let result = RequestFixture::new().handle(handlers::not_found()).await.unwrap();
//! assert_client_error(&result, 404);
//! # });
//! ```

mod assertions;
mod fixture;
mod result;

pub use assertions::{
    assert_body_contains, assert_called_next, assert_client_error, assert_header, assert_status,
};
pub use fixture::{DEFAULT_TIMEOUT, HarnessError, RequestFixture};
pub use result::{HandlingResult, Outcome};
