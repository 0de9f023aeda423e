// Assertions over handling results

use crate::HandlingResult;

/// Assert the result's status code.
pub fn assert_status(result: &HandlingResult, expected: u16) {
    let actual = result.status();
    assert_eq!(actual, expected, "Expected status {expected}, got {actual} ({:?})", result.outcome());
}

pub fn assert_header(result: &HandlingResult, name: &str, expected: &str) {
    let actual = result.header(name);
    assert_eq!(
        actual,
        Some(expected),
        "Expected header '{name}' to be '{expected}', got {actual:?}"
    );
}

pub fn assert_body_contains(result: &HandlingResult, expected: &str) {
    let body = result.body_text();
    assert!(
        body.contains(expected),
        "Expected body to contain '{expected}'. Body: {body}"
    );
}

/// Assert that the handler ended with `ctx.client_error(expected)`.
pub fn assert_client_error(result: &HandlingResult, expected: u16) {
    assert_eq!(
        result.client_error(),
        Some(expected),
        "Expected client error {expected}, got {:?}",
        result.outcome()
    );
}

pub fn assert_called_next(result: &HandlingResult) {
    assert!(
        result.called_next(),
        "Expected the chain to be exhausted, got {:?}",
        result.outcome()
    );
}
