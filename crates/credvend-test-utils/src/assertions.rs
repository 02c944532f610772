//! Assertion helpers for vend results.

use std::fmt::Debug;
use std::sync::Arc;

use credvend::{CachedCredential, ErrorClass, VendError, VendResult};

/// Asserts `result` failed with an error of `class` and returns the error.
#[track_caller]
pub fn assert_error_class<T: Debug>(result: VendResult<T>, class: ErrorClass) -> VendError {
    match result {
        Ok(value) => panic!("expected {class:?} error, got Ok({value:?})"),
        Err(err) => {
            assert_eq!(err.class(), class, "unexpected error: {err}");
            err
        }
    }
}

/// Asserts every credential is the same allocation as the first.
#[track_caller]
pub fn assert_all_shared(credentials: &[Arc<CachedCredential>]) {
    let Some(first) = credentials.first() else {
        return;
    };
    for (i, credential) in credentials.iter().enumerate() {
        assert!(
            Arc::ptr_eq(first, credential),
            "credential {i} is a different allocation"
        );
    }
}
