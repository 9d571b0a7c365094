//! Test utilities for the deferral workspace
//!
//! Provides mock device objects, request builders and timeout helpers shared
//! by the test suites of every crate.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_owner, create_mock_request};
//!
//! let owner = create_mock_owner("hub0");
//! assert_eq!(owner.name(), "hub0");
//!
//! let (request, _waiter) = create_mock_request(1);
//! assert_eq!(request.id().0, 1);
//! ```

use bytes::Bytes;
use interface::{CompletionWaiter, DeviceObject, OwnerRef, Request, RequestId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimal device object for tests
#[derive(Debug)]
pub struct MockDevice {
    name: String,
}

impl MockDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl DeviceObject for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Create a shared mock owner
pub fn create_mock_owner(name: &str) -> OwnerRef {
    Arc::new(MockDevice::new(name))
}

/// Create a mock request with a small payload derived from its ID
pub fn create_mock_request(id: u64) -> (Request, CompletionWaiter) {
    let payload = Bytes::from(id.to_le_bytes().to_vec());
    Request::new(RequestId(id), (id % 16) as u8, payload)
}

/// Create `count` mock requests with IDs starting at 1
pub fn create_mock_requests(count: u64) -> Vec<(Request, CompletionWaiter)> {
    (1..=count).map(create_mock_request).collect()
}

/// Timeout wrapper for async tests
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let completion = with_timeout(DEFAULT_TEST_TIMEOUT, waiter.wait()).await.unwrap();
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Poll `condition` until it holds or `timeout` elapses (blocking)
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
