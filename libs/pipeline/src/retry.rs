use std::future::Future;

use bridge_api::{BridgeError, ErrorKind, RetryPolicy};

/// Итог ограниченного ретрая.
#[derive(Debug)]
pub(crate) enum RetryError {
    /// Ошибка не `Retriable` — повтор не поможет.
    Permanent(BridgeError),
    /// Попытки кончились; последняя ошибка.
    Exhausted { last: BridgeError, attempts: u32 },
}

/// Выполнять `op`, пока он падает с `Retriable`-ошибкой и политика
/// разрешает ещё попытку. Между попытками экспоненциальный backoff.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BridgeError>>,
{
    let mut attempts = 0;
    loop {
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        attempts += 1;
        if error.kind() != ErrorKind::Retriable {
            return Err(RetryError::Permanent(error));
        }
        if !policy.allows(attempts) {
            return Err(RetryError::Exhausted { last: error, attempts });
        }
        let delay = policy.backoff(attempts - 1);
        tracing::warn!(operation, attempt = attempts, ?delay, error = %error, "retrying");
        tokio::time::sleep(delay).await;
    }
}
