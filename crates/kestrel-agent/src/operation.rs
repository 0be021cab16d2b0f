//! Waiting on operation handles.

use crate::session::Session;
use crate::{AgentError, Result};
use kestrel_host::Operation;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::Instant;

/// Poll `operation` until it is done or `timeout` elapses.
///
/// A failed operation becomes [`AgentError::OperationFailed`], except 404
/// failures which mean the target has not propagated yet. Expiry abandons the
/// operation locally and surfaces as a retryable timeout.
pub async fn wait_for_operation(
    session: &Session,
    operation: Operation,
    timeout: Duration,
) -> Result<Operation> {
    let deadline = Instant::now() + timeout;
    let poll = session.environment().poll_interval;
    let mut operation = operation;

    loop {
        if operation.done {
            return match operation.error {
                None => Ok(operation),
                Some(err) if err.code == 404 => Err(AgentError::PropagationNotYetVisible(format!(
                    "operation {}: {}",
                    operation.name, err.message
                ))),
                Some(err) => Err(AgentError::OperationFailed {
                    operation: operation.name,
                    code: err.code,
                    message: err.message,
                }),
            };
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(AgentError::OperationTimeout {
                operation: operation.name,
                done: operation.done,
                waited: timeout,
            });
        }
        tokio::time::sleep(poll.min(deadline - now)).await;

        operation = session
            .host()
            .operation(session.controller(), &operation.name)
            .await?;
    }
}

/// Decode the response of a completed operation.
pub fn response<T: DeserializeOwned>(operation: &Operation) -> Result<T> {
    let value = operation.response.clone().ok_or_else(|| {
        AgentError::SchemaMismatch(format!("operation {} has no response", operation.name))
    })?;
    serde_json::from_value(value).map_err(|e| {
        AgentError::SchemaMismatch(format!(
            "unexpected response from operation {}: {e}",
            operation.name
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use kestrel_core::{KeyEvent, Passcode, SignedEvent};
    use kestrel_host::{HostingService, MemoryHost};
    use std::sync::Arc;

    async fn session(host: Arc<MemoryHost>) -> Session {
        Session::connect(host, &Passcode::generate(), AgentConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let host = Arc::new(MemoryHost::default());
        host.network().set_receipt_lag(u32::MAX);
        let session = session(host.clone()).await;

        let (current, next) = session.signers("slow");
        let icp = KeyEvent::inception(&[&current], &[&next]).unwrap();
        let signed = SignedEvent::sign(icp, &[&current]).unwrap();
        let op = host.incept(session.controller(), "slow", signed).await.unwrap();

        let err = wait_for_operation(&session, op, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::OperationTimeout { done: false, .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_failed_operations() {
        let host = Arc::new(MemoryHost::default());
        let session = session(host).await;

        let missing = Operation::failed("oobi.1", 404, "no key event log");
        assert!(matches!(
            wait_for_operation(&session, missing, Duration::from_secs(1)).await,
            Err(AgentError::PropagationNotYetVisible(_))
        ));

        let broken = Operation::failed("query.1", 422, "bad signature");
        assert!(matches!(
            wait_for_operation(&session, broken, Duration::from_secs(1)).await,
            Err(AgentError::OperationFailed { code: 422, .. })
        ));
    }

    #[test]
    fn test_response_shape_is_checked() {
        let op = Operation::completed("witness.1", serde_json::json!({"unexpected": true}));
        let result: Result<kestrel_host::IdentifierRecord> = response(&op);
        assert!(matches!(result, Err(AgentError::SchemaMismatch(_))));
    }
}
