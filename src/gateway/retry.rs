//! Gateway Retry Combinator
//!
//! Retry policy is an explicit wrapper around gateway calls, not embedded in
//! stage code. Only `Timeout` and `RateLimited` are retried; malformed output
//! and provider errors surface immediately.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde_json::Value;
use tracing::warn;

use crate::types::GatewayError;

use super::{CallOptions, GatewayResult, LlmGateway, SchemaDescriptor};

/// Bounded exponential backoff policy for gateway calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum retry attempts after the initial call.
    pub max_retries: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
    }
}

/// Call the gateway, retrying retryable failures with backoff.
pub async fn call_with_retry(
    gateway: &dyn LlmGateway,
    prompt: &str,
    schema: &SchemaDescriptor,
    options: &CallOptions,
    policy: &RetryPolicy,
) -> GatewayResult<Value> {
    let op = || async { gateway.call_with(prompt, schema, options).await };
    op.retry(policy.builder())
        .when(GatewayError::is_retryable)
        .notify(|err: &GatewayError, dur: Duration| {
            warn!(
                gateway = gateway.name(),
                schema = %schema.name,
                "retrying after {} in {:?}",
                err.kind(),
                dur
            );
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ScriptedGateway;
    use serde_json::json;

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new("t", json!({"type": "object"}))
    }

    #[tokio::test]
    async fn test_retries_rate_limited_then_succeeds() {
        let gateway = ScriptedGateway::queue(vec![
            Err(GatewayError::RateLimited {
                retry_after: Some(Duration::from_millis(1)),
            }),
            Ok(json!({"ok": true})),
        ]);
        let policy = RetryPolicy {
            max_retries: 2,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let out = call_with_retry(&gateway, "p", &schema(), &CallOptions::default(), &policy)
            .await
            .unwrap();
        assert_eq!(out["ok"], true);
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test]
    async fn test_malformed_output_not_retried() {
        let gateway = ScriptedGateway::queue(vec![
            Err(GatewayError::MalformedOutput("bad".into())),
            Ok(json!({"ok": true})),
        ]);
        let policy = RetryPolicy {
            max_retries: 3,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let out =
            call_with_retry(&gateway, "p", &schema(), &CallOptions::default(), &policy).await;
        assert!(matches!(out, Err(GatewayError::MalformedOutput(_))));
        assert_eq!(gateway.calls(), 1);
    }

    #[tokio::test]
    async fn test_bounded_attempts() {
        let gateway = ScriptedGateway::always_err(|| GatewayError::Timeout(Duration::from_secs(1)));
        let policy = RetryPolicy {
            max_retries: 2,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let out =
            call_with_retry(&gateway, "p", &schema(), &CallOptions::default(), &policy).await;
        assert!(matches!(out, Err(GatewayError::Timeout(_))));
        // initial call + 2 retries
        assert_eq!(gateway.calls(), 3);
    }
}
