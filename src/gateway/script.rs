//! Scripted Gateway
//!
//! Deterministic in-process gateway used by tests and dry runs. Responses
//! come either from a fixed queue or from a handler closure that inspects
//! the prompt, which is how stage tests emulate a live model.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::types::GatewayError;

use super::{GatewayResult, LlmGateway, SchemaDescriptor};

type Handler = Box<dyn Fn(&str, &SchemaDescriptor) -> GatewayResult<Value> + Send + Sync>;

enum Script {
    Queue(Mutex<VecDeque<GatewayResult<Value>>>),
    Handler(Handler),
}

pub struct ScriptedGateway {
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedGateway {
    /// Respond with the queued results in order; error once exhausted.
    pub fn queue(responses: Vec<GatewayResult<Value>>) -> Self {
        Self {
            script: Script::Queue(Mutex::new(responses.into())),
            calls: AtomicUsize::new(0),
        }
    }

    /// Compute each response from the prompt and schema.
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&str, &SchemaDescriptor) -> GatewayResult<Value> + Send + Sync + 'static,
    {
        Self {
            script: Script::Handler(Box::new(handler)),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail every call with the produced error.
    pub fn always_err<F>(make: F) -> Self
    where
        F: Fn() -> GatewayError + Send + Sync + 'static,
    {
        Self::with_handler(move |_, _| Err(make()))
    }

    /// Number of calls issued so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmGateway for ScriptedGateway {
    async fn call(&self, prompt: &str, schema: &SchemaDescriptor) -> GatewayResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Queue(queue) => {
                let next = queue
                    .lock()
                    .expect("scripted gateway queue poisoned")
                    .pop_front();
                match next {
                    Some(result) => result,
                    None => Err(GatewayError::Provider(
                        "scripted gateway exhausted".to_string(),
                    )),
                }
            }
            Script::Handler(handler) => handler(prompt, schema),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> SchemaDescriptor {
        SchemaDescriptor::new("t", json!({"type": "object"}))
    }

    #[tokio::test]
    async fn test_queue_order_and_exhaustion() {
        let gw = ScriptedGateway::queue(vec![Ok(json!({"n": 1})), Ok(json!({"n": 2}))]);
        assert_eq!(gw.call("a", &schema()).await.unwrap()["n"], 1);
        assert_eq!(gw.call("b", &schema()).await.unwrap()["n"], 2);
        assert!(gw.call("c", &schema()).await.is_err());
        assert_eq!(gw.calls(), 3);
    }

    #[tokio::test]
    async fn test_handler_sees_prompt() {
        let gw = ScriptedGateway::with_handler(|prompt, _| {
            Ok(json!({"echo": prompt.contains("needle")}))
        });
        assert_eq!(gw.call("has needle", &schema()).await.unwrap()["echo"], true);
        assert_eq!(gw.call("nothing", &schema()).await.unwrap()["echo"], false);
    }
}
