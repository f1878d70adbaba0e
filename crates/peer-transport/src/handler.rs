//! Inbound request handlers.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Serves one procedure for requests arriving on any connection.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Produce the response body, or an error message sent back to the caller.
    async fn handle(&self, body: Value) -> Result<Value, String>;
}

/// Replies with the request body and the identity of the node that served it.
#[derive(Debug, Clone)]
pub struct Echo {
    identity: String,
}

impl Echo {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }
}

#[async_trait]
impl Handler for Echo {
    async fn handle(&self, body: Value) -> Result<Value, String> {
        Ok(json!({ "peer": self.identity, "body": body }))
    }
}

/// Procedure name to handler table shared by every connection.
#[derive(Default)]
pub struct Handlers {
    table: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `procedure`, replacing any previous one.
    pub fn register(&self, procedure: impl Into<String>, handler: Arc<dyn Handler>) {
        self.table
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(procedure.into(), handler);
    }

    pub fn get(&self, procedure: &str) -> Option<Arc<dyn Handler>> {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(procedure)
            .cloned()
    }

    /// Run the handler for `procedure`.
    pub async fn dispatch(&self, procedure: &str, body: Value) -> Result<Value, String> {
        match self.get(procedure) {
            Some(handler) => handler.handle(body).await,
            None => Err(format!("No handler for procedure {procedure:?}")),
        }
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        let mut procedures: Vec<_> = table.keys().collect();
        procedures.sort();
        f.debug_struct("Handlers")
            .field("procedures", &procedures)
            .finish()
    }
}
