//! Message-type based dispatch.
//!
//! One dispatcher serves every connection created by a registry; protocol
//! modules register their routing tables once at startup and registration
//! is additive only.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};

use futures::future::BoxFuture;

use crate::{connection::Connection, error::AgentError, message::Message};

pub type HandlerFuture = BoxFuture<'static, Result<(), AgentError>>;

/// An async message handler bound to a message type.
pub type Handler = Arc<dyn Fn(Message, Arc<Connection>) -> HandlerFuture + Send + Sync>;

/// A protocol module exposing a routing table of handlers.
pub trait ProtocolModule {
    fn routes(&self) -> Vec<(String, Handler)>;
}

/// Wrap an async module method as a dispatcher handler.
pub fn module_handler<M, F, Fut>(module: &Arc<M>, f: F) -> Handler
where
    M: Send + Sync + 'static,
    F: Fn(Arc<M>, Message, Arc<Connection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AgentError>> + Send + 'static,
{
    let module = Arc::clone(module);
    Arc::new(move |message, connection| -> HandlerFuture {
        Box::pin(f(Arc::clone(&module), message, connection))
    })
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: Mutex<HashMap<String, Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, msg_type: impl Into<String>, handler: Handler) {
        self.handlers
            .lock()
            .expect("unpoisoned mutex")
            .insert(msg_type.into(), handler);
    }

    /// Register every route of a protocol module.
    pub fn add_module(&self, module: &dyn ProtocolModule) {
        for (msg_type, handler) in module.routes() {
            self.add_handler(msg_type, handler);
        }
    }

    pub async fn dispatch(
        &self,
        message: Message,
        connection: Arc<Connection>,
    ) -> Result<(), AgentError> {
        let handler = self
            .handlers
            .lock()
            .expect("unpoisoned mutex")
            .get(message.msg_type())
            .cloned()
            .ok_or_else(|| AgentError::UnknownMessageType(message.msg_type().to_owned()))?;

        trace!("dispatching message of type {}", message.msg_type());
        handler(message, connection).await
    }
}
