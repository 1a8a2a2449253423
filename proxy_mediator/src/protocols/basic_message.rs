//! Basic-Message protocol: log inbound messages and keep the last one.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::{
    connection::Connection,
    dispatch::{module_handler, Handler, ProtocolModule},
    error::AgentError,
    message::{message_type, Message},
};

fn basic_message_type(name: &str) -> String {
    message_type("basicmessage", "1.0", name)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceivedMessage {
    #[serde(default)]
    pub sent_time: Option<String>,
    pub content: String,
}

#[derive(Default)]
pub struct BasicMessage {
    last: Mutex<Option<ReceivedMessage>>,
}

impl BasicMessage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_message(&self) -> Option<ReceivedMessage> {
        self.last.lock().expect("unpoisoned mutex").clone()
    }

    async fn handle_message(
        self: Arc<Self>,
        message: Message,
        connection: Arc<Connection>,
    ) -> Result<(), AgentError> {
        let received: ReceivedMessage = message.decode()?;
        info!(
            "basic message from {}: {}",
            connection.verkey_b58(),
            received.content
        );
        *self.last.lock().expect("unpoisoned mutex") = Some(received);
        Ok(())
    }
}

impl ProtocolModule for Arc<BasicMessage> {
    fn routes(&self) -> Vec<(String, Handler)> {
        vec![(
            basic_message_type("message"),
            module_handler(self, BasicMessage::handle_message),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dispatch::Dispatcher, test_init, transport::testing::NullTransport};

    #[tokio::test]
    async fn stores_last_received_message() {
        test_init();
        let module = BasicMessage::new();
        let connection = Connection::random(
            None,
            Arc::new(Dispatcher::new()),
            Arc::new(NullTransport),
            false,
        );

        let message = Message::build(
            basic_message_type("message"),
            &ReceivedMessage {
                sent_time: Some("2021-01-01T00:00:00Z".to_owned()),
                content: "hello there".to_owned(),
            },
        )
        .unwrap();

        Arc::clone(&module)
            .handle_message(message, connection)
            .await
            .unwrap();
        assert_eq!(
            module.last_message().map(|m| m.content),
            Some("hello there".to_owned())
        );
    }
}
