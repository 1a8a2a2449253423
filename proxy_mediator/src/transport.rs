//! Outbound message transport.
//!
//! Packed messages leave the process through a [`MessageTransport`]. The
//! HTTP implementation posts to the target endpoint and hands back a
//! response body when the peer answered on the same connection (the
//! return-route convention).

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("invalid endpoint `{endpoint}`")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: url::ParseError,
    },
    #[error("error sending message")]
    Send(#[from] reqwest::Error),
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Deliver `packed` to `endpoint`. A returned body is the peer's
    /// same-connection reply and must be processed as an inbound message.
    async fn send_message(
        &self,
        endpoint: &str,
        packed: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, TransportError>;
}

#[derive(Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageTransport for HttpTransport {
    async fn send_message(
        &self,
        endpoint: &str,
        packed: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let url = Url::parse(endpoint).map_err(|source| TransportError::InvalidEndpoint {
            endpoint: endpoint.to_owned(),
            source,
        })?;
        debug!("sending packed message to endpoint `{url}`");

        let response = self
            .client
            .post(url)
            .body(packed)
            .header(CONTENT_TYPE, "application/ssi-agent-wire")
            .header(USER_AGENT, "proxy-mediator")
            .send()
            .await?;

        debug!("endpoint answered with status `{}`", response.status());

        let body = response.bytes().await?;
        if body.is_empty() {
            Ok(None)
        } else {
            Ok(Some(body.to_vec()))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Discards every message; stands in where delivery is irrelevant.
    pub(crate) struct NullTransport;

    #[async_trait]
    impl MessageTransport for NullTransport {
        async fn send_message(
            &self,
            _endpoint: &str,
            _packed: Vec<u8>,
        ) -> Result<Option<Vec<u8>>, TransportError> {
            Ok(None)
        }
    }
}
