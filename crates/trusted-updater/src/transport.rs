use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode, Url};

use crate::error::TransportError;

/// Stream of response body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// An opened download.
pub struct Download {
    /// Byte offset the body starts at: the requested offset when the server
    /// honoured the range, otherwise zero.
    pub offset: u64,
    pub stream: ByteStream,
}

/// Abstraction over fetching metadata and targets from the update server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open `url`, asking the server to start at byte `offset`.
    async fn open(&self, url: &Url, offset: u64) -> Result<Download, TransportError>;

    /// Fetch a whole document, refusing bodies larger than `limit` bytes.
    async fn fetch_bytes(&self, url: &Url, limit: u64) -> Result<Vec<u8>, TransportError> {
        let mut download = self.open(url, 0).await?;
        let mut body = Vec::new();
        while let Some(chunk) = download.stream.next().await {
            let chunk = chunk?;
            if body.len() as u64 + chunk.len() as u64 > limit {
                return Err(TransportError::TooLarge {
                    url: url.to_string(),
                    limit,
                });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// Builder for [`HttpTransport`].
#[derive(Default)]
pub struct HttpTransportBuilder {
    client: Option<Client>,
    request_timeout: Option<Duration>,
    user_agent: Option<String>,
}

impl HttpTransportBuilder {
    /// Provide a custom reqwest client instance. The request timeout still
    /// applies to responses; connection settings come from `client`.
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Bound connecting, waiting for the response headers and every gap
    /// between body chunks. A body that keeps flowing is never cut off; the
    /// overall fetch deadline covers total duration.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Build the transport.
    pub fn build(self) -> Result<HttpTransport, TransportError> {
        let client = match self.client {
            Some(client) => client,
            None => {
                let mut builder = Client::builder().user_agent(
                    self.user_agent
                        .unwrap_or_else(|| format!("trusted-updater/{}", env!("CARGO_PKG_VERSION"))),
                );
                if let Some(timeout) = self.request_timeout {
                    builder = builder.connect_timeout(timeout);
                }
                builder.build()?
            }
        };
        Ok(HttpTransport {
            client,
            idle_timeout: self.request_timeout,
        })
    }
}

/// Plain HTTP(S) transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    idle_timeout: Option<Duration>,
}

impl HttpTransport {
    /// Create a new builder.
    pub fn builder() -> HttpTransportBuilder {
        HttpTransportBuilder::default()
    }
}

/// Fail the stream when no chunk arrives within `idle`.
fn with_idle_timeout(body: ByteStream, url: String, idle: Duration) -> ByteStream {
    futures::stream::unfold(Some(body), move |state| {
        let url = url.clone();
        async move {
            let mut body = state?;
            match tokio::time::timeout(idle, body.next()).await {
                Ok(Some(chunk)) => Some((chunk, Some(body))),
                Ok(None) => None,
                Err(_) => Some((Err(TransportError::Stalled { url, idle }), None)),
            }
        }
    })
    .boxed()
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, url: &Url, offset: u64) -> Result<Download, TransportError> {
        let mut request = self.client.get(url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = match self.idle_timeout {
            Some(idle) => tokio::time::timeout(idle, request.send())
                .await
                .map_err(|_| TransportError::Stalled {
                    url: url.to_string(),
                    idle,
                })??,
            None => request.send().await?,
        };

        let offset = match response.status() {
            StatusCode::PARTIAL_CONTENT => offset,
            status if status.is_success() => 0,
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => {
                return Err(TransportError::NotFound {
                    url: url.to_string(),
                })
            }
            status => {
                return Err(TransportError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                })
            }
        };

        let mut stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed();
        if let Some(idle) = self.idle_timeout {
            stream = with_idle_timeout(stream, url.to_string(), idle);
        }
        Ok(Download { offset, stream })
    }
}
