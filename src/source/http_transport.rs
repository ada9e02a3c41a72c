use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response};
use tracing::{debug, warn};

use super::traits::{BodyStream, Transport};
use crate::error::TransportError;

/// reqwest-backed transport. Timeouts and TLS come from the supplied client.
pub struct HttpTransport {
    client: Client,
    headers: Arc<RwLock<HashMap<String, String>>>,
}

impl HttpTransport {
    pub fn new(headers: HashMap<String, String>) -> Self {
        Self::with_client(Client::new(), headers)
    }

    pub fn with_client(client: Client, headers: HashMap<String, String>) -> Self {
        Self {
            client,
            headers: Arc::new(RwLock::new(headers)),
        }
    }

    /// Replace the extra request headers (e.g. after a credential refresh).
    pub fn update_headers(&self, new_headers: HashMap<String, String>) {
        *self.headers.write() = new_headers;
    }

    fn build_request(&self, url: &str) -> RequestBuilder {
        let headers = self.headers.read().clone();
        let mut req = self.client.get(url);
        for (k, v) in &headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_body() || err.is_decode() {
        TransportError::Body(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}

struct HttpBody {
    resp: Response,
}

#[async_trait]
impl BodyStream for HttpBody {
    fn content_length(&self) -> Option<u64> {
        self.resp.content_length()
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        match self.resp.chunk().await {
            Ok(chunk) => Ok(chunk),
            // Once headers are in, any failure is a broken body stream.
            Err(e) if e.is_timeout() => Err(TransportError::Timeout(e.to_string())),
            Err(e) => Err(TransportError::Body(e.to_string())),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &str) -> Result<Box<dyn BodyStream>, TransportError> {
        let resp = self.build_request(url).send().await.map_err(|e| {
            warn!("http fetch failed url={}: {}", url, e);
            classify(e)
        })?;

        let status = resp.status();
        debug!(
            "http fetch status={} url={} length={:?}",
            status.as_u16(),
            url,
            resp.content_length()
        );
        if !status.is_success() {
            warn!("http fetch rejected status={} url={}", status.as_u16(), url);
            return Err(TransportError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        Ok(Box::new(HttpBody { resp }))
    }
}
