use async_trait::async_trait;

use super::ClientCacheError;
use super::entry::{CachedResponse, FetchRequest};

/// Network side of the response cache.
///
/// Non-2xx responses are returned as responses, not errors; only transport
/// failures are errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<CachedResponse, ClientCacheError>;
}

#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn network_error(request: &FetchRequest, err: reqwest::Error) -> ClientCacheError {
    ClientCacheError::Network {
        url: request.url.to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<CachedResponse, ClientCacheError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder
            .send()
            .await
            .map_err(|err| network_error(request, err))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| network_error(request, err))?;

        Ok(CachedResponse {
            status,
            headers,
            body,
        })
    }
}
