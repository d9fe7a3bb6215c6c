use async_trait::async_trait;
use loadwatch_core::{FetchRequest, FetchResponse, Fetcher, Method, TransportError};
use reqwest::Client;

/// Network primitive backed by a shared `reqwest::Client`.
pub struct ReqwestFetcher {
    client: Client,
}

impl ReqwestFetcher {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransportError> {
        let url = request.url.clone();
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::new(&url, e.to_string()))?;
        let status = response.status();
        let final_url = response.url().to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::new(&url, e.to_string()))?;

        Ok(FetchResponse::new(final_url, status.as_u16(), body.to_vec())
            .with_status_text(status.canonical_reason().unwrap_or("")))
    }
}
