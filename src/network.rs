//! The network boundary: the only place requests leave the engine.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::http::{Body, Request, Response};

/// Failure to obtain a response from the network.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  #[error("network request to {url} failed: {message}")]
  Network { url: String, message: String },

  #[error("network request to {url} timed out after {timeout:?}")]
  Timeout { url: String, timeout: Duration },

  #[error("invalid request: {0}")]
  InvalidRequest(String),

  #[error("{url} is unavailable offline and has no cached copy")]
  Offline { url: String },
}

impl FetchError {
  pub fn network(url: impl ToString, message: impl ToString) -> Self {
    FetchError::Network {
      url: url.to_string(),
      message: message.to_string(),
    }
  }
}

/// Anything that can turn a request into a response.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Run `fetch` as its own task and race it against `timeout`.
///
/// On timeout the fetch keeps running detached; its result is discarded.
pub async fn fetch_with_timeout<F>(
  url: &str,
  timeout: Duration,
  fetch: F,
) -> Result<Response, FetchError>
where
  F: Future<Output = Result<Response, FetchError>> + Send + 'static,
{
  let handle = tokio::spawn(fetch);
  match tokio::time::timeout(timeout, handle).await {
    Ok(Ok(result)) => result,
    Ok(Err(join_error)) => Err(FetchError::network(url, join_error)),
    Err(_) => Err(FetchError::Timeout {
      url: url.to_string(),
      timeout,
    }),
  }
}

/// reqwest-backed network.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("shelter/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| FetchError::InvalidRequest(format!("failed to build HTTP client: {e}")))?;
    Ok(Self { client })
  }

  fn build(&self, request: &Request) -> Result<reqwest::RequestBuilder, FetchError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| FetchError::InvalidRequest(format!("bad method {}: {e}", request.method)))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    builder = match &request.body {
      None => builder,
      Some(Body::Bytes(bytes)) => builder.body(bytes.clone()),
      Some(Body::Multipart(parts)) => {
        let mut form = reqwest::multipart::Form::new();
        for part in parts {
          let mut field = reqwest::multipart::Part::bytes(part.data.clone());
          if let Some(file_name) = &part.file_name {
            field = field.file_name(file_name.clone());
          }
          if let Some(content_type) = &part.content_type {
            field = field
              .mime_str(content_type)
              .map_err(|e| FetchError::InvalidRequest(format!("bad content type: {e}")))?;
          }
          form = form.part(part.name.clone(), field);
        }
        builder.multipart(form)
      }
    };

    Ok(builder)
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let response = self
      .build(request)?
      .send()
      .await
      .map_err(|e| FetchError::network(&request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
      })
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::network(&request.url, e))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}
