use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(url: &str) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post_json(url: &str, body: Vec<u8>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(body),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// HTTP client over `ureq`. `ureq` is blocking, so every request runs
/// inside `tokio::task::spawn_blocking`.
#[derive(Debug, Clone, Default)]
pub struct UreqHttpClient;

impl UreqHttpClient {
    pub fn new() -> Self {
        Self
    }

    fn run(request: HttpRequest) -> Result<HttpResponse> {
        let response = match request.method.as_str() {
            "GET" => {
                let mut builder = ureq::get(&request.url);
                for (key, value) in &request.headers {
                    builder = builder.header(key, value);
                }
                builder.call()?
            }
            "POST" => {
                let mut builder = ureq::post(&request.url);
                for (key, value) in &request.headers {
                    builder = builder.header(key, value);
                }
                builder.send(&request.body.unwrap_or_default()[..])?
            }
            method => anyhow::bail!("Unsupported HTTP method: {method}"),
        };

        let status_code = response.status().as_u16();
        let body = response.into_body().read_to_vec()?;
        Ok(HttpResponse { status_code, body })
    }
}

#[async_trait]
impl HttpClient for UreqHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        tokio::task::spawn_blocking(move || Self::run(request)).await?
    }
}
