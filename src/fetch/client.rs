use async_trait::async_trait;
use reqwest::{Request, Response};

/// Executes a prepared request. The seam lets tests answer with canned
/// responses instead of calling the live feed.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
