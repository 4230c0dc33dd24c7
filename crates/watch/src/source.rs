use async_trait::async_trait;
use fetcher::{FetchFailure, Fetched, Fetcher, PageRequest, RetryPolicy};

/// Anything that can produce a rendered page for a request.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(
        &self,
        request: &PageRequest,
        policy: &RetryPolicy,
    ) -> Result<Fetched, FetchFailure>;
}

#[async_trait]
impl PageSource for Fetcher {
    async fn fetch(
        &self,
        request: &PageRequest,
        policy: &RetryPolicy,
    ) -> Result<Fetched, FetchFailure> {
        Fetcher::fetch(self, request, policy).await
    }
}
