//! The single network call of the engine: fetching the project snapshot.
use std::{future::Future, sync::Arc};

use reqwest::{StatusCode, Url};

use crate::{
    cache::ConfigCache,
    snapshot::{ServerSnapshot, SnapshotResponse},
    Error, Result,
};

const DATA_ENDPOINT: &str = "/api/v1/data/";

/// Source of [`ServerSnapshot`]s for a project and environment.
pub trait SnapshotFetcher {
    /// Fetch the current snapshot.
    fn fetch_snapshot(
        &self,
        project_id: &str,
        environment: &str,
    ) -> impl Future<Output = Result<ServerSnapshot>> + Send;
}

/// Fetches snapshots from the delivery endpoint over HTTP.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    base_url: String,
}

impl HttpFetcher {
    /// Create a fetcher for the API hosted at `base_url`.
    pub fn new(base_url: impl Into<String>) -> HttpFetcher {
        HttpFetcher {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, project_id: &str, environment: &str) -> Result<Url> {
        Url::parse_with_params(
            &format!(
                "{}{}{}",
                self.base_url.trim_end_matches('/'),
                DATA_ENDPOINT,
                project_id
            ),
            &[("environment", environment)],
        )
        .map_err(Error::InvalidBaseUrl)
    }
}

impl SnapshotFetcher for HttpFetcher {
    fn fetch_snapshot(
        &self,
        project_id: &str,
        environment: &str,
    ) -> impl Future<Output = Result<ServerSnapshot>> + Send {
        let url = self.url(project_id, environment);
        let client = self.client.clone();

        async move {
            let url = url?;

            log::debug!(target: "abby", "fetching project data");
            let response = client.get(url).send().await?;

            let status = response.status();
            if status != StatusCode::OK {
                log::warn!(target: "abby", status = status.as_u16(); "received non-200 response while fetching project data");
                return Err(Error::UnexpectedStatus(status.as_u16()));
            }

            let snapshot: SnapshotResponse = response.json().await?;

            log::debug!(target: "abby", "successfully fetched project data");

            Ok(snapshot.into())
        }
    }
}

/// Consults a [`ConfigCache`] before delegating to another fetcher, and caches what it fetches.
pub struct CachingFetcher<F> {
    inner: F,
    cache: Arc<ConfigCache>,
}

impl<F> CachingFetcher<F> {
    /// Serve snapshots from `cache` and fall through to `inner` on a miss.
    pub fn new(inner: F, cache: Arc<ConfigCache>) -> CachingFetcher<F> {
        CachingFetcher { inner, cache }
    }
}

impl<F: SnapshotFetcher + Sync> SnapshotFetcher for CachingFetcher<F> {
    fn fetch_snapshot(
        &self,
        project_id: &str,
        environment: &str,
    ) -> impl Future<Output = Result<ServerSnapshot>> + Send {
        async move {
            let key = ConfigCache::key(project_id, environment);
            if let Some(snapshot) = self.cache.get(&key) {
                log::trace!(target: "abby", key = key.as_str(); "serving project data from cache");
                return Ok(snapshot.as_ref().clone());
            }

            let snapshot = self.inner.fetch_snapshot(project_id, environment).await?;
            self.cache.set(key, snapshot.clone());
            Ok(snapshot)
        }
    }
}
