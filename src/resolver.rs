use std::time::Duration;

use reqwest::Client;
use reqwest::redirect::Policy;
use tracing::{info, warn};
use url::Url;

const SHARE_LINK_MARKER: &str = "/share/r/";
const RESOLVE_TIMEOUT_SECONDS: u64 = 5;

/// Follows share-link redirects to the canonical video URL.
///
/// Resolution is best-effort: anything that fails falls back to the
/// original input so the downloader still gets a chance at it.
pub struct ShareLinkResolver {
    client: Client,
}

impl ShareLinkResolver {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(RESOLVE_TIMEOUT_SECONDS))
            .redirect(Policy::limited(10))
            .build()?;
        Ok(Self { client })
    }

    /// Resolves a share link to its final URL with tracking parameters
    /// stripped. URLs without the share marker pass through untouched.
    pub async fn resolve(&self, url: &str) -> String {
        if !url.contains(SHARE_LINK_MARKER) {
            return url.to_string();
        }

        // HEAD keeps it metadata-only; the URL left after redirects is all
        // that matters here, whatever the final status code says.
        match self.client.head(url).send().await {
            Ok(response) => {
                let mut resolved: Url = response.url().clone();
                resolved.set_query(None);
                let resolved = resolved.to_string();
                info!("Resolved {url} -> {resolved}");
                resolved
            }
            Err(error) => {
                warn!("Could not resolve share URL {url}: {error}");
                url.to_string()
            }
        }
    }
}
