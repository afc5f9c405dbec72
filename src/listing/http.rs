use async_trait::async_trait;
use reqwest::header::ACCEPT;

use crate::error::ChatError;
use crate::listing::{ ListingDirectory, ListingRecord };

/// Looks listings up against the marketplace REST API.
pub struct HttpListingDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpListingDirectory {
    pub fn new(base_url: String) -> Self {
        HttpListingDirectory {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ListingDirectory for HttpListingDirectory {
    async fn lookup(&self, listing_id: &str) -> Result<ListingRecord, ChatError> {
        let url = format!("{}/api/listings/{}", self.base_url, listing_id);
        let resp = self.client.get(&url).header(ACCEPT, "application/json").send().await?;

        match resp.status() {
            reqwest::StatusCode::OK => Ok(resp.json::<ListingRecord>().await?),
            reqwest::StatusCode::NOT_FOUND => {
                Err(ChatError::NotFound(format!("listing {}", listing_id)))
            }
            s => {
                let body = resp.text().await.unwrap_or_default();
                Err(ChatError::Directory(format!("listing service returned {}: {}", s, body)))
            }
        }
    }
}
