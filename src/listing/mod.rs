mod http;
mod memory;

use async_trait::async_trait;
use serde::{ Serialize, Deserialize };
use std::error::Error;
use std::sync::Arc;

use crate::cli::Args;
use crate::error::ChatError;
use crate::models::chat::ListingSummary;

pub use memory::MemoryListingDirectory;

/// A listing as the marketplace service reports it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ListingRecord {
    pub id: String,
    pub title: String,
    /// User id of the seller who owns the listing.
    pub owner: String,
    pub sold: bool,
}

impl ListingRecord {
    pub fn summary(&self) -> ListingSummary {
        ListingSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            sold: self.sold,
        }
    }
}

/// Read-side view of the external listing service. The chat service
/// only ever asks who owns a listing and what to call it; listing
/// lifecycle stays with the marketplace.
#[async_trait]
pub trait ListingDirectory: Send + Sync {
    async fn lookup(&self, listing_id: &str) -> Result<ListingRecord, ChatError>;
}

pub fn create_listing_directory(
    args: &Args
) -> Result<Arc<dyn ListingDirectory>, Box<dyn Error + Send + Sync>> {
    match args.listing_directory.to_lowercase().as_str() {
        "memory" => Ok(Arc::new(MemoryListingDirectory::new())),
        "http" => Ok(Arc::new(http::HttpListingDirectory::new(args.listing_api_url.clone()))),
        _ =>
            Err(
                Box::new(
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        format!("Unsupported listing directory type: {}", args.listing_directory)
                    )
                )
            ),
    }
}
