use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::ChatError;
use crate::listing::{ ListingDirectory, ListingRecord };

/// Seedable in-memory directory for development and tests.
pub struct MemoryListingDirectory {
    records: RwLock<HashMap<String, ListingRecord>>,
}

impl MemoryListingDirectory {
    pub fn new() -> Self {
        MemoryListingDirectory {
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, record: ListingRecord) {
        let mut records = match self.records.write() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        records.insert(record.id.clone(), record);
    }
}

impl Default for MemoryListingDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ListingDirectory for MemoryListingDirectory {
    async fn lookup(&self, listing_id: &str) -> Result<ListingRecord, ChatError> {
        let records = match self.records.read() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        records
            .get(listing_id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(format!("listing {}", listing_id)))
    }
}
