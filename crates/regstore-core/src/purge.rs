use std::sync::Arc;

use regstore_store::ObjectStore;
use tracing::debug;

use crate::error::RegistryResult;

/// Recursive delete built from paged listing and batch deletes.
///
/// Not atomic: a failure part-way through leaves the already-deleted
/// batches deleted and reports the error.
#[derive(Clone, Debug)]
pub struct PrefixPurger {
    store: Arc<dyn ObjectStore>,
}

impl PrefixPurger {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Delete every object whose key starts with `prefix`.
    ///
    /// Returns the number of objects deleted. The whole listing is collected
    /// before the first delete so that deletions cannot shift page boundaries.
    pub async fn purge(&self, prefix: &str) -> RegistryResult<usize> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.store.list_page(prefix, token.as_deref()).await?;
            debug!(prefix, page_len = page.keys.len(), "listed purge page");
            keys.extend(page.keys);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        if keys.is_empty() {
            return Ok(0);
        }

        let batch_size = self.store.max_delete_batch().max(1);
        for batch in keys.chunks(batch_size) {
            self.store.delete_batch(batch).await?;
            debug!(prefix, count = batch.len(), "deleted purge batch");
        }
        Ok(keys.len())
    }
}
