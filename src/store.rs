use std::{collections::BTreeMap, future::Future, time::Duration};

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio_retry::{strategy::ExponentialBackoff, RetryIf};

use crate::{
    errors::StoreError,
    types::{ImageMapping, ProductRecord},
    utils::jitter,
};

/// Append-only record persistence. One `append` call is the unit of
/// atomicity: it either lands completely or not at all, and never replaces
/// what other sessions appended before.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn append(&self, records: &[ProductRecord]) -> Result<(), StoreError>;
}

/// Key to image list persistence with merge-append semantics.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn merge(&self, mappings: &[ImageMapping]) -> Result<(), StoreError>;
}

/// Appends the urls of `incoming` missing from `existing`, keeping order.
/// Returns how many were added.
pub fn merge_image_lists(existing: &mut Vec<String>, incoming: &[String]) -> usize {
    let mut added = 0;
    for url in incoming {
        if !existing.contains(url) {
            existing.push(url.clone());
            added += 1;
        }
    }
    added
}

/// Folds mappings sharing a key into one, keys in first-seen order.
pub fn collapse_mappings(mappings: Vec<ImageMapping>) -> Vec<ImageMapping> {
    let mut collapsed: Vec<ImageMapping> = vec![];
    for m in mappings {
        match collapsed.iter_mut().find(|c| c.key == m.key) {
            Some(c) => {
                merge_image_lists(&mut c.images, &m.images);
            }
            None => {
                let mut images = vec![];
                merge_image_lists(&mut images, &m.images);
                collapsed.push(ImageMapping::new(&m.key, images));
            }
        }
    }
    collapsed
}

/// Retries a store call up to `attempts` times in total, doubling the wait
/// from `base_ms` with jitter. Errors that are not retryable return at once.
pub async fn commit_with_retry<A, F>(
    attempts: usize,
    base_ms: u64,
    what: &str,
    mut action: A,
) -> Result<(), StoreError>
where
    A: FnMut() -> F,
    F: Future<Output = Result<(), StoreError>>,
{
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(base_ms.max(1) / 2 + base_ms.max(1) % 2)
        .max_delay(Duration::from_secs(30))
        .map(jitter)
        .take(attempts.saturating_sub(1));

    let mut attempt = 0;
    RetryIf::spawn(
        strategy,
        || {
            attempt += 1;
            if attempt > 1 {
                warn!("retrying {} commit, attempt {}", what, attempt);
            }
            action()
        },
        |e: &StoreError| e.is_retryable(),
    )
    .await
}

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<ProductRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        MemoryRecordStore::default()
    }

    pub async fn records(&self) -> Vec<ProductRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn append(&self, records: &[ProductRecord]) -> Result<(), StoreError> {
        self.records.lock().await.extend_from_slice(records);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryImageStore {
    images: Mutex<BTreeMap<String, Vec<String>>>,
}

impl MemoryImageStore {
    pub fn new() -> Self {
        MemoryImageStore::default()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.images.lock().await.clone()
    }

    pub async fn images_for(&self, key: &str) -> Vec<String> {
        self.images
            .lock()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn merge(&self, mappings: &[ImageMapping]) -> Result<(), StoreError> {
        let mut images = self.images.lock().await;
        for m in mappings {
            merge_image_lists(images.entry(m.key.clone()).or_default(), &m.images);
        }
        Ok(())
    }
}

/// Records as JSON entries of one redis list; a single RPUSH per batch.
pub struct RedisRecordStore {
    client: redis::Client,
    key: String,
}

impl RedisRecordStore {
    pub fn new(redis_url: &str, key: &str) -> anyhow::Result<Self> {
        Ok(RedisRecordStore {
            client: redis::Client::open(redis_url)?,
            key: key.into(),
        })
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        let mut con = self.client.get_async_connection().await?;
        Ok(con.llen(&self.key).await?)
    }
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    async fn append(&self, records: &[ProductRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let payloads = records
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<String>, _>>()?;

        let mut con = self.client.get_async_connection().await?;
        con.rpush::<_, _, ()>(&self.key, payloads).await?;
        Ok(())
    }
}

// Whole batch in one script run, so a merge is atomic on the server.
// KEYS[1] is <prefix>:keys, the set of every key ever merged. Mapping i
// (1-based) owns KEYS[2i], its ordered list, and KEYS[2i+1], the set of its
// members. On a cluster all of them must hash to one slot, e.g. by wrapping
// the prefix in a {hash tag}.
const MERGE_SCRIPT: &str = r#"
local batch = cjson.decode(ARGV[1])
local added = 0
for i, mapping in ipairs(batch) do
  local list_key = KEYS[2 * i]
  local seen_key = KEYS[2 * i + 1]
  redis.call('SADD', KEYS[1], mapping.key)
  for _, url in ipairs(mapping.images) do
    if redis.call('SADD', seen_key, url) == 1 then
      redis.call('RPUSH', list_key, url)
      added = added + 1
    end
  end
end
return added
"#;

/// Keys touched by `MERGE_SCRIPT` for `mappings`, in the order it reads them.
pub fn merge_script_keys(prefix: &str, mappings: &[ImageMapping]) -> Vec<String> {
    let mut keys = Vec::with_capacity(1 + mappings.len() * 2);
    keys.push(format!("{}:keys", prefix));
    for m in mappings {
        keys.push(format!("{}:{}", prefix, m.key));
        keys.push(format!("{}:{}:seen", prefix, m.key));
    }
    keys
}

pub struct RedisImageStore {
    client: redis::Client,
    prefix: String,
    script: redis::Script,
}

impl RedisImageStore {
    pub fn new(redis_url: &str, prefix: &str) -> anyhow::Result<Self> {
        Ok(RedisImageStore {
            client: redis::Client::open(redis_url)?,
            prefix: prefix.into(),
            script: redis::Script::new(MERGE_SCRIPT),
        })
    }

    pub async fn images_for(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut con = self.client.get_async_connection().await?;
        Ok(con
            .lrange(format!("{}:{}", self.prefix, key), 0, -1)
            .await?)
    }
}

#[async_trait]
impl ImageStore for RedisImageStore {
    async fn merge(&self, mappings: &[ImageMapping]) -> Result<(), StoreError> {
        if mappings.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_string(mappings)?;
        let keys = merge_script_keys(&self.prefix, mappings);

        let mut con = self.client.get_async_connection().await?;
        let added: i64 = self
            .script
            .key(keys)
            .arg(payload)
            .invoke_async(&mut con)
            .await?;
        debug!("merged {} new image urls into {}", added, self.prefix);
        Ok(())
    }
}
