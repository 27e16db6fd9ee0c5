use std::{
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
};

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::io::AsyncWriteExt;

use crate::errors::SourceError;

/// Read-only, index-addressed view over the shared url list.
#[async_trait]
pub trait UrlSource: Send + Sync {
    async fn len(&self) -> Result<usize, SourceError>;

    /// Urls at indices `start..=end`. Fails with `OutOfBounds` past the end.
    async fn get_range(&self, start: usize, end: usize) -> Result<Vec<String>, SourceError>;

    async fn sample(&self, n: usize) -> Result<Vec<String>, SourceError> {
        let len = self.len().await?;
        if len == 0 || n == 0 {
            return Ok(vec![]);
        }
        self.get_range(0, n.min(len) - 1).await
    }
}

/// Write side of the url list, fed by page discovery. Urls are appended so
/// that indices already handed out keep pointing at the same url.
#[async_trait]
pub trait UrlSink: Send + Sync {
    /// Appends `urls` and returns the new length of the list.
    async fn append(&self, urls: &[String]) -> Result<usize, SourceError>;
}

fn check_bounds(start: usize, end: usize, len: usize) -> Result<(), SourceError> {
    if start > end || end >= len {
        return Err(SourceError::OutOfBounds { start, end, len });
    }
    Ok(())
}

/// One url per line, surrounding whitespace and blank lines ignored.
pub fn parse_url_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct MemoryUrlSource {
    urls: Arc<RwLock<Vec<String>>>,
}

impl MemoryUrlSource {
    pub fn new(urls: Vec<String>) -> Self {
        MemoryUrlSource {
            urls: Arc::new(RwLock::new(urls)),
        }
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl UrlSource for MemoryUrlSource {
    async fn len(&self) -> Result<usize, SourceError> {
        Ok(self.urls.read().unwrap_or_else(PoisonError::into_inner).len())
    }

    async fn get_range(&self, start: usize, end: usize) -> Result<Vec<String>, SourceError> {
        let urls = self.urls.read().unwrap_or_else(PoisonError::into_inner);
        check_bounds(start, end, urls.len())?;
        Ok(urls[start..=end].to_vec())
    }
}

#[async_trait]
impl UrlSink for MemoryUrlSource {
    async fn append(&self, urls: &[String]) -> Result<usize, SourceError> {
        let mut list = self.urls.write().unwrap_or_else(PoisonError::into_inner);
        list.extend_from_slice(urls);
        Ok(list.len())
    }
}

/// Newline separated url file, re-read on every call so that a list
/// replaced between requests is picked up by the next session.
#[derive(Debug, Clone)]
pub struct FileUrlSource {
    path: PathBuf,
}

impl FileUrlSource {
    pub fn new(path: PathBuf) -> Self {
        FileUrlSource { path }
    }

    async fn read(&self) -> Result<Vec<String>, SourceError> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(parse_url_lines(&content))
    }
}

#[async_trait]
impl UrlSource for FileUrlSource {
    async fn len(&self) -> Result<usize, SourceError> {
        Ok(self.read().await?.len())
    }

    async fn get_range(&self, start: usize, end: usize) -> Result<Vec<String>, SourceError> {
        let urls = self.read().await?;
        check_bounds(start, end, urls.len())?;
        Ok(urls[start..=end].to_vec())
    }
}

#[async_trait]
impl UrlSink for FileUrlSource {
    async fn append(&self, urls: &[String]) -> Result<usize, SourceError> {
        let mut content = String::new();
        for url in urls {
            content.push_str(url);
            content.push('\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        self.len().await
    }
}

/// Url list kept in a redis list.
pub struct RedisUrlSource {
    client: redis::Client,
    key: String,
}

impl RedisUrlSource {
    pub fn new(redis_url: &str, key: &str) -> anyhow::Result<Self> {
        Ok(RedisUrlSource {
            client: redis::Client::open(redis_url)?,
            key: key.into(),
        })
    }
}

#[async_trait]
impl UrlSource for RedisUrlSource {
    async fn len(&self) -> Result<usize, SourceError> {
        let mut con = self.client.get_async_connection().await?;
        let len: usize = con.llen(&self.key).await?;
        Ok(len)
    }

    // a single LRANGE, a short answer means the list ends before `end`
    async fn get_range(&self, start: usize, end: usize) -> Result<Vec<String>, SourceError> {
        if start > end {
            return Err(SourceError::OutOfBounds {
                start,
                end,
                len: 0,
            });
        }
        let mut con = self.client.get_async_connection().await?;
        let urls: Vec<String> = con.lrange(&self.key, start as isize, end as isize).await?;
        if urls.len() != end - start + 1 {
            return Err(SourceError::OutOfBounds {
                start,
                end,
                len: start + urls.len(),
            });
        }
        Ok(urls)
    }
}

#[async_trait]
impl UrlSink for RedisUrlSource {
    async fn append(&self, urls: &[String]) -> Result<usize, SourceError> {
        if urls.is_empty() {
            return self.len().await;
        }
        let mut con = self.client.get_async_connection().await?;
        let len: usize = con.rpush(&self.key, urls).await?;
        Ok(len)
    }
}
