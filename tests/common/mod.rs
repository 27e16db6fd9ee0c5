#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use product_processor::{
    coordinator::{BatchCoordinator, CoordinatorOptions, CoordinatorOptionsBuilder},
    errors::{ExtractionError, StoreError},
    extractor::{article_id_from_url, Extractor},
    source::MemoryUrlSource,
    store::{ImageStore, MemoryImageStore, MemoryRecordStore, RecordStore},
    types::{Extraction, ImageMapping, ProductRecord},
};

macro_rules! aw {
    ($e:expr) => {
        tokio_test::block_on($e)
    };
}

pub fn url(index: usize) -> String {
    format!("https://www2.hm.com/sv_se/productpage.{}.html", 1_000_000 + index)
}

pub fn urls(n: usize) -> Vec<String> {
    (0..n).map(url).collect()
}

pub fn article_id(index: usize) -> String {
    (1_000_000 + index).to_string()
}

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Permanent,
    /// fails transiently this many times, then succeeds
    Transient(usize),
    AlwaysTransient,
    NoArticleId,
    Slow(u64),
}

/// Extractor driven by a per-url script; unscripted urls succeed.
#[derive(Default)]
pub struct ScriptedExtractor {
    script: HashMap<String, Behavior>,
    calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay_ms: u64,
}

impl ScriptedExtractor {
    pub fn new() -> Self {
        ScriptedExtractor::default()
    }

    pub fn with(mut self, index: usize, behavior: Behavior) -> Self {
        self.script.insert(url(index), behavior);
        self
    }

    /// Every extraction takes at least this long.
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    pub fn calls_for(&self, index: usize) -> usize {
        *self.calls.lock().unwrap().get(&url(index)).unwrap_or(&0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(&self, url: &str) -> Result<Extraction, ExtractionError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let c = calls.entry(url.to_string()).or_insert(0);
            *c += 1;
            *c
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let mut delay = self.delay_ms;
        if let Some(Behavior::Slow(ms)) = self.script.get(url) {
            delay += ms;
        }
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let id = article_id_from_url(url).unwrap_or_default();
        let ok = Extraction {
            record: ProductRecord::new(&id, url),
            images: vec![
                format!("https://img.example/{}/front.jpg", id),
                format!("https://img.example/{}/back.jpg", id),
            ],
        };

        match self.script.get(url) {
            Some(Behavior::Permanent) => Err(ExtractionError::permanent("malformed page")),
            Some(Behavior::Transient(n)) if call <= *n => {
                Err(ExtractionError::transient("connection reset"))
            }
            Some(Behavior::AlwaysTransient) => Err(ExtractionError::transient("timed out")),
            Some(Behavior::NoArticleId) => Ok(Extraction {
                record: ProductRecord::new("", url),
                images: vec![],
            }),
            _ => Ok(ok),
        }
    }
}

/// Store that fails its first `failures` calls.
#[derive(Default)]
pub struct FlakyStore {
    failures: usize,
    pub calls: AtomicUsize,
    pub records: MemoryRecordStore,
    pub images: MemoryImageStore,
}

impl FlakyStore {
    pub fn failing(failures: usize) -> Self {
        FlakyStore {
            failures,
            ..Default::default()
        }
    }

    fn fail(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst) < self.failures
    }
}

#[async_trait]
impl RecordStore for FlakyStore {
    async fn append(&self, records: &[ProductRecord]) -> Result<(), StoreError> {
        if self.fail() {
            return Err(StoreError::Unavailable("bucket unreachable".into()));
        }
        self.records.append(records).await
    }
}

#[async_trait]
impl ImageStore for FlakyStore {
    async fn merge(&self, mappings: &[ImageMapping]) -> Result<(), StoreError> {
        if self.fail() {
            return Err(StoreError::Unavailable("bucket unreachable".into()));
        }
        self.images.merge(mappings).await
    }
}

/// Options with every wait shrunk to keep tests fast.
pub fn fast_options() -> CoordinatorOptionsBuilder {
    let mut b = CoordinatorOptions::default_builder();
    b.retry_base_delay_ms(1u64)
        .batch_delay_ms(0u64)
        .commit_backoff_ms(1u64);
    b
}

pub struct Harness {
    pub coordinator: BatchCoordinator,
    pub extractor: Arc<ScriptedExtractor>,
    pub records: Arc<MemoryRecordStore>,
    pub images: Arc<MemoryImageStore>,
}

pub fn harness(n_urls: usize, extractor: ScriptedExtractor, options: CoordinatorOptions) -> Harness {
    let extractor = Arc::new(extractor);
    let records = Arc::new(MemoryRecordStore::new());
    let images = Arc::new(MemoryImageStore::new());
    let coordinator = BatchCoordinator::new(
        Arc::new(MemoryUrlSource::new(urls(n_urls))),
        extractor.clone(),
        records.clone(),
        images.clone(),
        options,
    );
    Harness {
        coordinator,
        extractor,
        records,
        images,
    }
}
