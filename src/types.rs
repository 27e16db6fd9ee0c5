use serde::{Deserialize, Serialize};

use crate::{
    errors::ErrorKind,
    session::{SessionStatus, SessionView},
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeAvailability {
    pub size: String,
    pub available: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub discounted: Option<f64>,
    pub original: Option<f64>,
    pub discount_pct: Option<f64>,
}

impl Price {
    /// Builds a price from the amounts shown on a page. When only one amount
    /// is present the product is not on sale.
    pub fn from_amounts(current: Option<f64>, previous: Option<f64>) -> Self {
        match (current, previous) {
            (Some(now), Some(before)) if before > now && before > 0.0 => Price {
                discounted: Some(now),
                original: Some(before),
                discount_pct: Some(((before - now) / before * 100.0).round()),
            },
            (Some(now), _) => Price {
                discounted: None,
                original: Some(now),
                discount_pct: None,
            },
            _ => Price::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub article_id: String,
    pub sizes: Vec<SizeAvailability>,
    pub description: String,
    pub fit: String,
    pub material: String,
    pub category: String,
    pub color: String,
    pub attributes: Vec<String>,
    pub price: Price,
    pub gender: String,
    pub source_url: String,
}

impl ProductRecord {
    pub fn new(article_id: &str, source_url: &str) -> Self {
        ProductRecord {
            article_id: article_id.into(),
            source_url: source_url.into(),
            ..Default::default()
        }
    }

    /// Key under which the product's images are stored.
    pub fn image_key(&self) -> &str {
        if self.article_id.trim().is_empty() {
            return &self.source_url;
        }
        &self.article_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMapping {
    pub key: String,
    pub images: Vec<String>,
}

impl ImageMapping {
    pub fn new(key: &str, images: Vec<String>) -> Self {
        ImageMapping {
            key: key.into(),
            images,
        }
    }
}

/// What an extractor hands back for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub record: ProductRecord,
    pub images: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub index: usize,
    pub url: String,
    pub attempts: u32,
    pub success: bool,
    pub record: Option<ProductRecord>,
    pub images: Option<ImageMapping>,
    pub error: Option<ErrorKind>,
}

impl BatchOutcome {
    pub fn succeeded(index: usize, url: &str, attempts: u32, extraction: Extraction) -> Self {
        let images = if extraction.images.is_empty() {
            None
        } else {
            Some(ImageMapping::new(
                extraction.record.image_key(),
                extraction.images,
            ))
        };
        BatchOutcome {
            index,
            url: url.into(),
            attempts,
            success: true,
            record: Some(extraction.record),
            images,
            error: None,
        }
    }

    pub fn failed(index: usize, url: &str, attempts: u32, error: ErrorKind) -> Self {
        BatchOutcome {
            index,
            url: url.into(),
            attempts,
            success: false,
            record: None,
            images: None,
            error: Some(error),
        }
    }

    pub fn not_dispatched(index: usize, url: &str, reason: &str) -> Self {
        Self::failed(index, url, 0, ErrorKind::NotDispatched(reason.into()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub success: bool,
    pub session_id: String,
    pub status: SessionStatus,
    pub products_processed: usize,
    pub products_failed: usize,
    pub total_urls_in_range: usize,
    pub processing_time_seconds: f64,
    pub records_persisted: bool,
    pub images_persisted: bool,
    pub persist_error: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub total_urls_available: usize,
    pub index_range: String,
    pub sample_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub total_urls_available: Option<usize>,
    pub active_sessions: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub active_sessions: usize,
    pub status: String,
    pub sessions: Vec<SessionView>,
}
