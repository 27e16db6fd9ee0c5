use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};

use crate::{
    errors::ExtractionError,
    types::{Extraction, Price, ProductRecord},
};

/// Turns one product url into a record. Implementations may retry at the
/// network layer themselves; the coordinator retries on top of that only for
/// `ExtractionError::Transient`.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, url: &str) -> Result<Extraction, ExtractionError>;
}

/// Fetches the raw body of a page, with the same transient / permanent split
/// as `Extractor`.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, ExtractionError>;
}

lazy_static! {
    static ref ARTICLE_ID: Regex = Regex::new(r"productpage\.(\d+)\.html").unwrap();
    static ref AMOUNT: Regex = Regex::new(r"(\d{1,3}(?:[ \u{a0}.]\d{3})*,\d{2})\s*kr").unwrap();
}

#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct HttpExtractorOptions {
    // request timeout in seconds
    #[builder(default = "30")]
    timeout: u64,
    #[builder(default = "self.default_user_agent()")]
    user_agent: String,
    // every image url on the page starting with this prefix is collected
    #[builder(default = "self.default_image_prefix()")]
    image_prefix: String,
}

impl HttpExtractorOptions {
    pub fn default_builder() -> HttpExtractorOptionsBuilder {
        HttpExtractorOptionsBuilder::default()
    }
}

impl HttpExtractorOptionsBuilder {
    fn default_user_agent(&self) -> String {
        format!("product-processor/{}", env!("CARGO_PKG_VERSION"))
    }
    fn default_image_prefix(&self) -> String {
        String::from("https://image.hm.com/assets/")
    }
}

pub struct HttpExtractor {
    client: Client,
    images: Regex,
}

impl HttpExtractor {
    pub fn new(options: HttpExtractorOptions) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout))
            .user_agent(options.user_agent.as_str())
            .build()?;
        let images = image_pattern(&options.image_prefix)?;

        Ok(HttpExtractor { client, images })
    }
}

#[async_trait]
impl PageFetcher for HttpExtractor {
    async fn fetch(&self, url: &str) -> Result<String, ExtractionError> {
        let res = self.client.get(url).send().await.map_err(classify)?;

        let status = res.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ExtractionError::transient(format!("status {}", status)));
        }
        if !status.is_success() {
            return Err(ExtractionError::permanent(format!("status {}", status)));
        }

        res.text().await.map_err(classify)
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn extract(&self, url: &str) -> Result<Extraction, ExtractionError> {
        let body = self.fetch(url).await?;
        parse_product_page(url, &body, &self.images)
    }
}

fn classify(e: reqwest::Error) -> ExtractionError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        return ExtractionError::transient(e.to_string());
    }
    ExtractionError::permanent(e.to_string())
}

pub fn image_pattern(prefix: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r#"{}[^\s"'()<>?]+"#, regex::escape(prefix)))
}

pub fn article_id_from_url(url: &str) -> Option<String> {
    ARTICLE_ID.captures(url).map(|c| c[1].to_string())
}

/// Image urls in page order, query strings dropped, duplicates removed.
pub fn image_urls(body: &str, pattern: &Regex) -> Vec<String> {
    let mut urls: Vec<String> = vec![];
    for m in pattern.find_iter(body) {
        let u = m.as_str().to_string();
        if !urls.contains(&u) {
            urls.push(u);
        }
    }
    urls
}

fn parse_amount(raw: &str) -> Option<f64> {
    raw.replace([' ', '\u{a0}', '.'], "")
        .replace(',', ".")
        .parse()
        .ok()
}

/// Reads the fields that can be recognised without site specific parsing:
/// the article id, the price pair and the image list. Everything else stays
/// empty for downstream enrichment.
pub fn parse_product_page(
    url: &str,
    body: &str,
    images: &Regex,
) -> Result<Extraction, ExtractionError> {
    let article_id = article_id_from_url(url)
        .ok_or_else(|| ExtractionError::permanent(format!("no article id in {}", url)))?;

    if body.trim().is_empty() {
        return Err(ExtractionError::permanent("empty page"));
    }

    let mut amounts = AMOUNT
        .captures_iter(body)
        .filter_map(|c| parse_amount(&c[1]));

    let mut record = ProductRecord::new(&article_id, url);
    record.price = Price::from_amounts(amounts.next(), amounts.next());

    Ok(Extraction {
        record,
        images: image_urls(body, images),
    })
}
