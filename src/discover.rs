use std::sync::Arc;

use regex::Regex;
use serde::Serialize;

use crate::{
    errors::ProcessError,
    extractor::PageFetcher,
    source::UrlSink,
    utils::{normalize_url, DEFAULT_LISTING_URL, SAMPLE_URLS},
};

lazy_static! {
    static ref HREF: Regex = Regex::new(r#"href\s*=\s*["']([^"']+)["']"#).unwrap();
}

#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct DiscoverOptions {
    // `{page}` is replaced by the page number
    #[builder(default = "self.default_listing_url()")]
    listing_url: String,
    // links containing this are product pages
    #[builder(default = "self.default_link_marker()")]
    link_marker: String,
}

impl DiscoverOptions {
    pub fn default_builder() -> DiscoverOptionsBuilder {
        DiscoverOptionsBuilder::default()
    }
}

impl DiscoverOptionsBuilder {
    fn default_listing_url(&self) -> String {
        String::from(DEFAULT_LISTING_URL)
    }
    fn default_link_marker(&self) -> String {
        String::from("productpage")
    }
}

pub fn listing_page_url(template: &str, page: usize) -> String {
    template.replace("{page}", &page.to_string())
}

/// Product links of a listing page, absolute, in page order, without
/// duplicates.
pub fn product_links(body: &str, page_url: &str, marker: &str) -> Vec<String> {
    let mut links: Vec<String> = vec![];
    for c in HREF.captures_iter(body) {
        if let Some(link) = normalize_url(page_url, &c[1]) {
            if link.contains(marker) && !links.contains(&link) {
                links.push(link);
            }
        }
    }
    links
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport {
    pub success: bool,
    pub pages_scraped: usize,
    pub pages_failed: Vec<usize>,
    pub urls_found: usize,
    pub total_urls_available: usize,
    pub sample_urls: Vec<String>,
    pub message: String,
}

/// Walks listing pages and feeds the product urls it finds into the shared
/// url list.
pub struct Discoverer {
    fetcher: Arc<dyn PageFetcher>,
    sink: Arc<dyn UrlSink>,
    options: DiscoverOptions,
}

impl Discoverer {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        sink: Arc<dyn UrlSink>,
        options: DiscoverOptions,
    ) -> Self {
        Discoverer {
            fetcher,
            sink,
            options,
        }
    }

    /// Pages are fetched one after the other; a failing page is logged and
    /// skipped. Everything found is appended in one call at the end.
    pub async fn run(
        &self,
        start_page: usize,
        end_page: usize,
    ) -> Result<DiscoveryReport, ProcessError> {
        if start_page < 1 || end_page < start_page {
            return Err(ProcessError::InvalidPageRange {
                start_page,
                end_page,
            });
        }

        let mut urls: Vec<String> = vec![];
        let mut pages_failed = vec![];
        for page in start_page..=end_page {
            let page_url = listing_page_url(&self.options.listing_url, page);
            match self.fetcher.fetch(&page_url).await {
                Ok(body) => {
                    let links = product_links(&body, &page_url, &self.options.link_marker);
                    info!("page {}: found {} product urls", page, links.len());
                    for link in links {
                        if !urls.contains(&link) {
                            urls.push(link);
                        }
                    }
                }
                Err(e) => {
                    warn!("could not scrape page {} ({}): {}", page, page_url, e);
                    pages_failed.push(page);
                }
            }
        }

        let pages_scraped = end_page - start_page + 1 - pages_failed.len();
        if urls.is_empty() {
            return Ok(DiscoveryReport {
                success: false,
                pages_scraped,
                pages_failed,
                urls_found: 0,
                total_urls_available: 0,
                sample_urls: vec![],
                message: "No URLs found".into(),
            });
        }

        let total = self.sink.append(&urls).await?;
        debug!("url list now holds {} urls", total);

        Ok(DiscoveryReport {
            success: true,
            pages_scraped,
            pages_failed,
            urls_found: urls.len(),
            total_urls_available: total,
            sample_urls: urls.iter().take(SAMPLE_URLS).cloned().collect(),
            message: format!("Successfully scraped pages {}-{}", start_page, end_page),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        errors::ExtractionError,
        source::{MemoryUrlSource, UrlSource},
    };
    use async_trait::async_trait;

    macro_rules! aw {
        ($e:expr) => {
            tokio_test::block_on($e)
        };
    }

    const LISTING: &str = r#"
        <a href="/sv_se/productpage.1259175004.html">Top</a>
        <a href='/sv_se/productpage.1259175004.html#swatch'>Top, other color</a>
        <a href="https://www2.hm.com/sv_se/productpage.1200000001.html">Dress</a>
        <a href="/sv_se/kundservice.html">Help</a>
        <a href="mailto:kundservice@hm.com">Mail</a>
    "#;

    // page 2 fails, every other page lists the same two products plus one of its own
    struct Listing;

    #[async_trait]
    impl PageFetcher for Listing {
        async fn fetch(&self, url: &str) -> Result<String, ExtractionError> {
            if url.ends_with("page=2") {
                return Err(ExtractionError::transient("timed out"));
            }
            let page = url.rsplit('=').next().unwrap_or("0");
            Ok(format!(
                r#"{}<a href="/sv_se/productpage.9{}.html">Own</a>"#,
                LISTING, page
            ))
        }
    }

    fn options() -> DiscoverOptions {
        DiscoverOptions::default_builder()
            .listing_url("https://www2.hm.com/sv_se/dam/produkter/se-alla.html?page={page}")
            .build()
            .unwrap()
    }

    #[test]
    fn keeps_product_links_only() {
        let links = product_links(
            LISTING,
            "https://www2.hm.com/sv_se/dam/produkter/se-alla.html?page=1",
            "productpage",
        );
        assert_eq!(
            links,
            vec![
                "https://www2.hm.com/sv_se/productpage.1259175004.html".to_string(),
                "https://www2.hm.com/sv_se/productpage.1200000001.html".to_string(),
            ]
        );
    }

    #[test]
    fn fills_the_page_number() {
        assert_eq!(
            listing_page_url("https://shop.example/all?page={page}", 3),
            "https://shop.example/all?page=3"
        );
    }

    #[test]
    fn appends_new_urls_and_skips_failed_pages() {
        let sink = Arc::new(MemoryUrlSource::new(vec![
            "https://www2.hm.com/sv_se/productpage.1.html".into(),
        ]));
        let d = Discoverer::new(Arc::new(Listing), sink.clone(), options());

        let report = aw!(d.run(1, 3)).unwrap();

        assert!(report.success);
        assert_eq!(report.pages_scraped, 2);
        assert_eq!(report.pages_failed, vec![2]);
        // two shared products plus one per successful page
        assert_eq!(report.urls_found, 4);
        assert_eq!(report.total_urls_available, 5);
        assert_eq!(aw!(sink.len()).unwrap(), 5);
        // earlier indices are untouched
        assert_eq!(sink.urls()[0], "https://www2.hm.com/sv_se/productpage.1.html");
    }

    #[test]
    fn nothing_found_writes_nothing() {
        let sink = Arc::new(MemoryUrlSource::default());
        let d = Discoverer::new(Arc::new(Listing), sink.clone(), options());

        let report = aw!(d.run(2, 2)).unwrap();

        assert!(!report.success);
        assert_eq!(report.message, "No URLs found");
        assert_eq!(aw!(sink.len()).unwrap(), 0);
    }

    #[test]
    fn rejects_invalid_page_ranges() {
        let d = Discoverer::new(
            Arc::new(Listing),
            Arc::new(MemoryUrlSource::default()),
            options(),
        );
        assert!(matches!(
            aw!(d.run(0, 3)),
            Err(ProcessError::InvalidPageRange { .. })
        ));
        assert!(matches!(
            aw!(d.run(4, 3)),
            Err(ProcessError::InvalidPageRange { .. })
        ));
    }
}
