use rand::{distributions::Alphanumeric, thread_rng, Rng};
use reqwest::Url;
use std::time::Duration;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1/";
pub const DEFAULT_URLS_KEY: &str = "garments:urls";
pub const SESSION_ID_LEN: usize = 11;
pub const SAMPLE_URLS: usize = 5;
pub const DEFAULT_LISTING_URL: &str =
    "https://www2.hm.com/sv_se/dam/produkter/se-alla.html?page={page}";

lazy_static! {
    pub static ref REDIS_URL: String = match std::env::var("REDIS_URL") {
        Ok(url) => url,
        Err(_) => DEFAULT_REDIS_URL.into(),
    };
    pub static ref KEY_PREFIX: String = {
        let env = match std::env::var("ENVIRONMENT") {
            Ok(e) => e,
            Err(_) => "".into(),
        };
        if env == "production" {
            return "products".into();
        }
        "products_dev".into()
    };
    pub static ref RECORDS_KEY: String = format!("{}:records", KEY_PREFIX.as_str());
    pub static ref IMAGES_PREFIX: String = format!("{}:images", KEY_PREFIX.as_str());
}

// spreads concurrent store retries from different sessions apart
pub fn jitter(duration: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let rndm = rng.gen_range(1.0..2.0);
    duration.mul_f64(rndm)
}

pub fn get_random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn new_session_id() -> String {
    get_random_string(SESSION_ID_LEN)
}

/// Seconds with two decimals, the precision reported back to callers.
pub fn rounded_secs(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).round() / 100.0
}

/// Resolves `url` against the page it was found on and drops the fragment.
/// Anything that is not http(s) once resolved, like `mailto:`, is skipped.
pub fn normalize_url(base_url: &str, url: &str) -> Option<String> {
    let mut u = Url::parse(base_url).ok()?.join(url.trim()).ok()?;
    if u.scheme() != "http" && u.scheme() != "https" {
        return None;
    }
    u.set_fragment(None);
    Some(u.to_string())
}

pub fn index_range_label(total: usize) -> String {
    if total == 0 {
        return "No URLs available".into();
    }
    format!("0-{}", total - 1)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn random_strings_are_alphanumeric() {
        let s = get_random_string(32);
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(new_session_id(), new_session_id());
    }

    #[test]
    fn jitter_never_shortens_the_delay() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let d = jitter(base);
            assert!(d >= base && d < base * 2);
        }
    }

    #[test]
    fn rounds_to_two_decimals() {
        assert_eq!(rounded_secs(Duration::from_millis(1234)), 1.23);
        assert_eq!(rounded_secs(Duration::from_millis(5)), 0.01);
    }

    #[test]
    fn normalizes_links() {
        let base = "https://www2.hm.com/sv_se/dam/produkter/se-alla.html?page=2";
        assert_eq!(
            normalize_url(base, "/sv_se/productpage.1259175004.html#reviews").as_deref(),
            Some("https://www2.hm.com/sv_se/productpage.1259175004.html")
        );
        assert_eq!(
            normalize_url(base, "https://other.example/a").as_deref(),
            Some("https://other.example/a")
        );
        assert_eq!(normalize_url(base, "mailto:kundservice@hm.com"), None);
        assert_eq!(normalize_url("not a url", "/x"), None);
    }

    #[test]
    fn labels_index_range() {
        assert_eq!(index_range_label(0), "No URLs available");
        assert_eq!(index_range_label(250), "0-249");
    }
}
