use rand::seq::SliceRandom;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use scraper::{Html, Selector};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::config::ScraperConfig;
use crate::models::RawPosting;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Timeouts, rate limiting, temporary blocks. Worth retrying.
    #[error("transient fetch error: {0}")]
    Transient(String),

    #[error("fatal fetch error: {0}")]
    Fatal(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// One listing page worth of postings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub postings: Vec<RawPosting>,
    /// Detail pages that failed and were left out of `postings`.
    pub detail_failures: usize,
}

impl From<Vec<RawPosting>> for Page {
    fn from(postings: Vec<RawPosting>) -> Self {
        Self {
            postings,
            detail_failures: 0,
        }
    }
}

/// Yields raw postings one listing page at a time. Pages are 1-based.
/// An empty page means there are no more listings.
pub trait PostingSource {
    fn fetch_page(&self, page: u32) -> Result<Page, FetchError>;
}

pub struct WellfoundSource {
    client: Client,
    base_url: String,
    query: String,
    location: String,
    user_agents: Vec<String>,
    detail_delay: Duration,
}

impl WellfoundSource {
    pub fn new(config: &ScraperConfig, query: &str, location: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            query: query.to_string(),
            location: location.to_string(),
            user_agents: config.user_agents.clone(),
            detail_delay: config.delay()?,
        })
    }

    fn get(&self, url: &str) -> Result<Option<String>, FetchError> {
        let mut request = self.client.get(url);
        if let Some(agent) = self.user_agents.choose(&mut rand::thread_rng()) {
            request = request.header(reqwest::header::USER_AGENT, agent);
        }

        let response = request.send().map_err(classify_request_error)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if let Some(err) = classify_status(status) {
            return Err(err);
        }
        response
            .text()
            .map(Some)
            .map_err(|e| FetchError::Transient(format!("reading body of {}: {}", url, e)))
    }

    fn listing_url(&self, page: u32) -> Result<String, FetchError> {
        let mut params = vec![("page", page.to_string())];
        if !self.query.is_empty() {
            params.push(("q", self.query.clone()));
        }
        if !self.location.is_empty() {
            params.push(("l", self.location.clone()));
        }
        reqwest::Url::parse_with_params(&self.base_url, &params)
            .map(String::from)
            .map_err(|e| FetchError::Fatal(format!("invalid base url {}: {}", self.base_url, e)))
    }
}

impl PostingSource for WellfoundSource {
    fn fetch_page(&self, page: u32) -> Result<Page, FetchError> {
        let url = self.listing_url(page)?;
        tracing::info!(page, %url, "fetching listing page");

        let Some(html) = self.get(&url)? else {
            return Ok(Page::default());
        };
        let links = collect_job_links(&html, &self.base_url);
        tracing::info!(page, links = links.len(), "collected job links");

        let mut result = Page::default();
        let mut last_error = None;
        for (i, link) in links.iter().enumerate() {
            if i > 0 && !self.detail_delay.is_zero() {
                thread::sleep(self.detail_delay);
            }
            match self.get(link) {
                Ok(Some(body)) => match parse_job_detail(&body, link) {
                    Some(posting) => result.postings.push(posting),
                    None => tracing::warn!(%link, "job page had no title, skipping"),
                },
                Ok(None) => tracing::warn!(%link, "job page gone"),
                Err(e) => {
                    tracing::warn!(%link, error = %e, "failed to fetch job page");
                    result.detail_failures += 1;
                    last_error = Some(e);
                }
            }
        }

        // Links but nothing fetched is a blocked page, not the end of listings.
        if result.postings.is_empty() {
            if let Some(e) = last_error {
                let reason = match e {
                    FetchError::Transient(r) | FetchError::Fatal(r) => r,
                };
                return Err(FetchError::Transient(format!(
                    "all {} job pages failed, last: {}",
                    result.detail_failures, reason
                )));
            }
        }
        Ok(result)
    }
}

fn classify_request_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        FetchError::Transient(e.to_string())
    } else {
        FetchError::Fatal(e.to_string())
    }
}

/// 429 and 5xx are transient, as is 403 which the site uses for temporary
/// bot blocks. Any other non-success status is fatal.
pub fn classify_status(status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        None
    } else if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::FORBIDDEN
        || status.is_server_error()
    {
        Some(FetchError::Transient(format!("HTTP {}", status)))
    } else {
        Some(FetchError::Fatal(format!("HTTP {}", status)))
    }
}

fn origin_of(base_url: &str) -> String {
    match reqwest::Url::parse(base_url) {
        Ok(url) => url.origin().ascii_serialization(),
        Err(_) => "https://wellfound.com".to_string(),
    }
}

fn job_href_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(https?://[^/]+)?/jobs/\d+").expect("static regex"))
}

fn selector(cell: &'static OnceLock<Selector>, css: &str) -> &'static Selector {
    cell.get_or_init(|| Selector::parse(css).expect("static selector"))
}

static ANCHOR: OnceLock<Selector> = OnceLock::new();
static TITLE: OnceLock<Selector> = OnceLock::new();
static COMPANY: OnceLock<Selector> = OnceLock::new();
static LOCATION: OnceLock<Selector> = OnceLock::new();
static DESCRIPTION: OnceLock<Selector> = OnceLock::new();
static SKILL_TAG: OnceLock<Selector> = OnceLock::new();
static HEADER_ITEM: OnceLock<Selector> = OnceLock::new();

pub fn collect_job_links(html: &str, base_url: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let origin = origin_of(base_url);

    let mut links: Vec<String> = Vec::new();
    for element in document.select(selector(&ANCHOR, "a[href]")) {
        let href = element.value().attr("href").unwrap_or("");
        if !job_href_re().is_match(href) || href.contains("signup") {
            continue;
        }
        let absolute = if href.starts_with("http") {
            href.to_string()
        } else {
            format!("{}{}", origin, href)
        };
        let absolute = match absolute.find(['?', '#']) {
            Some(idx) => absolute[..idx].to_string(),
            None => absolute,
        };
        if !links.contains(&absolute) {
            links.push(absolute);
        }
    }
    links
}

fn squash(text: String) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn all_text(document: &Html, selector: &Selector) -> Vec<String> {
    document
        .select(selector)
        .map(|el| squash(el.text().collect::<Vec<_>>().join(" ")))
        .filter(|t| !t.is_empty())
        .collect()
}

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    all_text(document, selector).into_iter().next()
}

/// Splits a header item like "$90k – $115k • 0.1% – 0.5%" into salary and
/// equity. Only items mentioning a currency count.
fn compensation(items: &[String]) -> (Option<String>, Option<String>) {
    let Some(item) = items
        .iter()
        .find(|t| t.contains('$') || t.contains('€') || t.contains('£'))
    else {
        return (None, None);
    };
    let mut parts = item.splitn(2, '•').map(str::trim);
    let salary = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    let equity = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
    (salary, equity)
}

pub fn parse_job_detail(html: &str, url: &str) -> Option<RawPosting> {
    let document = Html::parse_document(html);

    let title = first_text(&document, selector(&TITLE, "h1"))?;
    let company = first_text(&document, selector(&COMPANY, "a[href^='/company/']"))
        .unwrap_or_else(|| "Unknown".to_string());
    let location = first_text(&document, selector(&LOCATION, "a[href*='/location/']"))
        .unwrap_or_else(|| "Remote".to_string());

    let description = document
        .select(selector(&DESCRIPTION, "#job-description"))
        .next()
        .map(|el| {
            el.text()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    let mut skills: Vec<String> = Vec::new();
    for tag in all_text(&document, selector(&SKILL_TAG, "div.rounded-3xl.bg-accent-persian-100")) {
        if !skills.contains(&tag) {
            skills.push(tag);
        }
    }

    let (salary, equity) = compensation(&all_text(
        &document,
        selector(&HEADER_ITEM, "ul[class*='flex'] li"),
    ));

    Some(RawPosting {
        title,
        company,
        location,
        description,
        url: url.to_string(),
        skills,
        salary,
        equity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    const LISTING: &str = r#"
        <html><body>
          <a href="/jobs/123-backend-engineer">Backend Engineer</a>
          <a href="/jobs/123-backend-engineer?ref=feed">Backend Engineer (again)</a>
          <a href="https://wellfound.com/jobs/456-data">Data</a>
          <a href="/jobs/signup">Sign up</a>
          <a href="/company/acme">Acme</a>
          <a href="/jobs?page=2">Next</a>
        </body></html>
    "#;

    const DETAIL: &str = r#"
        <html><body>
          <h1>  Senior Rust Engineer </h1>
          <a href="/company/acme"><span class="font-semibold">Acme Corp</span></a>
          <a href="/location/remote">Remote (Europe)</a>
          <ul class="flex flex-wrap">
            <li class="md:flex-none">Full Time</li>
            <li class="md:flex-none">$90k – $115k • 0.1% – 0.5%</li>
          </ul>
          <div id="job-description">
            <p>Build backend services in Rust.</p>
            <ul><li>Tokio</li><li>Postgres</li></ul>
          </div>
          <div class="mr-2 mt-2 rounded-3xl border bg-accent-persian-100">Kubernetes</div>
          <div class="mr-2 mt-2 rounded-3xl border bg-accent-persian-100">Rust</div>
          <div class="mr-2 mt-2 rounded-3xl border bg-accent-persian-100">Rust</div>
        </body></html>
    "#;

    #[test]
    fn test_collect_job_links() {
        let links = collect_job_links(LISTING, "https://wellfound.com/jobs");
        assert_eq!(
            links,
            vec![
                "https://wellfound.com/jobs/123-backend-engineer".to_string(),
                "https://wellfound.com/jobs/456-data".to_string(),
            ]
        );
    }

    #[test]
    fn test_parse_job_detail() {
        let job = parse_job_detail(DETAIL, "https://wellfound.com/jobs/123").unwrap();
        assert_eq!(job.title, "Senior Rust Engineer");
        assert_eq!(job.company, "Acme Corp");
        assert_eq!(job.location, "Remote (Europe)");
        assert_eq!(job.description, "Build backend services in Rust.\nTokio\nPostgres");
        assert_eq!(job.url, "https://wellfound.com/jobs/123");
        assert_eq!(job.skills, vec!["Kubernetes", "Rust"]);
        assert_eq!(job.salary.as_deref(), Some("$90k – $115k"));
        assert_eq!(job.equity.as_deref(), Some("0.1% – 0.5%"));
    }

    #[test]
    fn test_parse_job_detail_defaults() {
        let job = parse_job_detail("<h1>Engineer</h1>", "u").unwrap();
        assert_eq!(job.company, "Unknown");
        assert_eq!(job.location, "Remote");
        assert!(job.description.is_empty());
        assert!(job.skills.is_empty());
        assert_eq!(job.salary, None);
        assert_eq!(job.equity, None);

        assert!(parse_job_detail("<p>no title</p>", "u").is_none());
    }

    #[test]
    fn test_compensation_without_equity() {
        let items = vec!["Full Time".to_string(), "€60k – €80k".to_string()];
        assert_eq!(compensation(&items), (Some("€60k – €80k".to_string()), None));
        assert_eq!(compensation(&["Full Time".to_string()]), (None, None));
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::OK).is_none());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS).unwrap().is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY).unwrap().is_transient());
        assert!(classify_status(StatusCode::FORBIDDEN).unwrap().is_transient());
        assert!(!classify_status(StatusCode::UNAUTHORIZED).unwrap().is_transient());
    }

    /// Minimal HTTP/1.1 server answering fixed (status, body) pairs by path.
    /// Returns the base url and a log of requested paths.
    fn serve(routes: Vec<(&'static str, u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&hits);
        let routes: HashMap<&str, (u16, &str)> =
            routes.into_iter().map(|(p, s, b)| (p, (s, b))).collect();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let Ok(reader_stream) = stream.try_clone() else { continue };
                let mut reader = BufReader::new(reader_stream);
                let mut request_line = String::new();
                if reader.read_line(&mut request_line).is_err() {
                    continue;
                }
                loop {
                    let mut header = String::new();
                    match reader.read_line(&mut header) {
                        Ok(n) if n > 2 => continue,
                        _ => break,
                    }
                }

                let target = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();
                let path = target.split('?').next().unwrap_or("/").to_string();
                log.lock().unwrap().push(path.clone());

                let (status, body) = routes.get(path.as_str()).copied().unwrap_or((404, ""));
                let response = format!(
                    "HTTP/1.1 {} Test\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });

        (format!("http://{}", addr), hits)
    }

    const TWO_LINKS: &str = r#"<a href="/jobs/1-a">A</a><a href="/jobs/2-b">B</a>"#;
    const DETAIL_A: &str = "<h1>Backend Engineer</h1><div id=\"job-description\">Python</div>";
    const DETAIL_B: &str = "<h1>Data Engineer</h1>";

    fn source_for(base: &str) -> WellfoundSource {
        let config = ScraperConfig {
            base_url: format!("{}/jobs", base),
            delay_seconds: 0.0,
            timeout_seconds: 5,
            user_agents: vec!["scout-test".to_string()],
            ..Default::default()
        };
        WellfoundSource::new(&config, "python", "Remote").unwrap()
    }

    #[test]
    fn test_fetch_page_reads_listing_and_details() {
        let (base, hits) = serve(vec![
            ("/jobs", 200, TWO_LINKS),
            ("/jobs/1-a", 200, DETAIL_A),
            ("/jobs/2-b", 200, DETAIL_B),
        ]);
        let page = source_for(&base).fetch_page(1).unwrap();

        let titles: Vec<&str> = page.postings.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["Backend Engineer", "Data Engineer"]);
        assert_eq!(page.postings[0].url, format!("{}/jobs/1-a", base));
        assert_eq!(page.detail_failures, 0);
        assert_eq!(*hits.lock().unwrap(), vec!["/jobs", "/jobs/1-a", "/jobs/2-b"]);
    }

    #[test]
    fn test_fetch_page_with_every_detail_rate_limited_is_transient() {
        let (base, _) = serve(vec![
            ("/jobs", 200, TWO_LINKS),
            ("/jobs/1-a", 429, ""),
            ("/jobs/2-b", 429, ""),
        ]);
        match source_for(&base).fetch_page(1) {
            Err(FetchError::Transient(reason)) => {
                assert!(reason.contains("all 2 job pages failed"), "{}", reason);
                assert!(reason.contains("429"), "{}", reason);
            }
            other => panic!("expected transient error, got {:?}", other),
        }
    }

    #[test]
    fn test_fetch_page_counts_partial_detail_failures() {
        let (base, _) = serve(vec![
            ("/jobs", 200, TWO_LINKS),
            ("/jobs/1-a", 200, DETAIL_A),
            ("/jobs/2-b", 503, ""),
        ]);
        let page = source_for(&base).fetch_page(1).unwrap();
        assert_eq!(page.postings.len(), 1);
        assert_eq!(page.detail_failures, 1);
    }

    #[test]
    fn test_fetch_page_listing_statuses() {
        let (base, _) = serve(vec![("/jobs", 500, "")]);
        assert!(source_for(&base).fetch_page(1).unwrap_err().is_transient());

        let (base, _) = serve(vec![("/jobs", 401, "")]);
        assert!(matches!(source_for(&base).fetch_page(1), Err(FetchError::Fatal(_))));

        let (base, _) = serve(vec![]);
        assert_eq!(source_for(&base).fetch_page(3).unwrap(), Page::default());

        let (base, _) = serve(vec![("/jobs", 200, "<p>no jobs today</p>")]);
        assert_eq!(source_for(&base).fetch_page(1).unwrap(), Page::default());
    }

    #[test]
    fn test_run_aborts_when_every_detail_page_is_blocked() {
        use crate::db::Database;
        use crate::models::Profile;
        use crate::pipeline::{Pipeline, PipelineOptions, RunState};
        use crate::retry::RetryPolicy;

        let (base, hits) = serve(vec![
            ("/jobs", 200, TWO_LINKS),
            ("/jobs/1-a", 429, ""),
            ("/jobs/2-b", 429, ""),
        ]);
        let source = source_for(&base);
        let db = Database::open_in_memory().unwrap();
        let profile = Profile::default();
        let options = PipelineOptions {
            max_pages: 1,
            page_delay: Duration::ZERO,
            batch_size: 5,
            notifications_enabled: false,
            cover_letters_enabled: false,
            fetch_retry: RetryPolicy::new(2, Duration::ZERO, Duration::ZERO),
            notify_retry: RetryPolicy::new(1, Duration::ZERO, Duration::ZERO),
        };

        let aborted = Pipeline::new(&source, &db, &profile, options).run().unwrap_err();

        assert_eq!(aborted.error.class(), "FatalFetchError");
        assert_eq!(aborted.summary.state, RunState::Aborted);
        assert_eq!(aborted.summary.pages_ok, 0);
        assert_eq!(aborted.summary.skipped_pages.len(), 1);
        assert_eq!(aborted.summary.skipped_pages[0].attempts, 2);
        let listing_hits = hits.lock().unwrap().iter().filter(|p| *p == "/jobs").count();
        assert_eq!(listing_hits, 2);
        assert_eq!(db.count().unwrap(), 0);
    }
}
