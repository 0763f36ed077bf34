//! Source adapter contracts + HTML adapters for job boards.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobmon_core::{RawRecord, SearchQuery};
use jobmon_storage::{BackoffPolicy, FetchError, HttpFetcher};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "jobmon-adapters";

pub const KNOWN_SOURCES: &[&str] = &["indeed", "linkedin"];

#[derive(Debug, Error)]
pub enum SourceFetchError {
    #[error("fetch failed: {0}")]
    Fetch(#[source] FetchError),
    #[error("rate limited by {source_name}")]
    RateLimited { source_name: String },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl SourceFetchError {
    pub fn from_fetch(source_name: &str, err: FetchError) -> Self {
        if err.is_rate_limited() {
            SourceFetchError::RateLimited {
                source_name: source_name.to_string(),
            }
        } else {
            SourceFetchError::Fetch(err)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    Records(Vec<RawRecord>),
    Exhausted,
}

/// One listing site. Adapters only fetch and parse; identity and dedup live downstream.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &'static str;

    /// Pause between consecutive pages of one query.
    fn page_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Fetch page `page` (zero-based) of results for `query`.
    async fn fetch_page(
        &self,
        query: &SearchQuery,
        page: u32,
        retry: &BackoffPolicy,
    ) -> Result<PageOutcome, SourceFetchError>;
}

impl dyn SourceAdapter {
    /// Lazy page-by-page sequence of raw records, bounded by `max_pages`.
    pub fn fetch(&self, query: &SearchQuery, max_pages: u32, retry: BackoffPolicy) -> RecordPages<'_> {
        RecordPages {
            adapter: self,
            query: query.clone(),
            max_pages,
            retry,
            next_page: 0,
            finished: false,
        }
    }
}

/// Finite, non-restartable cursor over an adapter's result pages.
pub struct RecordPages<'a> {
    adapter: &'a dyn SourceAdapter,
    query: SearchQuery,
    max_pages: u32,
    retry: BackoffPolicy,
    next_page: u32,
    finished: bool,
}

impl RecordPages<'_> {
    pub fn pages_fetched(&self) -> u32 {
        self.next_page
    }

    /// Next non-empty page, or `None` once the source is exhausted or the page budget is spent.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RawRecord>>, SourceFetchError> {
        if self.finished || self.next_page >= self.max_pages {
            self.finished = true;
            return Ok(None);
        }

        if self.next_page > 0 {
            let delay = self.adapter.page_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let page = self.next_page;
        self.next_page += 1;
        match self.adapter.fetch_page(&self.query, page, &self.retry).await {
            Ok(PageOutcome::Records(records)) if !records.is_empty() => Ok(Some(records)),
            Ok(_) => {
                debug!(source = self.adapter.source_name(), page, "no more results");
                self.finished = true;
                Ok(None)
            }
            Err(err) => {
                self.finished = true;
                Err(err)
            }
        }
    }

    pub async fn collect_all(mut self) -> Result<Vec<RawRecord>, SourceFetchError> {
        let mut out = Vec::new();
        while let Some(page) = self.next_page().await? {
            out.extend(page);
        }
        Ok(out)
    }
}

fn selector(css: &str) -> Result<Selector, SourceFetchError> {
    Selector::parse(css).map_err(|e| SourceFetchError::Parse(format!("selector {css:?}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn first_text(scope: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<Vec<_>>().join(" ")))
}

fn first_attr(scope: &ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

fn search_url(
    base_url: &str,
    path: &str,
    params: &[(&str, String)],
) -> Result<String, SourceFetchError> {
    let endpoint = format!("{}{}", base_url.trim_end_matches('/'), path);
    Url::parse_with_params(&endpoint, params)
        .map(|u| u.to_string())
        .map_err(|e| SourceFetchError::Parse(format!("search url {endpoint}: {e}")))
}

/// Strip tracking query strings and fragments so a posting keeps one url across scrapes.
pub fn canonical_posting_url(href: &str) -> String {
    match Url::parse(href) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => href
            .split(['?', '#'])
            .next()
            .unwrap_or(href)
            .to_string(),
    }
}

pub const INDEED_BASE_URL: &str = "https://www.indeed.com";
const INDEED_PAGE_SIZE: u32 = 10;

#[derive(Debug, Clone)]
pub struct IndeedAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
    page_delay: Duration,
}

impl IndeedAdapter {
    pub fn new(http: Arc<HttpFetcher>, page_delay: Duration) -> Self {
        Self {
            http,
            base_url: INDEED_BASE_URL.to_string(),
            page_delay,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn search_url(&self, query: &SearchQuery, page: u32) -> Result<String, SourceFetchError> {
        search_url(
            &self.base_url,
            "/jobs",
            &[
                ("q", query.term.clone()),
                ("l", query.location.clone()),
                ("start", (page * INDEED_PAGE_SIZE).to_string()),
            ],
        )
    }
}

/// Parse an Indeed results page. Cards without a job key yield records with no url.
pub fn parse_indeed_results(html: &str, base_url: &str) -> Result<Vec<RawRecord>, SourceFetchError> {
    let document = Html::parse_document(html);
    let card = selector("div.job_seen_beacon")?;
    let title = selector("h2.jobTitle")?;
    let link = selector("h2.jobTitle a")?;
    let company = selector("[data-testid=\"company-name\"]")?;
    let location = selector("[data-testid=\"text-location\"]")?;
    let snippet = selector("div.job-snippet")?;
    let date = selector("span.date")?;
    let base = base_url.trim_end_matches('/');

    Ok(document
        .select(&card)
        .map(|card| RawRecord {
            title: first_text(&card, &title),
            company: first_text(&card, &company),
            location: first_text(&card, &location),
            url: first_attr(&card, &link, "data-jk").map(|jk| format!("{base}/viewjob?jk={jk}")),
            posted_date: first_text(&card, &date),
            description_snippet: first_text(&card, &snippet),
        })
        .collect())
}

#[async_trait]
impl SourceAdapter for IndeedAdapter {
    fn source_name(&self) -> &'static str {
        "indeed"
    }

    fn page_delay(&self) -> Duration {
        self.page_delay
    }

    async fn fetch_page(
        &self,
        query: &SearchQuery,
        page: u32,
        retry: &BackoffPolicy,
    ) -> Result<PageOutcome, SourceFetchError> {
        let url = self.search_url(query, page)?;
        info!(source = "indeed", page = page + 1, %url, "fetching results page");
        let body = self
            .http
            .fetch_text(self.source_name(), &url, retry)
            .await
            .map_err(|e| SourceFetchError::from_fetch(self.source_name(), e))?;
        let records = parse_indeed_results(&body, &self.base_url)?;
        Ok(if records.is_empty() {
            PageOutcome::Exhausted
        } else {
            PageOutcome::Records(records)
        })
    }
}

pub const LINKEDIN_BASE_URL: &str = "https://www.linkedin.com";
const LINKEDIN_PAGE_SIZE: u32 = 25;

/// LinkedIn's public guest search endpoint, which serves server-rendered result cards.
#[derive(Debug, Clone)]
pub struct LinkedInAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
    page_delay: Duration,
}

impl LinkedInAdapter {
    pub fn new(http: Arc<HttpFetcher>, page_delay: Duration) -> Self {
        Self {
            http,
            base_url: LINKEDIN_BASE_URL.to_string(),
            page_delay,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn search_url(&self, query: &SearchQuery, page: u32) -> Result<String, SourceFetchError> {
        search_url(
            &self.base_url,
            "/jobs-guest/jobs/api/seeMoreJobPostings/search",
            &[
                ("keywords", query.term.clone()),
                ("location", query.location.clone()),
                ("start", (page * LINKEDIN_PAGE_SIZE).to_string()),
            ],
        )
    }
}

pub fn parse_linkedin_results(html: &str) -> Result<Vec<RawRecord>, SourceFetchError> {
    let document = Html::parse_document(html);
    let card = selector("div.base-card")?;
    let title = selector("h3.base-search-card__title")?;
    let company = selector("h4.base-search-card__subtitle")?;
    let location = selector("span.job-search-card__location")?;
    let link = selector("a.base-card__full-link")?;
    let posted = selector("time")?;

    Ok(document
        .select(&card)
        .map(|card| RawRecord {
            title: first_text(&card, &title),
            company: first_text(&card, &company),
            location: first_text(&card, &location),
            url: first_attr(&card, &link, "href").map(|href| canonical_posting_url(&href)),
            posted_date: first_attr(&card, &posted, "datetime"),
            description_snippet: None,
        })
        .collect())
}

#[async_trait]
impl SourceAdapter for LinkedInAdapter {
    fn source_name(&self) -> &'static str {
        "linkedin"
    }

    fn page_delay(&self) -> Duration {
        self.page_delay
    }

    async fn fetch_page(
        &self,
        query: &SearchQuery,
        page: u32,
        retry: &BackoffPolicy,
    ) -> Result<PageOutcome, SourceFetchError> {
        let url = self.search_url(query, page)?;
        info!(source = "linkedin", page = page + 1, %url, "fetching results page");
        let body = self
            .http
            .fetch_text(self.source_name(), &url, retry)
            .await
            .map_err(|e| SourceFetchError::from_fetch(self.source_name(), e))?;
        let records = parse_linkedin_results(&body)?;
        Ok(if records.is_empty() {
            PageOutcome::Exhausted
        } else {
            PageOutcome::Records(records)
        })
    }
}

pub fn normalize_source_name(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

pub fn adapter_for_source(
    source: &str,
    http: Arc<HttpFetcher>,
    page_delay: Duration,
) -> Option<Arc<dyn SourceAdapter>> {
    match normalize_source_name(source).as_str() {
        "indeed" => Some(Arc::new(IndeedAdapter::new(http, page_delay))),
        "linkedin" => Some(Arc::new(LinkedInAdapter::new(http, page_delay))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobmon_storage::HttpClientConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    const INDEED_PAGE: &str = r#"
        <html><body>
          <div class="job_seen_beacon">
            <h2 class="jobTitle"><a data-jk="abc123" href="/rc/clk?jk=abc123"><span>Senior Python</span> <span>Developer</span></a></h2>
            <span data-testid="company-name">Tech Corp</span>
            <div data-testid="text-location">Remote</div>
            <div class="job-snippet"><ul><li>Build APIs with FastAPI.</li></ul></div>
            <span class="date">Posted 3 days ago</span>
          </div>
          <div class="job_seen_beacon">
            <h2 class="jobTitle"><a href="/pagead/clk">Sponsored Role</a></h2>
            <span data-testid="company-name">Ad Corp</span>
          </div>
        </body></html>
    "#;

    const LINKEDIN_PAGE: &str = r#"
        <li>
          <div class="base-card job-search-card">
            <a class="base-card__full-link" href="https://www.linkedin.com/jobs/view/data-engineer-at-acme-3811?refId=xyz&amp;trackingId=abc">
              <span class="sr-only">Data Engineer</span>
            </a>
            <h3 class="base-search-card__title">  Data Engineer </h3>
            <h4 class="base-search-card__subtitle"><a>Acme</a></h4>
            <span class="job-search-card__location">San Francisco, CA</span>
            <time class="job-search-card__listdate" datetime="2026-02-20">1 week ago</time>
          </div>
        </li>
    "#;

    fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http client"))
    }

    #[test]
    fn indeed_cards_parse_into_raw_records() {
        let records = parse_indeed_results(INDEED_PAGE, "https://www.indeed.com/").unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.title.as_deref(), Some("Senior Python Developer"));
        assert_eq!(first.company.as_deref(), Some("Tech Corp"));
        assert_eq!(first.location.as_deref(), Some("Remote"));
        assert_eq!(
            first.url.as_deref(),
            Some("https://www.indeed.com/viewjob?jk=abc123")
        );
        assert_eq!(first.posted_date.as_deref(), Some("Posted 3 days ago"));
        assert_eq!(
            first.description_snippet.as_deref(),
            Some("Build APIs with FastAPI.")
        );

        // no job key means no stable url; the normalizer rejects it later
        assert_eq!(records[1].url, None);
        assert_eq!(records[1].location, None);
    }

    #[test]
    fn linkedin_cards_parse_with_canonical_urls() {
        let records = parse_linkedin_results(LINKEDIN_PAGE).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.title.as_deref(), Some("Data Engineer"));
        assert_eq!(record.company.as_deref(), Some("Acme"));
        assert_eq!(record.location.as_deref(), Some("San Francisco, CA"));
        assert_eq!(
            record.url.as_deref(),
            Some("https://www.linkedin.com/jobs/view/data-engineer-at-acme-3811")
        );
        assert_eq!(record.posted_date.as_deref(), Some("2026-02-20"));
        assert_eq!(record.description_snippet, None);
    }

    #[test]
    fn pages_without_cards_parse_to_nothing() {
        assert!(parse_indeed_results("<html></html>", INDEED_BASE_URL)
            .unwrap()
            .is_empty());
        assert!(parse_linkedin_results("").unwrap().is_empty());
    }

    #[test]
    fn canonical_url_drops_tracking_params() {
        assert_eq!(
            canonical_posting_url("https://example.com/jobs/view/1?trk=a#frag"),
            "https://example.com/jobs/view/1"
        );
        assert_eq!(canonical_posting_url("/jobs/view/1?trk=a"), "/jobs/view/1");
    }

    #[test]
    fn search_urls_encode_query_and_page_offsets() {
        let query = SearchQuery::new("python developer", "New York");
        let indeed = IndeedAdapter::new(fetcher(), Duration::ZERO);
        assert_eq!(
            indeed.search_url(&query, 2).unwrap(),
            "https://www.indeed.com/jobs?q=python+developer&l=New+York&start=20"
        );
        let linkedin = LinkedInAdapter::new(fetcher(), Duration::ZERO).with_base_url("http://localhost:9/");
        assert_eq!(
            linkedin.search_url(&query, 1).unwrap(),
            "http://localhost:9/jobs-guest/jobs/api/seeMoreJobPostings/search?keywords=python+developer&location=New+York&start=25"
        );
    }

    #[test]
    fn registry_resolves_known_sources_only() {
        let http = fetcher();
        let indeed = adapter_for_source(" Indeed ", http.clone(), Duration::ZERO).unwrap();
        assert_eq!(indeed.source_name(), "indeed");
        let linkedin = adapter_for_source("LinkedIn", http.clone(), Duration::ZERO).unwrap();
        assert_eq!(linkedin.source_name(), "linkedin");
        assert!(adapter_for_source("monster", http, Duration::ZERO).is_none());
    }

    struct ScriptedAdapter {
        pages: Vec<Result<PageOutcome, String>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SourceAdapter for ScriptedAdapter {
        fn source_name(&self) -> &'static str {
            "scripted"
        }

        async fn fetch_page(
            &self,
            _query: &SearchQuery,
            page: u32,
            _retry: &BackoffPolicy,
        ) -> Result<PageOutcome, SourceFetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.pages.get(page as usize) {
                Some(Ok(outcome)) => Ok(outcome.clone()),
                Some(Err(msg)) => Err(SourceFetchError::Parse(msg.clone())),
                None => Ok(PageOutcome::Exhausted),
            }
        }
    }

    fn page(titles: &[&str]) -> Result<PageOutcome, String> {
        Ok(PageOutcome::Records(
            titles
                .iter()
                .map(|t| RawRecord {
                    title: Some(t.to_string()),
                    url: Some(format!("https://example.com/{t}")),
                    ..Default::default()
                })
                .collect(),
        ))
    }

    fn scripted(pages: Vec<Result<PageOutcome, String>>) -> Arc<ScriptedAdapter> {
        Arc::new(ScriptedAdapter {
            pages,
            calls: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn cursor_stops_at_page_budget() {
        let adapter = scripted(vec![page(&["a"]), page(&["b"]), page(&["c"])]);
        let dyn_adapter: Arc<dyn SourceAdapter> = adapter.clone();
        let query = SearchQuery::new("rust", "remote");
        let records = dyn_adapter
            .fetch(&query, 2, BackoffPolicy::none())
            .collect_all()
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cursor_stops_on_exhaustion_and_stays_finished() {
        let adapter = scripted(vec![page(&["a", "b"]), Ok(PageOutcome::Records(vec![])), page(&["c"])]);
        let dyn_adapter: Arc<dyn SourceAdapter> = adapter.clone();
        let query = SearchQuery::new("rust", "remote");
        let mut pages = dyn_adapter.fetch(&query, 5, BackoffPolicy::none());

        assert_eq!(pages.next_page().await.unwrap().map(|p| p.len()), Some(2));
        assert_eq!(pages.next_page().await.unwrap(), None);
        assert_eq!(pages.next_page().await.unwrap(), None);
        assert_eq!(pages.pages_fetched(), 2);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cursor_surfaces_page_errors() {
        let adapter = scripted(vec![page(&["a"]), Err("markup changed".into())]);
        let dyn_adapter: Arc<dyn SourceAdapter> = adapter;
        let query = SearchQuery::new("rust", "remote");
        let err = dyn_adapter
            .fetch(&query, 5, BackoffPolicy::none())
            .collect_all()
            .await
            .unwrap_err();
        assert!(matches!(err, SourceFetchError::Parse(msg) if msg == "markup changed"));
    }

    #[test]
    fn rate_limited_fetches_are_classified() {
        let err = SourceFetchError::from_fetch(
            "indeed",
            FetchError::HttpStatus {
                status: 429,
                url: "https://www.indeed.com/jobs".into(),
            },
        );
        assert!(matches!(err, SourceFetchError::RateLimited { source_name } if source_name == "indeed"));
    }
}
