use std::{
    collections::BTreeMap,
    error::Error as _,
    io,
    sync::Arc,
};

use rand::Rng;
use reqwest::{
    blocking::{Client, Response},
    cookie::{CookieStore, Jar},
    header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER, USER_AGENT},
    Method, StatusCode,
};
use scraper::Html;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    cancel::CancelToken,
    config::Settings,
    error::Error,
    waiter::{Backoff, Band, Clock, Waiter},
};

pub static USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/92.0.4515.159 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/93.0.4577.82 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:91.0) Gecko/20100101 Firefox/91.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:92.0) Gecko/20100101 Firefox/92.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/15.0 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/106.0.0.0 Safari/537.36",
];

/// A fetched html document.
#[derive(Clone, Debug)]
pub struct Page {
    /// The final url, after redirects.
    pub url: Url,
    pub body: String,
}

impl Page {
    pub fn new(url: Url, body: impl Into<String>) -> Self {
        Self {
            url,
            body: body.into(),
        }
    }

    pub fn html(&self) -> Html {
        Html::parse_document(&self.body)
    }
}

/// Timing knobs for page requests.
#[derive(Copy, Clone, Debug)]
pub struct FetchPolicy {
    pub max_attempts: u32,
    pub before: Band,
    pub after: Band,
    pub backoff: Backoff,
}

impl FetchPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            before: settings.page_delay,
            after: settings.post_delay,
            backoff: Backoff::pages(),
        }
    }
}

/// Rate-limited, retrying http access to one site.
pub struct Fetcher {
    client: Client,
    jar: Arc<Jar>,
    site: Url,
    domain: String,
    charset: Option<&'static str>,
    policy: FetchPolicy,
    waiter: Waiter,
}

impl Fetcher {
    pub fn new(
        settings: &Settings,
        site: &Url,
        charset: Option<&'static str>,
        clock: Arc<dyn Clock>,
        cancel: CancelToken,
    ) -> crate::Result<Self> {
        let jar = Arc::new(Jar::default());
        let client = build_client(settings, jar.clone())?;
        let domain = site_domain(site)?;

        Ok(Self {
            client,
            jar,
            site: site.clone(),
            domain,
            charset,
            policy: FetchPolicy::from_settings(settings),
            waiter: Waiter::new(clock, cancel, settings.rate),
        })
    }

    #[cfg(test)]
    pub fn with_policy(mut self, policy: FetchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn waiter(&self) -> &Waiter {
        &self.waiter
    }

    pub fn cancel_token(&self) -> &CancelToken {
        self.waiter.cancel_token()
    }

    /// Whether `url` belongs to the site this fetcher serves.
    pub fn is_on_site(&self, url: &Url) -> bool {
        url.host_str()
            .map(|host| host == self.domain || host.ends_with(&format!(".{}", self.domain)))
            .unwrap_or(false)
    }

    pub fn page(&self, url: &Url) -> crate::Result<Option<Page>> {
        self.fetch(Method::GET, url, &[])
    }

    /// Fetches an html document with retries.
    ///
    /// `params` are sent as the query string for GET and as a form body
    /// otherwise. A response that lands on another domain yields `Ok(None)`.
    pub fn fetch(
        &self,
        method: Method,
        url: &Url,
        params: &[(&str, &str)],
    ) -> crate::Result<Option<Page>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.waiter.pause(self.policy.before)?;

            let connection_reset = match self.send(method.clone(), url, params) {
                Ok(response) if response.status().is_success() => {
                    if !self.is_on_site(response.url()) {
                        warn!("{} redirected to {}, skipping", url, response.url());
                        return Ok(None);
                    }

                    let final_url = response.url().clone();
                    let body = match self.charset {
                        Some(charset) => response.text_with_charset(charset),
                        None => response.text(),
                    };
                    match body {
                        Ok(body) => {
                            self.waiter.pause(self.policy.after)?;
                            debug!("fetched {} ({} bytes)", final_url, body.len());
                            return Ok(Some(Page::new(final_url, body)));
                        }
                        Err(e) => {
                            warn!(
                                "reading {} failed ({}/{}): {}",
                                url, attempt, self.policy.max_attempts, e
                            );
                            is_connection_reset(&e)
                        }
                    }
                }

                Ok(response) if !is_retryable(response.status()) => {
                    return Err(Error::Status {
                        url: url.to_string(),
                        status: response.status(),
                    });
                }

                Ok(response) => {
                    warn!(
                        "{} answered {} ({}/{})",
                        url,
                        response.status(),
                        attempt,
                        self.policy.max_attempts
                    );
                    false
                }

                Err(Error::Network(e)) => {
                    warn!(
                        "request to {} failed ({}/{}): {}",
                        url, attempt, self.policy.max_attempts, e
                    );
                    is_connection_reset(&e)
                }

                Err(e) => return Err(e),
            };

            if attempt >= self.policy.max_attempts {
                return Err(Error::Exhausted {
                    url: url.to_string(),
                    attempts: attempt,
                });
            }

            let delay = self
                .policy
                .backoff
                .delay(attempt, connection_reset, &mut rand::rng());
            info!("retrying {} in {:.2}s", url, delay.as_secs_f64());
            self.waiter.sleep(delay)?;
        }
    }

    /// A single throttled request with a rotated user agent.
    ///
    /// Fails with `Cancelled` if the run stops while waiting for a token.
    pub fn send(
        &self,
        method: Method,
        url: &Url,
        params: &[(&str, &str)],
    ) -> crate::Result<Response> {
        if let Some(host) = url.host_str() {
            self.waiter.throttle(host)?;
        }

        let agent = USER_AGENTS[rand::rng().random_range(0..USER_AGENTS.len())];
        let request = self
            .client
            .request(method.clone(), url.clone())
            .header(USER_AGENT, agent)
            .header(REFERER, url.as_str());

        let request = if params.is_empty() {
            request
        } else if method == Method::GET {
            request.query(params)
        } else {
            request.form(params)
        };

        Ok(request.send()?)
    }

    pub fn get(&self, url: &Url) -> crate::Result<Response> {
        self.send(Method::GET, url, &[])
    }

    /// Cookies the session currently holds for the site.
    pub fn cookies(&self) -> BTreeMap<String, String> {
        self.jar
            .cookies(&self.site)
            .and_then(|header| header.to_str().ok().map(parse_cookie_header))
            .unwrap_or_default()
    }

    pub fn load_cookies(&self, cookies: &BTreeMap<String, String>) {
        for (name, value) in cookies {
            self.jar
                .add_cookie_str(&format!("{}={}", name, value), &self.site);
        }
    }
}

pub(crate) fn build_client(settings: &Settings, jar: Arc<Jar>) -> crate::Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
    );

    let mut builder = Client::builder()
        .default_headers(headers)
        .cookie_provider(jar)
        .connect_timeout(settings.connect_timeout)
        .timeout(settings.read_timeout);

    if let Some(proxy) = &settings.proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
    }

    Ok(builder.build()?)
}

pub(crate) fn site_domain(site: &Url) -> crate::Result<String> {
    use crate::error::UnsupportedError;

    let host = site
        .host_str()
        .ok_or_else(|| Error::Unsupported(UnsupportedError::Route, site.to_string()))?;
    Ok(host.trim_start_matches("www.").to_string())
}

pub fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || matches!(status.as_u16(), 408 | 429 | 443)
}

/// Walks the error chain looking for a reset connection.
pub fn is_connection_reset(e: &reqwest::Error) -> bool {
    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<io::Error>() {
            if matches!(
                io.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
            ) {
                return true;
            }
        }
        source = err.source();
    }
    false
}

fn parse_cookie_header(header: &str) -> BTreeMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use reqwest::StatusCode;

    use super::{parse_cookie_header, FetchPolicy, Fetcher};
    use crate::{
        cancel::CancelToken,
        config::Settings,
        testing::{Fixture, ManualClock, Reply},
        waiter::{Backoff, Band},
    };

    pub fn quiet_settings() -> Settings {
        Settings {
            page_delay: Band::zero(),
            post_delay: Band::zero(),
            listing_delay: Band::zero(),
            album_delay: Band::zero(),
            image_delay: Band::zero(),
            rate: None,
            max_attempts: 3,
            ..Settings::default()
        }
    }

    pub fn fetcher_for(fixture: &Fixture, clock: Arc<ManualClock>) -> Fetcher {
        let settings = quiet_settings();
        let policy = FetchPolicy {
            backoff: Backoff {
                jitter: Band::zero(),
                ..Backoff::pages()
            },
            ..FetchPolicy::from_settings(&settings)
        };
        Fetcher::new(&settings, &fixture.url("/"), None, clock, CancelToken::new())
            .unwrap()
            .with_policy(policy)
    }

    #[test]
    fn fetches_pages() {
        let fixture = Fixture::start();
        fixture.route("/list", Reply::html("<html><title>Hi</title></html>"));
        let fetcher = fetcher_for(&fixture, Arc::new(ManualClock::new()));

        let page = fetcher.page(&fixture.url("/list")).unwrap().unwrap();
        assert!(page.body.contains("<title>Hi</title>"));
        assert_eq!(fixture.url("/list"), page.url);
    }

    #[test]
    fn retries_server_errors_with_backoff() {
        let fixture = Fixture::start();
        fixture.routes(
            "/flaky",
            vec![Reply::status(503), Reply::status(500), Reply::html("ok")],
        );
        let clock = Arc::new(ManualClock::new());
        let fetcher = fetcher_for(&fixture, clock.clone());

        let page = fetcher.page(&fixture.url("/flaky")).unwrap().unwrap();
        assert_eq!("ok", page.body);
        assert_eq!(3, fixture.hits("/flaky"));
        // 6s after the first failure, 12s after the second.
        assert_eq!(std::time::Duration::from_secs(18), clock.elapsed());
    }

    #[test]
    fn exhausted_retries_are_reported() {
        let fixture = Fixture::start();
        fixture.route("/down", Reply::status(502));
        let fetcher = fetcher_for(&fixture, Arc::new(ManualClock::new()));

        let err = fetcher.page(&fixture.url("/down")).unwrap_err();
        assert!(matches!(err, crate::Error::Exhausted { attempts: 3, .. }));
        assert_eq!(3, fixture.hits("/down"));
    }

    #[test]
    fn client_errors_are_not_retried() {
        let fixture = Fixture::start();
        fixture.route("/gone", Reply::status(404));
        let fetcher = fetcher_for(&fixture, Arc::new(ManualClock::new()));

        let err = fetcher.page(&fixture.url("/gone")).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Status {
                status: StatusCode::NOT_FOUND,
                ..
            }
        ));
        assert_eq!(1, fixture.hits("/gone"));
    }

    #[test]
    fn on_site_redirects_are_followed() {
        let fixture = Fixture::start();
        fixture.route("/old", Reply::redirect(fixture.url("/new").to_string()));
        fixture.route("/new", Reply::html("moved"));
        let fetcher = fetcher_for(&fixture, Arc::new(ManualClock::new()));

        let page = fetcher.page(&fixture.url("/old")).unwrap().unwrap();
        assert_eq!(fixture.url("/new"), page.url);
    }

    #[test]
    fn cut_off_bodies_are_retried() {
        let fixture = Fixture::start();
        fixture.routes(
            "/list",
            vec![Reply::html("<html>cut").truncated(1000), Reply::html("whole")],
        );
        let fetcher = fetcher_for(&fixture, Arc::new(ManualClock::new()));

        let page = fetcher.page(&fixture.url("/list")).unwrap().unwrap();
        assert_eq!("whole", page.body);
        assert_eq!(2, fixture.hits("/list"));
    }

    #[test]
    fn off_site_redirects_yield_nothing() {
        let fixture = Fixture::start();
        let mut elsewhere = fixture.url("/new");
        elsewhere.set_host(Some("localhost")).unwrap();
        fixture.route("/old", Reply::redirect(elsewhere.to_string()));
        fixture.route("/new", Reply::html("moved"));
        let fetcher = fetcher_for(&fixture, Arc::new(ManualClock::new()));

        assert!(fetcher.page(&fixture.url("/old")).unwrap().is_none());
        assert_eq!(1, fixture.hits("/old"));
    }

    #[test]
    fn throttled_requests_stop_on_cancel() {
        let fixture = Fixture::start();
        fixture.route("/a", Reply::html("a"));
        let settings = Settings {
            rate: Some(1.0),
            ..quiet_settings()
        };
        let cancel = CancelToken::new();
        let fetcher = Fetcher::new(
            &settings,
            &fixture.url("/"),
            None,
            Arc::new(ManualClock::new()),
            cancel.clone(),
        )
        .unwrap();

        assert!(fetcher.get(&fixture.url("/a")).is_ok());
        cancel.cancel();
        assert!(matches!(
            fetcher.get(&fixture.url("/a")),
            Err(crate::Error::Cancelled)
        ));
        assert_eq!(1, fixture.hits("/a"));
    }

    #[test]
    fn site_membership_includes_subdomains() {
        let fixture = Fixture::start();
        let fetcher = fetcher_for(&fixture, Arc::new(ManualClock::new()));
        assert!(fetcher.is_on_site(&fixture.url("/albums/1")));
        assert!(!fetcher.is_on_site(&url::Url::parse("https://ads.example.net/").unwrap()));
    }

    #[test]
    fn cookie_header_round_trips_through_the_jar() {
        let fixture = Fixture::start();
        let fetcher = fetcher_for(&fixture, Arc::new(ManualClock::new()));
        let mut cookies = BTreeMap::new();
        cookies.insert("session".to_string(), "abc123".to_string());
        fetcher.load_cookies(&cookies);
        assert_eq!(cookies, fetcher.cookies());

        let parsed = parse_cookie_header("a=1; b=2");
        assert_eq!(Some(&"2".to_string()), parsed.get("b"));
    }
}
