//! Fetch capability: the stateful client that loads the event page.
//!
//! A capability carries its own cookie jar. The session manager decides
//! when one is created, seeded with a saved session, and retired.

use crate::session::{Cookie, Session};
use async_trait::async_trait;
use rand::seq::IndexedRandom;
use reqwest::cookie::CookieStore;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Url;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/92.0.4515.107 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/90.0.4430.212 Safari/537.36",
];

const WARMUP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("failed to read body: {0}")]
    Body(String),
    #[error("client error: {0}")]
    Client(String),
}

impl FetchError {
    /// Timeouts and connection failures are expected now and then and do
    /// not make the capability suspect.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Timeout(_) | FetchError::Connection(_))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            FetchError::Connection(e.to_string())
        } else if e.is_body() || e.is_decode() {
            FetchError::Body(e.to_string())
        } else {
            FetchError::Client(e.to_string())
        }
    }
}

/// A loaded page. Non-success statuses still produce a document so the
/// blocking detector can look at the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub url: String,
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait Capability: Send {
    async fn fetch(&mut self, url: &str, timeout: Duration) -> Result<Document, FetchError>;

    fn apply_session(&mut self, session: &Session);

    fn current_session(&self) -> Result<Session, FetchError>;

    /// Release the capability's resources. Never reused afterwards.
    async fn teardown(&mut self);
}

#[async_trait]
pub trait CapabilityFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn Capability>, FetchError>;
}

/// Cookie jar installed as the client's cookie provider, so cookies set on
/// every hop (redirects included) land here. Scoped to the one site the
/// capability talks to: domain and path attributes are not tracked.
#[derive(Debug, Default)]
pub struct SessionJar {
    cookies: Mutex<BTreeMap<String, String>>,
}

impl SessionJar {
    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.cookies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, name: &str, value: &str) {
        self.entries().insert(name.to_string(), value.to_string());
    }

    pub fn snapshot(&self) -> Vec<Cookie> {
        self.entries()
            .iter()
            .map(|(name, value)| Cookie {
                name: name.clone(),
                value: value.clone(),
            })
            .collect()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }
}

impl CookieStore for SessionJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let mut jar = self.entries();
        for raw in cookie_headers {
            let Ok(raw) = raw.to_str() else { continue };
            let Some((name, value)) = parse_set_cookie(raw) else {
                continue;
            };
            trace!(url = %url, cookie = name, "cookie received");
            if value.is_empty() {
                jar.remove(name);
            } else {
                jar.insert(name.to_string(), value.to_string());
            }
        }
    }

    fn cookies(&self, _url: &Url) -> Option<HeaderValue> {
        let jar = self.entries();
        if jar.is_empty() {
            return None;
        }
        let joined = jar
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&joined).ok()
    }
}

/// reqwest-backed capability. Its cookies live in a [`SessionJar`] so they
/// can be exported and restored across capability restarts.
pub struct HttpCapability {
    client: reqwest::Client,
    jar: Arc<SessionJar>,
}

impl HttpCapability {
    pub fn new(user_agent: &'static str) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-GB,en;q=0.5"),
        );

        let jar = Arc::new(SessionJar::default());
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .cookie_provider(jar.clone())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self { client, jar })
    }
}

#[async_trait]
impl Capability for HttpCapability {
    async fn fetch(&mut self, url: &str, timeout: Duration) -> Result<Document, FetchError> {
        let resp = self.client.get(url).timeout(timeout).send().await?;
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let body = resp.text().await?;

        debug!(url = %final_url, status, bytes = body.len(), "page fetched");
        Ok(Document {
            url: final_url,
            status,
            body,
        })
    }

    fn apply_session(&mut self, session: &Session) {
        for cookie in &session.cookies {
            self.jar.insert(&cookie.name, &cookie.value);
        }
    }

    fn current_session(&self) -> Result<Session, FetchError> {
        Ok(Session {
            cookies: self.jar.snapshot(),
        })
    }

    async fn teardown(&mut self) {
        self.jar.clear();
        debug!("http capability released");
    }
}

/// Builds [`HttpCapability`] instances with a randomly picked user agent,
/// optionally visiting the site root first to pick up its cookies.
#[derive(Debug, Clone, Default)]
pub struct HttpCapabilityFactory {
    warmup_url: Option<String>,
}

impl HttpCapabilityFactory {
    pub fn new(warmup_url: Option<String>) -> Self {
        Self { warmup_url }
    }
}

#[async_trait]
impl CapabilityFactory for HttpCapabilityFactory {
    async fn create(&self) -> Result<Box<dyn Capability>, FetchError> {
        let user_agent = USER_AGENTS
            .choose(&mut rand::rng())
            .copied()
            .unwrap_or(USER_AGENTS[0]);
        let mut capability = HttpCapability::new(user_agent)?;

        if let Some(ref url) = self.warmup_url {
            // A failed warm-up is not fatal; the real fetch will tell.
            match capability.fetch(url, WARMUP_TIMEOUT).await {
                Ok(doc) => debug!(url = %url, status = doc.status, "warm-up visit done"),
                Err(e) => debug!(url = %url, error = %e, "warm-up visit failed"),
            }
        }

        info!(user_agent = %user_agent, "http capability initialized");
        Ok(Box::new(capability))
    }
}

/// `name=value; Path=/; ...` → `(name, value)`. Expired cookies come back
/// with an empty value.
fn parse_set_cookie(raw: &str) -> Option<(&str, &str)> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.trim().split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let expired = parts.any(|attr| {
        let attr = attr.trim().to_ascii_lowercase();
        attr == "max-age=0" || attr.starts_with("max-age=-")
    });
    Some((name, if expired { "" } else { value.trim() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_set_cookie() {
        assert_eq!(
            parse_set_cookie("sid=abc123; Path=/; HttpOnly"),
            Some(("sid", "abc123"))
        );
        assert_eq!(parse_set_cookie("sid=gone; Max-Age=0"), Some(("sid", "")));
        assert_eq!(parse_set_cookie("garbage"), None);
        assert_eq!(parse_set_cookie("=novalue"), None);
    }

    #[test]
    fn test_transient_classification() {
        assert!(FetchError::Timeout("t".into()).is_transient());
        assert!(FetchError::Connection("c".into()).is_transient());
        assert!(!FetchError::Body("b".into()).is_transient());
        assert!(!FetchError::Client("x".into()).is_transient());
    }

    #[test]
    fn test_session_round_trip_through_jar() {
        let mut cap = HttpCapability::new(USER_AGENTS[0]).unwrap();
        let session = Session {
            cookies: vec![
                Cookie { name: "a".into(), value: "1".into() },
                Cookie { name: "b".into(), value: "2".into() },
            ],
        };
        cap.apply_session(&session);
        assert_eq!(cap.current_session().unwrap(), session);
    }

    #[tokio::test]
    async fn test_fetch_carries_cookies_forward() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "sid=xyz; Path=/"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/event"))
            .and(header("cookie", "sid=xyz"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>event</html>"))
            .mount(&server)
            .await;

        let mut cap = HttpCapability::new(USER_AGENTS[1]).unwrap();
        cap.fetch(&format!("{}/", server.uri()), Duration::from_secs(5))
            .await
            .unwrap();
        let doc = cap
            .fetch(&format!("{}/event", server.uri()), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(doc.status, 200);
        assert_eq!(doc.body, "<html>event</html>");
        assert_eq!(cap.current_session().unwrap().cookies.len(), 1);
    }

    #[tokio::test]
    async fn test_error_status_still_yields_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).set_body_string("429 Too Many Requests"))
            .mount(&server)
            .await;

        let mut cap = HttpCapability::new(USER_AGENTS[0]).unwrap();
        let doc = cap.fetch(&server.uri(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(doc.status, 429);
        assert!(doc.body.contains("Too Many Requests"));
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let mut cap = HttpCapability::new(USER_AGENTS[0]).unwrap();
        let err = cap
            .fetch(&server.uri(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)), "{err:?}");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_factory_warms_up_against_site_root() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).insert_header("set-cookie", "consent=yes"))
            .expect(1)
            .mount(&server)
            .await;

        let factory = HttpCapabilityFactory::new(Some(format!("{}/", server.uri())));
        let cap = factory.create().await.unwrap();
        let session = cap.current_session().unwrap();
        assert_eq!(session.cookies[0].name, "consent");
    }

    #[tokio::test]
    async fn test_warm_up_keeps_cookies_set_on_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", "/home")
                    .insert_header("set-cookie", "sid=fromredirect; Path=/"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/home"))
            .and(header("cookie", "sid=fromredirect"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>home</html>"))
            .expect(1)
            .mount(&server)
            .await;

        let factory = HttpCapabilityFactory::new(Some(format!("{}/", server.uri())));
        let cap = factory.create().await.unwrap();
        let session = cap.current_session().unwrap();
        assert_eq!(
            session.cookies,
            vec![Cookie {
                name: "sid".into(),
                value: "fromredirect".into()
            }]
        );
    }

    #[test]
    fn test_jar_absorbs_and_expires_cookies() {
        let jar = SessionJar::default();
        let url = Url::parse("https://example.test/").unwrap();
        let set = [
            HeaderValue::from_static("a=1; Path=/"),
            HeaderValue::from_static("b=2"),
        ];
        jar.set_cookies(&mut set.iter(), &url);
        assert_eq!(jar.cookies(&url).unwrap(), "a=1; b=2");

        let expire = [HeaderValue::from_static("a=gone; Max-Age=0")];
        jar.set_cookies(&mut expire.iter(), &url);
        assert_eq!(jar.cookies(&url).unwrap(), "b=2");

        jar.clear();
        assert!(jar.cookies(&url).is_none());
    }
}
