//! Cookie-session client for the academic records portal.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE};
use reqwest::Url;

use crate::error::PortalError;
use crate::extract;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
(KHTML, like Gecko) Chrome/106.0.0.0 YaBrowser/22.11.5.715 Yowser/2.5 Safari/537.36";
const VERIFICATION_COOKIE: &str = "__RequestVerificationToken_L2JhcnNfd2Vi0";
const SESSION_COOKIES: [&str; 2] = ["auth_bars", "ASP.NET_SessionId"];

/// One portal session. Used serially; call [`Portal::reset`] before switching users.
#[async_trait]
pub trait Portal: Send {
    async fn authorize(&mut self, username: &str, password: &str) -> Result<(), PortalError>;

    /// Returns the grades page HTML, or `WrongPage` when the portal served something else.
    async fn fetch_grades_page(&mut self) -> Result<String, PortalError>;

    fn reset(&mut self);
}

#[derive(Debug, Clone)]
pub struct PortalSettings {
    pub login_url: Url,
    pub grades_url: Url,
    pub timeout: Duration,
}

/// Cookie store whose contents can be swapped out wholesale between users.
#[derive(Default)]
struct SessionJar {
    inner: RwLock<Arc<Jar>>,
}

impl SessionJar {
    fn current(&self) -> Arc<Jar> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(Jar::default());
    }
}

impl CookieStore for SessionJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        self.current().set_cookies(cookie_headers, url)
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        self.current().cookies(url)
    }
}

pub struct PortalClient {
    settings: PortalSettings,
    jar: Arc<SessionJar>,
    http: reqwest::Client,
}

impl PortalClient {
    pub fn new(settings: PortalSettings) -> Result<Self, PortalError> {
        let jar = Arc::new(SessionJar::default());
        let http = build_http(&settings, jar.clone())?;
        Ok(Self { settings, jar, http })
    }

    async fn verification_token(&self) -> Result<String, PortalError> {
        let response = self
            .http
            .post(self.settings.login_url.clone())
            .send()
            .await?;

        let token = response
            .cookies()
            .find(|cookie| cookie.name() == VERIFICATION_COOKIE)
            .map(|cookie| cookie.value().to_string())
            .ok_or(PortalError::MissingVerificationToken);
        token
    }

    fn is_authorized(&self) -> bool {
        self.jar
            .cookies(&self.settings.login_url)
            .and_then(|header| header.to_str().map(has_session_cookie).ok())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Portal for PortalClient {
    async fn authorize(&mut self, username: &str, password: &str) -> Result<(), PortalError> {
        let token = self.verification_token().await?;

        let form = [
            ("__RequestVerificationToken", token.as_str()),
            ("UserName", username),
            ("Password", password),
        ];
        let response = self
            .http
            .post(self.settings.login_url.clone())
            .form(&form)
            .send()
            .await?;
        // Drain the body so the session cookies from redirects are all recorded.
        response.bytes().await?;

        if !self.is_authorized() {
            return Err(PortalError::AuthenticationFailed);
        }
        Ok(())
    }

    async fn fetch_grades_page(&mut self) -> Result<String, PortalError> {
        let html = self
            .http
            .get(self.settings.grades_url.clone())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        if !extract::is_grades_page(&html) {
            return Err(PortalError::WrongPage);
        }
        Ok(html)
    }

    fn reset(&mut self) {
        self.jar.clear();
    }
}

fn build_http(
    settings: &PortalSettings,
    jar: Arc<SessionJar>,
) -> Result<reqwest::Client, PortalError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("ru,en;q=0.9"));

    let client = reqwest::Client::builder()
        .cookie_provider(jar)
        .user_agent(USER_AGENT)
        .default_headers(headers)
        .timeout(settings.timeout)
        .build()?;
    Ok(client)
}

/// Parses a `Cookie` header value looking for a portal session cookie.
fn has_session_cookie(header: &str) -> bool {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .any(|(name, value)| SESSION_COOKIES.contains(&name) && !value.is_empty())
}
