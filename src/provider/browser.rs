//! Browser-driven fallback geocoder.
//!
//! Talks W3C WebDriver (msedgedriver by default) over HTTP. One session per
//! run, created on first use, shared by all calls and torn down by `shutdown`.
//! Calls are serialized on the session and pass through their own limiter so
//! the interactive page sees human-like pacing.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use url::Url;

use crate::clock::{Clock, SystemClock};
use crate::config::FallbackConfig;
use crate::geocode::{
    Coordinate, GeocodeResult, NormalizedAddress, Precision, ResolutionSource, ResolveError,
    ResolveResult,
};
use crate::observability::metrics;
use crate::provider::{parse_base_url, GeocodeProvider, ProviderInitError};
use crate::resilience::timeouts::with_deadline;
use crate::throttle::RateLimiter;

/// URL fragments of the provider's human verification pages.
const BLOCK_MARKERS: [&str; 3] = ["wappass", "captcha", "verify"];

/// Confidence assigned to browser geocodes; the page does not score them.
const BROWSER_CONFIDENCE: u8 = 50;

const GEOCODE_SCRIPT: &str = r#"
var address = arguments[0], city = arguments[1], done = arguments[arguments.length - 1];
try {
  if (typeof BMap === 'undefined') { done({error: 'map script not loaded'}); return; }
  new BMap.Geocoder().getPoint(address, function (p) {
    done(p ? {lng: p.lng, lat: p.lat} : null);
  }, city || '');
} catch (e) {
  done({error: String(e)});
}
"#;

#[derive(Debug)]
struct BrowserSession {
    id: String,
    page_ready: bool,
}

/// Fallback geocoder driving the provider's interactive map page.
pub struct BrowserFallbackClient {
    http: reqwest::Client,
    webdriver_url: Url,
    config: FallbackConfig,
    city: Option<String>,
    limiter: Arc<RateLimiter>,
    session: Mutex<Option<BrowserSession>>,
    clock: Arc<dyn Clock>,
}

impl BrowserFallbackClient {
    pub fn new(config: &FallbackConfig, city: Option<String>, limiter: Arc<RateLimiter>) -> Result<Self, ProviderInitError> {
        let webdriver_url = parse_base_url(&config.webdriver_url)?;
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            webdriver_url,
            config: config.clone(),
            city,
            limiter,
            session: Mutex::new(None),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Limiter for the browser path: one call at a time.
    pub fn limiter_for(config: &FallbackConfig) -> RateLimiter {
        RateLimiter::new(
            "browser",
            1,
            config.requests_per_window,
            Duration::from_millis(config.window_ms),
        )
    }

    /// Whether a browser session is currently open.
    pub async fn has_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    fn capabilities(&self) -> Value {
        let options_key = if self.config.browser_name.to_lowercase().contains("chrome") {
            "goog:chromeOptions"
        } else {
            "ms:edgeOptions"
        };
        let options = match &self.config.debugger_address {
            Some(addr) => json!({ "debuggerAddress": addr }),
            None if self.config.headless => json!({ "args": ["--headless=new", "--disable-gpu"] }),
            None => json!({}),
        };
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": self.config.browser_name,
                    options_key: options,
                    "timeouts": {
                        "pageLoad": self.config.page_load_timeout_secs * 1000,
                        "script": self.config.script_timeout_secs * 1000,
                    }
                }
            }
        })
    }

    /// Send one WebDriver command and unwrap its `value`.
    async fn command(&self, method: reqwest::Method, path: &str, body: Option<Value>) -> ResolveResult<Value> {
        let url = self
            .webdriver_url
            .join(path)
            .map_err(|e| ResolveError::Transient(format!("bad WebDriver path {}: {}", path, e)))?;
        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ResolveError::Transient(format!("WebDriver unreachable: {}", e)))?;
        let text = response
            .text()
            .await
            .map_err(|e| ResolveError::Transient(format!("WebDriver read failed: {}", e)))?;
        let body: Value = serde_json::from_str(&text)
            .map_err(|e| ResolveError::Transient(format!("malformed WebDriver response: {}", e)))?;

        let value = body.get("value").cloned().unwrap_or(Value::Null);
        if let Some(error) = value.get("error").and_then(Value::as_str) {
            let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
            return Err(ResolveError::Transient(format!("WebDriver {}: {}", error, message)));
        }
        Ok(value)
    }

    async fn start_session(&self) -> ResolveResult<BrowserSession> {
        let value = self
            .command(reqwest::Method::POST, "session", Some(self.capabilities()))
            .await?;
        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| ResolveError::Transient("WebDriver returned no session id".into()))?
            .to_string();
        tracing::info!(
            session = %id,
            browser = %self.config.browser_name,
            attached = self.config.debugger_address.is_some(),
            "Browser session started"
        );
        Ok(BrowserSession { id, page_ready: false })
    }

    async fn open_page(&self, session: &mut BrowserSession) -> ResolveResult<()> {
        let path = format!("session/{}/url", session.id);
        self.command(reqwest::Method::POST, &path, Some(json!({ "url": self.config.page_url })))
            .await?;
        let current = self.command(reqwest::Method::GET, &path, None).await?;
        let current = current.as_str().unwrap_or_default().to_lowercase();
        if BLOCK_MARKERS.iter().any(|m| current.contains(m)) {
            return Err(ResolveError::ProviderBlocked(format!("verification page at {}", current)));
        }
        session.page_ready = true;
        tracing::debug!(session = %session.id, page = %self.config.page_url, "Map page loaded");
        Ok(())
    }

    async fn geocode_in(&self, session: &mut BrowserSession, address: &NormalizedAddress) -> ResolveResult<GeocodeResult> {
        if !session.page_ready {
            self.open_page(session).await?;
        }
        let path = format!("session/{}/execute/async", session.id);
        let body = json!({
            "script": GEOCODE_SCRIPT,
            "args": [address.as_str(), self.city.clone().unwrap_or_default()],
        });
        let value = self.command(reqwest::Method::POST, &path, Some(body)).await?;
        parse_script_result(address, &value, self.clock.now_unix())
    }

    async fn delete_session(&self, session: BrowserSession) {
        let path = format!("session/{}", session.id);
        match self.command(reqwest::Method::DELETE, &path, None).await {
            Ok(_) => tracing::info!(session = %session.id, "Browser session closed"),
            Err(e) => tracing::warn!(session = %session.id, error = %e, "Failed to close browser session"),
        }
    }

    async fn geocode_serialized(&self, address: &NormalizedAddress) -> ResolveResult<GeocodeResult> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(self.start_session().await?);
        }
        let Some(session) = guard.as_mut() else {
            return Err(ResolveError::Transient("browser session unavailable".into()));
        };

        let result = self.geocode_in(session, address).await;
        if matches!(result, Err(ResolveError::Transient(_))) {
            // The session may be dead; the next call starts a fresh one.
            if let Some(session) = guard.take() {
                self.delete_session(session).await;
            }
        }
        result
    }
}

#[async_trait]
impl GeocodeProvider for BrowserFallbackClient {
    fn source(&self) -> ResolutionSource {
        ResolutionSource::Browser
    }

    async fn geocode(&self, address: &NormalizedAddress) -> ResolveResult<GeocodeResult> {
        if address.is_empty() {
            return Err(ResolveError::Unresolvable("empty address".into()));
        }
        let permit = self
            .limiter
            .acquire()
            .await
            .map_err(|e| ResolveError::Transient(e.to_string()))?;

        let deadline = Duration::from_secs(self.config.page_load_timeout_secs + self.config.script_timeout_secs);
        let outcome = with_deadline(deadline, "browser geocode", self.geocode_serialized(address)).await;
        permit.release();

        metrics::record_geocode_request("browser", match &outcome {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        });
        match &outcome {
            Ok(r) => tracing::info!(address = %address, location = %r.location, "Geocoded via browser"),
            Err(e) => tracing::warn!(address = %address, error = %e, "Browser geocode failed"),
        }
        outcome
    }

    async fn shutdown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            self.delete_session(session).await;
        }
    }
}

impl Drop for BrowserFallbackClient {
    fn drop(&mut self) {
        if let Ok(guard) = self.session.try_lock() {
            if let Some(session) = guard.as_ref() {
                tracing::warn!(session = %session.id, "Browser client dropped with an open session");
            }
        }
    }
}

impl std::fmt::Debug for BrowserFallbackClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserFallbackClient")
            .field("webdriver_url", &self.webdriver_url.as_str())
            .field("browser", &self.config.browser_name)
            .finish()
    }
}

fn parse_script_result(address: &NormalizedAddress, value: &Value, now: u64) -> ResolveResult<GeocodeResult> {
    if value.is_null() {
        return Err(ResolveError::Unresolvable("map page found no point".into()));
    }
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Err(ResolveError::Transient(format!("map script error: {}", error)));
    }
    let lng = value.get("lng").and_then(Value::as_f64);
    let lat = value.get("lat").and_then(Value::as_f64);
    let location = match (lng, lat) {
        (Some(lng), Some(lat)) => Coordinate::new(lng, lat),
        _ => return Err(ResolveError::Unresolvable(format!("unexpected script result: {}", value))),
    };
    if !location.is_valid() {
        return Err(ResolveError::Unresolvable(format!("invalid point {}", location)));
    }
    Ok(GeocodeResult {
        location,
        formatted_address: address.as_str().to_string(),
        confidence: BROWSER_CONFIDENCE,
        precision: Precision::Approximate,
        source: ResolutionSource::Browser,
        resolved_at: now,
    })
}
