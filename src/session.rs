//! Authenticated session against the fulfillment API.
//!
//! [`SessionManager`] owns the bearer session, persists it to a small JSON
//! cache after every successful login or refresh, and funnels every
//! "check expiry, then re-authenticate" sequence through one lock.  Callers
//! that queue up behind an in-flight attempt reuse its outcome instead of
//! starting their own round trip.
//!
//! State machine:
//!
//! ```text
//! Unauthenticated --login ok--> Authenticated(expires_at)
//! Authenticated   --now >= expires_at--> refresh
//! refresh --ok--> Authenticated(new expires_at)
//! refresh --fail--> one login --> Authenticated | Unauthenticated
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ApiConfig;
use crate::error::{ErrorKind, EsimError, OptionExt as _, Result, ResultExt as _};
use crate::status::ProfileStatus;
use crate::transport::{ApiRequest, ApiResponse, Transport};
use crate::util;

/// Provider cookie carrying the access token.
pub const ACCESS_COOKIE: &str = "__Secure-SIM.JT";
/// Provider cookie carrying the refresh token.
pub const REFRESH_COOKIE: &str = "__Secure-SIM.RFT";
pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Stored expiry is pulled forward by this much so the token is renewed
/// before the provider starts rejecting it.
pub const EARLY_REFRESH_SECS: i64 = 300;
/// Token lifetime assumed when the provider omits `expiresIn`.
pub const DEFAULT_EXPIRES_IN_MS: i64 = 3_600_000;

// ---------------------------------------------------------------------------
// Credentials / session
// ---------------------------------------------------------------------------

pub struct Credentials {
    pub email: String,
    password: SecretString,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Both `api.email` and `api.password` must be set and non-blank.
    pub fn from_config(cfg: &ApiConfig) -> Option<Self> {
        let email = cfg.email.as_deref().map(str::trim).filter(|e| !e.is_empty())?;
        let password = cfg.password.as_deref().filter(|p| !p.is_empty())?;
        Some(Self::new(email, password))
    }
}

/// Current tokens plus the cookies the provider expects back.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Unix seconds after which `access_token` must not be used.
    pub expires_at: Option<i64>,
    pub csrf_token: Option<String>,
    /// Pass-through cookies (`cf_clearance` and friends), tokens excluded.
    pub cookies: BTreeMap<String, String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("Session")
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("expires_at", &self.expires_at)
            .field("csrf_token", &redact(&self.csrf_token))
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Session {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }

    /// A token is held and its window has not closed.
    pub fn is_usable_at(&self, now: i64) -> bool {
        self.access_token.is_some() && !self.is_expired_at(now)
    }

    /// `Cookie` header value: pass-through cookies plus the token cookies.
    pub fn cookie_header(&self) -> Option<String> {
        let mut pairs: Vec<String> = self
            .cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if let Some(token) = &self.access_token {
            pairs.push(format!("{ACCESS_COOKIE}={token}"));
        }
        if let Some(token) = &self.refresh_token {
            pairs.push(format!("{REFRESH_COOKIE}={token}"));
        }
        (!pairs.is_empty()).then(|| pairs.join("; "))
    }

    /// Fold `Set-Cookie` values into the session.  Token cookies win over
    /// whatever the response body said.
    fn absorb_cookies(&mut self, set_cookies: &[(String, String)]) {
        for (name, value) in set_cookies {
            match name.as_str() {
                ACCESS_COOKIE if !value.is_empty() => self.access_token = Some(value.clone()),
                REFRESH_COOKIE if !value.is_empty() => self.refresh_token = Some(value.clone()),
                ACCESS_COOKIE | REFRESH_COOKIE => {}
                _ if value.is_empty() => {
                    self.cookies.remove(name);
                }
                _ => {
                    self.cookies.insert(name.clone(), value.clone());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// On-disk cache
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    access_token: Option<String>,
    refresh_token: Option<String>,
    token_expires_at: Option<i64>,
    csrf_token: Option<String>,
    #[serde(default)]
    cookies: BTreeMap<String, String>,
    saved_at: i64,
}

/// JSON file holding the last good session.  Writes go to a sibling temp
/// file that is renamed over the target, so readers never see a torn file.
#[derive(Debug, Clone)]
pub struct SessionCache {
    path: PathBuf,
}

impl SessionCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no cache has been written yet.
    pub fn load(&self) -> Result<Option<Session>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)
            .ctx_storage(&format!("read session cache {}", self.path.display()))?;
        let record: CacheRecord =
            serde_json::from_str(&text).ctx_storage("parse session cache")?;
        Ok(Some(Session {
            access_token: record.access_token,
            refresh_token: record.refresh_token,
            expires_at: record.token_expires_at,
            csrf_token: record.csrf_token,
            cookies: record.cookies,
        }))
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        let record = CacheRecord {
            access_token: session.access_token.clone(),
            refresh_token: session.refresh_token.clone(),
            token_expires_at: session.expires_at,
            csrf_token: session.csrf_token.clone(),
            cookies: session.cookies.clone(),
            saved_at: util::unix_now(),
        };
        let json = serde_json::to_vec_pretty(&record).ctx_storage("serialize session cache")?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .ctx_storage(&format!("create cache dir {}", parent.display()))?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        write_private(&tmp, &json).ctx_storage(&format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .ctx_storage(&format!("replace session cache {}", self.path.display()))?;
        Ok(())
    }
}

/// Write `bytes` to a fresh file readable only by the owner (Unix).
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write as _;

    // A leftover file from an interrupted save would keep its old mode.
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

// ---------------------------------------------------------------------------
// Auth wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CsrfResponse {
    csrf_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthResponse {
    backend_tokens: Option<BackendTokens>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendTokens {
    access_token: Option<String>,
    refresh_token: Option<String>,
    /// Milliseconds.
    expires_in: Option<i64>,
}

fn expiry_from(now: i64, expires_in_ms: Option<i64>) -> i64 {
    let lifetime_ms = expires_in_ms.unwrap_or(DEFAULT_EXPIRES_IN_MS).max(0);
    now + lifetime_ms / 1000 - EARLY_REFRESH_SECS
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct AuthState {
    session: Session,
    /// Outcome of the most recent login/refresh attempt, replayed to callers
    /// that were queued behind it.
    last_failure: Option<(ErrorKind, String)>,
}

pub struct SessionManager<T: Transport> {
    transport: T,
    api: ApiConfig,
    credentials: Option<Credentials>,
    cache: Option<SessionCache>,
    state: Mutex<AuthState>,
    /// Bumped (under `state`) after every login/refresh attempt.
    attempts: AtomicU64,
}

impl<T: Transport> std::fmt::Debug for SessionManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("base_url", &self.api.base_url())
            .field("cache", &self.cache)
            .field("attempts", &self.attempts.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: Transport> SessionManager<T> {
    pub fn new(transport: T, api: &ApiConfig) -> Self {
        Self {
            transport,
            api: api.clone(),
            credentials: None,
            cache: None,
            state: Mutex::new(AuthState {
                session: Session::default(),
                last_failure: None,
            }),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Attach a session cache and load it now.  An unreadable cache is
    /// logged and ignored; the next API use logs in afresh.
    pub fn with_cache(mut self, cache: SessionCache) -> Self {
        match cache.load() {
            Ok(Some(session)) => {
                info!(path = %cache.path().display(), "session restored from cache");
                if let Ok(state) = self.state.get_mut() {
                    state.session = session;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(path = %cache.path().display(), error = %e, "ignoring unreadable session cache"),
        }
        self.cache = Some(cache);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Copy of the current session.
    pub fn session(&self) -> Result<Session> {
        Ok(self.lock_state()?.session.clone())
    }

    /// Number of login/refresh attempts made so far.
    pub fn auth_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Acquire)
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, AuthState>> {
        self.state
            .lock()
            .map_err(|_| EsimError::Storage("session state lock poisoned".into()))
    }

    // -- public lifecycle ---------------------------------------------------

    /// Full login.  Failures are logged and reported as `false`.
    pub fn login(&self) -> bool {
        let outcome = self.lock_state().and_then(|mut state| {
            let result = self.login_locked(&mut state.session);
            self.record(&mut state, &result);
            result
        });
        match outcome {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "login failed");
                false
            }
        }
    }

    /// Refresh the access token, falling back to one login.
    pub fn refresh(&self) -> bool {
        let outcome = self.lock_state().and_then(|mut state| {
            let result = self.refresh_locked(&mut state.session);
            self.record(&mut state, &result);
            result
        });
        match outcome {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "refresh failed");
                false
            }
        }
    }

    /// Make sure a usable access token is held, re-authenticating at most
    /// once across every concurrent caller.
    pub fn ensure_valid(&self) -> Result<()> {
        let seen = self.auth_attempts();
        self.reauthenticate_if(seen, |session, now| !session.is_usable_at(now))
    }

    /// Authenticated request to `path` (relative to the API base) or to an
    /// absolute URL.  A 401/403 triggers one refresh and one retry.
    pub fn call(&self, path: &str) -> Result<ApiResponse> {
        self.ensure_valid()?;
        let url = self.resolve(path);

        let seen = self.auth_attempts();
        let response = self.send_authorized(&url)?;
        if !response.is_auth_failure() {
            return Ok(response);
        }

        warn!(status = response.status, "token rejected; refreshing once");
        // Refresh unless another caller already did so since our request.
        self.reauthenticate_if(seen, |_, _| true)?;
        let retry = self.send_authorized(&url)?;
        if retry.is_auth_failure() {
            return Err(EsimError::Credentials(format!(
                "session rejected by provider (HTTP {}) after refresh",
                retry.status
            )));
        }
        Ok(retry)
    }

    /// Query live status for one ICCID.  The serial is validated before any
    /// network use.
    pub fn check_iccid(&self, iccid: &str) -> Result<ProfileStatus> {
        let iccid = util::validate_iccid(iccid)?;
        let response = self.call(&format!("{}/{iccid}", self.api.status_url()))?;
        match response.status {
            200..=299 => response.json(),
            404 => Err(EsimError::NotFound(format!("no eSIM found for ICCID {iccid}"))),
            status => Err(EsimError::Api(format!("status query failed: HTTP {status}"))),
        }
    }

    // -- internals ----------------------------------------------------------

    fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.api.base_url(), path.trim_start_matches('/'))
        }
    }

    /// Run one login/refresh under the state lock if `needed` says so.
    ///
    /// `seen` is the attempt counter observed before the caller started
    /// waiting; if it moved, an attempt completed in the meantime and its
    /// outcome is returned instead of starting another.
    fn reauthenticate_if(&self, seen: u64, needed: impl FnOnce(&Session, i64) -> bool) -> Result<()> {
        let mut state = self.lock_state()?;
        if self.attempts.load(Ordering::Acquire) != seen {
            return match &state.last_failure {
                None => Ok(()),
                Some((kind, reason)) => Err(kind.into_error(reason.clone())),
            };
        }
        let now = util::unix_now();
        if !needed(&state.session, now) {
            return Ok(());
        }

        let result = if state.session.refresh_token.is_some() {
            info!("access token unusable; refreshing");
            self.refresh_locked(&mut state.session)
        } else {
            info!("no usable session; logging in");
            self.login_locked(&mut state.session)
        };
        self.record(&mut state, &result);
        result
    }

    fn record(&self, state: &mut AuthState, result: &Result<()>) {
        state.last_failure = result.as_ref().err().map(|e| (e.kind(), e.reason()));
        self.attempts.fetch_add(1, Ordering::AcqRel);
    }

    fn login_locked(&self, session: &mut Session) -> Result<()> {
        let credentials = self
            .credentials
            .as_ref()
            .required_credentials("no API credentials configured (api.email / api.password)")?;
        let base = self.api.base_url();

        // The anti-forgery token is optional; a failed fetch still lets the
        // login go ahead.
        match self.fetch_csrf(session) {
            Ok(Some(token)) => session.csrf_token = Some(token),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "anti-forgery token fetch failed"),
        }

        let mut request = ApiRequest::post(
            format!("{base}/auth/login"),
            serde_json::json!({
                "email": credentials.email,
                "password": credentials.password.expose_secret(),
            }),
            self.api.timeout(),
        );
        request = self.with_session_headers(request, session, false);
        let response = self.transport.send(&request)?;

        if !response.is_success() {
            return Err(match response.status {
                400 | 401 | 403 => EsimError::Credentials(format!(
                    "login rejected for {} (HTTP {})",
                    credentials.email, response.status
                )),
                status => EsimError::Api(format!("login failed: HTTP {status}")),
            });
        }

        let body: AuthResponse = serde_json::from_str(&response.body).unwrap_or_default();
        let tokens = body.backend_tokens.unwrap_or_default();
        let mut next = session.clone();
        next.access_token = tokens.access_token.filter(|t| !t.is_empty());
        next.refresh_token = tokens.refresh_token.filter(|t| !t.is_empty());
        next.absorb_cookies(&response.set_cookies);
        if next.access_token.is_none() {
            return Err(EsimError::Credentials(
                "login response carried no access token".into(),
            ));
        }
        next.expires_at = Some(expiry_from(util::unix_now(), tokens.expires_in));

        *session = next;
        self.persist(session);
        info!(email = %credentials.email, "login successful");
        Ok(())
    }

    fn refresh_locked(&self, session: &mut Session) -> Result<()> {
        let Some(refresh_token) = session.refresh_token.clone() else {
            warn!("no refresh token held; logging in");
            return self.login_locked(session);
        };

        let request = ApiRequest::post(
            format!("{}/auth/refresh", self.api.base_url()),
            serde_json::json!({ "refreshToken": refresh_token }),
            self.api.timeout(),
        );
        let request = self.with_session_headers(request, session, false);

        let response = match self.transport.send(&request) {
            Ok(r) if r.is_success() => r,
            Ok(r) => {
                warn!(status = r.status, "refresh rejected; logging in again");
                return self.login_locked(session);
            }
            Err(e) => {
                warn!(error = %e, "refresh failed; logging in again");
                return self.login_locked(session);
            }
        };

        let body: AuthResponse = serde_json::from_str(&response.body).unwrap_or_default();
        let tokens = body.backend_tokens.unwrap_or_default();
        let body_token = tokens.access_token.filter(|t| !t.is_empty());
        let cookie_token = response
            .set_cookies
            .iter()
            .any(|(name, value)| name == ACCESS_COOKIE && !value.is_empty());
        if body_token.is_none() && !cookie_token {
            // The expiry must keep describing the token actually held.
            session.absorb_cookies(&response.set_cookies);
            warn!("refresh response carried no access token; logging in again");
            return self.login_locked(session);
        }

        if let Some(token) = body_token {
            session.access_token = Some(token);
        }
        if let Some(token) = tokens.refresh_token.filter(|t| !t.is_empty()) {
            session.refresh_token = Some(token);
        }
        session.absorb_cookies(&response.set_cookies);
        session.expires_at = Some(expiry_from(util::unix_now(), tokens.expires_in));

        self.persist(session);
        info!("access token refreshed");
        Ok(())
    }

    fn fetch_csrf(&self, session: &mut Session) -> Result<Option<String>> {
        let request = ApiRequest::get(
            format!("{}/csrf-token", self.api.base_url()),
            self.api.auth_timeout(),
        );
        let request = match session.cookie_header() {
            Some(cookie) => request.header("Cookie", cookie),
            None => request,
        };
        let response = self.transport.send(&request)?;
        session.absorb_cookies(&response.set_cookies);
        if response.status != 200 {
            return Ok(None);
        }
        let body: CsrfResponse = response.json()?;
        Ok(body.csrf_token.filter(|t| !t.is_empty()))
    }

    fn with_session_headers(&self, mut request: ApiRequest, session: &Session, bearer: bool) -> ApiRequest {
        if bearer {
            if let Some(token) = &session.access_token {
                request = request.header("Authorization", format!("Bearer {token}"));
            }
        }
        if let Some(csrf) = &session.csrf_token {
            request = request.header(CSRF_HEADER, csrf.clone());
        }
        if let Some(cookie) = session.cookie_header() {
            request = request.header("Cookie", cookie);
        }
        request
    }

    fn send_authorized(&self, url: &str) -> Result<ApiResponse> {
        let session = self.session()?;
        let request = self.with_session_headers(
            ApiRequest::get(url, self.api.timeout()),
            &session,
            true,
        );
        let response = self.transport.send(&request)?;
        if !response.set_cookies.is_empty() {
            self.lock_state()?.session.absorb_cookies(&response.set_cookies);
        }
        Ok(response)
    }

    fn persist(&self, session: &Session) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.save(session) {
                warn!(path = %cache.path().display(), error = %e, "could not save session cache");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
