use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use anyhow::Result;
use tempfile::tempdir;

use esimkit_core::{
    config::ApiConfig,
    error::{ErrorKind, Result as EsimResult},
    session::{Credentials, Session, SessionCache, SessionManager},
    transport::{ApiRequest, ApiResponse, Transport},
    util,
};

const ICCID: &str = "8944500102198304826";
const CONCURRENT_CALLERS: usize = 8;

// ---------------------------------------------------------------------------
// Fake fulfillment API
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeApi {
    csrf_calls: AtomicUsize,
    login_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    status_calls: AtomicUsize,
    /// HTTP status for login / refresh; 0 means 200.
    login_status: u16,
    refresh_status: u16,
    /// Replaces the token body of a successful refresh.
    refresh_body: Option<&'static str>,
    refresh_cookies: Vec<(String, String)>,
    /// Status codes for successive status queries; empty means 200.
    status_script: Mutex<VecDeque<u16>>,
    /// Latency of the auth endpoints, to widen race windows.
    auth_delay: Duration,
    requests: Mutex<Vec<ApiRequest>>,
}

impl FakeApi {
    fn total_calls(&self) -> usize {
        self.csrf_calls.load(Ordering::SeqCst)
            + self.login_calls.load(Ordering::SeqCst)
            + self.refresh_calls.load(Ordering::SeqCst)
            + self.status_calls.load(Ordering::SeqCst)
    }

    fn auth_round_trips(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst) + self.refresh_calls.load(Ordering::SeqCst)
    }

    fn last_request_to(&self, suffix: &str) -> Option<ApiRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.url.ends_with(suffix))
            .cloned()
    }
}

fn tokens_body(access: &str, refresh: &str) -> String {
    serde_json::json!({
        "backendTokens": {
            "accessToken": access,
            "refreshToken": refresh,
            "expiresIn": 3_600_000
        }
    })
    .to_string()
}

impl Transport for FakeApi {
    fn send(&self, request: &ApiRequest) -> EsimResult<ApiResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let url = request.url.as_str();

        if url.ends_with("/csrf-token") {
            self.csrf_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(ApiResponse {
                status: 200,
                body: r#"{"csrfToken":"csrf-1"}"#.into(),
                set_cookies: vec![("cf_clearance".into(), "cf-1".into())],
            });
        }
        if url.ends_with("/auth/login") {
            self.login_calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.auth_delay);
            return Ok(match self.login_status {
                0 | 200 => ApiResponse {
                    status: 200,
                    body: tokens_body("login-at", "login-rt"),
                    set_cookies: vec![],
                },
                status => ApiResponse { status, ..Default::default() },
            });
        }
        if url.ends_with("/auth/refresh") {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.auth_delay);
            return Ok(match self.refresh_status {
                0 | 200 => ApiResponse {
                    status: 200,
                    body: self
                        .refresh_body
                        .map(String::from)
                        .unwrap_or_else(|| tokens_body("refreshed-at", "refreshed-rt")),
                    set_cookies: self.refresh_cookies.clone(),
                },
                status => ApiResponse { status, ..Default::default() },
            });
        }
        if url.ends_with(&format!("/esim/{ICCID}")) {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            let status = self.status_script.lock().unwrap().pop_front().unwrap_or(200);
            let body = if status == 200 {
                r#"{"name":"Japan 5GB","planStatus":"In use","totalTraffic":5242880}"#.into()
            } else {
                String::new()
            };
            return Ok(ApiResponse { status, body, set_cookies: vec![] });
        }
        Ok(ApiResponse { status: 404, ..Default::default() })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn api_config() -> ApiConfig {
    ApiConfig {
        base_url: "https://api.test/api/v1".into(),
        ..ApiConfig::default()
    }
}

/// Write a cached session whose access token expired ten seconds ago.
fn expired_cache(dir: &std::path::Path) -> Result<SessionCache> {
    let cache = SessionCache::new(dir.join("session.json"));
    cache.save(&Session {
        access_token: Some("old-at".into()),
        refresh_token: Some("old-rt".into()),
        expires_at: Some(util::unix_now() - 10),
        csrf_token: Some("csrf-0".into()),
        ..Session::default()
    })?;
    Ok(cache)
}

fn manager(api: &Arc<FakeApi>) -> SessionManager<Arc<FakeApi>> {
    SessionManager::new(Arc::clone(api), &api_config())
        .with_credentials(Credentials::new("ops@example.com", "pw"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn concurrent_callers_share_one_refresh() -> Result<()> {
    let dir = tempdir()?;
    let api = Arc::new(FakeApi {
        auth_delay: Duration::from_millis(50),
        ..FakeApi::default()
    });
    let mgr = manager(&api).with_cache(expired_cache(dir.path())?);

    let barrier = Barrier::new(CONCURRENT_CALLERS);
    std::thread::scope(|s| {
        for _ in 0..CONCURRENT_CALLERS {
            let (mgr, barrier) = (&mgr, &barrier);
            s.spawn(move || {
                barrier.wait();
                mgr.ensure_valid().expect("session becomes valid");
            });
        }
    });

    assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(api.login_calls.load(Ordering::SeqCst), 0);
    assert_eq!(mgr.session()?.access_token.as_deref(), Some("refreshed-at"));
    Ok(())
}

#[test]
fn expired_session_refreshes_once_before_call() -> Result<()> {
    let dir = tempdir()?;
    let api = Arc::new(FakeApi::default());
    let mgr = manager(&api).with_cache(expired_cache(dir.path())?);

    let status = mgr.check_iccid(ICCID)?;
    assert_eq!(status.name.as_deref(), Some("Japan 5GB"));
    assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(api.status_calls.load(Ordering::SeqCst), 1);

    let refresh = api.last_request_to("/auth/refresh").expect("refresh sent");
    assert_eq!(refresh.body.as_ref().unwrap()["refreshToken"], "old-rt");
    assert_eq!(refresh.header_value("X-CSRF-Token"), Some("csrf-0"));

    let query = api.last_request_to(&format!("/esim/{ICCID}")).expect("query sent");
    assert_eq!(query.header_value("Authorization"), Some("Bearer refreshed-at"));

    // The refreshed session was written back.
    let cached = SessionCache::new(dir.path().join("session.json")).load()?.unwrap();
    assert_eq!(cached.access_token.as_deref(), Some("refreshed-at"));
    assert!(cached.expires_at.unwrap() > util::unix_now());
    Ok(())
}

#[test]
fn short_iccid_fails_without_network() {
    let api = Arc::new(FakeApi::default());
    let mgr = manager(&api);
    let err = mgr.check_iccid("12345").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(api.total_calls(), 0);
}

#[test]
fn rejected_token_is_refreshed_and_retried_once() -> Result<()> {
    let api = Arc::new(FakeApi::default());
    api.status_script.lock().unwrap().push_back(401);
    let mgr = manager(&api);
    assert!(mgr.login());

    mgr.check_iccid(ICCID)?;
    assert_eq!(api.login_calls.load(Ordering::SeqCst), 1);
    assert_eq!(api.status_calls.load(Ordering::SeqCst), 2);
    assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn repeated_rejection_surfaces_credentials_error() {
    let api = Arc::new(FakeApi::default());
    api.status_script.lock().unwrap().extend([403, 403, 403]);
    let mgr = manager(&api);

    let err = mgr.check_iccid(ICCID).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Credentials);
    // login, one refresh, no loop
    assert_eq!(api.login_calls.load(Ordering::SeqCst), 1);
    assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(api.status_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn failed_refresh_falls_back_to_one_login() -> Result<()> {
    let dir = tempdir()?;
    let api = Arc::new(FakeApi {
        refresh_status: 401,
        ..FakeApi::default()
    });
    let mgr = manager(&api).with_cache(expired_cache(dir.path())?);

    mgr.ensure_valid()?;
    assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(api.login_calls.load(Ordering::SeqCst), 1);
    assert_eq!(mgr.session()?.access_token.as_deref(), Some("login-at"));
    Ok(())
}

#[test]
fn tokenless_refresh_does_not_extend_old_token() -> Result<()> {
    let dir = tempdir()?;
    let api = Arc::new(FakeApi {
        refresh_body: Some("{}"),
        ..FakeApi::default()
    });
    let mgr = manager(&api).with_cache(expired_cache(dir.path())?);

    mgr.ensure_valid()?;
    assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(api.login_calls.load(Ordering::SeqCst), 1);
    let session = mgr.session()?;
    assert_eq!(session.access_token.as_deref(), Some("login-at"));
    assert!(session.expires_at.unwrap() > util::unix_now());
    Ok(())
}

#[test]
fn tokenless_refresh_without_login_keeps_old_expiry() -> Result<()> {
    let dir = tempdir()?;
    let api = Arc::new(FakeApi {
        refresh_body: Some("{}"),
        login_status: 401,
        ..FakeApi::default()
    });
    let mgr = manager(&api).with_cache(expired_cache(dir.path())?);

    assert_eq!(mgr.ensure_valid().unwrap_err().kind(), ErrorKind::Credentials);
    let session = mgr.session()?;
    assert_eq!(session.access_token.as_deref(), Some("old-at"));
    assert!(session.expires_at.unwrap() < util::unix_now());
    Ok(())
}

#[test]
fn cookie_only_refresh_sets_default_expiry() -> Result<()> {
    let dir = tempdir()?;
    let api = Arc::new(FakeApi {
        refresh_body: Some("{}"),
        refresh_cookies: vec![("__Secure-SIM.JT".into(), "cookie-at".into())],
        ..FakeApi::default()
    });
    let mgr = manager(&api).with_cache(expired_cache(dir.path())?);

    mgr.ensure_valid()?;
    assert_eq!(api.login_calls.load(Ordering::SeqCst), 0);
    let session = mgr.session()?;
    assert_eq!(session.access_token.as_deref(), Some("cookie-at"));
    assert!(session.expires_at.unwrap() > util::unix_now());
    Ok(())
}

#[test]
fn failed_refresh_and_login_is_credentials_error() -> Result<()> {
    let dir = tempdir()?;
    let api = Arc::new(FakeApi {
        refresh_status: 401,
        login_status: 401,
        ..FakeApi::default()
    });
    let mgr = manager(&api).with_cache(expired_cache(dir.path())?);

    let err = mgr.ensure_valid().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Credentials);
    assert!(!err.reason().is_empty());
    assert_eq!(api.auth_round_trips(), 2);
    Ok(())
}

#[test]
fn login_persists_and_restart_skips_login() -> Result<()> {
    let dir = tempdir()?;
    let cache_path = dir.path().join("session.json");

    let api = Arc::new(FakeApi::default());
    let mgr = manager(&api).with_cache(SessionCache::new(&cache_path));
    mgr.ensure_valid()?;
    assert_eq!(api.login_calls.load(Ordering::SeqCst), 1);

    let login = api.last_request_to("/auth/login").expect("login sent");
    assert_eq!(login.header_value("X-CSRF-Token"), Some("csrf-1"));
    assert_eq!(login.body.as_ref().unwrap()["email"], "ops@example.com");
    assert!(cache_path.exists());

    // A restarted process reuses the cached session without any auth call.
    let restarted_api = Arc::new(FakeApi::default());
    let restarted = manager(&restarted_api).with_cache(SessionCache::new(&cache_path));
    restarted.check_iccid(ICCID)?;
    assert_eq!(restarted_api.auth_round_trips(), 0);
    assert_eq!(restarted_api.csrf_calls.load(Ordering::SeqCst), 0);

    let query = restarted_api
        .last_request_to(&format!("/esim/{ICCID}"))
        .expect("query sent");
    let cookie = query.header_value("Cookie").unwrap_or_default();
    assert!(cookie.contains("cf_clearance=cf-1"));
    assert!(cookie.contains("__Secure-SIM.JT=login-at"));
    Ok(())
}

#[test]
fn unknown_serial_is_not_found() {
    let api = Arc::new(FakeApi::default());
    api.status_script.lock().unwrap().push_back(404);
    let err = manager(&api).check_iccid(ICCID).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn no_credentials_and_no_cache() {
    let api = Arc::new(FakeApi::default());
    let mgr = SessionManager::new(Arc::clone(&api), &api_config());
    let err = mgr.ensure_valid().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Credentials);
    assert!(!mgr.login());
    assert_eq!(api.total_calls(), 0);
}
