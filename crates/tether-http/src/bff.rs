//! BFF auth wiring: the cookie that carries an opaque grant id, and the
//! handshake-time rehydrate/rotate flow.
//!
//! The transport session id never rides in a cookie; only the auth grant id
//! does. Rotation on every rehydrate keeps stolen cookie values short-lived,
//! with a grace window covering requests already in flight.

use std::sync::Arc;

use chrono::Utc;
use hyper::Request;
use tracing::{debug, warn};

use tether_transport::auth::{AuthStore, Grant};

use crate::origin::{client_host, top_domain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

impl SameSite {
    fn as_str(&self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }
}

/// Attributes of the cookie carrying the BFF auth grant id.
#[derive(Debug, Clone)]
pub struct AuthCookie {
    pub name: String,
    pub path: String,
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
    pub max_age: Option<i64>,
    /// Derive the cookie domain from the request's registrable domain
    /// (eTLD+1) when `domain` is unset.
    pub use_top_domain: bool,
}

impl Default for AuthCookie {
    fn default() -> Self {
        Self {
            name: "BFF-Auth-Session".to_string(),
            path: "/".to_string(),
            domain: None,
            secure: true,
            http_only: true,
            same_site: SameSite::Lax,
            max_age: None,
            use_top_domain: false,
        }
    }
}

impl AuthCookie {
    /// Reads the cookie value from the request's `Cookie` header.
    pub fn read<T>(&self, req: &Request<T>) -> Option<String> {
        let header = req.headers().get("cookie")?.to_str().ok()?;
        for pair in header.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == self.name {
                    return Some(value.to_string());
                }
            }
        }
        None
    }

    fn domain_for(&self, host: &str) -> Option<String> {
        match &self.domain {
            Some(domain) => Some(domain.clone()),
            None if self.use_top_domain => top_domain(host),
            None => None,
        }
    }

    /// Renders a `Set-Cookie` value binding `value` to this cookie.
    pub fn build_set_cookie(&self, value: &str, host: &str) -> String {
        let mut cookie = format!("{}={}; Path={}", self.name, value, self.path);
        if let Some(domain) = self.domain_for(host) {
            cookie.push_str("; Domain=");
            cookie.push_str(&domain);
        }
        if let Some(max_age) = self.max_age {
            cookie.push_str(&format!("; Max-Age={max_age}"));
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        cookie.push_str("; SameSite=");
        cookie.push_str(self.same_site.as_str());
        cookie
    }

    /// Renders a `Set-Cookie` value clearing this cookie.
    pub fn build_clear_cookie(&self, host: &str) -> String {
        let mut cookie = format!("{}=; Path={}; Max-Age=0", self.name, self.path);
        if let Some(domain) = self.domain_for(host) {
            cookie.push_str("; Domain=");
            cookie.push_str(&domain);
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        cookie
    }
}

/// Server-held auth configuration attached to the streamable transport.
pub struct BffAuth {
    pub store: Arc<dyn AuthStore>,
    pub cookie: AuthCookie,
    /// Use the auth cookie to mint a new transport session when a handshake
    /// POST arrives without a session id.
    pub rehydrate_on_handshake: bool,
    /// Optional path that revokes the whole grant family (logout-all).
    pub logout_all_path: Option<String>,
}

impl BffAuth {
    pub fn new(store: Arc<dyn AuthStore>, cookie: AuthCookie) -> Self {
        Self {
            store,
            cookie,
            rehydrate_on_handshake: true,
            logout_all_path: None,
        }
    }

    /// Handshake-time rehydration: resolve the cookie-borne grant, touch it,
    /// rotate the id, and return the `Set-Cookie` value for the new id.
    /// A missing or expired grant rehydrates nothing; the handshake proceeds
    /// unauthenticated.
    pub async fn rehydrate<T>(&self, req: &Request<T>) -> Option<String> {
        let grant_id = self.cookie.read(req)?;
        let grant = match self.store.get(&grant_id).await {
            Ok(grant) => grant,
            Err(err) => {
                debug!(error = %err, "auth rehydrate miss");
                return None;
            }
        };

        if let Err(err) = self.store.touch(&grant_id, Utc::now()).await {
            warn!(error = %err, "auth touch failed");
        }

        let template = rotation_template(&grant);
        match self.store.rotate(&grant_id, template).await {
            Ok(new_id) => {
                let host = client_host(req);
                Some(self.cookie.build_set_cookie(&new_id, &host))
            }
            Err(err) => {
                warn!(error = %err, "auth rotation failed, keeping current id");
                let host = client_host(req);
                Some(self.cookie.build_set_cookie(&grant_id, &host))
            }
        }
    }

    /// Revokes the whole family behind the cookie-borne grant. Returns the
    /// `Set-Cookie` value clearing the cookie when a grant was found.
    pub async fn logout_all<T>(&self, req: &Request<T>) -> Option<String> {
        let grant_id = self.cookie.read(req)?;
        let grant = self.store.get(&grant_id).await.ok()?;
        if let Err(err) = self.store.revoke_family(&grant.family_id).await {
            warn!(error = %err, "logout-all revocation failed");
            return None;
        }
        let host = client_host(req);
        Some(self.cookie.build_clear_cookie(&host))
    }
}

/// A rotation template inheriting the principal and bindings of the current
/// grant; ids and timestamps are assigned by the store.
fn rotation_template(grant: &Grant) -> Grant {
    let mut template = Grant::new(grant.subject.clone());
    template.id = String::new();
    template.scopes = grant.scopes.clone();
    template.ua_hash = grant.ua_hash.clone();
    template.ip_hint = grant.ip_hint.clone();
    template.meta = grant.meta.clone();
    template
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_transport::auth::MemoryAuthStore;

    fn request_with_cookie(name: &str, value: &str) -> Request<()> {
        Request::builder()
            .uri("/mcp")
            .header("Host", "app.example.com")
            .header("Cookie", format!("other=1; {name}={value}"))
            .body(())
            .unwrap()
    }

    #[test]
    fn cookie_read_and_render() {
        let cookie = AuthCookie::default();
        let req = request_with_cookie("BFF-Auth-Session", "g-123");
        assert_eq!(cookie.read(&req), Some("g-123".to_string()));

        let rendered = cookie.build_set_cookie("g-456", "app.example.com");
        assert!(rendered.starts_with("BFF-Auth-Session=g-456; Path=/"));
        assert!(rendered.contains("HttpOnly"));
        assert!(rendered.contains("SameSite=Lax"));
        assert!(!rendered.contains("Domain="));
    }

    #[test]
    fn top_domain_cookie_scope() {
        let cookie = AuthCookie {
            use_top_domain: true,
            ..AuthCookie::default()
        };
        let rendered = cookie.build_set_cookie("v", "app.example.com");
        assert!(rendered.contains("Domain=example.com"));

        let cleared = cookie.build_clear_cookie("app.example.com");
        assert!(cleared.contains("Max-Age=0"));
    }

    #[tokio::test]
    async fn rehydrate_rotates_the_grant() {
        let store = Arc::new(MemoryAuthStore::new(
            Duration::from_secs(3600),
            Duration::from_secs(86400),
            Duration::from_millis(50),
        ));
        let grant = Grant::new("user-1");
        let old_id = grant.id.clone();
        store.put(grant).await.unwrap();

        let auth = BffAuth::new(Arc::clone(&store) as Arc<dyn AuthStore>, AuthCookie::default());
        let req = request_with_cookie("BFF-Auth-Session", &old_id);
        let set_cookie = auth.rehydrate(&req).await.expect("rehydrate should hit");

        let new_id = set_cookie
            .split(';')
            .next()
            .and_then(|kv| kv.split_once('='))
            .map(|(_, v)| v.to_string())
            .unwrap();
        assert_ne!(new_id, old_id);
        assert!(store.get(&new_id).await.is_ok());
    }

    #[tokio::test]
    async fn rehydrate_misses_on_unknown_grant() {
        let store = Arc::new(MemoryAuthStore::new(
            Duration::from_secs(3600),
            Duration::from_secs(86400),
            Duration::from_millis(50),
        ));
        let auth = BffAuth::new(store as Arc<dyn AuthStore>, AuthCookie::default());
        let req = request_with_cookie("BFF-Auth-Session", "never-issued");
        assert!(auth.rehydrate(&req).await.is_none());
    }

    #[tokio::test]
    async fn logout_all_revokes_family_and_clears_cookie() {
        let store = Arc::new(MemoryAuthStore::new(
            Duration::from_secs(3600),
            Duration::from_secs(86400),
            Duration::from_millis(50),
        ));
        let grant = Grant::new("user-2");
        let id = grant.id.clone();
        store.put(grant).await.unwrap();

        let auth = BffAuth::new(Arc::clone(&store) as Arc<dyn AuthStore>, AuthCookie::default());
        let req = request_with_cookie("BFF-Auth-Session", &id);
        let cleared = auth.logout_all(&req).await.expect("grant existed");
        assert!(cleared.contains("Max-Age=0"));
        assert!(store.get(&id).await.is_err());
    }
}
