//! Session and login-flow cookies.
use crate::config::{SameSiteMode, SessionConfig};
use axum::http::HeaderMap;
use axum_extra::extract::cookie::{Cookie, SameSite};
use std::time::Duration;

pub const FLOW_COOKIE_NAME: &str = "sessionplane_login_flow";

#[derive(Debug, Clone)]
pub struct CookiePolicy {
    session_name: String,
    same_site: SameSiteMode,
    force_secure: bool,
    session_ttl: Duration,
    flow_ttl: Duration,
}

impl CookiePolicy {
    pub fn new(session: &SessionConfig, flow_ttl: Duration) -> Self {
        Self {
            session_name: session.cookie_name.clone(),
            same_site: session.same_site,
            force_secure: session.force_secure,
            session_ttl: session.ttl,
            flow_ttl,
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// `Secure` is set when forced by configuration or when a proxy in front
    /// reports the original scheme as https.
    pub fn is_secure(&self, headers: &HeaderMap) -> bool {
        self.force_secure || forwarded_https(headers)
    }

    pub fn session_cookie(&self, token: String, headers: &HeaderMap) -> Cookie<'static> {
        self.build(self.session_name.clone(), token, self.session_ttl, headers)
    }

    pub fn clear_session(&self, headers: &HeaderMap) -> Cookie<'static> {
        self.build(self.session_name.clone(), String::new(), Duration::ZERO, headers)
    }

    pub fn flow_cookie(&self, value: String, headers: &HeaderMap) -> Cookie<'static> {
        // The IdP redirect back is a cross-site navigation; Strict would drop
        // the cookie on the callback.
        let mut cookie = self.build(FLOW_COOKIE_NAME.to_string(), value, self.flow_ttl, headers);
        if self.same_site == SameSiteMode::Strict {
            cookie.set_same_site(SameSite::Lax);
        }
        cookie
    }

    pub fn clear_flow(&self, headers: &HeaderMap) -> Cookie<'static> {
        self.build(FLOW_COOKIE_NAME.to_string(), String::new(), Duration::ZERO, headers)
    }

    fn build(
        &self,
        name: String,
        value: String,
        max_age: Duration,
        headers: &HeaderMap,
    ) -> Cookie<'static> {
        Cookie::build((name, value))
            .path("/")
            .http_only(true)
            .secure(self.is_secure(headers))
            .same_site(match self.same_site {
                SameSiteMode::Strict => SameSite::Strict,
                SameSiteMode::Lax => SameSite::Lax,
                SameSiteMode::None => SameSite::None,
            })
            .max_age(time::Duration::seconds(max_age.as_secs() as i64))
            .build()
    }
}

fn forwarded_https(headers: &HeaderMap) -> bool {
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().eq_ignore_ascii_case("https"))
        .unwrap_or(false);
    if proto {
        return true;
    }
    headers
        .get_all("forwarded")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split([';', ',']))
        .filter_map(|pair| pair.trim().split_once('='))
        .any(|(key, value)| {
            key.trim().eq_ignore_ascii_case("proto")
                && value.trim().trim_matches('"').eq_ignore_ascii_case("https")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_COOKIE_NAME;

    fn policy(same_site: SameSiteMode, force_secure: bool) -> CookiePolicy {
        CookiePolicy::new(
            &SessionConfig {
                secret: "x".repeat(32),
                ttl: Duration::from_secs(3600),
                issuer: "sessionplane".to_string(),
                cookie_name: DEFAULT_COOKIE_NAME.to_string(),
                same_site,
                force_secure,
            },
            Duration::from_secs(600),
        )
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, value.parse().expect("header"));
        }
        map
    }

    #[test]
    fn session_cookie_defaults() {
        let cookie = policy(SameSiteMode::Lax, false).session_cookie("tok".to_string(), &HeaderMap::new());
        assert_eq!(cookie.name(), DEFAULT_COOKIE_NAME);
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.secure(), Some(false));
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.max_age(), Some(time::Duration::seconds(3600)));
    }

    #[test]
    fn secure_follows_forwarded_headers() {
        let policy = policy(SameSiteMode::Lax, false);
        assert!(policy.is_secure(&headers(&[("x-forwarded-proto", "https")])));
        assert!(policy.is_secure(&headers(&[("x-forwarded-proto", "HTTPS, http")])));
        assert!(policy.is_secure(&headers(&[("forwarded", "for=10.0.0.1;proto=https")])));
        assert!(policy.is_secure(&headers(&[("forwarded", "for=1.2.3.4, proto=\"https\"")])));
        assert!(!policy.is_secure(&headers(&[("x-forwarded-proto", "http")])));
        assert!(!policy.is_secure(&HeaderMap::new()));
        assert!(self::policy(SameSiteMode::Lax, true).is_secure(&HeaderMap::new()));
    }

    #[test]
    fn clearing_expires_immediately() {
        let cookie = policy(SameSiteMode::Strict, true).clear_session(&HeaderMap::new());
        assert_eq!(cookie.value(), "");
        assert_eq!(cookie.max_age(), Some(time::Duration::ZERO));
        assert_eq!(cookie.same_site(), Some(SameSite::Strict));
    }

    #[test]
    fn flow_cookie_survives_cross_site_callback() {
        let cookie = policy(SameSiteMode::Strict, true).flow_cookie("v".to_string(), &HeaderMap::new());
        assert_eq!(cookie.name(), FLOW_COOKIE_NAME);
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.max_age(), Some(time::Duration::seconds(600)));
    }
}
