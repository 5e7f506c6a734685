//! Cookie naming and attributes, centralized.
//!
//! Cohort selection is a parameter here — never inferred from the request
//! path. The session cookie is HttpOnly; the CSRF cookie is readable by
//! same-origin script so the SPA can echo it in `x-csrf-token`.

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};

use crate::store::Cohort;

/// Session cookie name for a cohort.
#[must_use]
pub fn session_cookie_name(cohort: Cohort) -> &'static str {
    match cohort {
        Cohort::User => "__Host-ZkAuth",
        Cohort::Admin => "__Host-ZkAuth-Admin",
    }
}

/// CSRF cookie name for a cohort.
#[must_use]
pub fn csrf_cookie_name(cohort: Cohort) -> &'static str {
    match cohort {
        Cohort::User => "__Host-ZkAuth-Csrf",
        Cohort::Admin => "__Host-ZkAuth-Admin-Csrf",
    }
}

/// Header that must echo the CSRF cookie on state-changing requests.
pub const CSRF_HEADER: &str = "x-csrf-token";

fn base_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    let mut cookie = Cookie::new(name, value);
    cookie.set_path("/");
    cookie.set_same_site(SameSite::Strict);
    // `__Host-` requires Secure; development mode runs over plain http.
    cookie.set_secure(secure);
    cookie
}

/// Add the session + CSRF cookie pair for a cohort.
#[must_use]
pub fn add_session_cookies(
    jar: CookieJar,
    cohort: Cohort,
    session_id: &str,
    csrf_token: &str,
    secure: bool,
) -> CookieJar {
    let mut session = base_cookie(session_cookie_name(cohort), session_id.to_string(), secure);
    session.set_http_only(true);
    let csrf = base_cookie(csrf_cookie_name(cohort), csrf_token.to_string(), secure);
    jar.add(session).add(csrf)
}

/// Remove the pair (logout).
#[must_use]
pub fn clear_session_cookies(jar: CookieJar, cohort: Cohort) -> CookieJar {
    jar.remove(Cookie::from(session_cookie_name(cohort)))
        .remove(Cookie::from(csrf_cookie_name(cohort)))
}

/// Read the session id for a cohort, if present.
#[must_use]
pub fn session_id(jar: &CookieJar, cohort: Cohort) -> Option<String> {
    jar.get(session_cookie_name(cohort))
        .map(|c| c.value().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cohort_names_are_distinct() {
        assert_ne!(
            session_cookie_name(Cohort::User),
            session_cookie_name(Cohort::Admin)
        );
        assert!(session_cookie_name(Cohort::User).starts_with("__Host-"));
        assert!(csrf_cookie_name(Cohort::Admin).contains("-Admin-"));
    }

    #[test]
    fn session_cookie_roundtrip_through_jar() {
        let jar = CookieJar::new();
        let jar = add_session_cookies(jar, Cohort::User, "sid-123", "csrf-456", true);
        assert_eq!(session_id(&jar, Cohort::User).as_deref(), Some("sid-123"));
        assert_eq!(session_id(&jar, Cohort::Admin), None);

        let jar = clear_session_cookies(jar, Cohort::User);
        assert_eq!(session_id(&jar, Cohort::User), None);
    }
}
