//! Portals that log in through an HTML form and keep the session in a cookie.
//! The export endpoint answers with a CSV file or an HTML listing page.

use super::{
    collect_pages, read_page, session_client, AuthFailure, DateRange, FetchFailure, HttpTimeouts,
    RawBatch, Session, SourceCollector, SourceProfile,
};
use crate::config::Credentials;
use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use std::sync::LazyLock;
use tracing::{debug, info};

const DATE_FORMAT: &str = "%Y%m%d";

// Whole words only: listing pages say "blocked" all over the place.
static LOCKED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:account|user)\b[^<.]{0,40}\blocked\b|\blocked\s+out\b")
        .expect("valid lockout pattern")
});

pub struct FormPortalCollector {
    profile: SourceProfile,
    base_url: String,
    credentials: Credentials,
    timeouts: HttpTimeouts,
}

impl FormPortalCollector {
    pub fn new(
        profile: SourceProfile,
        base_url: &str,
        credentials: Credentials,
        timeouts: HttpTimeouts,
    ) -> Self {
        Self {
            profile,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            timeouts,
        }
    }
}

/// Portals tend to answer a failed login with 200 and an error page.
fn classify_login_page(body: &str) -> Option<AuthFailure> {
    if LOCKED_RE.is_match(body) {
        return Some(AuthFailure::Locked);
    }
    let body = body.to_lowercase();
    if body.contains("login failed") || body.contains("invalid credentials") {
        Some(AuthFailure::InvalidCredentials)
    } else {
        None
    }
}

#[async_trait]
impl SourceCollector for FormPortalCollector {
    fn profile(&self) -> &SourceProfile {
        &self.profile
    }

    async fn authenticate(&self) -> Result<Session, AuthFailure> {
        let client = session_client(&self.timeouts)?;

        let response = client
            .post(format!("{}/login", self.base_url))
            .timeout(self.timeouts.auth)
            .form(&[
                ("username", self.credentials.username.as_str()),
                ("password", self.credentials.password.as_str()),
            ])
            .send()
            .await?;

        match response.status() {
            StatusCode::LOCKED => return Err(AuthFailure::Locked),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(AuthFailure::InvalidCredentials)
            }
            status if !status.is_success() => {
                return Err(AuthFailure::Network(format!("login returned HTTP {status}")))
            }
            _ => {}
        }

        let body = response.text().await?;
        if let Some(failure) = classify_login_page(&body) {
            return Err(failure);
        }

        info!(source = %self.profile.name, "Logged in to portal");
        Ok(Session::new(client))
    }

    async fn fetch_raw_batch(
        &self,
        session: &Session,
        range: &DateRange,
    ) -> Result<RawBatch, FetchFailure> {
        let url = format!("{}/blacklist/export", self.base_url);
        let start = range.start.format(DATE_FORMAT).to_string();
        let end = range.end.format(DATE_FORMAT).to_string();
        let size = self.profile.page_size.to_string();

        debug!(source = %self.profile.name, %start, %end, "Requesting export");

        collect_pages(
            &self.profile,
            |page| {
                let request = session.client().get(&url).query(&[
                    ("startDate", start.as_str()),
                    ("endDate", end.as_str()),
                    ("page", page.to_string().as_str()),
                    ("size", size.as_str()),
                ]);
                read_page(request, page)
            },
            |payload| self.parse_records(payload),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_login_page() {
        assert_eq!(
            classify_login_page("<p>Your account has been LOCKED for 10 minutes</p>"),
            Some(AuthFailure::Locked)
        );
        assert_eq!(
            classify_login_page("<div class=\"error\">Login failed</div>"),
            Some(AuthFailure::InvalidCredentials)
        );
        assert_eq!(classify_login_page("<h1>Welcome, analyst</h1>"), None);
    }

    #[test]
    fn test_classify_login_page_ignores_blocked_listings() {
        assert_eq!(
            classify_login_page(
                "<h1>Welcome, analyst</h1><a href=\"/blacklist\">Blocked IP list</a>"
            ),
            None
        );
        assert_eq!(classify_login_page("<p>Account unlocked. Blocklist updated.</p>"), None);
        assert_eq!(
            classify_login_page("<p>User is temporarily locked out</p>"),
            Some(AuthFailure::Locked)
        );
    }
}
