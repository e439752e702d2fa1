//! JSON APIs that hand out a bearer token at login.

use super::{
    collect_pages, read_page, session_client, AuthFailure, DateRange, FetchFailure, HttpTimeouts,
    PayloadFormat, RawBatch, RawPayload, Session, SourceCollector, SourceProfile,
};
use crate::config::Credentials;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info};

const DATE_FORMAT: &str = "%Y-%m-%d";

pub struct TokenApiCollector {
    profile: SourceProfile,
    base_url: String,
    credentials: Credentials,
    timeouts: HttpTimeouts,
}

impl TokenApiCollector {
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

fn find_token(body: &Value) -> Option<&str> {
    body.get("token")
        .or_else(|| body.get("access_token"))
        .or_else(|| body.get("data").and_then(|data| data.get("token")))
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
}

fn error_message(body: &Value) -> String {
    ["error", "message", "detail"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .unwrap_or_default()
        .to_lowercase()
}

fn rejection(body: &Value) -> AuthFailure {
    if error_message(body).contains("lock") {
        AuthFailure::Locked
    } else {
        AuthFailure::InvalidCredentials
    }
}

#[async_trait]
impl SourceCollector for TokenApiCollector {
    fn profile(&self) -> &SourceProfile {
        &self.profile
    }

    async fn authenticate(&self) -> Result<Session, AuthFailure> {
        let client = session_client(&self.timeouts)?;

        let response = client
            .post(format!("{}/api/auth/login", self.base_url))
            .timeout(self.timeouts.auth)
            .json(&json!({
                "username": self.credentials.username,
                "password": self.credentials.password,
            }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::LOCKED {
            return Err(AuthFailure::Locked);
        }
        if status.is_server_error() {
            return Err(AuthFailure::Network(format!("login returned HTTP {status}")));
        }

        let body: Value = response.json().await.unwrap_or(Value::Null);
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(rejection(&body));
        }
        if !status.is_success() {
            return Err(AuthFailure::Network(format!("login returned HTTP {status}")));
        }

        let token = find_token(&body).ok_or_else(|| rejection(&body))?.to_string();

        info!(source = %self.profile.name, "Obtained API token");
        Ok(Session::new(client).with_token(token))
    }

    async fn fetch_raw_batch(
        &self,
        session: &Session,
        range: &DateRange,
    ) -> Result<RawBatch, FetchFailure> {
        let token = session
            .token()
            .ok_or_else(|| FetchFailure::Http("session carries no bearer token".to_string()))?;
        let url = format!("{}/api/blacklist", self.base_url);
        let start = range.start.format(DATE_FORMAT).to_string();
        let end = range.end.format(DATE_FORMAT).to_string();
        let size = self.profile.page_size.to_string();

        debug!(source = %self.profile.name, %start, %end, "Requesting blacklist pages");

        collect_pages(
            &self.profile,
            |page| {
                let request = session
                    .client()
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[
                        ("start_date", start.as_str()),
                        ("end_date", end.as_str()),
                        ("page", page.to_string().as_str()),
                        ("size", size.as_str()),
                    ]);
                async move {
                    let payload = read_page(request, page).await?;
                    // The API sometimes labels JSON as text/plain
                    Ok::<_, FetchFailure>(RawPayload::new(PayloadFormat::Json, page, payload.body))
                }
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
    fn test_find_token_shapes() {
        assert_eq!(find_token(&json!({"token": "abc"})), Some("abc"));
        assert_eq!(find_token(&json!({"access_token": "def"})), Some("def"));
        assert_eq!(find_token(&json!({"data": {"token": "ghi"}})), Some("ghi"));
        assert_eq!(find_token(&json!({"token": ""})), None);
    }

    #[test]
    fn test_rejection_detects_lockout() {
        assert_eq!(
            rejection(&json!({"error": "Account locked after 5 failed attempts"})),
            AuthFailure::Locked
        );
        assert_eq!(
            rejection(&json!({"message": "bad password"})),
            AuthFailure::InvalidCredentials
        );
        assert_eq!(rejection(&Value::Null), AuthFailure::InvalidCredentials);
    }
}
