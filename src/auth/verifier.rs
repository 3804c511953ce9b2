//! External HTTP credential verifier.
//!
//! When `externalAuthenticationURL` is configured, every access request
//! is POSTed to it as a JSON document. A 2xx response authorizes the
//! request; any other response is a critical failure whose body is
//! forwarded verbatim to the caller.

use serde::Serialize;

use crate::auth::Action;
use crate::error::{CoreError, Result};
use crate::session::{AccessRequest, SessionId};

#[derive(Serialize)]
struct VerifyPayload<'a> {
    ip: String,
    user: &'a str,
    password: &'a str,
    path: &'a str,
    protocol: String,
    id: Option<SessionId>,
    action: String,
    query: &'a str,
}

impl<'a> VerifyPayload<'a> {
    fn new(req: &'a AccessRequest, action: Action) -> Self {
        Self {
            ip: req.ip.to_string(),
            user: &req.user,
            password: &req.pass,
            path: &req.name,
            protocol: req.protocol.to_string(),
            id: req.session_id,
            action: action.to_string(),
            query: &req.query,
        }
    }
}

/// POSTs the access request to the verifier and maps the response.
pub(crate) async fn verify(
    client: &reqwest::Client,
    url: &str,
    req: &AccessRequest,
    action: Action,
) -> Result<()> {
    let res = client
        .post(url)
        .json(&VerifyPayload::new(req, action))
        .send()
        .await
        .map_err(|e| CoreError::AuthCritical(format!("external authentication failed: {}", e)))?;

    let status = res.status();
    if status.is_success() {
        return Ok(());
    }

    let body = res.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        format!("external authentication failed (code {})", status.as_u16())
    } else {
        body
    };

    Err(CoreError::AuthCritical(message))
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::session::Protocol;

    #[test]
    fn test_payload_shape() {
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let mut req = AccessRequest::basic("cam1", ip, Protocol::WebRtc, true);
        req.user = "u".into();
        req.pass = "p".into();
        req.query = "token=abc".into();

        let payload = VerifyPayload::new(&req, Action::Publish);
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["ip"], "203.0.113.9");
        assert_eq!(json["user"], "u");
        assert_eq!(json["password"], "p");
        assert_eq!(json["path"], "cam1");
        assert_eq!(json["protocol"], "webrtc");
        assert_eq!(json["action"], "publish");
        assert_eq!(json["query"], "token=abc");
        assert!(json["id"].is_null());
    }
}
