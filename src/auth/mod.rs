//! The auth broker.
//!
//! Validates publish/read attempts against per-path rules and an
//! optional external HTTP verifier, and converts outcomes into the typed
//! failures of [`CoreError`]. The broker itself never sleeps: the
//! mandatory anti-brute-force delay on critical failures is applied by
//! the requesting session's task (see
//! [`Authorizer::authorize_throttled`]), so a slow credential check can
//! never stall a control-plane loop.

pub mod verifier;

use std::time::Duration;

use crate::conf::path_conf::ip_allowed;
use crate::conf::{AuthMethod, ManagerConf, PathConf};
use crate::error::{CoreError, Result};
use crate::session::AccessRequest;

/// Minimum delay applied before surfacing a critical authentication
/// failure, to throttle brute force attempts.
pub const PAUSE_AFTER_AUTH_ERROR: Duration = Duration::from_secs(2);

/// What the requester wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Publish media to a path.
    Publish,
    /// Read media from a path.
    Read,
    /// Read recorded media.
    Playback,
    /// Use the control API.
    Api,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Publish => write!(f, "publish"),
            Action::Read => write!(f, "read"),
            Action::Playback => write!(f, "playback"),
            Action::Api => write!(f, "api"),
        }
    }
}

/// Validates access requests for the path manager.
pub struct Authorizer {
    methods: Vec<AuthMethod>,
    external_url: Option<String>,
    client: reqwest::Client,
}

impl Authorizer {
    /// Creates an authorizer from the core settings.
    pub fn new(conf: &ManagerConf) -> Self {
        Self {
            methods: conf.auth_methods.clone(),
            external_url: conf.external_authentication_url.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// Validates a request against the path's rules.
    ///
    /// Order: IP ACL (deny is critical), external verifier if configured
    /// (non-2xx is critical, body forwarded), then per-action
    /// credentials. Missing credentials when some are required yield
    /// [`CoreError::AuthNotCritical`] so the session can challenge.
    pub async fn authorize(
        &self,
        conf: &PathConf,
        req: &AccessRequest,
        action: Action,
    ) -> Result<()> {
        if req.skip_auth {
            return Ok(());
        }

        let ips = match action {
            Action::Publish => &conf.publish_ips,
            _ => &conf.read_ips,
        };
        if !ip_allowed(ips, req.ip) {
            return Err(CoreError::AuthCritical(format!(
                "IP {} not allowed to {}",
                req.ip, action
            )));
        }

        if let Some(url) = &self.external_url {
            return verifier::verify(&self.client, url, req, action).await;
        }

        let (user, pass) = match action {
            Action::Publish => (&conf.publish_user, &conf.publish_pass),
            _ => (&conf.read_user, &conf.read_pass),
        };

        if user.is_empty() && pass.is_empty() {
            return Ok(());
        }

        if self.methods.contains(&AuthMethod::Digest) {
            if let Some(validate) = &req.credentials_validator {
                if validate(user, pass) {
                    return Ok(());
                }
                return Err(CoreError::AuthCritical("invalid credentials".into()));
            }
        }

        if !self.methods.contains(&AuthMethod::Basic) {
            // Digest is the only method and no challenge has happened yet.
            return Err(CoreError::AuthNotCritical(
                "digest challenge required".into(),
            ));
        }

        if req.user.is_empty() && req.pass.is_empty() {
            return Err(CoreError::AuthNotCritical("credentials required".into()));
        }

        if req.user == *user && req.pass == *pass {
            Ok(())
        } else {
            Err(CoreError::AuthCritical("invalid credentials".into()))
        }
    }

    /// Like [`Authorizer::authorize`], but delays the reply by
    /// [`PAUSE_AFTER_AUTH_ERROR`] when the failure is critical. Meant to
    /// be awaited from the requesting session's task.
    pub async fn authorize_throttled(
        &self,
        conf: &PathConf,
        req: &AccessRequest,
        action: Action,
    ) -> Result<()> {
        match self.authorize(conf, req, action).await {
            Err(err) if err.is_auth_critical() => {
                tokio::time::sleep(PAUSE_AFTER_AUTH_ERROR).await;
                Err(err)
            }
            other => other,
        }
    }
}
