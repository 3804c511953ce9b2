//! Configuration types.
//!
//! The core is configured with a [`ManagerConf`] (settings shared by all
//! paths) and a [`PathConfSet`] (the ordered collection of path templates
//! a requested name is resolved against). Both are plain data: file
//! parsing and the on-disk format are the embedder's business. Validation
//! happens in an explicit `check()` pass and returns typed errors naming
//! the offending field.

pub mod matcher;
pub mod path_conf;

pub use matcher::{check_path_name, PathConfSet, PathMatch};
pub use path_conf::{IpNetwork, PathConf, Source};

use crate::error::{CoreError, Result};

/// Supported authentication methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// Plain user/password comparison.
    Basic,
    /// Challenge/response through the protocol binding's validator.
    Digest,
}

/// Core-level settings shared by the path manager and every path.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ManagerConf {
    /// URL of an external HTTP credential verifier. Incompatible with
    /// the `digest` auth method.
    pub external_authentication_url: Option<String>,

    /// Enabled authentication methods.
    pub auth_methods: Vec<AuthMethod>,

    /// Capacity of each reader's write queue. Must be a power of two.
    pub write_queue_size: usize,

    /// Eagerly instantiate every concretely-named path so the HLS server
    /// can pre-create muxers for it.
    pub hls_always_remux: bool,
}

impl Default for ManagerConf {
    fn default() -> Self {
        Self {
            external_authentication_url: None,
            auth_methods: vec![AuthMethod::Basic],
            write_queue_size: 512,
            hls_always_remux: false,
        }
    }
}

impl ManagerConf {
    /// Validates the settings.
    pub fn check(&self) -> Result<()> {
        if self.write_queue_size == 0 || !self.write_queue_size.is_power_of_two() {
            return Err(CoreError::Conf(
                "'writeQueueSize' must be a power of two".into(),
            ));
        }

        if let Some(url) = &self.external_authentication_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(CoreError::Conf(
                    "'externalAuthenticationURL' must be a HTTP URL".into(),
                ));
            }

            if self.auth_methods.contains(&AuthMethod::Digest) {
                return Err(CoreError::Conf(
                    "'externalAuthenticationURL' can't be used when 'digest' is in authMethods"
                        .into(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ManagerConf::default().check().is_ok());
    }

    #[test]
    fn test_write_queue_size_power_of_two() {
        let conf = ManagerConf {
            write_queue_size: 1001,
            ..Default::default()
        };
        let err = conf.check().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid configuration: 'writeQueueSize' must be a power of two"
        );

        let conf = ManagerConf {
            write_queue_size: 0,
            ..Default::default()
        };
        assert!(conf.check().is_err());
    }

    #[test]
    fn test_external_url_must_be_http() {
        let conf = ManagerConf {
            external_authentication_url: Some("testing".into()),
            ..Default::default()
        };
        assert!(conf.check().is_err());
    }

    #[test]
    fn test_external_url_conflicts_with_digest() {
        let conf = ManagerConf {
            external_authentication_url: Some("http://myurl".into()),
            auth_methods: vec![AuthMethod::Basic, AuthMethod::Digest],
            ..Default::default()
        };
        let err = conf.check().unwrap_err();
        assert!(err.to_string().contains("'digest'"));
    }
}
