//! Path name validation and template resolution.
//!
//! A [`PathConfSet`] is a validated, ordered collection of
//! [`PathConf`] templates. Resolution rules, in order: exact literal
//! match, regex patterns in declaration order, then the wildcard.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::conf::path_conf::PathConf;
use crate::error::{CoreError, Result};

/// Validates a concrete path name. Returns the reason on rejection.
///
/// Names must be non-empty, must not begin or end with a slash, must not
/// contain `.` or `..` segments, and may contain only alphanumeric
/// characters, underscore, minus, slash, dot and tilde.
pub fn check_path_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("cannot be empty".into());
    }

    if name.starts_with('/') {
        return Err("cannot begin with a slash".into());
    }

    if name.ends_with('/') {
        return Err("cannot end with a slash".into());
    }

    if name.split('/').any(|seg| seg == "." || seg == "..") {
        return Err("cannot contain '.' or '..' segments".into());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/' | '.' | '~'))
    {
        return Err(
            "can contain only alphanumeric characters, underscore, minus, slash, dot or tilde"
                .into(),
        );
    }

    Ok(())
}

/// Result of resolving a name against a regex template: the capture
/// groups, exposed to hook expansion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathMatch {
    /// Positional groups; `groups[0]` is the whole match.
    pub groups: Vec<String>,
    /// Named groups, in pattern order.
    pub named: Vec<(String, String)>,
}

impl PathMatch {
    fn from_captures(re: &Regex, caps: &regex::Captures<'_>) -> Self {
        let groups = caps
            .iter()
            .map(|g| g.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect();

        let named = re
            .capture_names()
            .flatten()
            .filter_map(|n| caps.name(n).map(|m| (n.to_string(), m.as_str().to_string())))
            .collect();

        Self { groups, named }
    }

    fn whole(name: &str) -> Self {
        Self {
            groups: vec![name.to_string()],
            named: Vec::new(),
        }
    }
}

/// The ordered, validated set of path templates.
#[derive(Debug)]
pub struct PathConfSet {
    confs: Vec<Arc<PathConf>>,
    literals: HashMap<String, usize>,
    patterns: Vec<(usize, Regex)>,
    wildcard: Option<usize>,
}

impl PathConfSet {
    /// Builds a set from templates in declaration order, keyed by the
    /// name each was declared under. Validates every template, rejects
    /// duplicate names and coexisting wildcard aliases.
    pub fn new(entries: impl IntoIterator<Item = (String, PathConf)>) -> Result<Self> {
        let mut confs = Vec::new();
        let mut literals = HashMap::new();
        let mut patterns = Vec::new();
        let mut wildcard = None;

        for (name, mut conf) in entries {
            conf.name = name.clone();
            conf.check()?;

            let idx = confs.len();

            if conf.is_wildcard() {
                if wildcard.is_some() {
                    return Err(CoreError::Conf(
                        "all_others, all and '~^.*$' are aliases and cannot coexist".into(),
                    ));
                }
                wildcard = Some(idx);
            } else if conf.is_pattern() {
                // check() already verified the pattern compiles.
                let re = Regex::new(&name[1..])
                    .map_err(|e| CoreError::Conf(format!("invalid regular expression: {}", e)))?;
                patterns.push((idx, re));
            } else if literals.insert(name.clone(), idx).is_some() {
                return Err(CoreError::Conf(format!("duplicate path '{}'", name)));
            }

            confs.push(Arc::new(conf));
        }

        Ok(Self {
            confs,
            literals,
            patterns,
            wildcard,
        })
    }

    /// An empty set; every lookup fails with `PathNotFound`.
    pub fn empty() -> Self {
        Self::new(std::iter::empty()).expect("empty set is always valid")
    }

    /// Resolves a concrete path name to its template.
    pub fn find(&self, name: &str) -> Result<(Arc<PathConf>, PathMatch)> {
        check_path_name(name).map_err(|reason| CoreError::invalid_name(name, &reason))?;

        if let Some(&idx) = self.literals.get(name) {
            return Ok((self.confs[idx].clone(), PathMatch::whole(name)));
        }

        for (idx, re) in &self.patterns {
            if let Some(caps) = re.captures(name) {
                return Ok((
                    self.confs[*idx].clone(),
                    PathMatch::from_captures(re, &caps),
                ));
            }
        }

        if let Some(idx) = self.wildcard {
            return Ok((self.confs[idx].clone(), PathMatch::whole(name)));
        }

        Err(CoreError::PathNotFound(name.to_string()))
    }

    /// Templates in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PathConf>> {
        self.confs.iter()
    }

    /// Number of templates.
    pub fn len(&self) -> usize {
        self.confs.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.confs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> PathConfSet {
        PathConfSet::new(
            names
                .iter()
                .map(|n| (n.to_string(), PathConf::default())),
        )
        .unwrap()
    }

    #[test]
    fn test_check_path_name() {
        assert!(check_path_name("cam1").is_ok());
        assert!(check_path_name("live/cam-1/sub.stream~x").is_ok());

        assert!(check_path_name("").is_err());
        assert!(check_path_name("/cam1").is_err());
        assert!(check_path_name("cam1/").is_err());
        assert!(check_path_name("a/./b").is_err());
        assert!(check_path_name("a/../b").is_err());
        assert!(check_path_name("cam 1").is_err());
        assert!(check_path_name("cam:1").is_err());
    }

    #[test]
    fn test_exact_match_wins() {
        let s = set(&["~^cam.*$", "cam1"]);
        let (conf, m) = s.find("cam1").unwrap();
        assert_eq!(conf.name, "cam1");
        assert_eq!(m.groups, vec!["cam1"]);
    }

    #[test]
    fn test_patterns_tried_in_declaration_order() {
        let s = set(&["~^cam(.*)$", "~^(cam1)$"]);
        let (conf, m) = s.find("cam1").unwrap();
        assert_eq!(conf.name, "~^cam(.*)$");
        assert_eq!(m.groups, vec!["cam1", "1"]);
    }

    #[test]
    fn test_named_captures() {
        let s = set(&["~^room/(?P<room>[a-z]+)/(?P<feed>[a-z]+)$"]);
        let (_, m) = s.find("room/lobby/main").unwrap();
        assert_eq!(m.groups, vec!["room/lobby/main", "lobby", "main"]);
        assert_eq!(
            m.named,
            vec![
                ("room".to_string(), "lobby".to_string()),
                ("feed".to_string(), "main".to_string())
            ]
        );
    }

    #[test]
    fn test_wildcard_catches_last() {
        // The wildcard is declared first but must not shadow the later
        // pattern.
        let s = set(&["all_others", "~^cam[0-9]+$", "fixed"]);

        assert_eq!(s.find("cam7").unwrap().0.name, "~^cam[0-9]+$");
        assert_eq!(s.find("fixed").unwrap().0.name, "fixed");
        assert_eq!(s.find("anything/else").unwrap().0.name, "all_others");
    }

    #[test]
    fn test_wildcard_aliases_cannot_coexist() {
        for names in [&["all", "all_others"][..], &["all_others", "~^.*$"][..]] {
            let err = PathConfSet::new(
                names
                    .iter()
                    .map(|n| (n.to_string(), PathConf::default())),
            )
            .unwrap_err();
            assert!(err.to_string().contains("aliases"));
        }
    }

    #[test]
    fn test_not_found_and_invalid() {
        let s = set(&["cam1"]);
        assert!(matches!(
            s.find("other").unwrap_err(),
            CoreError::PathNotFound(_)
        ));
        assert!(matches!(
            s.find("a/../b").unwrap_err(),
            CoreError::InvalidName { .. }
        ));

        assert!(matches!(
            PathConfSet::empty().find("cam1").unwrap_err(),
            CoreError::PathNotFound(_)
        ));
    }

    #[test]
    fn test_duplicate_literal_rejected() {
        let err = PathConfSet::new(vec![
            ("cam1".to_string(), PathConf::default()),
            ("cam1".to_string(), PathConf::default()),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
