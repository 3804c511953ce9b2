//! Hook environment construction.
//!
//! Hook commands receive an environment describing the path they fire
//! for: the resolved name, the regex capture groups (`G1`..`Gn` plus any
//! named groups), and for reader hooks the reader's identity and query.

use crate::conf::{PathConf, PathMatch};
use crate::externalcmd::Environment;
use crate::session::SessionRef;

/// Environment shared by every hook of a path.
pub fn path_env(name: &str, conf: &PathConf, path_match: &PathMatch) -> Environment {
    let mut env = Environment::new();
    env.insert("MTX_PATH".into(), name.to_string());
    env.insert("MTX_SOURCE_TYPE".into(), conf.source.to_string());

    for (i, group) in path_match.groups.iter().enumerate().skip(1) {
        env.insert(format!("G{}", i), group.clone());
    }
    for (group_name, value) in &path_match.named {
        env.insert(group_name.clone(), value.clone());
    }

    env
}

/// Environment of `run_on_demand`: the triggering reader's query is
/// exposed so the command can forward tokens.
pub fn demand_env(base: &Environment, query: &str) -> Environment {
    let mut env = base.clone();
    env.insert("MTX_QUERY".into(), query.to_string());
    env
}

/// Environment of `run_on_read` / `run_on_unread`.
pub fn reader_env(base: &Environment, session: &SessionRef, query: &str) -> Environment {
    let mut env = base.clone();
    env.insert("MTX_QUERY".into(), query.to_string());
    env.insert("MTX_READER_TYPE".into(), session.protocol().to_string());
    env.insert("MTX_READER_ID".into(), session.id().to_string());
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::matcher::PathConfSet;
    use crate::session::Protocol;

    #[test]
    fn test_path_env_with_captures() {
        let set = PathConfSet::new(vec![(
            "~^room/(?P<room>[a-z]+)/(cam[0-9]+)$".to_string(),
            PathConf::default(),
        )])
        .unwrap();
        let (conf, m) = set.find("room/lobby/cam2").unwrap();

        let env = path_env("room/lobby/cam2", &conf, &m);
        assert_eq!(env["MTX_PATH"], "room/lobby/cam2");
        assert_eq!(env["MTX_SOURCE_TYPE"], "publisher");
        assert_eq!(env["G1"], "lobby");
        assert_eq!(env["G2"], "cam2");
        assert_eq!(env["room"], "lobby");
    }

    #[test]
    fn test_reader_env() {
        let set = PathConfSet::new(vec![("cam1".to_string(), PathConf::default())]).unwrap();
        let (conf, m) = set.find("cam1").unwrap();
        let base = path_env("cam1", &conf, &m);

        let (session, _rx) = SessionRef::new(Protocol::WebRtc);
        let env = reader_env(&base, &session, "token=abc");

        assert_eq!(env["MTX_PATH"], "cam1");
        assert_eq!(env["MTX_QUERY"], "token=abc");
        assert_eq!(env["MTX_READER_TYPE"], "webrtc");
        assert_eq!(env["MTX_READER_ID"], session.id().to_string());
    }
}
