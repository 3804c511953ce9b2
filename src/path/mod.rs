//! Paths and the path manager.
//!
//! A path is a named broadcast resource: one publisher, many readers.
//! The [`PathManager`] resolves incoming requests against the configured
//! templates, owns the set of live paths and routes requests to them;
//! each path runs its own event loop and owns its stream, its readers'
//! bookkeeping and its on-demand source machinery.
//!
//! ```text
//!  protocol server ──▶ PathManager ──▶ Path ──▶ Stream ──▶ AsyncWriters
//!       (session)        (actor)      (actor)  (rwlock)    (1 / reader)
//! ```
//!
//! All control-plane state is private to its actor; entities communicate
//! by message passing only, and every request receives exactly one
//! terminal reply.

mod core;
pub mod hooks;
pub mod manager;
pub mod requests;
pub mod source;

pub use manager::{HlsServer, PathApiInfo, PathApiSource, PathManager};
pub use requests::{PathBinding, ReaderAttachment};
pub use source::{SourceHandle, SourceStartContext, StaticSourceStarter};

#[cfg(test)]
pub(crate) mod testutil {
    //! Recording fakes for the collaborator interfaces.

    use std::sync::{Arc, Mutex};

    use tokio_util::sync::CancellationToken;

    use crate::externalcmd::{CommandExecutor, CommandHandle, Environment};
    use crate::path::source::{SourceHandle, SourceStartContext, StaticSourceStarter};

    /// A spawned-command record kept by [`RecordingExecutor`].
    #[derive(Clone)]
    pub struct SpawnRecord {
        pub cmdline: String,
        pub env: Environment,
        pub restart: bool,
        pub token: CancellationToken,
    }

    impl SpawnRecord {
        pub fn closed(&self) -> bool {
            self.token.is_cancelled()
        }
    }

    /// Command executor that records spawns instead of running anything.
    #[derive(Default)]
    pub struct RecordingExecutor {
        spawns: Mutex<Vec<SpawnRecord>>,
    }

    impl RecordingExecutor {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn spawns_of(&self, cmdline: &str) -> Vec<SpawnRecord> {
            self.spawns
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.cmdline == cmdline)
                .cloned()
                .collect()
        }

        pub fn all_spawns(&self) -> Vec<SpawnRecord> {
            self.spawns.lock().unwrap().clone()
        }
    }

    impl CommandExecutor for RecordingExecutor {
        fn spawn(&self, cmdline: &str, env: Environment, restart: bool) -> CommandHandle {
            let token = CancellationToken::new();
            self.spawns.lock().unwrap().push(SpawnRecord {
                cmdline: cmdline.to_string(),
                env,
                restart,
                token: token.clone(),
            });
            CommandHandle::new(token)
        }
    }

    /// Static-source starter that records start requests; tests drive
    /// the actual publishing themselves.
    #[derive(Default)]
    pub struct RecordingStarter {
        starts: Mutex<Vec<(SourceStartContext, CancellationToken)>>,
    }

    impl RecordingStarter {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn starts(&self) -> Vec<(SourceStartContext, CancellationToken)> {
            self.starts
                .lock()
                .unwrap()
                .iter()
                .map(|(c, t)| (c.clone(), t.clone()))
                .collect()
        }
    }

    impl StaticSourceStarter for RecordingStarter {
        fn start(&self, ctx: SourceStartContext) -> SourceHandle {
            let token = CancellationToken::new();
            self.starts.lock().unwrap().push((ctx, token.clone()));
            SourceHandle::new(token)
        }
    }
}
