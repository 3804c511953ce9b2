//! The path manager.
//!
//! A single event-loop actor owning the set of live paths. Protocol
//! servers talk to it through [`PathManager`]: resolution of a requested
//! name against the configured templates, auth brokering (performed in
//! the caller's task, never in a control-plane loop), request routing,
//! hot configuration reloads and API snapshots.
//!
//! Path destruction is a two-phase handshake: an idle path reports
//! itself with the count of routed requests it has processed, and the
//! manager confirms only when that matches its own forward count. A
//! request still in flight therefore cancels the destruction, and a
//! request arriving after removal simply revives the name with a fresh
//! path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{Action, Authorizer};
use crate::conf::{ManagerConf, PathConf, PathConfSet, PathMatch};
use crate::error::{CoreError, Result};
use crate::externalcmd::CommandExecutor;
use crate::path::core::{self, PathOpts};
use crate::path::requests::{PathBinding, PathEvent, PathRequest, ReaderAttachment};
use crate::path::source::StaticSourceStarter;
use crate::session::{AccessRequest, SessionId, SessionRef};
use crate::stream::Stream;

/// Collaborator notified when paths gain or lose their stream, used to
/// eagerly create HLS muxers. Callbacks run on the manager's loop and
/// must not block.
pub trait HlsServer: Send + Sync + 'static {
    /// A stream exists for the path.
    fn path_ready(&self, name: &str, stream: &Arc<Stream>);
    /// The path's stream is gone.
    fn path_not_ready(&self, name: &str);
}

/// A publisher or reader as reported by the API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PathApiSource {
    /// Protocol tag of the session.
    #[serde(rename = "type")]
    pub kind: String,
    /// Session identity.
    pub id: SessionId,
}

/// Read-only snapshot of one live path.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathApiInfo {
    /// Resolved path name.
    pub name: String,
    /// Name of the configuration template the path was created from.
    pub conf_name: String,
    /// Current publisher, if any.
    pub source: Option<PathApiSource>,
    /// Whether a stream exists.
    pub ready: bool,
    /// When the stream was created.
    pub ready_time: Option<SystemTime>,
    /// Format names of the stream.
    pub tracks: Vec<String>,
    /// Payload bytes received so far.
    pub bytes_received: u64,
    /// Attached readers.
    pub readers: Vec<PathApiSource>,
}

enum ManagerRequest {
    Resolve {
        name: String,
        reply: oneshot::Sender<Result<(Arc<PathConf>, PathMatch)>>,
    },
    RoutePublisher {
        name: String,
        query: String,
        session: SessionRef,
        reply: oneshot::Sender<Result<PathBinding>>,
    },
    RouteReader {
        name: String,
        query: String,
        session: SessionRef,
        reply: oneshot::Sender<Result<ReaderAttachment>>,
    },
    ReloadConfs {
        confs: PathConfSet,
        reply: oneshot::Sender<()>,
    },
    SetHlsServer(Option<Arc<dyn HlsServer>>),
    PathsSnapshot {
        reply: oneshot::Sender<Vec<(String, mpsc::UnboundedSender<PathRequest>)>>,
    },
    PathSnapshot {
        name: String,
        reply: oneshot::Sender<Option<mpsc::UnboundedSender<PathRequest>>>,
    },
}

struct PathEntry {
    tx: mpsc::UnboundedSender<PathRequest>,
    task: JoinHandle<()>,
    instance: u64,
    /// Routed requests forwarded to the path so far; compared with the
    /// path's processed count in idle reports.
    forwarded: u64,
    conf: Arc<PathConf>,
}

struct ManagerActor {
    conf: ManagerConf,
    confs: PathConfSet,
    executor: Arc<dyn CommandExecutor>,
    source_starter: Option<Arc<dyn StaticSourceStarter>>,
    hls: Option<Arc<dyn HlsServer>>,
    paths: HashMap<String, PathEntry>,
    events_tx: mpsc::UnboundedSender<PathEvent>,
    next_instance: u64,
}

impl ManagerActor {
    async fn run(
        mut self,
        mut req_rx: mpsc::UnboundedReceiver<ManagerRequest>,
        mut events_rx: mpsc::UnboundedReceiver<PathEvent>,
        token: CancellationToken,
    ) {
        self.create_static_paths();

        loop {
            tokio::select! {
                req = req_rx.recv() => match req {
                    Some(req) => self.handle_request(req),
                    None => break,
                },
                ev = events_rx.recv() => {
                    // The actor holds a sender clone, so the channel can
                    // never yield None here.
                    if let Some(ev) = ev {
                        self.handle_event(ev);
                    }
                }
                _ = token.cancelled() => break,
            }
        }

        // Cooperative shutdown: signal every path, then join them.
        let entries: Vec<PathEntry> = self.paths.drain().map(|(_, e)| e).collect();
        for entry in &entries {
            let _ = entry.tx.send(PathRequest::Terminate(CoreError::Terminated));
        }
        for entry in entries {
            let _ = entry.task.await;
        }

        // Every in-flight request still gets its terminal reply.
        req_rx.close();
        while let Some(req) = req_rx.recv().await {
            reply_terminated(req);
        }

        tracing::debug!("path manager stopped");
    }

    fn handle_request(&mut self, req: ManagerRequest) {
        match req {
            ManagerRequest::Resolve { name, reply } => {
                let _ = reply.send(self.confs.find(&name));
            }

            ManagerRequest::RoutePublisher {
                name,
                query,
                session,
                reply,
            } => match self.live_entry(&name) {
                Ok(entry) => {
                    entry.forwarded += 1;
                    let _ = entry.tx.send(PathRequest::AddPublisher {
                        session,
                        query,
                        reply,
                    });
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },

            ManagerRequest::RouteReader {
                name,
                query,
                session,
                reply,
            } => match self.live_entry(&name) {
                Ok(entry) => {
                    entry.forwarded += 1;
                    let _ = entry.tx.send(PathRequest::AddReader {
                        session,
                        query,
                        reply,
                    });
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },

            ManagerRequest::ReloadConfs { confs, reply } => {
                self.reload(confs);
                let _ = reply.send(());
            }

            ManagerRequest::SetHlsServer(server) => {
                self.hls = server;
            }

            ManagerRequest::PathsSnapshot { reply } => {
                let mut list: Vec<_> = self
                    .paths
                    .iter()
                    .map(|(name, e)| (name.clone(), e.tx.clone()))
                    .collect();
                list.sort_by(|a, b| a.0.cmp(&b.0));
                let _ = reply.send(list);
            }

            ManagerRequest::PathSnapshot { name, reply } => {
                let _ = reply.send(self.paths.get(&name).map(|e| e.tx.clone()));
            }
        }
    }

    fn handle_event(&mut self, ev: PathEvent) {
        match ev {
            PathEvent::Ready { name, stream } => {
                if let Some(hls) = &self.hls {
                    hls.path_ready(&name, &stream);
                }
            }
            PathEvent::NotReady { name } => {
                if let Some(hls) = &self.hls {
                    hls.path_not_ready(&name);
                }
            }
            PathEvent::Idle {
                name,
                instance,
                processed,
            } => {
                let confirm = self
                    .paths
                    .get(&name)
                    .is_some_and(|e| e.instance == instance && e.forwarded == processed);
                if confirm {
                    let entry = self.paths.remove(&name).expect("checked above");
                    let _ = entry.tx.send(PathRequest::ConfirmClose);
                }
            }
        }
    }

    /// Entry of a live path, creating the path when absent (and
    /// replacing it if its task died without the close handshake).
    fn live_entry(&mut self, name: &str) -> Result<&mut PathEntry> {
        if self
            .paths
            .get(name)
            .is_some_and(|e| e.tx.is_closed())
        {
            self.paths.remove(name);
        }

        if !self.paths.contains_key(name) {
            let (conf, path_match) = self.confs.find(name)?;
            self.create_path(name.to_string(), conf, path_match);
        }

        Ok(self.paths.get_mut(name).expect("just inserted"))
    }

    fn create_path(&mut self, name: String, conf: Arc<PathConf>, path_match: PathMatch) {
        let instance = self.next_instance;
        self.next_instance += 1;

        let is_static = Self::conf_is_static(&conf, self.conf.hls_always_remux);
        let (tx, task) = core::spawn(PathOpts {
            name: name.clone(),
            conf: conf.clone(),
            path_match,
            write_queue_size: self.conf.write_queue_size,
            executor: self.executor.clone(),
            source_starter: self.source_starter.clone(),
            events: self.events_tx.clone(),
            instance,
            is_static,
        });

        self.paths.insert(
            name,
            PathEntry {
                tx,
                task,
                instance,
                forwarded: 0,
                conf,
            },
        );
    }

    fn conf_is_static(conf: &PathConf, hls_always_remux: bool) -> bool {
        !conf.is_pattern()
            && !conf.is_wildcard()
            && (conf.has_static_source() || hls_always_remux)
    }

    /// Paths with a concrete name and a static source (or all concrete
    /// names under `hls_always_remux`) exist from startup.
    fn create_static_paths(&mut self) {
        let static_confs: Vec<Arc<PathConf>> = self
            .confs
            .iter()
            .filter(|c| Self::conf_is_static(c, self.conf.hls_always_remux))
            .cloned()
            .collect();

        for conf in static_confs {
            if !self.paths.contains_key(&conf.name) {
                let name = conf.name.clone();
                let path_match = PathMatch {
                    groups: vec![name.clone()],
                    named: Vec::new(),
                };
                self.create_path(name, conf, path_match);
            }
        }
    }

    /// Applies a new template set. Live paths whose template changed in
    /// a breaking way are terminated with `ConfigurationChanged` (and
    /// recreated when static under the new set); compatible changes are
    /// pushed to the path in place.
    fn reload(&mut self, new_confs: PathConfSet) {
        let names: Vec<String> = self.paths.keys().cloned().collect();

        for name in names {
            match new_confs.find(&name) {
                Err(_) => {
                    tracing::info!(path = %name, "path removed by configuration reload");
                    self.terminate_path(&name, CoreError::ConfigurationChanged);
                }
                Ok((new_conf, _)) => {
                    let entry = self.paths.get_mut(&name).expect("listed above");
                    if *entry.conf == *new_conf {
                        entry.conf = new_conf;
                        continue;
                    }
                    if entry.conf.can_update_in_place(&new_conf) {
                        tracing::info!(path = %name, "path configuration updated in place");
                        entry.conf = new_conf.clone();
                        let _ = entry.tx.send(PathRequest::ReloadConf(new_conf));
                    } else {
                        tracing::info!(path = %name, "path invalidated by configuration reload");
                        self.terminate_path(&name, CoreError::ConfigurationChanged);
                    }
                }
            }
        }

        self.confs = new_confs;
        self.create_static_paths();
    }

    fn terminate_path(&mut self, name: &str, err: CoreError) {
        if let Some(entry) = self.paths.remove(name) {
            let _ = entry.tx.send(PathRequest::Terminate(err));
        }
    }
}

fn reply_terminated(req: ManagerRequest) {
    match req {
        ManagerRequest::Resolve { reply, .. } => {
            let _ = reply.send(Err(CoreError::Terminated));
        }
        ManagerRequest::RoutePublisher { reply, .. } => {
            let _ = reply.send(Err(CoreError::Terminated));
        }
        ManagerRequest::RouteReader { reply, .. } => {
            let _ = reply.send(Err(CoreError::Terminated));
        }
        ManagerRequest::ReloadConfs { reply, .. } => {
            let _ = reply.send(());
        }
        ManagerRequest::PathsSnapshot { reply } => {
            let _ = reply.send(Vec::new());
        }
        ManagerRequest::PathSnapshot { reply, .. } => {
            let _ = reply.send(None);
        }
        ManagerRequest::SetHlsServer(_) => {}
    }
}

/// The singleton router of the core. Owns every live path; all requests
/// from protocol servers go through it.
///
/// Must be created inside a tokio runtime.
pub struct PathManager {
    req_tx: mpsc::UnboundedSender<ManagerRequest>,
    authorizer: Arc<Authorizer>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PathManager {
    /// Validates the configuration and starts the manager.
    pub fn new(
        conf: ManagerConf,
        paths: PathConfSet,
        executor: Arc<dyn CommandExecutor>,
        source_starter: Option<Arc<dyn StaticSourceStarter>>,
    ) -> Result<Self> {
        conf.check()?;

        let authorizer = Arc::new(Authorizer::new(&conf));
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let actor = ManagerActor {
            conf,
            confs: paths,
            executor,
            source_starter,
            hls: None,
            paths: HashMap::new(),
            events_tx,
            next_instance: 0,
        };

        let task = tokio::spawn(actor.run(req_rx, events_rx, token.clone()));

        Ok(Self {
            req_tx,
            authorizer,
            token,
            task: Mutex::new(Some(task)),
        })
    }

    /// Admits a publisher: resolves the name, brokers auth (with the
    /// anti-brute-force delay applied here, in the caller's task) and
    /// claims the path's publisher slot.
    pub async fn add_publisher(
        &self,
        access: AccessRequest,
        session: SessionRef,
    ) -> Result<PathBinding> {
        let (conf, _) = self.resolve(&access.name).await?;
        self.authorizer
            .authorize_throttled(&conf, &access, Action::Publish)
            .await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.req_tx
            .send(ManagerRequest::RoutePublisher {
                name: access.name,
                query: access.query,
                session,
                reply: reply_tx,
            })
            .map_err(|_| CoreError::Terminated)?;
        reply_rx.await.map_err(|_| CoreError::Terminated)?
    }

    /// Admits a reader. Resolves, brokers auth, then either attaches
    /// immediately (path ready), parks the request behind an on-demand
    /// source start, or fails with
    /// [`CoreError::NoOnePublishing`]. The returned future resolves when
    /// the reader is attached or the admission terminally fails;
    /// dropping it while parked withdraws the reader from the queue.
    pub async fn add_reader(
        &self,
        access: AccessRequest,
        session: SessionRef,
    ) -> Result<ReaderAttachment> {
        let (conf, _) = self.resolve(&access.name).await?;
        self.authorizer
            .authorize_throttled(&conf, &access, Action::Read)
            .await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.req_tx
            .send(ManagerRequest::RouteReader {
                name: access.name,
                query: access.query,
                session,
                reply: reply_tx,
            })
            .map_err(|_| CoreError::Terminated)?;
        reply_rx.await.map_err(|_| CoreError::Terminated)?
    }

    /// Read-only configuration lookup, without auth. Used by collaborators
    /// for early rejection.
    pub async fn get_conf_for_path(&self, name: &str) -> Result<(Arc<PathConf>, PathMatch)> {
        self.resolve(name).await
    }

    /// Configuration lookup plus auth brokering, as used by the HLS
    /// server to decide whether to pre-create a muxer.
    pub async fn find_path_conf(
        &self,
        access: &AccessRequest,
    ) -> Result<(Arc<PathConf>, PathMatch)> {
        let (conf, path_match) = self.resolve(&access.name).await?;
        let action = if access.publish {
            Action::Publish
        } else {
            Action::Read
        };
        self.authorizer
            .authorize_throttled(&conf, access, action)
            .await?;
        Ok((conf, path_match))
    }

    /// Swaps the template set. When this returns, every live path either
    /// runs under a configuration equal to the new set or has been
    /// terminated with [`CoreError::ConfigurationChanged`].
    pub async fn reload_path_confs(&self, confs: PathConfSet) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.req_tx
            .send(ManagerRequest::ReloadConfs {
                confs,
                reply: reply_tx,
            })
            .map_err(|_| CoreError::Terminated)?;
        reply_rx.await.map_err(|_| CoreError::Terminated)
    }

    /// Registers (or clears) the HLS collaborator.
    pub fn set_hls_server(&self, server: Option<Arc<dyn HlsServer>>) {
        let _ = self.req_tx.send(ManagerRequest::SetHlsServer(server));
    }

    /// Snapshot of every live path, sorted by name.
    pub async fn api_paths_list(&self) -> Result<Vec<PathApiInfo>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.req_tx
            .send(ManagerRequest::PathsSnapshot { reply: reply_tx })
            .map_err(|_| CoreError::Terminated)?;
        let paths = reply_rx.await.map_err(|_| CoreError::Terminated)?;

        // Queried outside the manager loop so a busy path can never
        // stall routing.
        let mut out = Vec::with_capacity(paths.len());
        for (_, tx) in paths {
            let (info_tx, info_rx) = oneshot::channel();
            if tx.send(PathRequest::ApiGet(info_tx)).is_ok() {
                if let Ok(info) = info_rx.await {
                    out.push(info);
                }
            }
        }
        Ok(out)
    }

    /// Snapshot of one live path.
    pub async fn api_paths_get(&self, name: &str) -> Result<PathApiInfo> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.req_tx
            .send(ManagerRequest::PathSnapshot {
                name: name.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| CoreError::Terminated)?;
        let tx = reply_rx
            .await
            .map_err(|_| CoreError::Terminated)?
            .ok_or_else(|| CoreError::PathNotFound(name.to_string()))?;

        let (info_tx, info_rx) = oneshot::channel();
        tx.send(PathRequest::ApiGet(info_tx))
            .map_err(|_| CoreError::PathNotFound(name.to_string()))?;
        info_rx
            .await
            .map_err(|_| CoreError::PathNotFound(name.to_string()))
    }

    /// Shuts the manager down: every path is terminated, every attached
    /// session is kicked with [`CoreError::Terminated`], and all tasks
    /// are joined before this returns.
    pub async fn close(&self) {
        self.token.cancel();
        let task = self.task.lock().expect("manager lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn resolve(&self, name: &str) -> Result<(Arc<PathConf>, PathMatch)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.req_tx
            .send(ManagerRequest::Resolve {
                name: name.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| CoreError::Terminated)?;
        reply_rx.await.map_err(|_| CoreError::Terminated)?
    }
}

impl Drop for PathManager {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
