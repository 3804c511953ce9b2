//! The path event loop.
//!
//! One task per live path. The loop owns all of the path's mutable
//! state: the publisher slot, the attached readers, the queue of readers
//! parked behind an on-demand source, the hook handles and the two
//! timers (on-demand start timeout, close-after-idle). It suspends only
//! on its mailbox and those timers; everything else is message passing.
//!
//! Publisher slot state machine:
//!
//! ```text
//! NoPublisher ──AddPublisher──▶ PublisherClaimed ──StartPublisher──▶ Ready
//!      ▲                              │                                │
//!      └─────RemovePublisher──────────┴────────RemovePublisher─────────┘
//! ```

use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::conf::{PathConf, PathMatch};
use crate::error::{CoreError, Result};
use crate::externalcmd::{CommandExecutor, CommandHandle, Environment};
use crate::path::hooks;
use crate::path::manager::{PathApiInfo, PathApiSource};
use crate::path::requests::{PathBinding, PathEvent, PathRequest, ReaderAttachment};
use crate::path::source::{SourceHandle, SourceStartContext, StaticSourceStarter};
use crate::session::{SessionId, SessionRef};
use crate::stream::{AsyncWriter, Stream};

/// Everything a path needs at spawn time.
pub(crate) struct PathOpts {
    pub name: String,
    pub conf: Arc<PathConf>,
    pub path_match: PathMatch,
    pub write_queue_size: usize,
    pub executor: Arc<dyn CommandExecutor>,
    pub source_starter: Option<Arc<dyn StaticSourceStarter>>,
    pub events: mpsc::UnboundedSender<PathEvent>,
    pub instance: u64,
    pub is_static: bool,
}

/// Spawns a path actor, returning its mailbox and task handle.
pub(crate) fn spawn(opts: PathOpts) -> (mpsc::UnboundedSender<PathRequest>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let path = Path::new(opts, tx.clone());
    let task = tokio::spawn(path.run(rx));
    (tx, task)
}

struct PublisherSlot {
    session: SessionRef,
    stream: Option<Arc<Stream>>,
}

struct ReaderEntry {
    session: SessionRef,
    query: String,
    writer: Arc<AsyncWriter>,
    on_read_cmd: Option<CommandHandle>,
}

struct ParkedReader {
    session: SessionRef,
    query: String,
    reply: tokio::sync::oneshot::Sender<Result<ReaderAttachment>>,
}

/// State of the on-demand trigger (static source pull or `run_on_demand`
/// command).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnDemandState {
    Idle,
    WaitingReady,
    Ready,
}

enum Flow {
    Continue,
    Exit,
}

struct Path {
    name: String,
    conf: Arc<PathConf>,
    path_match: PathMatch,
    write_queue_size: usize,
    executor: Arc<dyn CommandExecutor>,
    source_starter: Option<Arc<dyn StaticSourceStarter>>,
    events: mpsc::UnboundedSender<PathEvent>,
    instance: u64,
    is_static: bool,
    tx: mpsc::UnboundedSender<PathRequest>,

    publisher: Option<PublisherSlot>,
    readers: Vec<ReaderEntry>,
    parked: Vec<ParkedReader>,

    on_demand: OnDemandState,
    on_demand_cmd: Option<CommandHandle>,
    on_demand_source: Option<SourceHandle>,
    start_deadline: Option<Instant>,
    close_deadline: Option<Instant>,

    static_source: Option<SourceHandle>,
    on_init_cmd: Option<CommandHandle>,
    on_ready_cmd: Option<CommandHandle>,

    ready_since: Option<SystemTime>,
    /// Routed (manager-forwarded) requests handled so far; echoed in
    /// idle reports so the manager can detect requests still in flight.
    processed: u64,
}

/// How often the parked queue is checked for readers that dropped their
/// admission while waiting on an on-demand source.
const PARKED_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

impl Path {
    fn new(opts: PathOpts, tx: mpsc::UnboundedSender<PathRequest>) -> Self {
        Self {
            name: opts.name,
            conf: opts.conf,
            path_match: opts.path_match,
            write_queue_size: opts.write_queue_size,
            executor: opts.executor,
            source_starter: opts.source_starter,
            events: opts.events,
            instance: opts.instance,
            is_static: opts.is_static,
            tx,
            publisher: None,
            readers: Vec::new(),
            parked: Vec::new(),
            on_demand: OnDemandState::Idle,
            on_demand_cmd: None,
            on_demand_source: None,
            start_deadline: None,
            close_deadline: None,
            static_source: None,
            on_init_cmd: None,
            on_ready_cmd: None,
            ready_since: None,
            processed: 0,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PathRequest>) {
        tracing::debug!(path = %self.name, conf = %self.conf.name, "path created");

        if !self.conf.run_on_init.is_empty() {
            self.on_init_cmd = Some(self.executor.spawn(
                &self.conf.run_on_init,
                self.base_env(),
                self.conf.run_on_init_restart,
            ));
        }

        // The permanent source of a static path starts right away.
        if self.conf.has_static_source() && !self.conf.source_on_demand {
            self.static_source = self.start_source(false);
        }

        loop {
            let start_deadline = self.start_deadline;
            let close_deadline = self.close_deadline;
            let parked_tick = (!self.parked.is_empty())
                .then(|| Instant::now() + PARKED_POLL_INTERVAL);

            tokio::select! {
                req = rx.recv() => match req {
                    Some(req) => {
                        if let Flow::Exit = self.handle_request(req).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = maybe_sleep(start_deadline) => self.handle_start_timeout(),
                _ = maybe_sleep(close_deadline) => self.handle_close_deadline().await,
                _ = maybe_sleep(parked_tick) => self.prune_parked(),
            }

            self.maybe_report_idle();
        }

        tracing::debug!(path = %self.name, "path destroyed");

        // Late requests from stale handles get a terminal reply.
        rx.close();
        while let Some(req) = rx.recv().await {
            reply_terminated(req);
        }
    }

    async fn handle_request(&mut self, req: PathRequest) -> Flow {
        match req {
            PathRequest::AddPublisher {
                session,
                query,
                reply,
            } => {
                self.processed += 1;
                let _ = reply.send(self.add_publisher(session, query).await);
                Flow::Continue
            }

            PathRequest::StartPublisher {
                session,
                desc,
                generate_rtp,
                reply,
            } => {
                let _ = reply.send(self.start_publisher(session, desc, generate_rtp));
                Flow::Continue
            }

            PathRequest::RemovePublisher { session, reply } => {
                self.remove_publisher(session).await;
                let _ = reply.send(());
                Flow::Continue
            }

            PathRequest::AddReader {
                session,
                query,
                reply,
            } => {
                self.processed += 1;
                self.add_reader(session, query, reply);
                Flow::Continue
            }

            PathRequest::RemoveReader { session, reply } => {
                self.remove_reader(session).await;
                let _ = reply.send(());
                Flow::Continue
            }

            PathRequest::ReloadConf(new_conf) => {
                tracing::debug!(path = %self.name, "configuration updated in place");
                self.conf = new_conf;
                Flow::Continue
            }

            PathRequest::ApiGet(reply) => {
                let _ = reply.send(self.api_info());
                Flow::Continue
            }

            PathRequest::Terminate(err) => {
                self.terminate(err).await;
                Flow::Exit
            }

            PathRequest::ConfirmClose => {
                self.terminate(CoreError::Terminated).await;
                Flow::Exit
            }
        }
    }

    async fn add_publisher(&mut self, session: SessionRef, _query: String) -> Result<PathBinding> {
        // The publisher slot of a path with a static source belongs to
        // the source itself.
        if self.conf.has_static_source() && session.protocol() != crate::session::Protocol::StaticSource
        {
            return Err(CoreError::AlreadyPublishing(self.name.clone()));
        }

        if let Some(slot) = self.publisher.take() {
            if !self.conf.override_publisher {
                self.publisher = Some(slot);
                return Err(CoreError::AlreadyPublishing(self.name.clone()));
            }

            tracing::info!(
                path = %self.name,
                old = %slot.session.id(),
                new = %session.id(),
                "publisher overridden"
            );
            if slot.stream.is_some() {
                self.set_not_ready(CoreError::SourceClosed).await;
            }
            slot.session.kick(CoreError::ReplacedByNewPublisher);
        }

        tracing::info!(
            path = %self.name,
            session = %session.id(),
            protocol = %session.protocol(),
            "publisher claimed slot"
        );
        // A new publisher cancels any scheduled destruction.
        self.close_deadline = None;
        self.publisher = Some(PublisherSlot {
            session,
            stream: None,
        });

        Ok(self.binding())
    }

    fn start_publisher(
        &mut self,
        session: SessionId,
        desc: crate::media::MediaDescription,
        generate_rtp: bool,
    ) -> Result<Arc<Stream>> {
        let Some(slot) = self
            .publisher
            .as_mut()
            .filter(|s| s.session.id() == session)
        else {
            return Err(CoreError::Terminated);
        };

        if slot.stream.is_some() {
            return Err(CoreError::AlreadyPublishing(self.name.clone()));
        }

        let stream = Arc::new(Stream::new(desc, generate_rtp));
        slot.stream = Some(stream.clone());
        self.ready_since = Some(SystemTime::now());
        self.close_deadline = None;

        tracing::info!(
            path = %self.name,
            session = %session,
            tracks = ?stream.description().format_names(),
            "publisher started, path is ready"
        );

        if self.on_demand == OnDemandState::WaitingReady {
            self.on_demand = OnDemandState::Ready;
            self.start_deadline = None;
        }

        if !self.conf.run_on_ready.is_empty() {
            self.on_ready_cmd = Some(self.executor.spawn(
                &self.conf.run_on_ready,
                self.base_env(),
                self.conf.run_on_ready_restart,
            ));
        }
        let _ = self.events.send(PathEvent::Ready {
            name: self.name.clone(),
            stream: stream.clone(),
        });

        // Everyone parked behind the on-demand start attaches now.
        let max = self.conf.max_readers;
        for parked in std::mem::take(&mut self.parked) {
            if parked.reply.is_closed() {
                continue;
            }
            if max > 0 && self.readers.len() >= max {
                let _ = parked
                    .reply
                    .send(Err(CoreError::TooManyReaders(self.name.clone())));
                continue;
            }
            let reader_id = parked.session.id();
            let attachment = self.attach_reader(parked.session, parked.query, stream.clone());
            if parked.reply.send(Ok(attachment)).is_err() {
                // The session vanished between the check and the reply;
                // undo the attachment through the normal request.
                let (tx, _rx) = tokio::sync::oneshot::channel();
                let _ = self.tx.send(PathRequest::RemoveReader {
                    session: reader_id,
                    reply: tx,
                });
            }
        }

        Ok(stream)
    }

    async fn remove_publisher(&mut self, session: SessionId) {
        let matches = self
            .publisher
            .as_ref()
            .is_some_and(|s| s.session.id() == session);
        if !matches {
            return;
        }

        let slot = self.publisher.take().expect("checked above");
        tracing::info!(path = %self.name, session = %session, "publisher removed");

        if slot.stream.is_some() {
            self.set_not_ready(CoreError::SourceClosed).await;
        }

        if self.on_demand != OnDemandState::Idle {
            if self.parked.is_empty() {
                // No demand left; give the trigger the close-after window
                // in case new readers show up, then stop it.
                self.on_demand = OnDemandState::WaitingReady;
                self.start_deadline = None;
                self.close_deadline = Some(Instant::now() + self.conf.on_demand_close_after());
            } else {
                // Parked readers are still waiting; the trigger may
                // republish (e.g. a restarting command) until the start
                // timeout fires.
                self.on_demand = OnDemandState::WaitingReady;
                if self.start_deadline.is_none() {
                    self.start_deadline =
                        Some(Instant::now() + self.conf.on_demand_start_timeout());
                }
            }
        }
    }

    fn add_reader(
        &mut self,
        session: SessionRef,
        query: String,
        reply: tokio::sync::oneshot::Sender<Result<ReaderAttachment>>,
    ) {
        let max = self.conf.max_readers;
        if max > 0 && self.readers.len() + self.parked.len() >= max {
            let _ = reply.send(Err(CoreError::TooManyReaders(self.name.clone())));
            return;
        }

        if let Some(stream) = self.publisher.as_ref().and_then(|s| s.stream.clone()) {
            // A new reader cancels any scheduled close.
            self.close_deadline = None;
            let attachment = self.attach_reader(session, query, stream);
            let _ = reply.send(Ok(attachment));
            return;
        }

        if !self.conf.has_on_demand() {
            let _ = reply.send(Err(CoreError::NoOnePublishing(self.name.clone())));
            return;
        }

        self.close_deadline = None;
        if self.on_demand == OnDemandState::Idle {
            self.start_on_demand(&query);
        }
        if self.start_deadline.is_none() {
            self.start_deadline = Some(Instant::now() + self.conf.on_demand_start_timeout());
        }

        tracing::debug!(
            path = %self.name,
            session = %session.id(),
            "reader parked, waiting for on-demand source"
        );
        self.parked.push(ParkedReader {
            session,
            query,
            reply,
        });
    }

    async fn remove_reader(&mut self, session: SessionId) {
        if let Some(pos) = self.readers.iter().position(|r| r.session.id() == session) {
            let entry = self.readers.remove(pos);
            self.detach_reader(entry).await;
        } else if let Some(pos) = self.parked.iter().position(|p| p.session.id() == session) {
            // Dropped from the queue; its pending admission resolves now.
            let parked = self.parked.remove(pos);
            let _ = parked.reply.send(Err(CoreError::Terminated));
        } else {
            return;
        }

        self.after_reader_departure();
    }

    /// Readers dropped their parked admission: withdraw them from the
    /// queue.
    fn prune_parked(&mut self) {
        let before = self.parked.len();
        self.parked.retain(|p| !p.reply.is_closed());
        if self.parked.len() == before {
            return;
        }

        tracing::debug!(
            path = %self.name,
            dropped = before - self.parked.len(),
            "parked readers disconnected"
        );
        self.after_reader_departure();
    }

    fn after_reader_departure(&mut self) {
        if !self.readers.is_empty() || !self.parked.is_empty() {
            return;
        }

        match self.on_demand {
            // The queue emptied before the source came up: cancel it
            // right away, then let close-after-idle decide destruction.
            OnDemandState::WaitingReady => {
                self.stop_on_demand();
                self.close_deadline = Some(Instant::now() + self.conf.on_demand_close_after());
            }
            // The source is up but nobody watches: keep it for the
            // close-after window.
            OnDemandState::Ready => {
                self.close_deadline = Some(Instant::now() + self.conf.on_demand_close_after());
            }
            OnDemandState::Idle => {}
        }
    }

    fn attach_reader(
        &mut self,
        session: SessionRef,
        query: String,
        stream: Arc<Stream>,
    ) -> ReaderAttachment {
        let writer = Arc::new(AsyncWriter::new(self.write_queue_size));
        writer.start();

        let on_read_cmd = if !self.conf.run_on_read.is_empty() {
            let env = hooks::reader_env(&self.base_env(), &session, &query);
            Some(
                self.executor
                    .spawn(&self.conf.run_on_read, env, self.conf.run_on_read_restart),
            )
        } else {
            None
        };

        tracing::info!(
            path = %self.name,
            session = %session.id(),
            protocol = %session.protocol(),
            "reader attached"
        );

        self.readers.push(ReaderEntry {
            session,
            query,
            writer: writer.clone(),
            on_read_cmd,
        });

        ReaderAttachment {
            path: self.binding(),
            stream,
            writer,
        }
    }

    async fn detach_reader(&mut self, entry: ReaderEntry) {
        tracing::info!(
            path = %self.name,
            session = %entry.session.id(),
            "reader detached"
        );

        if let Some(stream) = self.publisher.as_ref().and_then(|s| s.stream.as_ref()) {
            stream.remove_reader(entry.session.id());
        }
        drop(entry.on_read_cmd);
        if !self.conf.run_on_unread.is_empty() {
            let env = hooks::reader_env(&self.base_env(), &entry.session, &entry.query);
            // One-shot; the handle is dropped on purpose, the command
            // runs to completion on its own.
            drop(self.executor.spawn(&self.conf.run_on_unread, env, false));
        }
        entry.writer.stop().await;
    }

    /// Tears the ready state down: detaches every reader with `err`,
    /// closes the ready bracket and drops the stream. The publisher slot
    /// itself is the caller's business.
    async fn set_not_ready(&mut self, err: CoreError) {
        for entry in std::mem::take(&mut self.readers) {
            entry.session.kick(err.clone());
            self.detach_reader(entry).await;
        }

        if self.ready_since.take().is_some() {
            self.on_ready_cmd = None;
            if !self.conf.run_on_not_ready.is_empty() {
                drop(
                    self.executor
                        .spawn(&self.conf.run_on_not_ready, self.base_env(), false),
                );
            }
            let _ = self.events.send(PathEvent::NotReady {
                name: self.name.clone(),
            });
            tracing::info!(path = %self.name, "path is not ready anymore");
        }

        if let Some(slot) = self.publisher.as_mut() {
            slot.stream = None;
        }
    }

    fn start_on_demand(&mut self, query: &str) {
        self.on_demand = OnDemandState::WaitingReady;

        if self.conf.has_static_source() {
            tracing::info!(path = %self.name, "starting on-demand source");
            self.on_demand_source = self.start_source(true);
        } else {
            tracing::info!(path = %self.name, cmd = %self.conf.run_on_demand, "starting on-demand command");
            let env = hooks::demand_env(&self.base_env(), query);
            self.on_demand_cmd = Some(self.executor.spawn(
                &self.conf.run_on_demand,
                env,
                self.conf.run_on_demand_restart,
            ));
        }
    }

    /// Stops the on-demand trigger and fires `run_on_un_demand`.
    fn stop_on_demand(&mut self) {
        if self.on_demand == OnDemandState::Idle {
            return;
        }
        tracing::info!(path = %self.name, "on-demand source no longer needed");

        self.on_demand = OnDemandState::Idle;
        self.start_deadline = None;
        self.on_demand_cmd = None;
        self.on_demand_source = None;

        if !self.conf.run_on_un_demand.is_empty() {
            drop(
                self.executor
                    .spawn(&self.conf.run_on_un_demand, self.base_env(), false),
            );
        }
    }

    fn start_source(&self, on_demand: bool) -> Option<SourceHandle> {
        let crate::conf::Source::Upstream(url) = &self.conf.source else {
            return None;
        };
        let Some(starter) = &self.source_starter else {
            tracing::error!(
                path = %self.name,
                "path has a static source but no source starter is configured"
            );
            return None;
        };
        Some(starter.start(SourceStartContext {
            path_name: self.name.clone(),
            source_url: url.clone(),
            on_demand,
        }))
    }

    fn handle_start_timeout(&mut self) {
        self.start_deadline = None;
        if self.on_demand != OnDemandState::WaitingReady {
            return;
        }

        tracing::warn!(path = %self.name, "on-demand source did not become ready in time");

        for parked in std::mem::take(&mut self.parked) {
            let _ = parked
                .reply
                .send(Err(CoreError::StartTimeout(self.name.clone())));
        }
        self.stop_on_demand();
        self.close_deadline = Some(Instant::now() + self.conf.on_demand_close_after());
    }

    async fn handle_close_deadline(&mut self) {
        self.close_deadline = None;
        if !self.readers.is_empty() || !self.parked.is_empty() {
            return;
        }

        if self.on_demand != OnDemandState::Idle {
            let was_ready = self.on_demand == OnDemandState::Ready;
            self.stop_on_demand();

            if was_ready {
                // The on-demand publisher is still up; closing its
                // trigger makes it withdraw eventually, but readers are
                // gone, so tear the slot down deterministically.
                if let Some(slot) = self.publisher.take() {
                    if slot.stream.is_some() {
                        self.set_not_ready(CoreError::Terminated).await;
                    }
                    slot.session.kick(CoreError::Terminated);
                }
            }
        }
    }

    /// Asks the manager for destruction when nothing keeps the path
    /// alive. The manager only confirms when no routed request is in
    /// flight, so this is safe to call eagerly after every event.
    fn maybe_report_idle(&mut self) {
        if self.is_static
            || self.publisher.is_some()
            || !self.readers.is_empty()
            || !self.parked.is_empty()
            || self.on_demand != OnDemandState::Idle
            || self.start_deadline.is_some()
            || self.close_deadline.is_some()
        {
            return;
        }

        let _ = self.events.send(PathEvent::Idle {
            name: self.name.clone(),
            instance: self.instance,
            processed: self.processed,
        });
    }

    async fn terminate(&mut self, err: CoreError) {
        self.set_not_ready(err.clone()).await;

        if let Some(slot) = self.publisher.take() {
            slot.session.kick(err.clone());
        }
        for parked in std::mem::take(&mut self.parked) {
            let _ = parked.reply.send(Err(err.clone()));
        }

        self.stop_on_demand();
        self.static_source = None;
        self.on_init_cmd = None;
        self.start_deadline = None;
        self.close_deadline = None;
    }

    fn binding(&self) -> PathBinding {
        PathBinding::new(self.name.clone(), self.conf.clone(), self.tx.clone())
    }

    fn base_env(&self) -> Environment {
        hooks::path_env(&self.name, &self.conf, &self.path_match)
    }

    fn api_info(&self) -> PathApiInfo {
        let stream = self.publisher.as_ref().and_then(|s| s.stream.as_ref());

        PathApiInfo {
            name: self.name.clone(),
            conf_name: self.conf.name.clone(),
            source: self.publisher.as_ref().map(|s| PathApiSource {
                kind: s.session.protocol().to_string(),
                id: s.session.id(),
            }),
            ready: stream.is_some(),
            ready_time: self.ready_since,
            tracks: stream.map(|s| s.description().format_names()).unwrap_or_default(),
            bytes_received: stream.map(|s| s.bytes_received()).unwrap_or(0),
            readers: self
                .readers
                .iter()
                .map(|r| PathApiSource {
                    kind: r.session.protocol().to_string(),
                    id: r.session.id(),
                })
                .collect(),
        }
    }
}

fn reply_terminated(req: PathRequest) {
    match req {
        PathRequest::AddPublisher { reply, .. } => {
            let _ = reply.send(Err(CoreError::Terminated));
        }
        PathRequest::StartPublisher { reply, .. } => {
            let _ = reply.send(Err(CoreError::Terminated));
        }
        PathRequest::AddReader { reply, .. } => {
            let _ = reply.send(Err(CoreError::Terminated));
        }
        PathRequest::RemovePublisher { reply, .. } | PathRequest::RemoveReader { reply, .. } => {
            let _ = reply.send(());
        }
        PathRequest::ApiGet(_)
        | PathRequest::ReloadConf(_)
        | PathRequest::Terminate(_)
        | PathRequest::ConfirmClose => {}
    }
}
