//! Request and reply types of the path control plane.
//!
//! Every operation is a message carrying a oneshot reply channel; an
//! actor that goes away drops the channel and the sender observes
//! [`CoreError::Terminated`]. Requests are therefore never silently
//! lost.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::conf::PathConf;
use crate::error::{CoreError, Result};
use crate::media::MediaDescription;
use crate::path::manager::PathApiInfo;
use crate::session::{SessionId, SessionRef};
use crate::stream::{AsyncWriter, Stream};

/// Messages processed by a path's event loop.
pub(crate) enum PathRequest {
    AddPublisher {
        session: SessionRef,
        query: String,
        reply: oneshot::Sender<Result<PathBinding>>,
    },
    StartPublisher {
        session: SessionId,
        desc: MediaDescription,
        generate_rtp: bool,
        reply: oneshot::Sender<Result<Arc<Stream>>>,
    },
    RemovePublisher {
        session: SessionId,
        reply: oneshot::Sender<()>,
    },
    AddReader {
        session: SessionRef,
        query: String,
        reply: oneshot::Sender<Result<ReaderAttachment>>,
    },
    RemoveReader {
        session: SessionId,
        reply: oneshot::Sender<()>,
    },
    /// In-place configuration update (compatible changes only).
    ReloadConf(Arc<PathConf>),
    /// Snapshot for the API.
    ApiGet(oneshot::Sender<PathApiInfo>),
    /// Manager-initiated teardown; every session is kicked with the
    /// given error.
    Terminate(CoreError),
    /// Manager confirmation of an idle-close request; the path exits.
    ConfirmClose,
}

/// Events a path reports to its manager.
pub(crate) enum PathEvent {
    /// A stream exists; forwarded to the HLS server.
    Ready {
        name: String,
        stream: Arc<Stream>,
    },
    /// The stream is gone.
    NotReady {
        name: String,
    },
    /// The path has nothing to live for. `processed` is the number of
    /// routed requests the path has handled; the manager confirms the
    /// close only when it matches its own forward count, so a request
    /// still in flight cancels the destruction.
    Idle {
        name: String,
        instance: u64,
        processed: u64,
    },
}

/// A session's handle to a live path, returned by the manager on
/// admission. Cloneable; all direct path operations go through it.
#[derive(Clone)]
pub struct PathBinding {
    name: String,
    conf: Arc<PathConf>,
    pub(crate) tx: mpsc::UnboundedSender<PathRequest>,
}

impl PathBinding {
    pub(crate) fn new(
        name: String,
        conf: Arc<PathConf>,
        tx: mpsc::UnboundedSender<PathRequest>,
    ) -> Self {
        Self { name, conf, tx }
    }

    /// Resolved, concrete name of the path.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration snapshot taken at admission.
    pub fn conf(&self) -> &Arc<PathConf> {
        &self.conf
    }

    /// Declares the publisher's media description and creates the
    /// stream. The path transitions to ready and parked readers are
    /// attached. `generate_rtp` is recorded on the stream for
    /// collaborators that feed raw units.
    pub async fn start_publisher(
        &self,
        session: &SessionRef,
        desc: MediaDescription,
        generate_rtp: bool,
    ) -> Result<Arc<Stream>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PathRequest::StartPublisher {
                session: session.id(),
                desc,
                generate_rtp,
                reply: reply_tx,
            })
            .map_err(|_| CoreError::Terminated)?;
        reply_rx.await.map_err(|_| CoreError::Terminated)?
    }

    /// Withdraws the publisher. Idempotent; succeeds even if the path is
    /// already gone.
    pub async fn remove_publisher(&self, session: &SessionRef) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(PathRequest::RemovePublisher {
                session: session.id(),
                reply: reply_tx,
            })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    /// Detaches a reader. Idempotent; succeeds even if the path is
    /// already gone.
    pub async fn remove_reader(&self, session: &SessionRef) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(PathRequest::RemoveReader {
                session: session.id(),
                reply: reply_tx,
            })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

impl std::fmt::Debug for PathBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathBinding")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// What a reader receives on admission: its path handle, the live
/// stream, and the started write queue isolating it from the publisher.
pub struct ReaderAttachment {
    /// Handle to the path, for the paired remove request.
    pub path: PathBinding,
    /// The live stream to subscribe on.
    pub stream: Arc<Stream>,
    /// The reader's write queue. Already started; the owning session
    /// must watch [`AsyncWriter::error`] and tear down on overflow.
    pub writer: Arc<AsyncWriter>,
}

impl std::fmt::Debug for ReaderAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderAttachment")
            .field("path", &self.path.name)
            .finish_non_exhaustive()
    }
}
