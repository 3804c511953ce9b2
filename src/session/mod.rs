//! Session identity and access-request types.
//!
//! Sessions (publishers and readers) are owned by the protocol servers
//! that accepted them. The core only ever holds a [`SessionRef`]: an
//! identity plus a one-way channel used to deliver a terminal error when
//! the path decides the session must go away. The core never manages a
//! session's lifetime directly.

use std::net::IpAddr;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::CoreError;

/// Unique identity of a publisher or reader session.
pub type SessionId = Uuid;

/// Wire protocol a session was accepted over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Protocol {
    /// RTSP or RTSPS.
    Rtsp,
    /// RTMP or RTMPS.
    Rtmp,
    /// HLS.
    Hls,
    /// WebRTC.
    WebRtc,
    /// SRT.
    Srt,
    /// An internally managed upstream source.
    StaticSource,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Rtsp => write!(f, "rtsp"),
            Protocol::Rtmp => write!(f, "rtmp"),
            Protocol::Hls => write!(f, "hls"),
            Protocol::WebRtc => write!(f, "webrtc"),
            Protocol::Srt => write!(f, "srt"),
            Protocol::StaticSource => write!(f, "staticSource"),
        }
    }
}

/// Identity-only reference to a session, registered with a path.
///
/// Cloneable; clones share the same identity and kick channel. The path
/// holds one of these per participant and uses [`SessionRef::kick`] to
/// deliver the terminal error that tells the owning protocol server to
/// tear the session down.
#[derive(Debug, Clone)]
pub struct SessionRef {
    id: SessionId,
    protocol: Protocol,
    kick_tx: mpsc::UnboundedSender<CoreError>,
}

impl SessionRef {
    /// Creates a session reference plus the receiving end of its kick
    /// channel. The owning protocol server must watch the receiver: the
    /// first error received is terminal and the session must then issue
    /// its paired remove request.
    pub fn new(protocol: Protocol) -> (Self, mpsc::UnboundedReceiver<CoreError>) {
        let (kick_tx, kick_rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                protocol,
                kick_tx,
            },
            kick_rx,
        )
    }

    /// The session's identity.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The session's protocol tag.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Delivers a terminal error to the owning session. Never blocks; if
    /// the session is already gone the error is dropped.
    pub(crate) fn kick(&self, err: CoreError) {
        let _ = self.kick_tx.send(err);
    }
}

/// Callback used to validate credentials through the caller's protocol
/// binding, e.g. an RTSP digest challenge/response. Receives the expected
/// user and password and returns whether the client proved knowledge of
/// them.
pub type CredentialsValidator = Box<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Everything the core needs to know about an incoming publish or read
/// attempt.
pub struct AccessRequest {
    /// Requested path name (concrete, possibly matching a pattern).
    pub name: String,
    /// Raw query string of the request, if any.
    pub query: String,
    /// Source address of the client.
    pub ip: IpAddr,
    /// Supplied user, empty if none.
    pub user: String,
    /// Supplied password, empty if none.
    pub pass: String,
    /// Protocol the request arrived over.
    pub protocol: Protocol,
    /// True for publish, false for read.
    pub publish: bool,
    /// Session UUID, when the protocol server has one.
    pub session_id: Option<SessionId>,
    /// Skip the auth broker entirely. Used by trusted internal sources.
    pub skip_auth: bool,
    /// Protocol-side credential validator, required for digest.
    pub credentials_validator: Option<CredentialsValidator>,
}

impl AccessRequest {
    /// A plain unauthenticated request, mostly useful in tests and for
    /// internal sources.
    pub fn basic(name: &str, ip: IpAddr, protocol: Protocol, publish: bool) -> Self {
        Self {
            name: name.to_string(),
            query: String::new(),
            ip,
            user: String::new(),
            pass: String::new(),
            protocol,
            publish,
            session_id: None,
            skip_auth: false,
            credentials_validator: None,
        }
    }
}

impl std::fmt::Debug for AccessRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessRequest")
            .field("name", &self.name)
            .field("ip", &self.ip)
            .field("user", &self.user)
            .field("protocol", &self.protocol)
            .field("publish", &self.publish)
            .field("skip_auth", &self.skip_auth)
            .finish_non_exhaustive()
    }
}
