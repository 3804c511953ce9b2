//! Protocol-agnostic core of a live media server.
//!
//! The crate accepts publishers and readers from any wire-protocol
//! server and connects them through named broadcast resources called
//! *paths*: one publisher, many readers, zero-copy packet fan-out, no
//! persistence.
//!
//! # Architecture
//!
//! ```text
//!   protocol servers (RTSP/RTMP/HLS/WebRTC/SRT — not in this crate)
//!        │ AccessRequest
//!        ▼
//!   PathManager ── resolves names against PathConfSet, brokers auth,
//!        │          owns the set of live paths, handles hot reloads
//!        ▼
//!   Path ────────── one actor per live path: publisher slot, reader
//!        │          registry, on-demand sources, lifecycle hooks
//!        ▼
//!   Stream ──────── the packet bus: write once, fan out to every
//!        │          reader through its own bounded AsyncWriter
//!        ▼
//!   readers
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mediahub_rs::conf::{ManagerConf, PathConf, PathConfSet};
//! use mediahub_rs::externalcmd::ProcessExecutor;
//! use mediahub_rs::path::PathManager;
//! use mediahub_rs::session::{AccessRequest, Protocol, SessionRef};
//!
//! # async fn run() -> Result<(), mediahub_rs::error::CoreError> {
//! let paths = PathConfSet::new(vec![("all_others".to_string(), PathConf::default())])?;
//! let manager = PathManager::new(
//!     ManagerConf::default(),
//!     paths,
//!     Arc::new(ProcessExecutor),
//!     None,
//! )?;
//!
//! let (session, _kick) = SessionRef::new(Protocol::Rtmp);
//! let access = AccessRequest::basic("live/cam1", "127.0.0.1".parse().unwrap(), Protocol::Rtmp, true);
//! let path = manager.add_publisher(access, session).await?;
//! # let _ = path;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod conf;
pub mod error;
pub mod externalcmd;
pub mod media;
pub mod path;
pub mod session;
pub mod stream;

pub use conf::{ManagerConf, PathConf, PathConfSet};
pub use error::{CoreError, Result};
pub use media::{Format, Media, MediaDescription, MediaKind, RtpPacket, Unit};
pub use path::{
    HlsServer, PathApiInfo, PathBinding, PathManager, ReaderAttachment, SourceHandle,
    SourceStartContext, StaticSourceStarter,
};
pub use session::{AccessRequest, Protocol, SessionId, SessionRef};
pub use stream::{AsyncWriter, Stream};
