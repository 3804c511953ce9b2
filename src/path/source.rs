//! Static-source collaborator interface.
//!
//! When a path's `source` is an upstream URL, the actual pulling is done
//! by a protocol client outside the core. The path asks a
//! [`StaticSourceStarter`] to start it and keeps the returned
//! [`SourceHandle`]; closing the handle obliges the collaborator to tear
//! the pull down, which in turn makes the source's publisher session
//! withdraw through the normal remove-publisher request.

use tokio_util::sync::CancellationToken;

/// Everything the collaborator needs to start pulling an upstream.
#[derive(Debug, Clone)]
pub struct SourceStartContext {
    /// Resolved, concrete path name the media must be published to.
    pub path_name: String,
    /// Upstream URL or device, from the path configuration.
    pub source_url: String,
    /// Whether the pull was started on demand (and may be stopped when
    /// demand ends) or is the permanent source of a static path.
    pub on_demand: bool,
}

/// Handle of a running static source. Closing it (or dropping it) stops
/// the pull.
#[derive(Debug)]
pub struct SourceHandle {
    token: CancellationToken,
}

impl SourceHandle {
    /// Builds a handle around the cancellation token watched by the
    /// collaborator.
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Stops the source.
    pub fn close(&self) {
        self.token.cancel();
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Starts upstream pulls on behalf of paths.
///
/// Implementations publish the pulled media back through the path
/// manager with an [`AccessRequest`](crate::session::AccessRequest)
/// marked `skip_auth` and tagged with the static-source protocol.
pub trait StaticSourceStarter: Send + Sync + 'static {
    /// Starts pulling. Must not block.
    fn start(&self, ctx: SourceStartContext) -> SourceHandle;
}
