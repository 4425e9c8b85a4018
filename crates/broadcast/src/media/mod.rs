//! Media transport seam
//!
//! The orchestration core never touches codecs or packets. It asks a
//! `MediaTransport` for one `TransportLink` per call, moves opaque offer and
//! answer payloads through signaling, and watches the link's `LinkState`.

pub mod loopback;
#[cfg(feature = "webrtc")]
pub mod rtc;

pub use loopback::LoopbackTransport;
#[cfg(feature = "webrtc")]
pub use rtc::{WebRtcSourceTrack, WebRtcTransport};

use crate::call::CallId;
use crate::identity::PeerRole;
use crate::Result;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// One outgoing track of a local source
///
/// Transports downcast through `as_any` to the track type they understand.
pub trait SourceTrack: Send + Sync + fmt::Debug {
    /// Track id
    fn id(&self) -> &str;
    /// Media kind
    fn kind(&self) -> MediaKind;
    /// Downcast hook
    fn as_any(&self) -> &dyn Any;
}

/// Transport-agnostic track description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescriptor {
    id: String,
    kind: MediaKind,
}

impl TrackDescriptor {
    /// Describe a track
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

impl SourceTrack for TrackDescriptor {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Shared, read-only handle to the broadcaster's local media
///
/// Cloning is cheap; every viewer call attaches the same tracks.
#[derive(Clone)]
pub struct MediaSource {
    inner: Arc<SourceInner>,
}

struct SourceInner {
    id: String,
    tracks: Vec<Arc<dyn SourceTrack>>,
}

impl MediaSource {
    /// Create a source from its tracks
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<dyn SourceTrack>>) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                id: id.into(),
                tracks,
            }),
        }
    }

    /// Source with one audio and one video track description
    pub fn audio_video(id: impl Into<String>) -> Self {
        let id = id.into();
        let tracks: Vec<Arc<dyn SourceTrack>> = vec![
            Arc::new(TrackDescriptor::new(format!("{}-audio", id), MediaKind::Audio)),
            Arc::new(TrackDescriptor::new(format!("{}-video", id), MediaKind::Video)),
        ];
        Self::new(id, tracks)
    }

    /// Source id
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Tracks in attach order
    pub fn tracks(&self) -> &[Arc<dyn SourceTrack>] {
        &self.inner.tracks
    }

    /// Number of live handles to this source (sessions plus attached links)
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSource")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks.len())
            .finish()
    }
}

/// One track received from the remote side
#[derive(Clone)]
pub struct RemoteTrack {
    /// Track id as reported by the transport
    pub id: String,
    /// Media kind
    pub kind: MediaKind,
    /// Transport-specific track handle (e.g. `webrtc` `TrackRemote`)
    pub handle: Option<Arc<dyn Any + Send + Sync>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Media received on a connected call
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    /// Stream id (the remote source id when known)
    pub id: String,
    /// Received tracks
    pub tracks: Vec<RemoteTrack>,
}

/// State of one transport link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Created, nothing exchanged
    New,
    /// Offer/answer in progress or connectivity checks running
    Connecting,
    /// Media path established
    Live,
    /// Media path failed or dropped
    Lost,
    /// Closed locally
    Closed,
}

/// Parameters for one link
#[derive(Debug, Clone)]
pub struct LinkSpec {
    /// Call this link serves
    pub call_id: CallId,
    /// Local role
    pub local_role: PeerRole,
    /// Remote relay id
    pub remote: String,
    /// Local media to send, if any
    pub source: Option<MediaSource>,
}

/// Media path of a single call
#[async_trait]
pub trait TransportLink: Send + Sync {
    /// Produce an offer payload (caller side)
    async fn create_offer(&self) -> Result<String>;

    /// Apply a remote offer and produce the answer payload (callee side)
    ///
    /// Malformed offers yield `Error::ProtocolViolation`.
    async fn accept_offer(&self, offer: &str) -> Result<String>;

    /// Apply the remote answer (caller side)
    async fn apply_answer(&self, answer: &str) -> Result<()>;

    /// Watch link state
    fn state(&self) -> watch::Receiver<LinkState>;

    /// Media received from the remote side, once live
    fn remote_stream(&self) -> Option<RemoteStream>;

    /// Release the link. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Factory for transport links
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Create the link for one call
    async fn create_link(&self, spec: LinkSpec) -> Result<Arc<dyn TransportLink>>;
}
