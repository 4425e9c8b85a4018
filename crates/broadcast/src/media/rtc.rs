//! WebRTC media transport built on the `webrtc` crate
//!
//! One `RTCPeerConnection` per call. ICE gathering completes before an offer
//! or answer is handed to signaling, so no trickle candidates travel through
//! the relay. The broadcaster's tracks are shared `TrackLocalStaticSample`s:
//! every viewer connection adds the same track objects, and samples written
//! once reach every connected viewer.

use super::{
    LinkSpec, LinkState, MediaKind, MediaTransport, RemoteStream, RemoteTrack, SourceTrack,
    TransportLink,
};
use crate::config::BroadcastConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Outgoing track backed by a `TrackLocalStaticSample`
#[derive(Clone)]
pub struct WebRtcSourceTrack {
    id: String,
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
}

impl std::fmt::Debug for WebRtcSourceTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcSourceTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl WebRtcSourceTrack {
    /// Opus audio track (48 kHz, mono)
    pub fn opus(id: &str, stream_id: &str) -> Self {
        Self::with_codec(
            id,
            stream_id,
            MediaKind::Audio,
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 1,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        )
    }

    /// VP8 video track (90 kHz clock)
    pub fn vp8(id: &str, stream_id: &str) -> Self {
        Self::with_codec(
            id,
            stream_id,
            MediaKind::Video,
            RTCRtpCodecCapability {
                mime_type: "video/vp8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        )
    }

    /// Track with an explicit codec capability
    pub fn with_codec(
        id: &str,
        stream_id: &str,
        kind: MediaKind,
        codec: RTCRtpCodecCapability,
    ) -> Self {
        Self {
            id: id.to_string(),
            kind,
            track: Arc::new(TrackLocalStaticSample::new(
                codec,
                id.to_string(),
                stream_id.to_string(),
            )),
        }
    }

    /// Underlying track; write samples here
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }
}

impl SourceTrack for WebRtcSourceTrack {
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

/// Media transport producing one WebRTC peer connection per call
pub struct WebRtcTransport {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransport {
    /// Build the WebRTC API with default codecs and interceptors
    pub fn new(config: &BroadcastConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::MediaTransport(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::MediaTransport(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect();

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn create_link(&self, spec: LinkSpec) -> Result<Arc<dyn TransportLink>> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection = Arc::new(self.api.new_peer_connection(rtc_config).await.map_err(
            |e| Error::MediaTransport(format!("Failed to create peer connection: {}", e)),
        )?);

        let (state_tx, _) = watch::channel(LinkState::New);
        let state_tx = Arc::new(state_tx);
        let remote = Arc::new(Mutex::new(RemoteStream {
            id: spec.remote.clone(),
            tracks: Vec::new(),
        }));

        let state_clone = Arc::clone(&state_tx);
        let call_id = spec.call_id.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let state = Arc::clone(&state_clone);
                let call_id = call_id.clone();

                Box::pin(async move {
                    let next = match s {
                        RTCPeerConnectionState::New => LinkState::New,
                        RTCPeerConnectionState::Connecting => LinkState::Connecting,
                        RTCPeerConnectionState::Connected => LinkState::Live,
                        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                            LinkState::Lost
                        }
                        RTCPeerConnectionState::Closed => LinkState::Closed,
                        _ => return,
                    };
                    debug!("Call {} peer connection: {:?}", call_id, s);
                    state.send_if_modified(|current| {
                        if *current == next || *current == LinkState::Closed {
                            false
                        } else {
                            *current = next;
                            true
                        }
                    });
                })
            },
        ));

        let remote_clone = Arc::clone(&remote);
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let remote = Arc::clone(&remote_clone);
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => MediaKind::Video,
                };
                info!("Received remote {} track (ssrc {})", track.kind(), track.ssrc());
                remote.lock().tracks.push(RemoteTrack {
                    id: format!("{:?}-{}", kind, track.ssrc()).to_lowercase(),
                    kind,
                    handle: Some(track),
                });
            })
        }));

        match &spec.source {
            Some(source) => {
                for source_track in source.tracks() {
                    let Some(track) = source_track.as_any().downcast_ref::<WebRtcSourceTrack>()
                    else {
                        warn!(
                            "Skipping track {}: not a WebRTC sample track",
                            source_track.id()
                        );
                        continue;
                    };

                    let sender = peer_connection
                        .add_track(track.sample_track() as Arc<dyn TrackLocal + Send + Sync>)
                        .await
                        .map_err(|e| Error::MediaTransport(format!("Failed to add track: {}", e)))?;

                    // RTCP must be drained for interceptors to work.
                    tokio::spawn(async move {
                        let mut rtcp_buf = vec![0u8; 1500];
                        while sender.read(&mut rtcp_buf).await.is_ok() {}
                    });
                }
            }
            None => {
                for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                    peer_connection
                        .add_transceiver_from_kind(
                            kind,
                            Some(RTCRtpTransceiverInit {
                                direction: RTCRtpTransceiverDirection::Recvonly,
                                send_encodings: vec![],
                            }),
                        )
                        .await
                        .map_err(|e| {
                            Error::MediaTransport(format!("Failed to add transceiver: {}", e))
                        })?;
                }
            }
        }

        Ok(Arc::new(WebRtcLink {
            peer_connection,
            state: state_tx,
            remote,
            closed: AtomicBool::new(false),
        }))
    }
}

struct WebRtcLink {
    peer_connection: Arc<RTCPeerConnection>,
    state: Arc<watch::Sender<LinkState>>,
    remote: Arc<Mutex<RemoteStream>>,
    closed: AtomicBool,
}

impl WebRtcLink {
    /// Set the local description and wait for ICE gathering to finish
    async fn set_local_and_gather(&self, description: RTCSessionDescription) -> Result<String> {
        let mut gather_complete = self.peer_connection.gathering_complete_promise().await;

        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(|e| Error::MediaTransport(format!("Failed to set local description: {}", e)))?;

        let _ = gather_complete.recv().await;

        self.peer_connection
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| Error::MediaTransport("No local description".to_string()))
    }
}

#[async_trait]
impl TransportLink for WebRtcLink {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::MediaTransport(format!("Failed to create offer: {}", e)))?;
        self.set_local_and_gather(offer).await
    }

    async fn accept_offer(&self, offer: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(offer.to_string())
            .map_err(|e| Error::ProtocolViolation(format!("Invalid SDP offer: {}", e)))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::ProtocolViolation(format!("Failed to apply offer: {}", e)))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::MediaTransport(format!("Failed to create answer: {}", e)))?;
        self.set_local_and_gather(answer).await
    }

    async fn apply_answer(&self, answer: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(answer.to_string())
            .map_err(|e| Error::ProtocolViolation(format!("Invalid SDP answer: {}", e)))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::ProtocolViolation(format!("Failed to apply answer: {}", e)))
    }

    fn state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn remote_stream(&self) -> Option<RemoteStream> {
        if *self.state.borrow() == LinkState::Live {
            Some(self.remote.lock().clone())
        } else {
            None
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.send_replace(LinkState::Closed);
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::MediaTransport(format!("Failed to close peer connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::CallId;
    use crate::identity::PeerRole;
    use crate::media::MediaSource;

    fn offline_config() -> BroadcastConfig {
        BroadcastConfig {
            stun_servers: Vec::new(),
            ..Default::default()
        }
    }

    #[test]
    fn test_source_track_metadata() {
        let audio = WebRtcSourceTrack::opus("mic", "cam");
        assert_eq!(audio.id(), "mic");
        assert_eq!(audio.kind(), MediaKind::Audio);
        assert!(audio.as_any().downcast_ref::<WebRtcSourceTrack>().is_some());
    }

    #[tokio::test]
    async fn test_viewer_offer_and_broadcaster_answer() {
        let transport = WebRtcTransport::new(&offline_config()).unwrap();
        let call_id = CallId::new();

        let source = MediaSource::new(
            "cam",
            vec![Arc::new(WebRtcSourceTrack::vp8("video", "cam")) as Arc<dyn SourceTrack>],
        );

        let viewer = transport
            .create_link(LinkSpec {
                call_id: call_id.clone(),
                local_role: PeerRole::Viewer,
                remote: "bc".into(),
                source: None,
            })
            .await
            .unwrap();
        let broadcaster = transport
            .create_link(LinkSpec {
                call_id,
                local_role: PeerRole::Broadcaster,
                remote: "vw".into(),
                source: Some(source),
            })
            .await
            .unwrap();

        let offer = viewer.create_offer().await.unwrap();
        assert!(offer.contains("m=video"));

        let answer = broadcaster.accept_offer(&offer).await.unwrap();
        viewer.apply_answer(&answer).await.unwrap();

        viewer.close().await.unwrap();
        broadcaster.close().await.unwrap();
        broadcaster.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_offer_is_protocol_violation() {
        let transport = WebRtcTransport::new(&offline_config()).unwrap();
        let link = transport
            .create_link(LinkSpec {
                call_id: CallId::new(),
                local_role: PeerRole::Broadcaster,
                remote: "vw".into(),
                source: None,
            })
            .await
            .unwrap();

        assert!(matches!(
            link.accept_offer("not sdp").await.unwrap_err(),
            Error::ProtocolViolation(_)
        ));
        link.close().await.unwrap();
    }
}
