use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::PayloadType;
use webrtc::track::track_remote::TrackRemote;

use crate::recorder::{Recorder, TrackKind, AUDIO_CLOCK_RATE, VIDEO_CLOCK_RATE};
use crate::result::Result;

pub mod manager;

pub const VIDEO_PAYLOAD_TYPE: PayloadType = 96;
pub const AUDIO_PAYLOAD_TYPE: PayloadType = 111;

// keyframe request cadence while recording
const PLI_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// The lifecycle state machine. Terminal states absorb every further event,
/// so the transition out of them happens exactly once no matter how often
/// the transport fires its callback.
fn next_state(current: SessionState, event: RTCPeerConnectionState) -> Option<SessionState> {
    if current.is_terminal() {
        return None;
    }
    match event {
        RTCPeerConnectionState::Connected => {
            (current == SessionState::Negotiating).then_some(SessionState::Connected)
        }
        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected => {
            Some(SessionState::Failed)
        }
        RTCPeerConnectionState::Closed => Some(SessionState::Closed),
        _ => None,
    }
}

/// One recording session: owns the peer transport and the recorder, reacts
/// to track discovery and transport lifecycle events.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    internal: Arc<SessionInternal>,
}

struct SessionInternal {
    id: String,
    recorder: Recorder,
    ice_servers: Vec<RTCIceServer>,
    state: RwLock<SessionState>,
    peer: RwLock<Option<Arc<RTCPeerConnection>>>,
    terminated: watch::Sender<bool>,
}

impl Session {
    pub fn new(id: impl ToString, recorder: Recorder, ice_servers: Vec<RTCIceServer>) -> Self {
        let (terminated, _) = watch::channel(false);
        Session {
            id: id.to_string(),
            internal: Arc::new(SessionInternal {
                id: id.to_string(),
                recorder,
                ice_servers,
                state: RwLock::new(SessionState::Negotiating),
                peer: RwLock::new(None),
                terminated,
            }),
        }
    }

    /// Negotiate the peer transport from the browser's offer. The answer is
    /// returned once local ICE gathering has completed, so the caller can
    /// use it immediately.
    pub async fn connect(&self, offer: RTCSessionDescription) -> Result<RTCSessionDescription> {
        let peer = self.internal.new_peer().await?;

        let internal = Arc::downgrade(&self.internal);
        let pc = Arc::downgrade(&peer);
        peer.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            if let (Some(internal), Some(pc)) = (internal.upgrade(), pc.upgrade()) {
                tokio::spawn(async move {
                    internal.handle_connection_state(pc, s).await;
                });
            }
            Box::pin(async {})
        }));

        let internal = Arc::downgrade(&self.internal);
        peer.on_track(Box::new(move |track, _, _| {
            if let Some(internal) = internal.upgrade() {
                tokio::spawn(async move {
                    internal.track_up(track).await;
                });
            }
            Box::pin(async {})
        }));

        *self.internal.peer.write().await = Some(peer.clone());
        peer_complete(offer, peer).await
    }

    pub async fn state(&self) -> SessionState {
        *self.internal.state.read().await
    }

    /// Observes the terminal transition; the receiver flips to `true` once
    /// the recorder has been finalized.
    pub fn subscribe_terminated(&self) -> watch::Receiver<bool> {
        self.internal.terminated.subscribe()
    }

    /// Explicitly close the transport and finalize the recording, e.g. on
    /// process shutdown or when the answer could not be delivered.
    pub async fn close(&self) {
        self.internal
            .clone()
            .transition(RTCPeerConnectionState::Closed)
            .await;
    }
}

impl SessionInternal {
    async fn new_peer(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut m = MediaEngine::default();
        m.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: VIDEO_CLOCK_RATE,
                    channels: 0,
                    sdp_fmtp_line: "".to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: VIDEO_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
        m.register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: AUDIO_CLOCK_RATE,
                    channels: 2,
                    sdp_fmtp_line: "".to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: AUDIO_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let mut s = SettingEngine::default();
        // server side, nothing local to resolve
        s.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .with_setting_engine(s)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        Ok(Arc::new(api.new_peer_connection(config).await?))
    }

    async fn handle_connection_state(
        self: Arc<Self>,
        pc: Arc<RTCPeerConnection>,
        s: RTCPeerConnectionState,
    ) {
        info!("[{}] connection state changed: {}", self.id, s);
        if matches!(
            s,
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Disconnected
        ) {
            let _ = pc.close().await;
        }
        self.transition(s).await;
    }

    /// Apply one lifecycle event; a terminal transition closes the peer and
    /// finalizes the recorder exactly once.
    async fn transition(self: Arc<Self>, event: RTCPeerConnectionState) {
        let next = {
            let mut state = self.state.write().await;
            match next_state(*state, event) {
                Some(next) => {
                    *state = next;
                    next
                }
                None => return,
            }
        };
        match next {
            SessionState::Connected => {
                info!("[{}] transport connected", self.id);
            }
            SessionState::Closed | SessionState::Failed => {
                if let Some(pc) = self.peer.write().await.take() {
                    let _ = pc.close().await;
                }
                self.recorder.finalize().await;
                let _ = self.terminated.send(true);
                info!("[{}] session terminated ({:?})", self.id, next);
            }
            SessionState::Negotiating => {}
        }
    }

    /// Reader loop for one discovered track; exits when the transport closes
    /// or the recorder refuses further packets.
    async fn track_up(self: Arc<Self>, track: Arc<TrackRemote>) {
        let kind = match track.kind() {
            RTPCodecType::Video => TrackKind::Video,
            RTPCodecType::Audio => TrackKind::Audio,
            RTPCodecType::Unspecified => {
                warn!("[{}] track of unspecified kind ignored", self.id);
                return;
            }
        };
        info!(
            "[{}] [track] kind: {}, ssrc: {}, codec: {}",
            self.id,
            kind,
            track.ssrc(),
            track.codec().capability.mime_type,
        );
        if kind == TrackKind::Video {
            if let Some(pc) = self.peer.read().await.as_ref() {
                tokio::spawn(keyframe_request_loop(
                    self.id.clone(),
                    Arc::downgrade(pc),
                    track.ssrc(),
                ));
            }
        }
        let mut b = vec![0u8; 1500];
        loop {
            match track.read(&mut b).await {
                Ok((pkt, _)) => {
                    if self.recorder.ingest(kind, pkt).is_err() {
                        debug!("[{}] [track] {} recorder closed, stop reading", self.id, kind);
                        break;
                    }
                }
                Err(err) => {
                    debug!("[{}] [track] {} read error: {}", self.id, kind, err);
                    break;
                }
            }
        }
        info!("[{}] [track] {} reader stopped", self.id, kind);
    }
}

/// Ask the publisher for a keyframe at a fixed cadence so the keyframe gate
/// opens quickly and recovery after loss is bounded.
async fn keyframe_request_loop(
    id: String,
    peer: std::sync::Weak<RTCPeerConnection>,
    media_ssrc: u32,
) {
    let mut interval = tokio::time::interval(PLI_INTERVAL);
    loop {
        interval.tick().await;
        let Some(pc) = peer.upgrade() else {
            break;
        };
        if let Err(err) = pc
            .write_rtcp(&[Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            })])
            .await
        {
            debug!("[{}] stop requesting keyframes: {}", id, err);
            break;
        }
    }
}

async fn peer_complete(
    offer: RTCSessionDescription,
    peer: Arc<RTCPeerConnection>,
) -> Result<RTCSessionDescription> {
    peer.set_remote_description(offer).await?;
    let answer = peer.create_answer(None).await?;
    let mut gather_complete = peer.gathering_complete_promise().await;
    peer.set_local_description(answer).await?;
    let _ = gather_complete.recv().await;
    peer.local_description()
        .await
        .ok_or(anyhow::anyhow!("no local description after gathering").into())
}
