use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::Config;
use crate::metrics;
use crate::recorder::Recorder;
use crate::result::Result;
use crate::session::Session;

/// Registry of live recording sessions. Sessions are fully independent;
/// the registry only tracks them so they can be reaped when terminal and
/// closed together on process shutdown.
pub struct Manager {
    config: Config,
    ice_servers: Vec<RTCIceServer>,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl Manager {
    pub fn new(config: Config) -> Self {
        let ice_servers = config
            .ice_servers
            .clone()
            .into_iter()
            .map(|i| i.into())
            .collect();
        Manager {
            config,
            ice_servers,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Build a session for one inbound offer: open the output file, wire up
    /// the recorder, negotiate the transport and hand back the answer.
    pub async fn create(
        &self,
        offer: RTCSessionDescription,
        fname_hint: Option<String>,
    ) -> Result<(RTCSessionDescription, String)> {
        let id = Uuid::new_v4().simple().to_string();
        let path = self
            .config
            .record
            .output_dir
            .join(output_filename(fname_hint.as_deref(), &id));

        // the recorder exists before negotiation so the answer can go out
        // before the first packet arrives
        let recorder = Recorder::create(&path, self.config.record.cluster_ms).await?;
        let session = Session::new(&id, recorder, self.ice_servers.clone());
        let answer = match session.connect(offer).await {
            Ok(answer) => answer,
            Err(err) => {
                // a rejected offer leaves no artifact behind
                session.close().await;
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    warn!("[{}] failed to remove {}: {}", id, path.display(), err);
                }
                return Err(err);
            }
        };
        info!("[{}] answer ready, recording to {}", session.id, path.display());

        let mut terminated = session.subscribe_terminated();
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        metrics::SESSIONS.inc();

        let sessions = self.sessions.clone();
        let session_id = id.clone();
        tokio::spawn(async move {
            while !*terminated.borrow() {
                if terminated.changed().await.is_err() {
                    break;
                }
            }
            if sessions.write().await.remove(&session_id).is_some() {
                metrics::SESSIONS.dec();
                info!("[{}] session removed", session_id);
            }
        });

        Ok((answer, id))
    }

    /// Drop a session whose answer could not be delivered.
    pub async fn discard(&self, id: &str) {
        let session = self.sessions.write().await.remove(id);
        if let Some(session) = session {
            metrics::SESSIONS.dec();
            session.close().await;
            info!("[{}] session discarded", id);
        }
    }

    /// Close every live session so all recordings finalize.
    pub async fn shutdown(&self) {
        let sessions: Vec<Session> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            metrics::SESSIONS.dec();
            session.close().await;
        }
    }
}

fn output_filename(hint: Option<&str>, id: &str) -> String {
    match hint {
        Some(hint) => format!("{hint}_{id}.webm"),
        None => format!("{id}.webm"),
    }
}
