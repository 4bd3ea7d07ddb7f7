//! Session registration with the master.
//!
//! Registration is a three-step handshake: fetch a 32-byte challenge, send
//! a NEW_SESSION with the hashed password response and the mount subfolder,
//! and keep the returned session id for RECONNECT after a connection loss.

use std::sync::Arc;

use log::info;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::error::{FsError, Result};
use crate::protocol::SessionFlags;

use super::messages::{MasterRequest, MasterResponse};
use super::transport::MasterTransport;

pub const CLIENT_VERSION: u32 = 0x00090400;

#[derive(Clone, Debug)]
pub struct SessionState {
    pub session_id: u64,
    pub flags: SessionFlags,
}

pub struct SessionManager {
    transport: Arc<dyn MasterTransport>,
    subfolder: String,
    password: Option<String>,
    state: Mutex<Option<SessionState>>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn MasterTransport>,
        subfolder: String,
        password: Option<String>,
    ) -> Self {
        Self { transport, subfolder, password, state: Mutex::new(None) }
    }

    pub fn state(&self) -> Option<SessionState> {
        self.state.lock().clone()
    }

    /// Run the registration handshake and remember the session.
    pub async fn register(&self) -> Result<SessionState> {
        let challenge = match self.transport.request(MasterRequest::GetRandom).await? {
            MasterResponse::Challenge(challenge) => challenge,
            _ => return Err(FsError::Protocol("expected challenge".into())),
        };

        let response = self.challenge_response(&challenge)?;
        let reply = self
            .transport
            .request(MasterRequest::NewSession {
                challenge_response: response,
                subfolder: self.subfolder.clone(),
                version: CLIENT_VERSION,
            })
            .await?;

        match reply {
            MasterResponse::SessionEstablished { session_id, flags } => {
                let state = SessionState { session_id, flags };
                info!("registered session {:#x} (flags {:?})", session_id, flags);
                *self.state.lock() = Some(state.clone());
                Ok(state)
            }
            _ => Err(FsError::Protocol("unexpected session reply".into())),
        }
    }

    /// Resume an interrupted session. Falls back to full registration when
    /// the master no longer knows us.
    pub async fn reconnect(&self) -> Result<SessionState> {
        let previous = self.state.lock().clone();
        let Some(previous) = previous else {
            return self.register().await;
        };
        let reply = self
            .transport
            .request(MasterRequest::Reconnect {
                session_id: previous.session_id,
                version: CLIENT_VERSION,
            })
            .await;
        match reply {
            Ok(MasterResponse::Done) => Ok(previous),
            Ok(MasterResponse::SessionEstablished { session_id, flags }) => {
                let state = SessionState { session_id, flags };
                *self.state.lock() = Some(state.clone());
                Ok(state)
            }
            Ok(_) => Err(FsError::Protocol("unexpected reconnect reply".into())),
            Err(FsError::SessionLost) => {
                info!("session {:#x} expired, registering again", previous.session_id);
                self.register().await
            }
            Err(err) => Err(err),
        }
    }

    fn challenge_response(&self, challenge: &[u8; 32]) -> Result<[u8; 32]> {
        let password = match &self.password {
            Some(password) => password,
            None => "",
        };
        let mut hasher = Sha256::new();
        hasher.update(challenge);
        hasher.update(password.as_bytes());
        let digest = hasher.finalize();
        let mut response = [0u8; 32];
        response.copy_from_slice(&digest);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct HandshakeMaster {
        lost: AtomicBool,
    }

    impl MasterTransport for HandshakeMaster {
        fn request<'a>(
            &'a self,
            request: MasterRequest,
        ) -> Pin<Box<dyn Future<Output = crate::error::Result<MasterResponse>> + Send + 'a>>
        {
            Box::pin(async move {
                match request {
                    MasterRequest::GetRandom => Ok(MasterResponse::Challenge([7u8; 32])),
                    MasterRequest::NewSession { challenge_response, .. } => {
                        // response must be keyed on the challenge we issued
                        assert_ne!(challenge_response, [0u8; 32]);
                        Ok(MasterResponse::SessionEstablished {
                            session_id: 0xbeef,
                            flags: SessionFlags::empty(),
                        })
                    }
                    MasterRequest::Reconnect { session_id, .. } => {
                        assert_eq!(session_id, 0xbeef);
                        if self.lost.swap(false, Ordering::SeqCst) {
                            Err(FsError::SessionLost)
                        } else {
                            Ok(MasterResponse::Done)
                        }
                    }
                    _ => Err(FsError::Protocol("unexpected".into())),
                }
            })
        }
    }

    #[tokio::test]
    async fn register_then_reconnect() {
        let transport = Arc::new(HandshakeMaster { lost: AtomicBool::new(false) });
        let sessions = SessionManager::new(transport, "/".into(), Some("secret".into()));

        let state = sessions.register().await.unwrap();
        assert_eq!(state.session_id, 0xbeef);
        let resumed = sessions.reconnect().await.unwrap();
        assert_eq!(resumed.session_id, 0xbeef);
    }

    #[tokio::test]
    async fn expired_session_reregisters() {
        let transport = Arc::new(HandshakeMaster { lost: AtomicBool::new(true) });
        let sessions = SessionManager::new(transport, "/".into(), None);
        sessions.register().await.unwrap();
        let state = sessions.reconnect().await.unwrap();
        assert_eq!(state.session_id, 0xbeef);
    }
}
