//! Offer/answer bookkeeping on top of a [`PeerConnection`].

use std::collections::VecDeque;
use std::sync::Arc;

use callcore::types::{IceCandidate, SessionDescription};
use log::{debug, warn};

use super::error::SessionError;
use super::transport::{PeerConnection, PeerConnectionFactory, SessionConfig, TransportEventSender};

/// Owns the peer connection of one call and enforces a single offer/answer
/// exchange.
///
/// Remote candidates received before the remote description are queued and
/// applied in arrival order once it is set.
pub struct SignalingSession {
    connection: Arc<dyn PeerConnection>,
    config: SessionConfig,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_remote: VecDeque<IceCandidate>,
    closed: bool,
}

impl SignalingSession {
    pub fn open(
        factory: &dyn PeerConnectionFactory,
        config: SessionConfig,
        events: TransportEventSender,
    ) -> Result<Self, SessionError> {
        let connection = factory.create(&config, events)?;
        debug!(
            "Opened peer connection ({} media, {} ICE servers, policy {:?})",
            config.media,
            config.ice_servers.len(),
            config.ice_transport_policy
        );
        Ok(Self {
            connection,
            config,
            local_description: None,
            remote_description: None,
            pending_remote: VecDeque::new(),
            closed: false,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn has_local_description(&self) -> bool {
        self.local_description.is_some()
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description.is_some()
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn pending_remote_candidates(&self) -> usize {
        self.pending_remote.len()
    }

    /// Creates the local offer and sets it as the local description.
    pub async fn create_local_offer(&mut self) -> Result<SessionDescription, SessionError> {
        self.ensure_open()?;
        if self.local_description.is_some() {
            return Err(SessionError::LocalAlreadySet);
        }
        let offer = self
            .connection
            .create_offer()
            .await
            .map_err(SessionError::CreateDescription)?;
        self.set_local(offer.clone()).await?;
        Ok(offer)
    }

    /// Applies a remote offer and produces the local answer.
    pub async fn accept_remote_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SessionError> {
        self.ensure_open()?;
        if self.local_description.is_some() {
            return Err(SessionError::LocalAlreadySet);
        }
        self.set_remote(offer).await?;
        let answer = self
            .connection
            .create_answer()
            .await
            .map_err(SessionError::CreateDescription)?;
        self.set_local(answer.clone()).await?;
        self.flush_remote_candidates().await;
        Ok(answer)
    }

    /// Applies the remote answer to a local offer.
    pub async fn apply_remote_answer(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.set_remote(answer).await?;
        self.flush_remote_candidates().await;
        Ok(())
    }

    /// Adds remote candidates, or queues them while no remote description is
    /// set. Returns how many were handed to the connection.
    pub async fn add_remote_candidates(
        &mut self,
        candidates: impl IntoIterator<Item = IceCandidate>,
    ) -> Result<usize, SessionError> {
        self.ensure_open()?;
        self.pending_remote.extend(candidates);
        if self.remote_description.is_none() {
            debug!(
                "Queued remote candidates until remote description is set ({} pending)",
                self.pending_remote.len()
            );
            return Ok(0);
        }
        Ok(self.flush_remote_candidates().await)
    }

    /// Closes the connection. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending_remote.clear();
        self.connection.set_frame_cryptor(None);
        self.connection.close().await;
    }

    async fn set_local(&mut self, desc: SessionDescription) -> Result<(), SessionError> {
        self.connection
            .set_local_description(&desc)
            .await
            .map_err(SessionError::LocalDescription)?;
        self.local_description = Some(desc);
        Ok(())
    }

    async fn set_remote(&mut self, desc: SessionDescription) -> Result<(), SessionError> {
        if self.remote_description.is_some() {
            return Err(SessionError::RemoteAlreadySet);
        }
        self.connection
            .set_remote_description(&desc)
            .await
            .map_err(SessionError::RemoteDescription)?;
        self.remote_description = Some(desc);
        Ok(())
    }

    async fn flush_remote_candidates(&mut self) -> usize {
        let mut added = 0;
        while let Some(candidate) = self.pending_remote.pop_front() {
            // A bad candidate must not stop the rest of the batch.
            match self.connection.add_ice_candidate(&candidate).await {
                Ok(()) => added += 1,
                Err(e) => warn!(
                    "Failed to add remote candidate {}: {e}",
                    candidate.candidate
                ),
            }
        }
        added
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }
}
