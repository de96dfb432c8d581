//! Dispatches inbound bus events to the conference that owns them, creating
//! conferences on invites and re-dispatching what an ended conference left
//! behind.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conference::{self, ConferenceEnded, ConferenceHandle, ConferenceParams};
use crate::id_types::{CallId, SessionId};
use crate::signaling::{SignalingEnvelope, SignalingEvent, SignalingTransport};

pub struct Router {
    params: ConferenceParams,
    transport: Arc<dyn SignalingTransport>,
    conferences: HashMap<CallId, ConferenceHandle>,
}

impl Router {
    pub fn new(params: ConferenceParams, transport: Arc<dyn SignalingTransport>) -> Self {
        Self {
            params,
            transport,
            conferences: HashMap::new(),
        }
    }

    /// Consumes bus events until the inbound stream closes. Each conference
    /// runs on its own task; the router only routes.
    pub async fn run(mut self, mut events: mpsc::Receiver<SignalingEnvelope>) {
        let (ended_tx, mut ended_rx) = mpsc::channel::<ConferenceEnded>(16);
        loop {
            tokio::select! {
                envelope = events.recv() => match envelope {
                    Some(envelope) => self.dispatch(envelope, &ended_tx).await,
                    None => break,
                },
                ended = ended_rx.recv() => {
                    if let Some(ended) = ended {
                        self.conference_ended(ended, &ended_tx).await;
                    }
                }
            }
        }
        info!(active = self.conferences.len(), "signaling stream closed, router exiting");
    }

    pub fn conference_count(&self) -> usize {
        self.conferences.len()
    }

    async fn dispatch(
        &mut self,
        envelope: SignalingEnvelope,
        ended_tx: &mpsc::Sender<ConferenceEnded>,
    ) {
        if envelope.call_id.as_ref().is_empty() {
            debug!("event without a call id, ignoring");
            return;
        }
        let call_id = envelope.call_id.clone();

        if let Some(handle) = self.conferences.get(&call_id) {
            match handle.deliver(envelope).await {
                Ok(()) => return,
                Err(err) => {
                    // The conference ended under us; retry against a fresh
                    // one if the event can start it.
                    debug!(call = %call_id, "conference gone, re-dispatching event");
                    self.conferences.remove(&call_id);
                    self.deliver_or_start(err.into_inner(), ended_tx).await;
                    return;
                }
            }
        }
        self.deliver_or_start(envelope, ended_tx).await;
    }

    async fn deliver_or_start(
        &mut self,
        envelope: SignalingEnvelope,
        ended_tx: &mpsc::Sender<ConferenceEnded>,
    ) {
        if !matches!(envelope.event, SignalingEvent::Invite(_)) {
            debug!(call = %envelope.call_id, "event for unknown conference, ignoring");
            return;
        }
        let call_id = envelope.call_id.clone();
        let session_id = SessionId::from(Uuid::new_v4().to_string());
        info!(call = %call_id, session = %session_id, "starting conference");
        let handle = conference::spawn(
            call_id.clone(),
            session_id,
            self.params.clone(),
            self.transport.clone(),
            ended_tx.clone(),
        );
        if handle.deliver(envelope).await.is_err() {
            warn!(call = %call_id, "fresh conference refused its invite");
            return;
        }
        self.conferences.insert(call_id, handle);
    }

    async fn conference_ended(
        &mut self,
        ended: ConferenceEnded,
        ended_tx: &mpsc::Sender<ConferenceEnded>,
    ) {
        info!(call = %ended.call_id, leftover = ended.unprocessed.len(), "conference ended");
        self.conferences.remove(&ended.call_id);
        for envelope in ended.unprocessed {
            self.deliver_or_start(envelope, ended_tx).await;
        }
    }
}
