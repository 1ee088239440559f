//! Host session controller.
//!
//! The host owns the authoritative room state: the roster, the round
//! counter, and the start-next-round predicate. Every roster mutation
//! flows through a single actor task, so concurrent joins, submissions,
//! and disconnects serialize in arrival order. Observers read
//! consistent snapshots from a `watch` channel.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use estimate_proto::{Estimate, Participant, ParticipantId, RoomCode, RoomMessage};
use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::rendezvous::{AdvertiseHandle, Rendezvous, META_OFFER};
use crate::transport::{Link, LinkEvent, LinkId, Listener, Offer};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

const ACCEPT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(200);

/// Authoritative room state, published as an atomic snapshot.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_code: RoomCode,
    pub round: u32,
    /// Roster in join order. Entries are never removed; a participant
    /// that drops is marked disconnected and keeps its slot.
    pub participants: IndexMap<ParticipantId, Participant>,
    /// True when at least one connected participant exists and every
    /// connected participant has submitted for the current round.
    pub can_start_next_round: bool,
    pub disconnected: HashSet<ParticipantId>,
}

/// What happened to a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Recorded { became_ready: bool },
    /// Submission tagged with a round other than the current one.
    StaleRound,
    UnknownParticipant,
}

impl RoomState {
    #[must_use]
    pub fn new(room_code: RoomCode) -> Self {
        Self {
            room_code,
            round: 1,
            participants: IndexMap::new(),
            can_start_next_round: false,
            disconnected: HashSet::new(),
        }
    }

    /// Admit a participant. A rejoin after a disconnect reclaims the
    /// existing slot with a fresh unsubmitted estimate; a duplicate
    /// join of a live participant is a no-op.
    pub fn admit(&mut self, id: ParticipantId, name: String) {
        if self.disconnected.remove(&id) {
            if let Some(participant) = self.participants.get_mut(&id) {
                participant.name = name;
                participant.estimate = Estimate::Unsubmitted;
            }
        } else if !self.participants.contains_key(&id) {
            self.participants
                .insert(id.clone(), Participant::new(id, name));
        }
        self.refresh_can_start();
    }

    /// Record a submission for the current round. Submissions tagged
    /// with any other round are ignored.
    pub fn record_submit(
        &mut self,
        round: u32,
        id: &ParticipantId,
        points: u32,
    ) -> SubmitOutcome {
        if round != self.round {
            return SubmitOutcome::StaleRound;
        }
        let Some(participant) = self.participants.get_mut(id) else {
            return SubmitOutcome::UnknownParticipant;
        };
        participant.estimate = Estimate::Submitted(points);
        self.refresh_can_start();
        SubmitOutcome::Recorded {
            became_ready: self.can_start_next_round,
        }
    }

    /// Advance to the next round. Fails while any connected
    /// participant still owes a submission; nothing changes on failure.
    pub fn start_next_round(&mut self) -> Result<u32> {
        if !self.can_start_next_round {
            return Err(Error::RoundNotReady);
        }
        self.round = self.round.saturating_add(1);
        for (id, participant) in &mut self.participants {
            participant.estimate = if self.disconnected.contains(id) {
                Estimate::Disconnected
            } else {
                Estimate::Unsubmitted
            };
        }
        self.refresh_can_start();
        Ok(self.round)
    }

    /// Mark a participant disconnected. A submitted estimate stays on
    /// the board so the in-flight round can still complete; an
    /// unsubmitted one stops blocking the round immediately.
    pub fn mark_disconnected(&mut self, id: &ParticipantId) {
        if !self.participants.contains_key(id) {
            return;
        }
        self.disconnected.insert(id.clone());
        if let Some(participant) = self.participants.get_mut(id) {
            if participant.estimate == Estimate::Unsubmitted {
                participant.estimate = Estimate::Disconnected;
            }
        }
        self.refresh_can_start();
    }

    fn refresh_can_start(&mut self) {
        let mut connected = 0usize;
        let mut all_submitted = true;
        for (id, participant) in &self.participants {
            if self.disconnected.contains(id) {
                continue;
            }
            connected += 1;
            if !participant.estimate.is_submitted() {
                all_submitted = false;
            }
        }
        self.can_start_next_round = connected > 0 && all_submitted;
    }

    /// Roster in join order, for fan-out to participants.
    #[must_use]
    pub fn roster(&self) -> Vec<Participant> {
        self.participants.values().cloned().collect()
    }
}

enum HostCommand {
    LinkOpened(Link),
    Inbound {
        link_id: LinkId,
        message: RoomMessage,
    },
    LinkClosed {
        link_id: LinkId,
    },
    StartNextRound {
        reply: oneshot::Sender<Result<u32>>,
    },
}

/// A running host session.
pub struct HostSession {
    room_code: RoomCode,
    cmd_tx: mpsc::Sender<HostCommand>,
    state_rx: watch::Receiver<RoomState>,
    cancel: CancellationToken,
    actor_task: JoinHandle<()>,
    acceptor_task: JoinHandle<()>,
}

impl HostSession {
    /// Host a new room under a freshly generated code.
    pub async fn start(config: &Config) -> Result<Self> {
        Self::start_with_room(config, RoomCode::generate()).await
    }

    /// Host a room under a caller-chosen code.
    pub async fn start_with_room(config: &Config, room_code: RoomCode) -> Result<Self> {
        let rendezvous = Rendezvous::new(config.discovery.clone());
        let (offer, listener) = Listener::open_as_host().await?;
        let advert = rendezvous
            .advertise(room_code.clone(), offer_metadata(&offer)?)
            .await?;

        let state = RoomState::new(room_code.clone());
        let (state_tx, state_rx) = watch::channel(state.clone());
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let actor = HostActor {
            state,
            links: HashMap::new(),
            link_participants: HashMap::new(),
            state_tx,
            cmd_tx: cmd_tx.clone(),
        };
        let actor_task = tokio::spawn(actor.run(cmd_rx, cancel.clone()));
        let acceptor_task = tokio::spawn(accept_loop(
            listener,
            advert,
            cmd_tx.clone(),
            cancel.clone(),
        ));
        info!(room_code = %room_code, "hosting room");

        Ok(Self {
            room_code,
            cmd_tx,
            state_rx,
            cancel,
            actor_task,
            acceptor_task,
        })
    }

    #[must_use]
    pub fn room_code(&self) -> &RoomCode {
        &self.room_code
    }

    /// Snapshot stream of the authoritative room state.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RoomState> {
        self.state_rx.clone()
    }

    /// Advance to the next round and announce it to every participant.
    pub async fn start_next_round(&self) -> Result<u32> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HostCommand::StartNextRound { reply: reply_tx })
            .await
            .map_err(|_| Error::SessionClosed)?;
        reply_rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Stop advertising, close every link, and wind the actor down.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.acceptor_task.await;
        let _ = self.actor_task.await;
    }
}

fn offer_metadata(offer: &Offer) -> Result<HashMap<String, String>> {
    let mut metadata = HashMap::new();
    metadata.insert(META_OFFER.to_string(), offer.to_json()?);
    Ok(metadata)
}

/// Accept answered offers and hand the links to the actor. Every
/// accepted link retires its offer; a fresh one replaces it in the
/// advertisement. Accept errors (ECONNABORTED, EMFILE and friends) are
/// transient; the loop backs off and keeps admitting.
async fn accept_loop(
    mut listener: Listener,
    advert: AdvertiseHandle,
    cmd_tx: mpsc::Sender<HostCommand>,
    cancel: CancellationToken,
) {
    loop {
        let accept = listener.accept();
        tokio::pin!(accept);
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = &mut accept => accepted,
        };
        match accepted {
            Ok(link) => {
                if cmd_tx.send(HostCommand::LinkOpened(link)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "accept failed, reopening the offer");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    () = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                }
            }
        }
        match Listener::open_as_host().await {
            Ok((offer, next)) => {
                listener = next;
                match offer_metadata(&offer) {
                    Ok(metadata) => advert.update(metadata),
                    Err(e) => warn!(error = %e, "offer encode failed"),
                }
            }
            Err(e) => {
                warn!(error = %e, "could not open a fresh offer");
                break;
            }
        }
    }
    advert.stop().await;
}

struct HostActor {
    state: RoomState,
    links: HashMap<LinkId, Link>,
    link_participants: HashMap<LinkId, ParticipantId>,
    state_tx: watch::Sender<RoomState>,
    cmd_tx: mpsc::Sender<HostCommand>,
}

impl HostActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<HostCommand>,
        cancel: CancellationToken,
    ) {
        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => break,
                command = cmd_rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            match command {
                HostCommand::LinkOpened(link) => self.handle_link_opened(link),
                HostCommand::Inbound { link_id, message } => {
                    self.handle_inbound(link_id, message);
                }
                HostCommand::LinkClosed { link_id } => {
                    self.handle_link_closed(&link_id);
                }
                HostCommand::StartNextRound { reply } => {
                    let _ = reply.send(self.handle_start_next_round());
                }
            }
        }
        for link in self.links.values() {
            link.close();
        }
        debug!(room_code = %self.state.room_code, "host actor stopped");
    }

    fn handle_link_opened(&mut self, mut link: Link) {
        let link_id = link.link_id().to_string();
        let Some(events) = link.take_events() else {
            warn!(link_id = %link_id, "link arrived without its event stream");
            return;
        };
        debug!(link_id = %link_id, "link attached");
        self.links.insert(link_id.clone(), link);
        tokio::spawn(read_link(link_id, events, self.cmd_tx.clone()));
    }

    fn handle_inbound(&mut self, link_id: LinkId, message: RoomMessage) {
        match message {
            RoomMessage::Join { id, name } => self.handle_join(link_id, id, name),
            RoomMessage::Submit {
                round,
                participant_id,
                points,
            } => self.handle_submit(round, &participant_id, points),
            other => {
                // Participants mirror state, they never author it.
                warn!(
                    link_id = %link_id,
                    message_type = other.message_type(),
                    "host-only message from participant ignored"
                );
            }
        }
    }

    fn handle_join(&mut self, link_id: LinkId, participant_id: ParticipantId, name: String) {
        // A rejoin over a new link retires any stale mapping.
        self.link_participants
            .retain(|_, existing| existing != &participant_id);
        self.link_participants
            .insert(link_id.clone(), participant_id.clone());
        info!(participant_id = %participant_id, name = %name, "participant joined");
        self.state.admit(participant_id, name);
        self.publish();
        self.broadcast(&RoomMessage::Participants {
            participants: self.state.roster(),
        });
        // Late joiners need the current round to submit against it.
        self.send_to(
            &link_id,
            &RoomMessage::StartRound {
                round: self.state.round,
            },
        );
    }

    fn handle_submit(&mut self, round: u32, id: &ParticipantId, points: u32) {
        match self.state.record_submit(round, id, points) {
            SubmitOutcome::Recorded { became_ready } => {
                debug!(participant_id = %id, round, points, became_ready, "estimate recorded");
                self.publish();
                self.broadcast(&RoomMessage::Participants {
                    participants: self.state.roster(),
                });
            }
            SubmitOutcome::StaleRound => {
                debug!(
                    participant_id = %id,
                    submitted_round = round,
                    current_round = self.state.round,
                    "stale submission ignored"
                );
            }
            SubmitOutcome::UnknownParticipant => {
                warn!(participant_id = %id, "submission from unknown participant ignored");
            }
        }
    }

    fn handle_link_closed(&mut self, link_id: &LinkId) {
        self.links.remove(link_id);
        let Some(participant_id) = self.link_participants.remove(link_id) else {
            debug!(link_id = %link_id, "unjoined link closed");
            return;
        };
        info!(participant_id = %participant_id, "participant disconnected");
        self.state.mark_disconnected(&participant_id);
        self.publish();
        self.broadcast(&RoomMessage::Participants {
            participants: self.state.roster(),
        });
    }

    fn handle_start_next_round(&mut self) -> Result<u32> {
        let round = self.state.start_next_round()?;
        info!(round, "round started");
        self.publish();
        self.broadcast(&RoomMessage::StartRound { round });
        Ok(round)
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    // Fan-out never waits on a link. A peer that stops draining its
    // socket fills its queue and is dropped like a closed link; the
    // reader task then reports the closure for roster bookkeeping.
    fn send_to(&mut self, link_id: &LinkId, message: &RoomMessage) {
        let bytes: Bytes = match message.encode() {
            Ok(bytes) => bytes.into(),
            Err(e) => {
                warn!(error = %e, "message encode failed");
                return;
            }
        };
        let Some(link) = self.links.get(link_id) else {
            return;
        };
        if link.try_send(bytes).is_err() {
            if let Some(link) = self.links.remove(link_id) {
                link.close();
            }
        }
    }

    fn broadcast(&mut self, message: &RoomMessage) {
        let bytes: Bytes = match message.encode() {
            Ok(bytes) => bytes.into(),
            Err(e) => {
                warn!(error = %e, "message encode failed");
                return;
            }
        };
        let mut dead = Vec::new();
        for (link_id, link) in &self.links {
            if link.try_send(bytes.clone()).is_err() {
                dead.push(link_id.clone());
            }
        }
        for link_id in dead {
            warn!(link_id = %link_id, "link not draining, dropped");
            if let Some(link) = self.links.remove(&link_id) {
                link.close();
            }
        }
    }
}

async fn read_link(
    link_id: LinkId,
    mut events: mpsc::Receiver<LinkEvent>,
    cmd_tx: mpsc::Sender<HostCommand>,
) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Open => {}
            LinkEvent::Message(bytes) => {
                let message = match RoomMessage::decode(&bytes) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(link_id = %link_id, error = %e, "malformed message dropped");
                        continue;
                    }
                };
                if cmd_tx
                    .send(HostCommand::Inbound {
                        link_id: link_id.clone(),
                        message,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            LinkEvent::Closed => break,
        }
    }
    let _ = cmd_tx.send(HostCommand::LinkClosed { link_id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomState {
        RoomState::new("ABCD2345".parse().expect("valid room code"))
    }

    fn pid(s: &str) -> ParticipantId {
        ParticipantId::from(s)
    }

    fn admit(state: &mut RoomState, id: &str) {
        state.admit(pid(id), id.to_string());
    }

    #[test]
    fn test_empty_room_is_never_ready() {
        let state = room();
        assert_eq!(state.round, 1);
        assert!(!state.can_start_next_round);
    }

    #[test]
    fn test_ready_when_all_connected_submitted() {
        let mut state = room();
        admit(&mut state, "alice");
        admit(&mut state, "bob");
        assert!(!state.can_start_next_round);

        state.record_submit(1, &pid("alice"), 5);
        assert!(!state.can_start_next_round, "bob still owes an estimate");

        let outcome = state.record_submit(1, &pid("bob"), 8);
        assert_eq!(outcome, SubmitOutcome::Recorded { became_ready: true });
        assert!(state.can_start_next_round);
    }

    #[test]
    fn test_start_next_round_resets_estimates() {
        let mut state = room();
        admit(&mut state, "alice");
        admit(&mut state, "bob");
        state.record_submit(1, &pid("alice"), 5);
        state.record_submit(1, &pid("bob"), 8);

        let round = state.start_next_round().expect("ready");
        assert_eq!(round, 2);
        assert!(!state.can_start_next_round);
        for participant in state.participants.values() {
            assert_eq!(participant.estimate, Estimate::Unsubmitted);
        }
    }

    #[test]
    fn test_start_next_round_not_ready_changes_nothing() {
        let mut state = room();
        admit(&mut state, "alice");
        state.record_submit(1, &pid("alice"), 13);
        admit(&mut state, "bob");

        let before = state.roster();
        let result = state.start_next_round();
        assert!(matches!(result, Err(Error::RoundNotReady)));
        assert_eq!(state.round, 1);
        assert_eq!(state.roster(), before);
        assert_eq!(
            state.participants[&pid("alice")].estimate,
            Estimate::Submitted(13)
        );
    }

    #[test]
    fn test_stale_submission_ignored() {
        let mut state = room();
        admit(&mut state, "alice");
        admit(&mut state, "bob");
        state.record_submit(1, &pid("alice"), 5);
        state.record_submit(1, &pid("bob"), 8);
        state.start_next_round().expect("ready");

        // A submission tagged with the finished round arrives late.
        let outcome = state.record_submit(1, &pid("alice"), 21);
        assert_eq!(outcome, SubmitOutcome::StaleRound);
        assert_eq!(
            state.participants[&pid("alice")].estimate,
            Estimate::Unsubmitted
        );

        let outcome = state.record_submit(2, &pid("alice"), 21);
        assert_eq!(outcome, SubmitOutcome::Recorded { became_ready: false });
    }

    #[test]
    fn test_unknown_participant_submission() {
        let mut state = room();
        admit(&mut state, "alice");
        let outcome = state.record_submit(1, &pid("ghost"), 5);
        assert_eq!(outcome, SubmitOutcome::UnknownParticipant);
        assert_eq!(state.participants.len(), 1);
    }

    #[test]
    fn test_disconnect_stops_blocking_the_round() {
        let mut state = room();
        admit(&mut state, "alice");
        admit(&mut state, "bob");
        state.record_submit(1, &pid("alice"), 5);
        assert!(!state.can_start_next_round);

        state.mark_disconnected(&pid("bob"));
        assert!(state.can_start_next_round, "only connected peers block");
        assert_eq!(
            state.participants[&pid("bob")].estimate,
            Estimate::Disconnected
        );
        // The slot survives the disconnect.
        assert_eq!(state.participants.len(), 2);
    }

    #[test]
    fn test_disconnect_keeps_submitted_estimate_until_next_round() {
        let mut state = room();
        admit(&mut state, "alice");
        admit(&mut state, "bob");
        state.record_submit(1, &pid("alice"), 5);
        state.record_submit(1, &pid("bob"), 8);
        state.mark_disconnected(&pid("bob"));

        // The in-flight round keeps bob's estimate on the board.
        assert_eq!(
            state.participants[&pid("bob")].estimate,
            Estimate::Submitted(8)
        );
        assert!(state.can_start_next_round);

        state.start_next_round().expect("ready");
        assert_eq!(
            state.participants[&pid("bob")].estimate,
            Estimate::Disconnected
        );
    }

    #[test]
    fn test_all_disconnected_is_not_ready() {
        let mut state = room();
        admit(&mut state, "alice");
        state.record_submit(1, &pid("alice"), 5);
        state.mark_disconnected(&pid("alice"));
        assert!(
            !state.can_start_next_round,
            "a round needs at least one connected participant"
        );
    }

    #[test]
    fn test_rejoin_reclaims_slot_unsubmitted() {
        let mut state = room();
        admit(&mut state, "alice");
        admit(&mut state, "bob");
        state.record_submit(1, &pid("bob"), 8);
        state.mark_disconnected(&pid("bob"));

        state.admit(pid("bob"), "bobby".to_string());
        assert!(!state.disconnected.contains(&pid("bob")));
        let bob = &state.participants[&pid("bob")];
        assert_eq!(bob.name, "bobby");
        assert_eq!(bob.estimate, Estimate::Unsubmitted);
        // Join order is preserved across the rejoin.
        assert_eq!(
            state.roster().iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["alice", "bob"]
        );
    }

    #[test]
    fn test_duplicate_join_is_a_no_op() {
        let mut state = room();
        admit(&mut state, "alice");
        state.record_submit(1, &pid("alice"), 5);
        admit(&mut state, "alice");
        assert_eq!(state.participants.len(), 1);
        assert_eq!(
            state.participants[&pid("alice")].estimate,
            Estimate::Submitted(5)
        );
    }

    #[test]
    fn test_round_counter_never_leaves_valid_range() {
        let mut state = room();
        admit(&mut state, "alice");
        state.round = u32::MAX;
        state.record_submit(u32::MAX, &pid("alice"), 1);
        let round = state.start_next_round().expect("ready");
        // Saturates rather than wrapping below 1.
        assert_eq!(round, u32::MAX);
        assert_eq!(
            state.participants[&pid("alice")].estimate,
            Estimate::Unsubmitted
        );
    }
}
