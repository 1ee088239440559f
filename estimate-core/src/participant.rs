//! Participant session controller.
//!
//! A participant mirrors the host's room state: the roster and round
//! number are taken verbatim from host messages, never computed
//! locally. The only participant-owned state is the card selection and
//! the submitted flag for the current round, both reset atomically
//! when a `start-round` arrives.
//!
//! A background loop searches for the room, dials the offer it finds,
//! joins, and pumps inbound messages; on link loss it falls back to
//! searching and rejoins under the same participant id.

use std::collections::HashSet;

use estimate_proto::{is_card, Participant, ParticipantId, RoomCode, RoomMessage};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::rendezvous::{Discovery, Rendezvous, META_OFFER};
use crate::transport::{connect_as_participant, Link, LinkEvent, Offer};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Where the session is on the way to a live link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Probing for the room's advertisement.
    Searching,
    /// Offer found, handshake in flight.
    Connecting,
    /// Link open and joined.
    Connected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Searching => write!(f, "searching"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// Derived view of the room from this participant's seat.
#[derive(Debug, Clone)]
pub struct ParticipantView {
    pub room_code: RoomCode,
    /// Current round as announced by the host.
    pub round: u32,
    pub connection_status: ConnectionStatus,
    /// Roster as last fanned out by the host.
    pub roster: Vec<Participant>,
    pub selected_card: Option<u32>,
    /// Whether this participant already submitted for `round`.
    pub submitted: bool,
    pub can_estimate: bool,
}

impl ParticipantView {
    #[must_use]
    pub fn new(room_code: RoomCode) -> Self {
        Self {
            room_code,
            round: 1,
            connection_status: ConnectionStatus::Searching,
            roster: Vec::new(),
            selected_card: None,
            submitted: false,
            can_estimate: false,
        }
    }

    /// Enter the announced round. Selection, submitted flag, and
    /// estimability reset together; no observer can see the new round
    /// paired with last round's selection.
    pub fn apply_start_round(&mut self, round: u32) {
        self.round = round;
        self.selected_card = None;
        self.submitted = false;
        self.can_estimate = self.connection_status == ConnectionStatus::Connected;
    }

    /// The selected card, if submitting is currently allowed.
    pub fn ensure_estimable(&self) -> Result<u32> {
        if self.connection_status != ConnectionStatus::Connected {
            return Err(Error::NotEstimable("not connected to the room"));
        }
        if self.submitted {
            return Err(Error::NotEstimable("already submitted this round"));
        }
        self.selected_card
            .ok_or(Error::NotEstimable("no card selected"))
    }
}

enum ParticipantCommand {
    Status(ConnectionStatus),
    LinkReady(Link),
    LinkLost,
    Inbound(RoomMessage),
    SelectCard {
        points: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    SubmitEstimate {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// A running participant session.
#[derive(Debug)]
pub struct ParticipantSession {
    participant_id: ParticipantId,
    room_code: RoomCode,
    cmd_tx: mpsc::Sender<ParticipantCommand>,
    view_rx: watch::Receiver<ParticipantView>,
    cancel: CancellationToken,
    actor_task: JoinHandle<()>,
    connect_task: JoinHandle<()>,
}

impl ParticipantSession {
    /// Join a room under a fresh participant id.
    pub async fn start(config: &Config, room_code: RoomCode, name: &str) -> Result<Self> {
        Self::start_with_id(config, room_code, name, ParticipantId::new()).await
    }

    /// Join a room under a caller-chosen participant id. Reusing the
    /// id of a dropped participant reclaims its roster slot.
    pub async fn start_with_id(
        config: &Config,
        room_code: RoomCode,
        name: &str,
        participant_id: ParticipantId,
    ) -> Result<Self> {
        let rendezvous = Rendezvous::new(config.discovery.clone());
        // The first search opens here; a dead discovery socket fails
        // this call instead of leaving a session stuck searching.
        let search = rendezvous.discover(room_code.clone()).await?;
        let view = ParticipantView::new(room_code.clone());
        let (view_tx, view_rx) = watch::channel(view.clone());
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let actor = ParticipantActor {
            view,
            participant_id: participant_id.clone(),
            link: None,
            view_tx,
        };
        let actor_task = tokio::spawn(actor.run(cmd_rx, cancel.clone()));
        let connect_task = tokio::spawn(connect_loop(
            rendezvous,
            search,
            room_code.clone(),
            participant_id.clone(),
            name.to_string(),
            cmd_tx.clone(),
            cancel.clone(),
        ));
        info!(room_code = %room_code, participant_id = %participant_id, "joining room");

        Ok(Self {
            participant_id,
            room_code,
            cmd_tx,
            view_rx,
            cancel,
            actor_task,
            connect_task,
        })
    }

    #[must_use]
    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    #[must_use]
    pub fn room_code(&self) -> &RoomCode {
        &self.room_code
    }

    /// Snapshot stream of the derived view.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ParticipantView> {
        self.view_rx.clone()
    }

    /// Select a card from the deck for the current round.
    pub async fn select_card(&self, points: u32) -> Result<()> {
        self.request(|reply| ParticipantCommand::SelectCard { points, reply })
            .await
    }

    /// Submit the selected card to the host.
    pub async fn submit_estimate(&self) -> Result<()> {
        self.request(|reply| ParticipantCommand::SubmitEstimate { reply })
            .await
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<()>>) -> ParticipantCommand,
    ) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| Error::SessionClosed)?;
        reply_rx.await.map_err(|_| Error::SessionClosed)?
    }

    /// Leave the room and wind the session down.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.connect_task.await;
        let _ = self.actor_task.await;
    }
}

struct ParticipantActor {
    view: ParticipantView,
    participant_id: ParticipantId,
    link: Option<Link>,
    view_tx: watch::Sender<ParticipantView>,
}

impl ParticipantActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<ParticipantCommand>,
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
                ParticipantCommand::Status(status) => {
                    self.view.connection_status = status;
                    if status != ConnectionStatus::Connected {
                        self.view.can_estimate = false;
                    }
                    self.publish();
                }
                ParticipantCommand::LinkReady(link) => {
                    debug!(link_id = %link.link_id(), "link ready");
                    self.link = Some(link);
                    self.view.connection_status = ConnectionStatus::Connected;
                    self.view.can_estimate = !self.view.submitted;
                    self.publish();
                }
                ParticipantCommand::LinkLost => {
                    info!("link to host lost, searching again");
                    if let Some(link) = self.link.take() {
                        link.close();
                    }
                    self.view.connection_status = ConnectionStatus::Searching;
                    self.view.can_estimate = false;
                    self.publish();
                }
                ParticipantCommand::Inbound(message) => self.handle_inbound(message),
                ParticipantCommand::SelectCard { points, reply } => {
                    let _ = reply.send(self.handle_select(points));
                }
                ParticipantCommand::SubmitEstimate { reply } => {
                    let _ = reply.send(self.handle_submit().await);
                }
            }
        }
        if let Some(link) = self.link.take() {
            link.close();
        }
        debug!(participant_id = %self.participant_id, "participant actor stopped");
    }

    fn handle_inbound(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::StartRound { round } => {
                debug!(round, "round announced");
                self.view.apply_start_round(round);
                self.publish();
            }
            RoomMessage::Participants { participants } => {
                self.view.roster = participants;
                self.publish();
            }
            other => {
                warn!(
                    message_type = other.message_type(),
                    "participant-only message from host ignored"
                );
            }
        }
    }

    fn handle_select(&mut self, points: u32) -> Result<()> {
        if !is_card(points) {
            return Err(Error::Proto(estimate_proto::Error::InvalidCard(points)));
        }
        if self.view.connection_status != ConnectionStatus::Connected {
            return Err(Error::NotEstimable("not connected to the room"));
        }
        if self.view.submitted {
            return Err(Error::NotEstimable("already submitted this round"));
        }
        self.view.selected_card = Some(points);
        self.publish();
        Ok(())
    }

    async fn handle_submit(&mut self) -> Result<()> {
        let points = self.view.ensure_estimable()?;
        let Some(link) = &self.link else {
            return Err(Error::LinkNotOpen);
        };
        let message = RoomMessage::Submit {
            round: self.view.round,
            participant_id: self.participant_id.clone(),
            points,
        };
        link.send(message.encode()?.into()).await?;
        self.view.submitted = true;
        self.view.can_estimate = false;
        self.publish();
        Ok(())
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.view.clone());
    }
}

/// Find the room, dial it, join, and pump inbound messages until the
/// link drops; then start over. Runs until the session is cancelled.
async fn connect_loop(
    rendezvous: Rendezvous,
    search: Discovery,
    room_code: RoomCode,
    participant_id: ParticipantId,
    name: String,
    cmd_tx: mpsc::Sender<ParticipantCommand>,
    cancel: CancellationToken,
) {
    let mut seen_adverts = HashSet::new();
    let mut search = Some(search);
    loop {
        if cmd_tx
            .send(ParticipantCommand::Status(ConnectionStatus::Searching))
            .await
            .is_err()
        {
            return;
        }
        let mut discovery = match search.take() {
            Some(discovery) => discovery,
            None => match rendezvous.discover(room_code.clone()).await {
                Ok(discovery) => discovery,
                Err(e) => {
                    warn!(error = %e, "room search failed");
                    return;
                }
            },
        };
        let found = find_offer(&mut discovery, &mut seen_adverts, &cancel).await;
        discovery.stop().await;
        let Ok(offer) = found else {
            return;
        };
        if cmd_tx
            .send(ParticipantCommand::Status(ConnectionStatus::Connecting))
            .await
            .is_err()
        {
            return;
        }
        let (_answer, mut link) =
            match connect_as_participant(&offer, participant_id.as_str()).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "connect failed, searching again");
                    continue;
                }
            };
        let Some(mut events) = link.take_events() else {
            continue;
        };
        match events.recv().await {
            Some(LinkEvent::Open) => {}
            _ => continue,
        }
        let join = RoomMessage::Join {
            id: participant_id.clone(),
            name: name.clone(),
        };
        let joined = match join.encode() {
            Ok(bytes) => link.send(bytes.into()).await.is_ok(),
            Err(e) => {
                warn!(error = %e, "join encode failed");
                false
            }
        };
        if !joined {
            continue;
        }
        if cmd_tx
            .send(ParticipantCommand::LinkReady(link))
            .await
            .is_err()
        {
            return;
        }
        pump_events(&mut events, &cmd_tx, &cancel).await;
        if cmd_tx.send(ParticipantCommand::LinkLost).await.is_err() {
            return;
        }
    }
}

/// Wait for a dialable offer on an active search. Consumed offers get
/// a superseding advertisement, so sightings are de-duplicated on
/// `advert_id` to avoid re-dialing a retired offer.
async fn find_offer(
    discovery: &mut Discovery,
    seen_adverts: &mut HashSet<String>,
    cancel: &CancellationToken,
) -> Result<Offer> {
    loop {
        let sighting = tokio::select! {
            _ = cancel.cancelled() => None,
            sighting = discovery.recv() => sighting,
        };
        let Some(sighting) = sighting else {
            return Err(Error::SessionClosed);
        };
        if !seen_adverts.insert(sighting.advert.advert_id.clone()) {
            continue;
        }
        let Some(raw) = sighting.advert.metadata.get(META_OFFER) else {
            debug!(from = %sighting.from, "advertisement without an offer");
            continue;
        };
        match Offer::from_json(raw) {
            Ok(offer) => return Ok(offer),
            Err(e) => {
                warn!(from = %sighting.from, error = %e, "undecodable offer");
            }
        }
    }
}

async fn pump_events(
    events: &mut mpsc::Receiver<LinkEvent>,
    cmd_tx: &mpsc::Sender<ParticipantCommand>,
    cancel: &CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Some(LinkEvent::Open) => {}
            Some(LinkEvent::Message(bytes)) => {
                let message = match RoomMessage::decode(&bytes) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "malformed message dropped");
                        continue;
                    }
                };
                if cmd_tx
                    .send(ParticipantCommand::Inbound(message))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some(LinkEvent::Closed) | None => return,
        }
    }
}
