//! Local-network rendezvous.
//!
//! Maps a room code to reachable endpoints without a central server.
//! The host binds the well-known discovery port and answers probes;
//! searchers probe from an ephemeral port and collect [`Sighting`]s of
//! the host's [`Advertisement`]. The advertisement metadata is an
//! opaque key/value bag; the room layer stashes connection offers (or
//! whole JSON-encoded protocol messages) in it, which is the only
//! signaling channel available before a link exists.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use estimate_proto::id::generate_id;
use estimate_proto::RoomCode;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::{Error, Result};

/// Metadata key carrying a connection offer.
pub const META_OFFER: &str = "offer";

/// Metadata key carrying a connection answer.
pub const META_ANSWER: &str = "answer";

/// Metadata key carrying a JSON-encoded protocol message, for use as a
/// degraded signaling channel when no live link exists yet.
pub const META_MESSAGE: &str = "message";

/// Upper bound for probe and advertisement datagrams.
const MAX_DATAGRAM_BYTES: usize = 8192;

const SIGHTING_CHANNEL_CAPACITY: usize = 16;

/// Datagram sent by a searcher looking for a specific room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Probe {
    room_code: RoomCode,
}

/// A room endpoint advertisement as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    /// Identity of this advertisement. Consumers de-duplicate repeated
    /// sightings on it; a superseding advertisement gets a fresh one.
    pub advert_id: String,
    pub room_code: RoomCode,
    /// Opaque bag chosen by the layer above.
    pub metadata: HashMap<String, String>,
}

/// One observation of an advertisement.
#[derive(Debug, Clone)]
pub struct Sighting {
    pub advert: Advertisement,
    pub from: SocketAddr,
}

/// Rendezvous endpoint factory, configured once per session.
#[derive(Debug, Clone)]
pub struct Rendezvous {
    config: DiscoveryConfig,
}

impl Rendezvous {
    #[must_use]
    pub const fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Make this device discoverable under `room_code`.
    ///
    /// Binds the discovery port and answers matching probes with the
    /// current advertisement until the handle is stopped. Fails with
    /// [`Error::DiscoveryUnavailable`] when the port cannot be bound,
    /// in which case the session falls back to manual endpoint entry.
    pub async fn advertise(
        &self,
        room_code: RoomCode,
        metadata: HashMap<String, String>,
    ) -> Result<AdvertiseHandle> {
        let socket = UdpSocket::bind(("0.0.0.0", self.config.port))
            .await
            .map_err(|e| {
                Error::DiscoveryUnavailable(format!("bind port {}: {e}", self.config.port))
            })?;

        let advert = Advertisement {
            advert_id: generate_id(),
            room_code: room_code.clone(),
            metadata,
        };
        let (update_tx, update_rx) = watch::channel(advert);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(respond_loop(
            socket,
            room_code.clone(),
            update_rx,
            cancel.clone(),
        ));
        info!(room_code = %room_code, port = self.config.port, "advertising room");

        Ok(AdvertiseHandle {
            update_tx,
            cancel,
            task: Some(task),
        })
    }

    /// Search for advertisements of `room_code`.
    ///
    /// Probes the configured broadcast address on an interval and
    /// yields every matching sighting. Duplicate sightings of the same
    /// advertisement are not suppressed here; consumers de-duplicate
    /// on `advert_id`.
    pub async fn discover(&self, room_code: RoomCode) -> Result<Discovery> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| Error::DiscoveryUnavailable(e.to_string()))?;
        socket
            .set_broadcast(true)
            .map_err(|e| Error::DiscoveryUnavailable(e.to_string()))?;
        let target: SocketAddr = format!("{}:{}", self.config.broadcast_addr, self.config.port)
            .parse()
            .map_err(|e| Error::DiscoveryUnavailable(format!("broadcast address: {e}")))?;

        let (tx, rx) = mpsc::channel(SIGHTING_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(probe_loop(
            socket,
            room_code,
            target,
            self.config.probe_interval(),
            tx,
            cancel.clone(),
        ));

        Ok(Discovery {
            sightings: rx,
            cancel,
            task: Some(task),
        })
    }
}

/// Handle for an active advertisement.
pub struct AdvertiseHandle {
    update_tx: watch::Sender<Advertisement>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl AdvertiseHandle {
    /// Replace the advertised metadata.
    ///
    /// Supersedes the prior payload within one discovery cycle. The
    /// advertisement gets a fresh `advert_id` so consumers that
    /// de-duplicate on identity see the update as a new sighting.
    pub fn update(&self, metadata: HashMap<String, String>) {
        self.update_tx.send_modify(|advert| {
            advert.advert_id = generate_id();
            advert.metadata = metadata;
        });
    }

    /// Stop answering probes. The responder task has exited by the
    /// time this returns.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AdvertiseHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle for an active search.
pub struct Discovery {
    sightings: mpsc::Receiver<Sighting>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Discovery {
    /// Next sighting, or `None` once the search has stopped.
    pub async fn recv(&mut self) -> Option<Sighting> {
        self.sightings.recv().await
    }

    /// Stop probing. The prober task has exited by the time this
    /// returns.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn respond_loop(
    socket: UdpSocket,
    room_code: RoomCode,
    update_rx: watch::Receiver<Advertisement>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        let (len, from) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(error = %e, "probe receive failed");
                    continue;
                }
            },
        };
        let probe: Probe = match serde_json::from_slice(&buf[..len]) {
            Ok(probe) => probe,
            Err(e) => {
                debug!(from = %from, error = %e, "undecodable probe dropped");
                continue;
            }
        };
        // Only an exact room code match is answered.
        if probe.room_code != room_code {
            continue;
        }
        let payload = match serde_json::to_vec(&*update_rx.borrow()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "advertisement encode failed");
                continue;
            }
        };
        if let Err(e) = socket.send_to(&payload, from).await {
            debug!(to = %from, error = %e, "advertisement send failed");
        }
    }
    debug!(room_code = %room_code, "advertiser stopped");
}

async fn probe_loop(
    socket: UdpSocket,
    room_code: RoomCode,
    target: SocketAddr,
    interval: Duration,
    tx: mpsc::Sender<Sighting>,
    cancel: CancellationToken,
) {
    let probe = match serde_json::to_vec(&Probe {
        room_code: room_code.clone(),
    }) {
        Ok(probe) => probe,
        Err(e) => {
            warn!(error = %e, "probe encode failed");
            return;
        }
    };
    let mut ticker = tokio::time::interval(interval);
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&probe, target).await {
                    debug!(to = %target, error = %e, "probe send failed");
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        debug!(error = %e, "advertisement receive failed");
                        continue;
                    }
                };
                let advert: Advertisement = match serde_json::from_slice(&buf[..len]) {
                    Ok(advert) => advert,
                    Err(e) => {
                        debug!(from = %from, error = %e, "undecodable advertisement dropped");
                        continue;
                    }
                };
                // Sightings for other rooms are irrelevant, not errors.
                if advert.room_code != room_code {
                    continue;
                }
                if tx.send(Sighting { advert, from }).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!(room_code = %room_code, "search stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn test_config(port: u16) -> DiscoveryConfig {
        DiscoveryConfig {
            port,
            broadcast_addr: "127.0.0.1".to_string(),
            probe_interval_ms: 50,
        }
    }

    fn room(code: &str) -> RoomCode {
        code.parse().expect("valid room code")
    }

    #[tokio::test]
    async fn test_advertise_and_discover() {
        let rendezvous = Rendezvous::new(test_config(43311));
        let mut metadata = HashMap::new();
        metadata.insert(META_OFFER.to_string(), "offer-payload".to_string());

        let advert = rendezvous
            .advertise(room("ABCD2345"), metadata)
            .await
            .expect("advertise");
        let mut discovery = rendezvous
            .discover(room("ABCD2345"))
            .await
            .expect("discover");

        let sighting = timeout(Duration::from_secs(2), discovery.recv())
            .await
            .expect("sighting in time")
            .expect("search alive");
        assert_eq!(sighting.advert.room_code, room("ABCD2345"));
        assert_eq!(
            sighting.advert.metadata.get(META_OFFER).map(String::as_str),
            Some("offer-payload")
        );

        discovery.stop().await;
        advert.stop().await;
    }

    #[tokio::test]
    async fn test_room_code_must_match_exactly() {
        let rendezvous = Rendezvous::new(test_config(43312));
        let advert = rendezvous
            .advertise(room("ABCD2345"), HashMap::new())
            .await
            .expect("advertise");
        let mut discovery = rendezvous
            .discover(room("ZZZZ9999"))
            .await
            .expect("discover");

        // Several probe cycles pass without a sighting.
        let sighting = timeout(Duration::from_millis(300), discovery.recv()).await;
        assert!(sighting.is_err(), "must not sight a different room");

        discovery.stop().await;
        advert.stop().await;
    }

    #[tokio::test]
    async fn test_update_supersedes_advertisement() {
        let rendezvous = Rendezvous::new(test_config(43313));
        let mut metadata = HashMap::new();
        metadata.insert(META_OFFER.to_string(), "first".to_string());

        let advert = rendezvous
            .advertise(room("ABCD2345"), metadata)
            .await
            .expect("advertise");
        let mut discovery = rendezvous
            .discover(room("ABCD2345"))
            .await
            .expect("discover");

        let first = timeout(Duration::from_secs(2), discovery.recv())
            .await
            .expect("sighting in time")
            .expect("search alive");

        let mut updated = HashMap::new();
        updated.insert(META_OFFER.to_string(), "second".to_string());
        advert.update(updated);

        let superseding = timeout(Duration::from_secs(2), async {
            loop {
                let sighting = discovery.recv().await.expect("search alive");
                if sighting.advert.metadata.get(META_OFFER).map(String::as_str) == Some("second") {
                    return sighting;
                }
            }
        })
        .await
        .expect("superseding sighting in time");

        // A superseding advertisement is a new identity for de-duplication.
        assert_ne!(superseding.advert.advert_id, first.advert.advert_id);

        discovery.stop().await;
        advert.stop().await;
    }

    #[tokio::test]
    async fn test_port_conflict_is_discovery_unavailable() {
        let rendezvous = Rendezvous::new(test_config(43314));
        let advert = rendezvous
            .advertise(room("ABCD2345"), HashMap::new())
            .await
            .expect("advertise");

        let second = rendezvous.advertise(room("EFGH6789"), HashMap::new()).await;
        assert!(matches!(second, Err(Error::DiscoveryUnavailable(_))));

        advert.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_sightings_are_passed_through() {
        let rendezvous = Rendezvous::new(test_config(43315));
        let advert = rendezvous
            .advertise(room("ABCD2345"), HashMap::new())
            .await
            .expect("advertise");
        let mut discovery = rendezvous
            .discover(room("ABCD2345"))
            .await
            .expect("discover");

        // Each probe cycle produces another sighting of the same advertisement.
        let first = timeout(Duration::from_secs(2), discovery.recv())
            .await
            .expect("first sighting")
            .expect("search alive");
        let second = timeout(Duration::from_secs(2), discovery.recv())
            .await
            .expect("second sighting")
            .expect("search alive");
        assert_eq!(first.advert.advert_id, second.advert.advert_id);

        discovery.stop().await;
        advert.stop().await;
    }
}
