//! Transport links between host and participants.
//!
//! A link is a bidirectional, ordered, reliable message channel between
//! exactly two endpoints, established by an offer/answer exchange:
//! the host opens a listener and embeds the [`Offer`] in its
//! advertisement; a participant consumes the offer, dials it, and
//! relays the [`Answer`] as the first frame on the dialed connection.
//! The link opens on both sides once the host acknowledges the answer.
//!
//! Framing is length-delimited over TCP. Lifecycle events arrive on a
//! single channel in order: `Open`, then messages, then `Closed`;
//! nothing is delivered after `Closed`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use estimate_proto::id::generate_id;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Identity of one host↔participant link, minted with the offer.
pub type LinkId = String;

/// Capacity of the per-link outbound and event channels.
const LINK_CHANNEL_CAPACITY: usize = 64;

/// Connection offer, generated by the host before advertising so it
/// can ride inside the advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub link_id: LinkId,
    pub addr: SocketAddr,
}

impl Offer {
    /// Encode for the advertisement metadata bag.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Handshake(e.to_string()))
    }

    /// Decode from advertisement metadata.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Handshake(e.to_string()))
    }
}

/// Connection answer, relayed back to the host to complete the
/// handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub link_id: LinkId,
    /// Identity of the answering device, informational.
    pub peer: String,
}

/// Host acknowledgement that completes the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct HandshakeAck {
    link_id: LinkId,
}

/// Link lifecycle events. No `Message` before `Open`; nothing after
/// `Closed`.
#[derive(Debug)]
pub enum LinkEvent {
    Open,
    Message(Bytes),
    Closed,
}

/// Link state machine. `Closed` is terminal and reachable from any
/// state on transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Created,
    OfferPending,
    Open,
    Closed,
}

/// An established link endpoint.
pub struct Link {
    link_id: LinkId,
    outbound: mpsc::Sender<Bytes>,
    events: Option<mpsc::Receiver<LinkEvent>>,
    state: Arc<RwLock<LinkState>>,
    cancel: CancellationToken,
}

impl Link {
    #[must_use]
    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state.read()
    }

    /// Take the event receiver (can only be called once).
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<LinkEvent>> {
        self.events.take()
    }

    /// Send one message to the peer. Delivery is in-order and
    /// exactly-once while the link stays open.
    pub async fn send(&self, bytes: Bytes) -> Result<()> {
        if self.state() != LinkState::Open {
            return Err(Error::LinkNotOpen);
        }
        self.outbound
            .send(bytes)
            .await
            .map_err(|_| Error::LinkNotOpen)
    }

    /// Queue one message without waiting. A full queue means the peer
    /// has stopped draining its socket; callers treat that the same as
    /// a closed link.
    pub fn try_send(&self, bytes: Bytes) -> Result<()> {
        if self.state() != LinkState::Open {
            return Err(Error::LinkNotOpen);
        }
        self.outbound
            .try_send(bytes)
            .map_err(|_| Error::LinkNotOpen)
    }

    /// Close the link. The `Closed` event is emitted once the IO task
    /// winds down.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Host-side pending offer: a bound listener waiting for the answer.
pub struct Listener {
    offer: Offer,
    inner: TcpListener,
}

impl Listener {
    /// Lifecycle position of this endpoint: the offer is out, the
    /// handshake has not completed.
    #[must_use]
    pub const fn state(&self) -> LinkState {
        LinkState::OfferPending
    }

    /// Bind a listener and mint the offer to advertise for it.
    pub async fn open_as_host() -> Result<(Offer, Self)> {
        let inner = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let port = inner.local_addr()?.port();
        let offer = Offer {
            link_id: generate_id(),
            addr: SocketAddr::new(local_ip(), port),
        };
        debug!(link_id = %offer.link_id, addr = %offer.addr, "offer pending");
        Ok((offer.clone(), Self { offer, inner }))
    }

    /// Wait for a participant to answer this listener's offer.
    ///
    /// Connections that present no answer, an undecodable answer, or an
    /// answer for a different offer are refused and the wait continues.
    pub async fn accept(self) -> Result<Link> {
        loop {
            let (stream, peer_addr) = self.inner.accept().await?;
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            let answer = match framed.next().await {
                Some(Ok(bytes)) => match serde_json::from_slice::<Answer>(&bytes) {
                    Ok(answer) => answer,
                    Err(e) => {
                        warn!(peer = %peer_addr, error = %e, "invalid answer frame, connection refused");
                        continue;
                    }
                },
                Some(Err(e)) => {
                    debug!(peer = %peer_addr, error = %e, "read failed before answer");
                    continue;
                }
                None => {
                    debug!(peer = %peer_addr, "connection closed before answer");
                    continue;
                }
            };
            if answer.link_id != self.offer.link_id {
                warn!(
                    peer = %peer_addr,
                    link_id = %answer.link_id,
                    "answer does not match the pending offer, connection refused"
                );
                continue;
            }
            let ack = serde_json::to_vec(&HandshakeAck {
                link_id: self.offer.link_id.clone(),
            })
            .map_err(|e| Error::Handshake(e.to_string()))?;
            if let Err(e) = framed.send(Bytes::from(ack)).await {
                warn!(peer = %peer_addr, error = %e, "acknowledgement send failed, connection refused");
                continue;
            }
            debug!(peer = %peer_addr, link_id = %self.offer.link_id, "link open");
            return Ok(spawn_link(self.offer.link_id.clone(), framed));
        }
    }
}

/// Consume a discovered offer: dial it, relay the answer, and wait for
/// the host's acknowledgement before declaring the link open.
pub async fn connect_as_participant(offer: &Offer, peer: &str) -> Result<(Answer, Link)> {
    let stream = TcpStream::connect(offer.addr).await?;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let answer = Answer {
        link_id: offer.link_id.clone(),
        peer: peer.to_string(),
    };
    let bytes = serde_json::to_vec(&answer).map_err(|e| Error::Handshake(e.to_string()))?;
    framed.send(Bytes::from(bytes)).await?;

    match framed.next().await {
        Some(Ok(bytes)) => {
            let ack: HandshakeAck = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Handshake(e.to_string()))?;
            if ack.link_id != offer.link_id {
                return Err(Error::Handshake(
                    "acknowledgement for a different offer".to_string(),
                ));
            }
        }
        Some(Err(e)) => return Err(Error::Io(e)),
        None => {
            return Err(Error::Handshake(
                "connection closed before acknowledgement".to_string(),
            ))
        }
    }

    debug!(link_id = %offer.link_id, addr = %offer.addr, "link open");
    Ok((answer, spawn_link(offer.link_id.clone(), framed)))
}

fn spawn_link(link_id: LinkId, framed: Framed<TcpStream, LengthDelimitedCodec>) -> Link {
    let (outbound_tx, outbound_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
    let (event_tx, event_rx) = mpsc::channel(LINK_CHANNEL_CAPACITY);
    let state = Arc::new(RwLock::new(LinkState::Open));
    let cancel = CancellationToken::new();
    tokio::spawn(io_loop(
        framed,
        outbound_rx,
        event_tx,
        state.clone(),
        cancel.clone(),
    ));
    Link {
        link_id,
        outbound: outbound_tx,
        events: Some(event_rx),
        state,
        cancel,
    }
}

async fn io_loop(
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    mut outbound: mpsc::Receiver<Bytes>,
    events: mpsc::Sender<LinkEvent>,
    state: Arc<RwLock<LinkState>>,
    cancel: CancellationToken,
) {
    // Open is the first event on the channel; nothing precedes it.
    if events.send(LinkEvent::Open).await.is_err() {
        *state.write() = LinkState::Closed;
        return;
    }
    let (mut sink, mut stream) = framed.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => match frame {
                Some(Ok(bytes)) => {
                    if events.send(LinkEvent::Message(bytes.freeze())).await.is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!(error = %e, "link read failed");
                    break;
                }
                None => break,
            },
            item = outbound.recv() => match item {
                Some(bytes) => {
                    if let Err(e) = sink.send(bytes).await {
                        debug!(error = %e, "link write failed");
                        break;
                    }
                }
                None => break,
            },
        }
    }
    // Flush whatever was queued before announcing the close.
    outbound.close();
    while let Ok(bytes) = outbound.try_recv() {
        if sink.send(bytes).await.is_err() {
            break;
        }
    }
    *state.write() = LinkState::Closed;
    let _ = events.send(LinkEvent::Closed).await;
}

/// Routable local address to put in an offer. Opening a UDP socket
/// towards a public address selects the outbound interface without
/// sending anything; loopback is the offline fallback.
fn local_ip() -> IpAddr {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.connect("8.8.8.8:80").map(|()| s))
        .and_then(|s| s.local_addr())
        .map_or(IpAddr::V4(Ipv4Addr::LOCALHOST), |addr| addr.ip())
}
