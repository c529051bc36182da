//! # Provider Runtime
//!
//! Binds one UDP socket per endpoint, routes datagrams to per-peer flow
//! tasks, and paces Data symbols at the fetcher-requested rate. Each flow
//! task owns its `ProviderFlow` state machine exclusively; the accept loop
//! only decodes and forwards packets, so per-flow handling stays serialized
//! in arrival order.

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use cmb_transport::coding::Encoder;
use cmb_transport::provider::{ProviderFlow, RequestOutcome};
use cmb_transport::resource::{block_byte_range, ResourceId};
use cmb_transport::tfrc::{FeedbackReport, TfrcSender};
use cmb_transport::timestamp::Timestamp;
use cmb_transport::wire::{Packet, PacketKind};
use cmb_transport::{MAX_DATAGRAM_SIZE, MAX_HEARTBEAT_INTERVAL, MAX_TRANSMISSION_UNIT};

/// Per-flow inbox depth; beyond this, back-pressure drops at the socket.
const FLOW_CHANNEL_DEPTH: usize = 64;

/// A resource prepared for serving: identity plus per-block encoders.
pub struct ServedResource {
    pub resource_id: ResourceId,
    encoders: Arc<BTreeMap<u64, Encoder>>,
}

impl ServedResource {
    /// Partition the resource into blocks and build one encoder per block.
    pub fn prepare(data: &[u8]) -> Self {
        let resource_id = ResourceId::of(data);
        let mut encoders = BTreeMap::new();
        for block_id in 1..=resource_id.number_of_blocks() {
            let (start, end) =
                block_byte_range(resource_id.length(), block_id).expect("block id in range");
            encoders.insert(
                block_id,
                Encoder::new(&data[start..end], MAX_TRANSMISSION_UNIT as u16),
            );
        }
        ServedResource {
            resource_id,
            encoders: Arc::new(encoders),
        }
    }
}

/// A bound provider ready to serve one resource on a set of endpoints.
pub struct Server {
    pub resource_id: ResourceId,
    encoders: Arc<BTreeMap<u64, Encoder>>,
    sockets: Vec<Arc<UdpSocket>>,
}

impl Server {
    /// Bind every endpoint. Fails fast on any bind error.
    pub async fn bind(resource: ServedResource, addresses: &[SocketAddr]) -> Result<Self> {
        let mut sockets = Vec::with_capacity(addresses.len());
        for address in addresses {
            let socket = UdpSocket::bind(address)
                .await
                .with_context(|| format!("failed to bind {address}"))?;
            tracing::info!(addr = %socket.local_addr()?, "listening");
            sockets.push(Arc::new(socket));
        }
        Ok(Server {
            resource_id: resource.resource_id,
            encoders: resource.encoders,
            sockets,
        })
    }

    /// Actual bound addresses (relevant when binding port 0).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect()
    }

    /// Serve until cancelled by the caller.
    pub async fn run(self) -> Result<()> {
        let mut accept_loops = tokio::task::JoinSet::new();
        for socket in &self.sockets {
            accept_loops.spawn(accept_loop(
                socket.clone(),
                self.resource_id,
                self.encoders.clone(),
            ));
        }
        // The accept loops only return if their socket dies.
        while accept_loops.join_next().await.is_some() {}
        Ok(())
    }
}

/// One socket's receive loop: decode, route to per-peer flows, accept new
/// peers on `RequestResource`.
async fn accept_loop(
    socket: Arc<UdpSocket>,
    resource_id: ResourceId,
    encoders: Arc<BTreeMap<u64, Encoder>>,
) {
    let flows: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Packet>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(error) => {
                // Connected-UDP style resets carry no routing information;
                // nothing to tear down.
                tracing::debug!(%error, "recv error ignored");
                continue;
            }
        };
        let packet = match Packet::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(error) => {
                tracing::debug!(%peer, %error, "dropping undecodable datagram");
                continue;
            }
        };

        let sender = flows.lock().unwrap().get(&peer).cloned();
        let sender = match sender {
            Some(sender) => sender,
            None => {
                // Only a RequestResource may open a flow.
                if packet.kind() != PacketKind::RequestResource {
                    tracing::debug!(%peer, kind = ?packet.kind(), "ignoring stray packet");
                    continue;
                }
                let (tx, rx) = mpsc::channel(FLOW_CHANNEL_DEPTH);
                tracing::debug!(%peer, "accepted flow");
                tokio::spawn(flow_task(
                    socket.clone(),
                    peer,
                    resource_id,
                    encoders.clone(),
                    rx,
                    flows.clone(),
                ));
                flows.lock().unwrap().insert(peer, tx.clone());
                tx
            }
        };
        if sender.send(packet).await.is_err() {
            flows.lock().unwrap().remove(&peer);
        }
    }
}

/// Per-peer provider flow: packet handling plus the paced sender loop.
async fn flow_task(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    resource_id: ResourceId,
    encoders: Arc<BTreeMap<u64, Encoder>>,
    mut inbox: mpsc::Receiver<Packet>,
    flows: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Packet>>>>,
) {
    let mut flow = ProviderFlow::new(resource_id, encoders);
    let mut tfrc = TfrcSender::new(MAX_TRANSMISSION_UNIT, Timestamp::now());
    let mut connected = false;
    let mut send_at = tokio::time::Instant::now();

    let done_reason = loop {
        // Keep-alive timeout: 4 heartbeat intervals of silence.
        if connected && flow.keepalive_elapsed(Timestamp::now()) > 4 * MAX_HEARTBEAT_INTERVAL {
            break "keep-alive timeout";
        }
        if connected && flow.is_complete() {
            break "complete";
        }

        tokio::select! {
            packet = inbox.recv() => {
                let Some(packet) = packet else { break "accept loop gone" };
                if handle_packet(&socket, peer, &mut flow, &mut tfrc, packet).await {
                    break "rejected";
                }
                if !connected && flow.state() == cmb_transport::provider::ProviderState::Connected {
                    connected = true;
                    send_at = tokio::time::Instant::now();
                }
            }
            _ = tokio::time::sleep_until(send_at), if connected => {
                match flow.next_symbol() {
                    Some((block_id, symbol)) => {
                        let data = flow.data_packet(block_id, symbol, Timestamp::now());
                        let datagram = Packet::Data(data).encode();
                        if let Err(error) = socket.send_to(&datagram, peer).await {
                            tracing::debug!(%peer, %error, "send error ignored");
                        }
                        // Constant-rate pacing at the requested sending rate.
                        let rate = flow.sending_rate().max(1);
                        let interval =
                            Duration::from_secs_f64(MAX_TRANSMISSION_UNIT as f64 / rate as f64);
                        send_at += interval;
                        let now = tokio::time::Instant::now();
                        if now > send_at + interval {
                            send_at = now;
                        }
                    }
                    None => break "complete",
                }
            }
            _ = tokio::time::sleep(MAX_HEARTBEAT_INTERVAL), if !connected => {
                // Idle tick so the keep-alive timeout is re-checked.
            }
        }
    };

    flows.lock().unwrap().remove(&peer);
    tracing::debug!(%peer, reason = done_reason, "flow closed");
}

/// Dispatch one packet into the flow. Returns `true` when the flow must shut
/// down (resource mismatch answered with an Error).
async fn handle_packet(
    socket: &UdpSocket,
    peer: SocketAddr,
    flow: &mut ProviderFlow,
    tfrc: &mut TfrcSender,
    packet: Packet,
) -> bool {
    let now = Timestamp::now();
    match packet {
        Packet::RequestResource(request) => {
            match flow.handle_request(&request, now) {
                RequestOutcome::Rejected(error) => {
                    let datagram = Packet::Error(error).encode();
                    if let Err(send_error) = socket.send_to(&datagram, peer).await {
                        tracing::debug!(%peer, %send_error, "error reply failed");
                    }
                    return true;
                }
                RequestOutcome::Connected | RequestOutcome::Refreshed | RequestOutcome::Ignored => {
                }
            }
        }
        Packet::AckBlock(ack) => flow.handle_ack(&ack),
        Packet::NackBlock(nack) => flow.handle_nack(&nack),
        Packet::ShrinkRange(shrink) => flow.handle_shrink(&shrink),
        Packet::Feedback(feedback) => {
            tfrc.handle_feedback(
                FeedbackReport {
                    timestamp: feedback.timestamp,
                    delay: Duration::from_millis(feedback.delay as u64),
                    receive_rate: feedback.receive_rate as f64,
                    loss_event_rate: feedback.loss_event_rate as f64,
                },
                now,
            );
            let allowed = tfrc.allowed_sending_rate();
            if allowed < flow.sending_rate() as f64 {
                tracing::debug!(
                    allowed = allowed as u64,
                    requested = flow.sending_rate(),
                    "tfrc rate below requested rate"
                );
            }
        }
        Packet::Data(_) | Packet::Error(_) => {
            tracing::debug!(%peer, "unexpected fetcher-bound packet dropped");
        }
    }
    false
}
