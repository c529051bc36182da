//! # Fetch Coordinator
//!
//! Opens one or two fetcher flows against provider endpoints, stores decoded
//! blocks into a slot-per-block store, relays each flow's deliveries to the
//! opposite flow so the two ranges converge, and verifies the content hash
//! once every slot is filled.
//!
//! Flow tasks hold no reference to the coordinator: deliveries travel over a
//! channel, and convergence notifications travel back over a per-flow stop
//! channel, so either side can shut down without the other noticing more
//! than a closed channel.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use cmb_transport::fetcher::{FetcherAction, FetcherConfig, FetcherFlow};
use cmb_transport::loss::{DataOutcome, TfrcReceiver};
use cmb_transport::resource::ResourceId;
use cmb_transport::seqnum::SequenceNumber;
use cmb_transport::timestamp::Timestamp;
use cmb_transport::wire::Packet;
use cmb_transport::{MAX_DATAGRAM_SIZE, MAX_TRANSMISSION_UNIT};

/// Grace period for a flow to flush its final packets before hard cancel.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// One flow of a fetch: where to connect and how to iterate.
#[derive(Debug, Clone, Copy)]
pub struct FlowSpec {
    pub address: SocketAddr,
    pub sending_rate: u32,
    pub reverse: bool,
}

/// How a flow task ended.
#[derive(Debug)]
enum FlowEnd {
    /// Range empty: every owed block was delivered (by us or the opposite).
    Completed,
    /// Provider answered with a fatal error.
    ResourceNotFound,
    /// Cancelled by the coordinator.
    Cancelled,
}

/// A block delivered by one flow.
struct Delivery {
    flow_index: usize,
    block_id: u64,
    data: Bytes,
}

/// Fetch the resource over the given flows and return its bytes, verified
/// against the resource id's content hash.
pub async fn fetch(resource_id: ResourceId, flows: Vec<FlowSpec>) -> Result<Vec<u8>> {
    let block_count = resource_id.number_of_blocks() as usize;
    let mut blocks: Vec<Option<Bytes>> = vec![None; block_count];

    let cancel = CancellationToken::new();
    let (delivery_tx, mut delivery_rx) = mpsc::channel::<Delivery>(16);
    let mut stop_txs = Vec::new();
    let mut tasks = JoinSet::new();

    for (flow_index, spec) in flows.iter().enumerate() {
        // Unbounded so the coordinator never blocks on a busy flow; the
        // message count is bounded by the block count anyway.
        let (stop_tx, stop_rx) = mpsc::unbounded_channel::<u64>();
        stop_txs.push(stop_tx);
        tasks.spawn(run_flow(
            flow_index,
            *spec,
            resource_id,
            delivery_tx.clone(),
            stop_rx,
            cancel.child_token(),
        ));
    }
    drop(delivery_tx);

    // Collect deliveries and cross-wire convergence until both flows end.
    // After a fatal error, cancelled flows get a grace window to flush
    // their last packets before being aborted outright.
    let far_future = tokio::time::Instant::now() + Duration::from_secs(3600);
    let mut grace_deadline = far_future;
    let mut fatal = false;
    let mut flows_running = flows.len();
    while flows_running > 0 {
        tokio::select! {
            _ = tokio::time::sleep_until(grace_deadline), if fatal => {
                tasks.abort_all();
                break;
            }
            delivery = delivery_rx.recv() => {
                if let Some(delivery) = delivery {
                    store_block(&mut blocks, &delivery)?;
                    // Shrink the opposite flow past this block.
                    for (other, stop_tx) in stop_txs.iter().enumerate() {
                        if other != delivery.flow_index {
                            let _ = stop_tx.send(delivery.block_id);
                        }
                    }
                }
            }
            joined = tasks.join_next() => {
                let Some(joined) = joined else { break };
                flows_running -= 1;
                match joined.context("flow task panicked")?? {
                    FlowEnd::Completed | FlowEnd::Cancelled => {}
                    FlowEnd::ResourceNotFound => {
                        fatal = true;
                        grace_deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
                        cancel.cancel();
                    }
                }
            }
        }
    }
    // Drain deliveries that raced with task completion.
    while let Ok(delivery) = delivery_rx.try_recv() {
        store_block(&mut blocks, &delivery)?;
    }

    if fatal {
        bail!("resource not found on provider");
    }

    let mut resource = Vec::with_capacity(resource_id.length() as usize);
    for (index, slot) in blocks.iter().enumerate() {
        match slot {
            Some(data) => resource.extend_from_slice(data),
            None => bail!("fetch incomplete: block {} missing", index + 1),
        }
    }
    if !resource_id.matches(&resource) {
        bail!("content hash mismatch after reassembly");
    }
    Ok(resource)
}

fn store_block(blocks: &mut [Option<Bytes>], delivery: &Delivery) -> Result<()> {
    let slot = (delivery.block_id as usize)
        .checked_sub(1)
        .and_then(|index| blocks.get_mut(index))
        .context("delivered block id out of range")?;
    // Each block id is produced by at most one flow; a filled slot can only
    // repeat the same bytes (duplicate delivery across the meeting point).
    if slot.is_none() {
        *slot = Some(delivery.data.clone());
    }
    Ok(())
}

/// One fetcher flow: socket, keep-alive loop, TFRC feedback, convergence.
async fn run_flow(
    flow_index: usize,
    spec: FlowSpec,
    resource_id: ResourceId,
    delivery_tx: mpsc::Sender<Delivery>,
    mut stop_rx: mpsc::UnboundedReceiver<u64>,
    cancel: CancellationToken,
) -> Result<FlowEnd> {
    let bind_addr: SocketAddr = if spec.address.is_ipv6() {
        "[::]:0".parse().expect("static address")
    } else {
        "0.0.0.0:0".parse().expect("static address")
    };
    let socket = UdpSocket::bind(bind_addr).await.context("bind flow socket")?;
    socket
        .connect(spec.address)
        .await
        .with_context(|| format!("connect to {}", spec.address))?;

    let config = FetcherConfig {
        sending_rate: spec.sending_rate,
        symbol_size: MAX_TRANSMISSION_UNIT as u16,
        reverse: spec.reverse,
    };
    let mut flow = FetcherFlow::new(resource_id, config);
    if flow.is_finished() {
        // Zero-block resource: nothing to request.
        return Ok(FlowEnd::Completed);
    }

    let mut tfrc = TfrcReceiver::new(MAX_TRANSMISSION_UNIT, Timestamp::now());
    let feedback_timer = crate::timer::Timer::new();
    let (feedback_fire_tx, mut feedback_fire_rx) = mpsc::unbounded_channel::<bool>();
    feedback_timer.subscribe(move |early| {
        let _ = feedback_fire_tx.send(early);
    });

    // Echo state for Feedback packets: the most recent Data's echoed
    // timestamp, its provider-side delay, and its arrival time.
    let mut last_data: Option<(Timestamp, u16, Timestamp)> = None;
    let mut arrival_seq = SequenceNumber::new(0);

    let mut keepalive_at = tokio::time::Instant::now();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(FlowEnd::Cancelled);
            }
            _ = tokio::time::sleep_until(keepalive_at) => {
                let keepalive = flow.keepalive(Timestamp::now());
                send(&socket, &Packet::RequestResource(keepalive)).await;
                let interval = flow.keepalive_interval();
                keepalive_at += interval;
                let now = tokio::time::Instant::now();
                if now > keepalive_at + interval {
                    // Re-anchor rather than bursting missed heartbeats.
                    keepalive_at = now;
                }
            }
            received = socket.recv(&mut buf) => {
                let len = match received {
                    Ok(len) => len,
                    Err(error) => {
                        // Connection-refused style errors on connected UDP
                        // say nothing reliable about provider liveness.
                        tracing::debug!(%error, "recv error ignored");
                        continue;
                    }
                };
                let packet = match Packet::decode(&buf[..len]) {
                    Ok(packet) => packet,
                    Err(error) => {
                        tracing::debug!(%error, "dropping undecodable datagram");
                        continue;
                    }
                };
                let now = Timestamp::now();
                match &packet {
                    Packet::Data(data) => {
                        last_data = Some((data.receiver_timestamp, data.delay, now));
                        flow.handle_data(data, now);
                        let seq = arrival_seq;
                        arrival_seq = arrival_seq.next();
                        match tfrc.on_data(seq, now, flow.rtt()) {
                            DataOutcome::SendInitialFeedback => {
                                send_feedback(&socket, &mut tfrc, &flow, &last_data).await;
                                feedback_timer.reset(feedback_interval(&flow));
                            }
                            DataOutcome::RestartTimer(interval) => {
                                send_feedback(&socket, &mut tfrc, &flow, &last_data).await;
                                feedback_timer.reset(interval);
                            }
                            DataOutcome::ExpediteFeedback => feedback_timer.expire(),
                            DataOutcome::Continue => {}
                        }
                    }
                    Packet::Error(error) => flow.handle_error(error),
                    other => {
                        tracing::debug!(kind = ?other.kind(), "ignoring provider-bound packet");
                    }
                }
                if let Some(end) = flush_actions(&socket, &mut flow, flow_index, &delivery_tx).await {
                    return Ok(end);
                }
            }
            fired = feedback_fire_rx.recv() => {
                if fired.is_some() {
                    send_feedback(&socket, &mut tfrc, &flow, &last_data).await;
                    feedback_timer.reset(feedback_interval(&flow));
                }
            }
            stopped = stop_rx.recv() => {
                if let Some(block_id) = stopped {
                    flow.on_opposite_block(block_id);
                    if let Some(end) =
                        flush_actions(&socket, &mut flow, flow_index, &delivery_tx).await
                    {
                        return Ok(end);
                    }
                }
            }
        }
    }
}

/// Feedback timer period: the current RTT estimate (RFC 5348 §6.2), with
/// the heartbeat ceiling as a fallback before any estimate exists.
fn feedback_interval(flow: &FetcherFlow) -> Duration {
    flow.rtt()
        .unwrap_or(cmb_transport::MAX_HEARTBEAT_INTERVAL)
        .max(Duration::from_millis(1))
}

async fn send(socket: &UdpSocket, packet: &Packet) {
    if let Err(error) = socket.send(&packet.encode()).await {
        tracing::debug!(%error, kind = ?packet.kind(), "send error ignored");
    }
}

async fn send_feedback(
    socket: &UdpSocket,
    tfrc: &mut TfrcReceiver,
    flow: &FetcherFlow,
    last_data: &Option<(Timestamp, u16, Timestamp)>,
) {
    let Some((echoed, provider_delay, arrived_at)) = *last_data else {
        return;
    };
    let now = Timestamp::now();
    let hold = now.duration_since(arrived_at) + Duration::from_millis(provider_delay as u64);
    let feedback = tfrc.build_feedback(echoed, hold, flow.rtt(), now);
    send(socket, &Packet::Feedback(feedback)).await;
}

/// Drain the flow's queued actions. Returns the flow's end state when a
/// shutdown or fatal action surfaces.
async fn flush_actions(
    socket: &UdpSocket,
    flow: &mut FetcherFlow,
    flow_index: usize,
    delivery_tx: &mpsc::Sender<Delivery>,
) -> Option<FlowEnd> {
    let actions: Vec<FetcherAction> = flow.drain_actions().collect();
    let mut end = None;
    for action in actions {
        match action {
            FetcherAction::Send(packet) => send(socket, &packet).await,
            FetcherAction::Deliver { block_id, data } => {
                let delivery = Delivery {
                    flow_index,
                    block_id,
                    data,
                };
                if delivery_tx.send(delivery).await.is_err() {
                    end = Some(FlowEnd::Cancelled);
                }
            }
            FetcherAction::Shutdown => {
                if end.is_none() {
                    end = Some(FlowEnd::Completed);
                }
            }
            FetcherAction::Fatal(code) => {
                tracing::error!(?code, "provider reported fatal error");
                end = Some(FlowEnd::ResourceNotFound);
            }
        }
    }
    end
}
