//! End-to-end transfers over real loopback UDP: server and fetch
//! coordinator in one process, exercising the full wire format, RaptorQ
//! block pipeline, convergence protocol, and keep-alive semantics.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use cmb_cli::client::{fetch, FlowSpec};
use cmb_cli::server::{ServedResource, Server};
use cmb_transport::resource::ResourceId;
use cmb_transport::timestamp::Timestamp;
use cmb_transport::wire::{Packet, RequestResource};
use cmb_transport::{BLOCK_SIZE, MAX_DATAGRAM_SIZE};

/// Deterministic filler so hash mismatches would be caught.
fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

/// Spawn a server for `data` on `endpoints` loopback sockets.
async fn start_server(data: &[u8], endpoints: usize) -> (ResourceId, Vec<SocketAddr>) {
    let resource = ServedResource::prepare(data);
    let addresses: Vec<SocketAddr> = (0..endpoints)
        .map(|_| "127.0.0.1:0".parse().unwrap())
        .collect();
    let server = Server::bind(resource, &addresses).await.unwrap();
    let resource_id = server.resource_id;
    let local = server.local_addrs();
    tokio::spawn(server.run());
    (resource_id, local)
}

fn forward_flow(address: SocketAddr, sending_rate: u32) -> FlowSpec {
    FlowSpec {
        address,
        sending_rate,
        reverse: false,
    }
}

#[tokio::test(flavor = "current_thread")]
async fn tiny_forward_transfer() {
    let data = b"hello".to_vec();
    let (resource_id, addrs) = start_server(&data, 1).await;

    let fetched = timeout(
        Duration::from_secs(10),
        fetch(resource_id, vec![forward_flow(addrs[0], 1_000_000)]),
    )
    .await
    .expect("tiny transfer must not hang")
    .unwrap();
    assert_eq!(fetched, data);
}

#[tokio::test(flavor = "current_thread")]
async fn exact_block_boundary_transfer() {
    // Exactly one full block of zeros.
    let data = vec![0u8; BLOCK_SIZE];
    let (resource_id, addrs) = start_server(&data, 1).await;

    let fetched = timeout(
        Duration::from_secs(20),
        fetch(resource_id, vec![forward_flow(addrs[0], 1_000_000)]),
    )
    .await
    .expect("single-block transfer must not hang")
    .unwrap();
    assert_eq!(fetched, data);
}

#[tokio::test(flavor = "current_thread")]
async fn odd_sized_transfers_roundtrip() {
    for len in [1usize, 511, 512, 513, BLOCK_SIZE - 1, BLOCK_SIZE + 1] {
        let data = patterned(len);
        let (resource_id, addrs) = start_server(&data, 1).await;
        let fetched = timeout(
            Duration::from_secs(20),
            fetch(resource_id, vec![forward_flow(addrs[0], 1_000_000)]),
        )
        .await
        .unwrap_or_else(|_| panic!("transfer of {len} bytes hung"))
        .unwrap();
        assert_eq!(fetched, data, "length {len}");
    }
}

#[tokio::test(flavor = "current_thread")]
async fn empty_resource_fetches_empty() {
    let (resource_id, addrs) = start_server(&[], 1).await;
    let fetched = timeout(
        Duration::from_secs(5),
        fetch(resource_id, vec![forward_flow(addrs[0], 1_000_000)]),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(fetched.is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn two_flow_convergence() {
    // Six blocks fetched from two provider endpoints, forward and reverse.
    let data = patterned(6 * BLOCK_SIZE);
    let (resource_id, addrs) = start_server(&data, 2).await;

    let flows = vec![
        FlowSpec {
            address: addrs[0],
            sending_rate: 250_000,
            reverse: false,
        },
        FlowSpec {
            address: addrs[1],
            sending_rate: 250_000,
            reverse: true,
        },
    ];
    let fetched = timeout(Duration::from_secs(60), fetch(resource_id, flows))
        .await
        .expect("two-flow transfer must not hang")
        .unwrap();
    assert_eq!(fetched.len(), data.len());
    assert_eq!(fetched, data);
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_resource_fails_fast() {
    let served = patterned(BLOCK_SIZE);
    let (_, addrs) = start_server(&served, 1).await;

    // Ask for a resource the server does not hold.
    let unknown = ResourceId::of(b"something else entirely");
    let result = timeout(
        Duration::from_secs(5),
        fetch(unknown, vec![forward_flow(addrs[0], 1_000_000)]),
    )
    .await
    .expect("rejection must arrive quickly");
    assert!(result.is_err(), "fetch of an unknown resource must fail");
}

#[tokio::test(flavor = "current_thread")]
async fn keepalive_timeout_closes_server_flow() {
    let data = patterned(4 * BLOCK_SIZE);
    let (resource_id, addrs) = start_server(&data, 1).await;

    // Handshake once, then go silent: no ACKs, no further keep-alives.
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(addrs[0]).await.unwrap();
    let request = RequestResource {
        timestamp: Timestamp::now(),
        sending_rate: 250_000,
        range_start: 1,
        resource_id,
        range_end: 5,
    };
    socket
        .send(&Packet::RequestResource(request).encode())
        .await
        .unwrap();

    // Data must arrive while the flow is alive.
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let first = timeout(Duration::from_secs(1), socket.recv(&mut buf)).await;
    assert!(first.is_ok(), "provider must start sending after the request");

    // The flow times out 4 heartbeat intervals (1s) after the last
    // keep-alive. Well past that, the stream must have stopped.
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    let mut drained = 0;
    while timeout(Duration::from_millis(10), socket.recv(&mut buf))
        .await
        .is_ok()
    {
        drained += 1;
        assert!(drained < 10_000, "stale datagrams should be bounded");
    }
    let late = timeout(Duration::from_millis(500), socket.recv(&mut buf)).await;
    assert!(
        late.is_err(),
        "provider flow must stop sending after the keep-alive timeout"
    );
}

/// UDP proxy dropping every fifth provider→fetcher datagram, counting
/// fetcher→provider NACKs.
async fn lossy_proxy(
    upstream: SocketAddr,
) -> (SocketAddr, tokio::sync::oneshot::Receiver<u64>) {
    let client_side = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = client_side.local_addr().unwrap();
    let server_side = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    server_side.connect(upstream).await.unwrap();

    let (nack_tx, nack_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let mut client_addr: Option<SocketAddr> = None;
        let mut down_count = 0u64;
        let mut nacks = 0u64;
        let mut nack_tx = Some(nack_tx);
        let mut up_buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut down_buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                received = client_side.recv_from(&mut up_buf) => {
                    let Ok((len, from)) = received else { continue };
                    client_addr = Some(from);
                    // 0xCB03 = NackBlock.
                    if len >= 2 && up_buf[0] == 0xCB && up_buf[1] == 0x03 {
                        nacks += 1;
                        if nacks == 1 {
                            if let Some(tx) = nack_tx.take() {
                                let _ = tx.send(nacks);
                            }
                        }
                    }
                    let _ = server_side.send(&up_buf[..len]).await;
                }
                received = server_side.recv(&mut down_buf) => {
                    let Ok(len) = received else { continue };
                    down_count += 1;
                    // Drop every fifth datagram toward the fetcher.
                    if down_count % 5 == 0 {
                        continue;
                    }
                    if let Some(addr) = client_addr {
                        let _ = client_side.send_to(&down_buf[..len], addr).await;
                    }
                }
            }
        }
    });
    (proxy_addr, nack_rx)
}

#[tokio::test(flavor = "current_thread")]
async fn transfer_survives_twenty_percent_loss() {
    let data = patterned(8 * BLOCK_SIZE);
    let (resource_id, addrs) = start_server(&data, 1).await;
    let (proxy_addr, nack_rx) = lossy_proxy(addrs[0]).await;

    let fetched = timeout(
        Duration::from_secs(120),
        fetch(resource_id, vec![forward_flow(proxy_addr, 1_000_000)]),
    )
    .await
    .expect("lossy transfer must still complete")
    .unwrap();
    assert_eq!(fetched, data);

    let nacks = timeout(Duration::from_millis(100), nack_rx).await;
    assert!(
        matches!(nacks, Ok(Ok(n)) if n >= 1),
        "sustained loss must provoke at least one NACK"
    );
}
