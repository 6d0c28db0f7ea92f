//! Many concurrent sends in both directions with randomized sizes and
//! interleaving.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sockflow_core::{
    FramingConfig, IdentityTransform, MessageSerializer, PayloadTransform, RawSerializer,
    XorTransform,
};
use sockflow_net::ClientConnection;

use common::{connect_client, small_pool, start_server, wait_until, Event, Events};

const SENDERS: usize = 8;
const PER_SENDER: usize = 40;

/// `u32_le(index) ++ random bytes`, so every message is distinguishable.
fn messages(seed: u64) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..SENDERS * PER_SENDER)
        .map(|index| {
            let fill = match rng.random_range(0..10) {
                0 => 0,
                1..=6 => rng.random_range(1..512),
                _ => rng.random_range(512..48 * 1024),
            };
            let mut message = u32::try_from(index).unwrap().to_le_bytes().to_vec();
            message.extend((0..fill).map(|_| rng.random::<u8>()));
            message
        })
        .collect()
}

async fn send_concurrently(conn: &ClientConnection<Vec<u8>>, messages: &[Vec<u8>], seed: u64) {
    let mut tasks = Vec::new();
    for (sender, batch) in messages.chunks(PER_SENDER).enumerate() {
        let conn = conn.clone();
        let batch = batch.to_vec();
        let mut rng = StdRng::seed_from_u64(seed + sender as u64);
        let yields: Vec<u8> = (0..batch.len()).map(|_| rng.random_range(0..4)).collect();
        tasks.push(tokio::spawn(async move {
            for (message, yields) in batch.iter().zip(yields) {
                conn.send(message).unwrap();
                for _ in 0..yields {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

async fn collect(events: &mut Events<Vec<u8>>, count: usize) -> BTreeMap<u32, Vec<u8>> {
    let mut received = BTreeMap::new();
    while received.len() < count {
        match events.next().await {
            Event::Message(message) => {
                let index = u32::from_le_bytes(message[..4].try_into().unwrap());
                assert!(
                    received.insert(index, message).is_none(),
                    "message {index} delivered twice"
                );
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    received
}

fn assert_intact(sent: &[Vec<u8>], received: &BTreeMap<u32, Vec<u8>>) {
    assert_eq!(received.len(), sent.len());
    for (index, message) in sent.iter().enumerate() {
        let got = &received[&u32::try_from(index).unwrap()];
        assert_eq!(got.len(), message.len(), "message {index} length");
        assert!(got == message, "message {index} corrupted");
    }
}

async fn echo_round(transform: Arc<dyn PayloadTransform>, seed: u64) {
    let serializer: Arc<dyn MessageSerializer<Vec<u8>>> = Arc::new(RawSerializer);
    let framing = FramingConfig::default();
    let mut server = start_server(
        Arc::clone(&serializer),
        Arc::clone(&transform),
        framing.clone(),
        true,
    );
    let pool = small_pool();
    let (client, mut events) =
        connect_client(&pool, serializer, transform, framing, server.addr).await;

    let sent = messages(seed);
    send_concurrently(&client, &sent, seed).await;

    let echoed = collect(&mut events, sent.len()).await;
    assert_intact(&sent, &echoed);

    let mut seen_by_server = BTreeMap::new();
    while seen_by_server.len() < sent.len() {
        if let Event::Message(message) = server.events.next().await {
            let index = u32::from_le_bytes(message[..4].try_into().unwrap());
            seen_by_server.insert(index, message);
        }
    }
    assert_intact(&sent, &seen_by_server);

    client.disconnect().unwrap();
    wait_until("client contexts returned", || {
        pool.idle_count() == pool.total_created()
    })
    .await;
    assert!(pool.total_created() >= 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_echo_delivers_every_message_intact() {
    echo_round(Arc::new(IdentityTransform), 0x5EED).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_echo_with_xor_transform() {
    echo_round(Arc::new(XorTransform::default()), 0xC0FFEE).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_reaches_every_client() {
    let serializer: Arc<dyn MessageSerializer<Vec<u8>>> = Arc::new(RawSerializer);
    let transform: Arc<dyn PayloadTransform> = Arc::new(IdentityTransform);
    let framing = FramingConfig::default();
    let server = start_server(
        Arc::clone(&serializer),
        Arc::clone(&transform),
        framing.clone(),
        false,
    );
    let pool = small_pool();

    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(
            connect_client(
                &pool,
                Arc::clone(&serializer),
                Arc::clone(&transform),
                framing.clone(),
                server.addr,
            )
            .await,
        );
    }
    wait_until("all clients registered", || server.registry.count() == 4).await;

    let sent = messages(7);
    let registry = Arc::clone(&server.registry);
    let broadcasts = {
        let sent = sent.clone();
        tokio::spawn(async move {
            for message in &sent {
                assert_eq!(registry.broadcast(message), 4);
                tokio::task::yield_now().await;
            }
        })
    };
    broadcasts.await.unwrap();

    for (_client, events) in &mut clients {
        let received = collect(events, sent.len()).await;
        assert_intact(&sent, &received);
    }
}
