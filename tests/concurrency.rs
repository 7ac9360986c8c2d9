//! Governor bound, backpressure and out-of-order replies under load

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use opwire::config::{NetworkConfig, TransportKind};
use opwire::core::codec::PackCodec;
use opwire::core::packet::{OpCode, Pack};
use opwire::error::Result;
use opwire::protocol::{ReplyChannel, Router};
use opwire::service::{Engine, ServerBuilder, TcpClient};
use tokio::sync::Semaphore;

#[derive(Default)]
struct Sink {
    frames: Mutex<Vec<Bytes>>,
}

impl ReplyChannel for Sink {
    fn send<'a>(&'a self, frame: Bytes) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        })
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

fn pack(sequence_id: u32) -> Pack {
    Pack::new(OpCode(1000), sequence_id, Vec::new())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn governor_blocks_the_reader_when_exhausted() {
    let gate = Arc::new(Semaphore::new(0));
    let started = Arc::new(AtomicUsize::new(0));

    let (g, s) = (Arc::clone(&gate), Arc::clone(&started));
    let router = Router::builder()
        .handle(1000u16, move |_ctx| {
            let (gate, started) = (Arc::clone(&g), Arc::clone(&s));
            Box::pin(async move {
                started.fetch_add(1, Ordering::SeqCst);
                let _permit = gate.acquire().await.unwrap();
            })
        })
        .build();
    let engine = Engine::new(router, 2);
    let sink: Arc<dyn ReplyChannel> = Arc::new(Sink::default());

    for seq in 0..2 {
        engine.dispatch(pack(seq), Arc::clone(&sink), PackCodec::stream()).await.unwrap();
    }

    // N+1: the third message cannot be admitted while both units are held
    let third = tokio::time::timeout(
        Duration::from_millis(100),
        engine.dispatch(pack(2), Arc::clone(&sink), PackCodec::stream()),
    )
    .await;
    assert!(third.is_err(), "third dispatch should wait for a free unit");
    assert_eq!(engine.governor().available(), 0);

    gate.add_permits(1);
    tokio::time::timeout(
        Duration::from_secs(2),
        engine.dispatch(pack(3), Arc::clone(&sink), PackCodec::stream()),
    )
    .await
    .expect("admitted once a unit is released")
    .unwrap();

    gate.add_permits(10);
    assert!(engine.drain(Duration::from_secs(2)).await);
    assert_eq!(started.load(Ordering::SeqCst), 3);
    assert_eq!(engine.governor().available(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_handlers_never_exceed_capacity() {
    const CAPACITY: usize = 4;
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
    let router = Router::builder()
        .handle(1000u16, move |ctx| {
            let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
            Box::pin(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                let _ = ctx.write(Vec::new()).await;
            })
        })
        .build();
    let engine = Arc::new(Engine::new(router, CAPACITY));

    let mut readers = Vec::new();
    for reader in 0..8u32 {
        let engine = Arc::clone(&engine);
        readers.push(tokio::spawn(async move {
            let sink: Arc<dyn ReplyChannel> = Arc::new(Sink::default());
            for i in 0..50u32 {
                engine
                    .dispatch(pack(reader * 1000 + i), Arc::clone(&sink), PackCodec::stream())
                    .await
                    .unwrap();
            }
        }));
    }
    for reader in readers {
        reader.await.unwrap();
    }

    assert!(engine.drain(Duration::from_secs(5)).await);
    assert!(peak.load(Ordering::SeqCst) <= CAPACITY);
    assert_eq!(engine.metrics().snapshot().frames_sent, 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pipelined_replies_correlate_by_sequence_id() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.address = "127.0.0.1:0".to_string();
        c.server.transport = TransportKind::Tcp;
        c.server.worker_capacity = 16;
        c.server.shutdown_grace = Duration::from_millis(500);
    });

    // earlier requests sleep longer, so replies come back reversed
    let running = ServerBuilder::new(config)
        .handle(1000u16, |ctx| {
            Box::pin(async move {
                let delay = ctx.payload().first().copied().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(u64::from(delay) * 10)).await;
                let body = ctx.payload().to_vec();
                let _ = ctx.write(body).await;
            })
        })
        .build()
        .unwrap()
        .bind()
        .await
        .unwrap();

    let mut client = TcpClient::connect(&running.local_addr().to_string()).await.unwrap();
    let mut sent = HashSet::new();
    for delay in (0..5u8).rev() {
        sent.insert(client.send(OpCode(1000), vec![delay]).await.unwrap());
    }

    let mut received = HashSet::new();
    let mut order = Vec::new();
    for _ in 0..5 {
        let reply = client.recv().await.unwrap();
        order.push(reply.sequence_id());
        received.insert(reply.sequence_id());
    }

    assert_eq!(sent, received);
    assert_ne!(order, vec![1, 2, 3, 4, 5], "replies should not be forced into request order");

    running.shutdown().await.unwrap();
}
