//! End-to-end fan-out benchmark for Podium.
//!
//! Opens N live connections subscribed to one leaderboard, submits scores
//! over the HTTP API, and counts `entry_update` frames arriving at the
//! clients.
//!
//! ```bash
//! podium &
//! e2e_fanout 64 127.0.0.1:8080
//! ```

use futures_util::{SinkExt, StreamExt};
use podium_protocol::{codec, MessageType};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;
const PLAYERS: u64 = 1000;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let addr = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());

    println!("Podium end-to-end fan-out benchmark");
    println!("  server: {addr}, clients: {num_clients}");
    println!("  warmup: {WARMUP_SECS}s, measurement: {BENCH_SECS}s");
    println!();

    if let Err(e) = run(num_clients, &addr).await {
        eprintln!("Benchmark failed: {e}");
        std::process::exit(1);
    }
}

async fn run(num_clients: usize, addr: &str) -> Result<(), BoxError> {
    let (status, created) = http(
        addr,
        "POST",
        "/api/v1/leaderboards",
        Some(json!({ "name": "e2e-bench" })),
    )
    .await?;
    let id = created["data"]["id"]
        .as_str()
        .ok_or_else(|| format!("create leaderboard failed with {status}: {created}"))?
        .to_string();
    println!("Created leaderboard {id}");

    let received = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));
    let mut clients = Vec::with_capacity(num_clients);
    for client_id in 0..num_clients {
        let url = format!("ws://{addr}/ws?userId=bench-{client_id}");
        let topic = format!("leaderboard:{id}");
        let received = received.clone();
        let barrier = barrier.clone();
        clients.push(tokio::spawn(async move {
            if let Err(e) = run_client(&url, &topic, received, barrier).await {
                eprintln!("Client {client_id} error: {e}");
            }
        }));
    }

    barrier.wait().await;
    println!("All {num_clients} clients subscribed");

    let submitted = Arc::new(AtomicU64::new(0));
    let loader = {
        let addr = addr.to_string();
        let submitted = submitted.clone();
        tokio::spawn(async move {
            let mut i = 0u64;
            loop {
                let body = json!({ "entryId": format!("player-{}", i % PLAYERS), "score": i });
                let path = format!("/api/v1/leaderboards/{id}/score");
                match http(&addr, "POST", &path, Some(body)).await {
                    Ok((200, _)) => {
                        submitted.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok((status, body)) => eprintln!("Score rejected with {status}: {body}"),
                    Err(e) => eprintln!("Score request failed: {e}"),
                }
                i += 1;
            }
        })
    };

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;
    received.store(0, Ordering::SeqCst);
    submitted.store(0, Ordering::SeqCst);
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;
    let elapsed = start.elapsed().as_secs_f64();
    let delivered = received.load(Ordering::SeqCst);
    let scores = submitted.load(Ordering::SeqCst);

    loader.abort();
    for client in clients {
        client.abort();
    }

    println!();
    println!("Results");
    println!("  scores submitted:   {scores:>10} ({:.0}/s)", scores as f64 / elapsed);
    println!(
        "  updates delivered:  {delivered:>10} ({:.0}/s)",
        delivered as f64 / elapsed
    );
    if scores > 0 {
        println!(
            "  delivery ratio:     {:>10.3}",
            delivered as f64 / (scores as f64 * num_clients as f64)
        );
    }
    Ok(())
}

async fn run_client(
    url: &str,
    topic: &str,
    received: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(url).await?;
    let (mut sender, mut receiver) = ws.split();

    let subscribe = json!({ "type": "subscribe", "topic": topic }).to_string();
    sender.send(Message::Text(subscribe)).await?;

    // Wait for the acknowledgement before counting.
    while let Some(message) = receiver.next().await {
        if let Message::Text(text) = message? {
            let envelope = codec::decode_envelope(text.as_bytes())?;
            if envelope.kind == MessageType::Subscribe {
                break;
            }
        }
    }
    barrier.wait().await;

    while let Some(message) = receiver.next().await {
        let Message::Text(text) = message? else {
            continue;
        };
        let envelope = codec::decode_envelope(text.as_bytes())?;
        match envelope.kind {
            MessageType::EntryUpdate => {
                received.fetch_add(1, Ordering::Relaxed);
            }
            MessageType::Ping => {
                let pong = json!({ "type": "pong" }).to_string();
                sender.send(Message::Text(pong)).await?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// One HTTP/1.1 request on a fresh connection. Returns status and JSON body.
async fn http(
    addr: &str,
    method: &str,
    path: &str,
    body: Option<Value>,
) -> Result<(u16, Value), BoxError> {
    let body = body.map(|b| b.to_string()).unwrap_or_default();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );

    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(request.as_bytes()).await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;

    let text = String::from_utf8_lossy(&response);
    let (head, payload) = text
        .split_once("\r\n\r\n")
        .ok_or("malformed HTTP response")?;
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or("missing HTTP status")?;
    let value = if payload.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(payload)?
    };
    Ok((status, value))
}
