//! Room fan-out throughput against a running Switchboard server.
//!
//! ```bash
//! e2e_throughput [clients] [seconds] [url]
//! ```
//!
//! Every client joins the same room and floods it. The figure reported is
//! room messages received per second across all clients, measured after a
//! short warmup.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchboard_protocol::{codec, Envelope, MessageKind};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const ROOM: &str = "benchmark";
const WARMUP: Duration = Duration::from_secs(2);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

struct Report {
    clients: usize,
    elapsed: Duration,
    received: u64,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rate = self.received as f64 / self.elapsed.as_secs_f64();
        write!(
            f,
            "clients={} elapsed={:.2}s received={} rate={:.0} msg/s per_client={:.0} msg/s",
            self.clients,
            self.elapsed.as_secs_f64(),
            self.received,
            rate,
            rate / self.clients.max(1) as f64,
        )
    }
}

fn text(envelope: &Envelope) -> Result<Message, BoxError> {
    let data = codec::encode(envelope)?;
    Ok(Message::Text(String::from_utf8(data.to_vec())?))
}

fn kind_of(message: &Message) -> Option<MessageKind> {
    match message {
        Message::Text(data) => codec::decode(data.as_bytes()).ok().map(|e| e.message_kind()),
        _ => None,
    }
}

#[tokio::main]
async fn main() {
    let mut args = std::env::args().skip(1);
    let clients: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(16);
    let seconds: u64 = args.next().and_then(|s| s.parse().ok()).unwrap_or(10);
    let url = args
        .next()
        .unwrap_or_else(|| "ws://127.0.0.1:8080/ws".to_string());

    let received = Arc::new(AtomicU64::new(0));
    let ready = Arc::new(Barrier::new(clients + 1));

    let tasks: Vec<_> = (0..clients)
        .map(|n| {
            let url = url.clone();
            let received = Arc::clone(&received);
            let ready = Arc::clone(&ready);
            tokio::spawn(async move {
                if let Err(e) = flood(&url, n, received, ready).await {
                    eprintln!("client {n}: {e}");
                }
            })
        })
        .collect();

    ready.wait().await;
    println!("{clients} clients in '{ROOM}', warming up");
    tokio::time::sleep(WARMUP).await;

    received.store(0, Ordering::SeqCst);
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(seconds)).await;

    let report = Report {
        clients,
        elapsed: start.elapsed(),
        received: received.load(Ordering::SeqCst),
    };
    println!("{report}");

    for task in tasks {
        task.abort();
    }
}

async fn flood(
    url: &str,
    n: usize,
    received: Arc<AtomicU64>,
    ready: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(url).await?;
    let (mut sink, mut stream) = ws.split();

    // The pong is queued behind the join, so membership is in place once it arrives.
    sink.send(text(&Envelope::join(ROOM))?).await?;
    sink.send(text(&Envelope::ping())?).await?;
    while let Some(message) = stream.next().await {
        if kind_of(&message?) == Some(MessageKind::Pong) {
            break;
        }
    }

    ready.wait().await;

    let counter = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            if kind_of(&message) == Some(MessageKind::Room) {
                received.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    let message = text(&Envelope::room_message(
        ROOM,
        json!({ "from": n, "data": "x".repeat(64) }),
    ))?;
    while sink.send(message.clone()).await.is_ok() {
        tokio::task::yield_now().await;
    }

    counter.abort();
    Ok(())
}
