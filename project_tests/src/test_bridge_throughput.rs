use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Viewer client reporting data bridge throughput", long_about = None)]
struct Args {
    /// WebSocket endpoint of the bridge
    #[clap(short, long, default_value = "ws://127.0.0.1:9003/ws")]
    url: String,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 10)]
    report_interval_seconds: u64,
}

struct Sample {
    at: chrono::DateTime<Utc>,
    bytes: usize,
    /// Packages carried by the message: array length for merged batches, 1 otherwise.
    packages: usize,
    binary: bool,
}

#[derive(Default)]
struct Stats {
    samples: VecDeque<Sample>,
    total_messages: u64,
}

fn packages_in(text: &str) -> usize {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Array(items)) => items.len(),
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let stats = Arc::new(Mutex::new(Stats::default()));

    // Clone for the reporter task
    let stats_reporter = Arc::clone(&stats);
    let report_interval_seconds = args.report_interval_seconds.max(1);
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(report_interval_seconds)).await;
            let now = Utc::now();
            let window_start = now - Duration::seconds(report_interval_seconds as i64);

            let mut data = stats_reporter.lock().unwrap();
            while data.samples.front().is_some_and(|s| s.at < window_start) {
                data.samples.pop_front();
            }

            let messages = data.samples.len();
            let bytes: usize = data.samples.iter().map(|s| s.bytes).sum();
            let packages: usize = data.samples.iter().map(|s| s.packages).sum();
            let binary = data.samples.iter().filter(|s| s.binary).count();
            let largest_batch = data.samples.iter().map(|s| s.packages).max().unwrap_or(0);
            let secs = report_interval_seconds as f64;

            println!("\n----- {}s Summary -----", report_interval_seconds);
            println!("Messages: {:.1} msg/s ({} binary)", messages as f64 / secs, binary);
            println!("Packages: {:.1} pkg/s, largest batch {}", packages as f64 / secs, largest_batch);
            println!("Bytes:    {:.1} KiB/s", bytes as f64 / 1024.0 / secs);
            println!("Total messages since start: {}", data.total_messages);
            println!("--------------------------\n");
        }
    });

    // Main WebSocket Loop
    println!("Connecting to {}...", args.url);
    let (ws_stream, _) = connect_async(args.url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", args.url))?;
    let (_write, mut read) = ws_stream.split();
    println!("Connected. Press Ctrl+C to stop.");

    while let Some(msg) = read.next().await {
        let sample = match msg.context("WebSocket read failed")? {
            Message::Text(text) => Sample {
                at: Utc::now(),
                bytes: text.as_str().len(),
                packages: packages_in(text.as_str()),
                binary: false,
            },
            Message::Binary(data) => Sample {
                at: Utc::now(),
                bytes: data.len(),
                packages: 1,
                binary: true,
            },
            Message::Close(_) => break,
            _ => continue,
        };

        let mut data = stats.lock().unwrap();
        data.total_messages += 1;
        data.samples.push_back(sample);
    }

    println!("Connection closed.");
    Ok(())
}
