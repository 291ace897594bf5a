use clap::Parser;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// INTERVAL ms
    #[arg(short, long, default_value = "100")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Client addresses of the nodes, comma separated
    #[arg(short, long, default_value = "127.0.0.1:5001", value_delimiter = ',')]
    server: Vec<String>,
}

/// Client-facing message; `response` is filled in by the node
#[derive(Debug, Serialize, Deserialize)]
struct ClientMessage {
    request: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response: Option<String>,
}

struct Client {
    lines: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Client {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    async fn call(&mut self, request: String) -> anyhow::Result<ClientMessage> {
        let mut line = serde_json::to_string(&ClientMessage {
            request,
            response: None,
        })?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        let reply = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow::anyhow!("connection closed"))?;
        Ok(serde_json::from_str(&reply)?)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3)?));
    let total_requests = Arc::new(Mutex::new(0u64));

    println!(
        "Starting benchmark with {} concurrent clients against {:?}, target INTERVAL: {}",
        args.concurrency, args.server, args.interval
    );

    // Spawn client tasks, spread over the nodes
    let interval = args.interval;
    let mut handles = vec![];
    for i in 0..args.concurrency {
        let server_addr = args.server[i % args.server.len()].clone();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();

        let handle = tokio::spawn(async move {
            let mut client = match Client::connect(&server_addr).await {
                Ok(client) => client,
                Err(e) => {
                    eprintln!("Failed to connect to server {}: {}", server_addr, e);
                    return;
                }
            };

            loop {
                let start = Instant::now();
                let request = format!(
                    "INSERT {} {}",
                    uuid::Uuid::new_v4(),
                    rand::random::<u32>() % 1000
                );

                match client.call(request).await {
                    Ok(reply) if reply.response.is_some() => {
                        let duration = start.elapsed();
                        let mut hist = histogram.lock().await;
                        let _ = hist.record(duration.as_micros() as u64);
                        let mut total = total_requests.lock().await;
                        *total += 1;
                    }
                    Ok(reply) => eprintln!("Reply without response: {:?}", reply),
                    Err(e) => {
                        eprintln!("Request failed: {}", e);
                        return;
                    }
                }

                tokio::time::sleep(Duration::from_millis(interval)).await;
            }
        });

        handles.push(handle);
    }

    // Run for specified duration
    sleep(Duration::from_secs(args.duration)).await;

    // Cancel all tasks
    for handle in handles {
        handle.abort();
    }

    // Print statistics
    let total = *total_requests.lock().await;
    let hist = histogram.lock().await;

    println!("\nBenchmark Results:");
    println!("Total Requests: {}", total);
    println!("Average TPS: {:.2}", total as f64 / args.duration as f64);
    println!("\nAccept Latency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    Ok(())
}
