use clap::Parser;
use hdrhistogram::Histogram;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent clients
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// Delay between requests per client, in milliseconds
    #[arg(short, long, default_value = "100")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Server API address
    #[arg(short, long, default_value = "http://127.0.0.1:8108")]
    server: String,

    /// Collection to ingest documents into
    #[arg(long, default_value = "bench")]
    collection: String,
}

async fn create_collection(client: &reqwest::Client, server: &str, collection: &str) {
    let body = serde_json::json!({ "name": collection });
    match client
        .post(format!("{}/collections", server))
        .json(&body)
        .send()
        .await
    {
        Ok(res) => println!("Collection create: {}", res.status()),
        Err(e) => eprintln!("Failed to create collection: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3).unwrap()));
    let total_requests = Arc::new(Mutex::new(0u64));
    let client = reqwest::Client::new();

    println!(
        "Starting benchmark with {} concurrent clients, interval {} ms",
        args.concurrency, args.interval
    );

    create_collection(&client, &args.server, &args.collection).await;

    let mut handles = vec![];
    for _ in 0..args.concurrency {
        let server = args.server.clone();
        let collection = args.collection.clone();
        let client = client.clone();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();
        let interval = args.interval;

        let handle = tokio::spawn(async move {
            let url = format!("{}/collections/{}/documents", server, collection);
            loop {
                let start = Instant::now();

                let doc = serde_json::json!({
                    "id": format!("{}", rand::random::<u64>()),
                    "title": format!("document {}", rand::random::<u32>()),
                    "points": rand::random::<u16>(),
                });

                match client.post(&url).json(&doc).send().await {
                    Ok(res) if res.status().is_success() => {
                        let cost = start.elapsed();
                        let mut hist = histogram.lock().await;
                        hist.record(cost.as_micros() as u64).unwrap();
                        let mut total = total_requests.lock().await;
                        *total += 1;
                    }
                    Ok(res) => eprintln!("Request rejected: {}", res.status()),
                    Err(e) => eprintln!("Request failed: {}", e),
                }

                tokio::time::sleep(Duration::from_millis(interval)).await;
            }
        });

        handles.push(handle);
    }

    sleep(Duration::from_secs(args.duration)).await;

    for handle in handles {
        handle.abort();
    }

    let total = *total_requests.lock().await;
    let hist = histogram.lock().await;

    println!("\nBenchmark Results:");
    println!("Total Requests: {}", total);
    println!("Average RPS: {:.2}", total as f64 / args.duration as f64);
    println!("\nLatency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    Ok(())
}
