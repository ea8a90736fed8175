//! End-to-end throughput benchmark for Courier.
//!
//! Measures acknowledged deliveries per second over real TCP connections
//! against a running server.

use courier_core::{BufferPool, FrameAssembler};
use courier_protocol::{codec, CorrelationId, Frame, PayloadType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::Barrier;

const SERVER_ADDR: &str = "127.0.0.1:7070";
const QUEUE: &str = "e2e-bench";
const ROUTE: &str = "bench/e2e";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let publishers = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(4);
    let consumers = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(4);

    println!("Courier end-to-end throughput benchmark");
    println!("Make sure the server is running: cargo run --release --bin courier");
    println!();

    if let Err(e) = run_benchmark(publishers, consumers).await {
        eprintln!("Benchmark failed: {}", e);
    }
}

async fn run_benchmark(publishers: usize, consumers: usize) -> Result<(), BoxError> {
    println!(
        "{} publishers, {} consumers on queue {}",
        publishers, consumers, QUEUE
    );
    println!("Warmup: {}s, Measurement: {}s", WARMUP_SECS, BENCH_SECS);
    println!();

    let delivered = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(publishers + consumers + 1));
    let mut handles = Vec::new();

    for consumer_id in 0..consumers {
        let delivered = Arc::clone(&delivered);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_consumer(delivered, barrier).await {
                eprintln!("Consumer {} error: {}", consumer_id, e);
            }
        }));
    }
    for publisher_id in 0..publishers {
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            if let Err(e) = run_publisher(barrier).await {
                eprintln!("Publisher {} error: {}", publisher_id, e);
            }
        }));
    }

    barrier.wait().await;
    println!("All clients connected");

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;
    delivered.store(0, Ordering::SeqCst);
    let start = Instant::now();

    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;
    let elapsed = start.elapsed();
    let total = delivered.load(Ordering::SeqCst);

    println!();
    println!("Duration:        {:>10.2}s", elapsed.as_secs_f64());
    println!("Delivered:       {:>10}", total);
    println!(
        "Throughput:      {:>10.0} msg/s",
        total as f64 / elapsed.as_secs_f64()
    );

    for handle in handles {
        handle.abort();
    }
    Ok(())
}

/// Reads frames off one connection.
struct FrameReader {
    reader: OwnedReadHalf,
    assembler: FrameAssembler,
    buf: Vec<u8>,
}

impl FrameReader {
    fn new(reader: OwnedReadHalf) -> Self {
        let pool = Arc::new(BufferPool::new(
            64 * 1024,
            codec::DEFAULT_MAX_BODY_SIZE,
            false,
        ));
        Self {
            reader,
            assembler: FrameAssembler::new(pool, 64 * 1024, codec::DEFAULT_MAX_BODY_SIZE),
            buf: vec![0u8; 64 * 1024],
        }
    }

    /// Frames from the next read; empty once the server hangs up.
    async fn next_batch(&mut self) -> Result<Vec<Frame>, BoxError> {
        loop {
            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(Vec::new());
            }
            let frames = self.assembler.push(&self.buf[..n])?;
            if !frames.is_empty() {
                return Ok(frames);
            }
        }
    }

    /// Skip frames until the reply to `id`.
    async fn expect_reply(&mut self, id: CorrelationId) -> Result<(), BoxError> {
        loop {
            let batch = self.next_batch().await?;
            if batch.is_empty() {
                return Err("server closed the connection".into());
            }
            for frame in batch {
                if frame.correlation_id != id {
                    continue;
                }
                return match frame.payload_type {
                    PayloadType::Ack => Ok(()),
                    _ => Err(format!("request {} rejected", id).into()),
                };
            }
        }
    }
}

async fn run_consumer(delivered: Arc<AtomicU64>, barrier: Arc<Barrier>) -> Result<(), BoxError> {
    let stream = TcpStream::connect(SERVER_ADDR).await?;
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = FrameReader::new(reader);

    let declare = Frame::queue_declare(CorrelationId::generate(), QUEUE, ROUTE)?;
    writer.write_all(&codec::encode(&declare)?).await?;
    reader.expect_reply(declare.correlation_id).await?;

    let subscribe = Frame::subscribe(CorrelationId::generate(), QUEUE, Some(256))?;
    writer.write_all(&codec::encode(&subscribe)?).await?;
    reader.expect_reply(subscribe.correlation_id).await?;

    barrier.wait().await;

    loop {
        let batch = reader.next_batch().await?;
        if batch.is_empty() {
            return Ok(());
        }
        let mut acks = Vec::with_capacity(batch.len() * codec::HEADER_SIZE);
        for frame in batch {
            if frame.payload_type == PayloadType::Message {
                acks.extend_from_slice(&codec::encode(&Frame::ack(frame.correlation_id))?);
                delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
        writer.write_all(&acks).await?;
    }
}

async fn run_publisher(barrier: Arc<Barrier>) -> Result<(), BoxError> {
    let stream = TcpStream::connect(SERVER_ADDR).await?;
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = FrameReader::new(reader);

    // Queue may not exist yet if consumers are slow to declare it.
    let declare = Frame::queue_declare(CorrelationId::generate(), QUEUE, ROUTE)?;
    writer.write_all(&codec::encode(&declare)?).await?;
    reader.expect_reply(declare.correlation_id).await?;

    barrier.wait().await;

    // Drain publish replies.
    let drain = tokio::spawn(async move {
        while let Ok(batch) = reader.next_batch().await {
            if batch.is_empty() {
                break;
            }
        }
    });

    let payload = vec![0u8; 64];
    loop {
        let frame = Frame::message(CorrelationId::generate(), ROUTE, payload.clone())?;
        if writer.write_all(&codec::encode(&frame)?).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    drain.abort();
    Ok(())
}
