// Copyright 2026 Maurice S. Barnum
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Benchmark of partition key resolution on the request hot path
//
// Run with: cargo bench --package docstore-client --bench routing_lookup

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use docstore_client::Client;
use docstore_client::Container;
use docstore_client::PartitionKey;
use docstore_client::config::Config;
use docstore_client::memory::MemoryStore;

const ITERATIONS: u64 = 100_000;
const CONCURRENT_TASKS: usize = 16;

fn format_duration(d: Duration, iterations: u64) -> String {
    let nanos_per_op = d.as_nanos() as f64 / iterations as f64;
    if nanos_per_op < 1000.0 {
        format!("{:.1} ns/op", nanos_per_op)
    } else if nanos_per_op < 1_000_000.0 {
        format!("{:.2} µs/op", nanos_per_op / 1000.0)
    } else {
        format!("{:.2} ms/op", nanos_per_op / 1_000_000.0)
    }
}

fn setup(partitions: usize) -> (MemoryStore, Container) {
    let store = MemoryStore::new();
    store.create_container("bench", partitions).unwrap();
    let client = Client::new(Config::builder().build().unwrap(), store.clone());
    (store, client.container("bench"))
}

async fn bench_single(container: &Container, iterations: u64) -> Duration {
    let start = Instant::now();
    for i in 0..iterations {
        let key = PartitionKey::new(format!("key-{}", i));
        std::hint::black_box(container.resolve(&key).await.unwrap());
    }
    start.elapsed()
}

async fn bench_concurrent(container: &Container, tasks: usize, iterations: u64) -> Duration {
    let per_task = iterations / tasks as u64;
    let start = Instant::now();

    let handles: Vec<_> = (0..tasks)
        .map(|t| {
            let c = container.clone();
            tokio::spawn(async move {
                for i in 0..per_task {
                    let key = PartitionKey::new(format!("key-{}-{}", t, i));
                    std::hint::black_box(c.resolve(&key).await.unwrap());
                }
            })
        })
        .collect();

    for h in handles {
        h.await.unwrap();
    }
    start.elapsed()
}

#[tokio::main]
async fn main() {
    println!("Partition Key Resolution Benchmark");
    println!("==================================");
    println!("Iterations: {}", ITERATIONS);
    println!();

    for partitions in [1, 8, 64, 512] {
        let (_store, container) = setup(partitions);
        container.refresh_routing().await.unwrap();

        // Warmup
        for _ in 0..1000 {
            std::hint::black_box(container.resolve(&"warmup".into()).await.unwrap());
        }

        let single = bench_single(&container, ITERATIONS).await;
        let concurrent = bench_concurrent(&container, CONCURRENT_TASKS, ITERATIONS).await;
        println!("{} partitions:", partitions);
        println!(
            "  single:     {} (total: {:?})",
            format_duration(single, ITERATIONS),
            single
        );
        println!(
            "  {} tasks:   {} (total: {:?})",
            CONCURRENT_TASKS,
            format_duration(concurrent, ITERATIONS),
            concurrent
        );
    }
    println!();

    // Readers keep resolving while the layout changes underneath them
    println!("With concurrent splits and refreshes:");
    println!("-------------------------------------");
    let (store, container) = setup(8);
    container.refresh_routing().await.unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let splitter = {
        let container = container.clone();
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            let mut splits = 0;
            while !done.load(Ordering::Relaxed) && splits < 20 {
                let victim = store.partitions("bench").unwrap()[0].id;
                store.split_partition("bench", victim).unwrap();
                container.refresh_routing().await.unwrap();
                splits += 1;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            splits
        })
    };
    let elapsed = bench_concurrent(&container, CONCURRENT_TASKS, ITERATIONS).await;
    done.store(true, Ordering::Relaxed);
    let splits = splitter.await.unwrap();
    println!(
        "  {} tasks:   {} (total: {:?}, {} splits)",
        CONCURRENT_TASKS,
        format_duration(elapsed, ITERATIONS),
        elapsed,
        splits
    );
}
