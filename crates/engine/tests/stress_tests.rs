//! Randomized concurrency tests
//!
//! Several producers enqueue while a completer thread finishes transfers in
//! random order of success and failure. Checks the properties that must hold
//! for every interleaving: one TX transfer in flight, per-producer FIFO, no
//! lost wake-ups and no leaked slots.
//!
//! Run with: `cargo test -p engine --test stress_tests --release`

use bytes::Bytes;
use engine::test_utils::{IN_EP, MockTransport, OUT_EP, RecordingCongestion, RecordingSink};
use engine::test_utils::{TEST_TIMEOUT, wait_until};
use engine::{Endpoints, Engine, EngineConfig, TransferError};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

const PRODUCERS: u8 = 4;
const PACKETS_PER_PRODUCER: u16 = 250;

/// Header: producer id, then a big-endian sequence number
fn tagged_packet(producer: u8, seq: u16, padding: usize) -> Bytes {
    let mut data = vec![producer];
    data.extend_from_slice(&seq.to_be_bytes());
    data.resize(3 + padding, 0xEE);
    Bytes::from(data)
}

fn start(transport: &Arc<MockTransport>, config: EngineConfig) -> Arc<Engine> {
    common::init_test_logging();

    let engine = Engine::start(
        transport.clone(),
        Endpoints::new(IN_EP, OUT_EP),
        config,
        Arc::new(RecordingSink::new()),
        Arc::new(RecordingCongestion::new()),
    )
    .expect("engine should start");

    Arc::new(engine)
}

#[test]
fn test_concurrent_producers_random_completions() {
    let transport = MockTransport::new();
    let engine = start(
        &transport,
        EngineConfig {
            tx_queue_high: 2000,
            tx_queue_low: 1000,
            tx_queue_limit: 4000,
            ..Default::default()
        },
    );
    let total = PRODUCERS as usize * PACKETS_PER_PRODUCER as usize;

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let mut rng = rand::rng();
                for seq in 0..PACKETS_PER_PRODUCER {
                    let packet = tagged_packet(producer, seq, rng.random_range(0..128));
                    assert!(engine.enqueue(packet).is_queued());
                    if rng.random_bool(0.05) {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    let done = Arc::new(AtomicBool::new(false));
    let failures = Arc::new(AtomicU64::new(0));
    let completer = {
        let transport = Arc::clone(&transport);
        let engine = Arc::clone(&engine);
        let done = Arc::clone(&done);
        let failures = Arc::clone(&failures);
        thread::spawn(move || {
            let mut rng = rand::rng();
            while !done.load(Ordering::Acquire) {
                // One RX slot plus at most one TX slot
                assert!(engine.status().live_slots <= 2);

                if rng.random_bool(0.1) {
                    if transport.fail(OUT_EP, TransferError::Timeout) {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                } else if !transport.complete_out(OUT_EP) {
                    thread::sleep(Duration::from_micros(50));
                }

                if rng.random_bool(0.2) {
                    transport.complete_in(IN_EP, b"inbound");
                }
            }
        })
    };

    for producer in producers {
        producer.join().unwrap();
    }

    // Every packet reaches the transport: no wake-up was lost
    let drained = wait_until(TEST_TIMEOUT * 6, || {
        transport.submit_count(OUT_EP) == total && transport.pending(OUT_EP) == 0
    });
    done.store(true, Ordering::Release);
    completer.join().unwrap();
    assert!(drained, "only {} of {} packets submitted", transport.submit_count(OUT_EP), total);

    assert_eq!(transport.max_in_flight(OUT_EP), 1);

    // Per-producer order survives interleaving
    let mut next_seq = vec![0u16; PRODUCERS as usize];
    for packet in transport.sent(OUT_EP) {
        let producer = packet[0] as usize;
        let seq = u16::from_be_bytes([packet[1], packet[2]]);
        assert_eq!(seq, next_seq[producer], "producer {} out of order", producer);
        next_seq[producer] += 1;
    }
    assert!(next_seq.iter().all(|&n| n == PACKETS_PER_PRODUCER));

    let stats = engine.stop();
    assert_eq!(stats.tx_packets, total as u64);
    assert_eq!(stats.tx_errors, failures.load(Ordering::Relaxed));
    assert_eq!(stats.tx_dropped, 0);
    assert_eq!(engine.status().live_slots, 0);
}

#[test]
fn test_backpressure_under_load() {
    let transport = MockTransport::new();
    let congestion = Arc::new(RecordingCongestion::new());
    let engine = Arc::new(
        Engine::start(
            transport.clone(),
            Endpoints::new(IN_EP, OUT_EP),
            EngineConfig {
                tx_queue_high: 20,
                tx_queue_low: 10,
                tx_queue_limit: 10_000,
                ..Default::default()
            },
            Arc::new(RecordingSink::new()),
            congestion.clone(),
        )
        .unwrap(),
    );

    let producer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            let mut rng = rand::rng();
            for seq in 0..500u16 {
                assert!(engine.enqueue(tagged_packet(0, seq, 8)).is_queued());
                if rng.random_bool(0.3) {
                    thread::sleep(Duration::from_micros(rng.random_range(10..200)));
                }
            }
        })
    };

    let completer = {
        let transport = Arc::clone(&transport);
        thread::spawn(move || {
            let mut rng = rand::rng();
            let mut completed = 0;
            while completed < 500 {
                if transport.complete_out(OUT_EP) {
                    completed += 1;
                } else {
                    thread::sleep(Duration::from_micros(rng.random_range(10..100)));
                }
            }
        })
    };

    producer.join().unwrap();
    completer.join().unwrap();

    // Everything drained, so the last pause has been answered
    assert!(wait_until(TEST_TIMEOUT, || !engine.status().congested));
    let pauses = congestion.pauses();
    let resumes = congestion.resumes();
    assert_eq!(pauses, resumes);

    // Strict alternation, starting with a pause
    for (i, event) in congestion.events().iter().enumerate() {
        let expected = if i % 2 == 0 {
            engine::test_utils::CongestionEvent::Pause
        } else {
            engine::test_utils::CongestionEvent::Resume
        };
        assert_eq!(*event, expected);
    }

    engine.stop();
}
