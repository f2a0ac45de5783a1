//! Shared test helpers for KCP integration tests
#![allow(dead_code)]

use rand::seq::SliceRandom;
use rand::Rng;
use ukcp::ukcp_core::{KcpEngine, Timestamp};

/// Send all output packets from one engine into another engine's input.
pub fn transfer(src: &mut KcpEngine, dst: &mut KcpEngine) {
    for packet in src.drain_output() {
        let _ = dst.input(&packet);
    }
}

/// Transfer all output packets from `src` to `dst`, dropping each packet
/// independently with probability `loss_rate`. Returns (total, delivered).
pub fn lossy_transfer(
    src: &mut KcpEngine,
    dst: &mut KcpEngine,
    loss_rate: f32,
    rng: &mut impl Rng,
) -> (usize, usize) {
    let packets = src.drain_output();
    let total = packets.len();
    let mut delivered = 0;
    for packet in packets {
        if rng.gen::<f32>() >= loss_rate {
            let _ = dst.input(&packet);
            delivered += 1;
        }
    }
    (total, delivered)
}

/// Transfer all output packets from `src` to `dst` in a random order.
pub fn reorder_transfer(src: &mut KcpEngine, dst: &mut KcpEngine, rng: &mut impl Rng) {
    let mut packets = src.drain_output();
    packets.shuffle(rng);
    for packet in packets {
        let _ = dst.input(&packet);
    }
}

/// Drain every complete message from `engine`.
pub fn drain_messages(engine: &mut KcpEngine) -> Vec<Vec<u8>> {
    let mut messages = Vec::new();
    while let Ok(msg) = engine.recv_bytes() {
        messages.push(msg.to_vec());
    }
    messages
}

/// Advance both engines one tick and exchange their output over a perfect link.
pub fn tick(a: &mut KcpEngine, b: &mut KcpEngine, now: Timestamp) {
    a.update(now);
    b.update(now);
    transfer(a, b);
    transfer(b, a);
}

/// Install a `tracing` subscriber honouring `RUST_LOG`; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
