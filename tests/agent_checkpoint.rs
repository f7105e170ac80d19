use fieldgate::agent::AgentCore;
use fieldgate::channel::ChannelEvent;
use fieldgate::config::Config;
use fieldgate::pipeline::PipelineState;
use fieldgate::stream::{DataPoint, StreamRouter};
use serde_json::{json, Value};
use tokio::sync::mpsc;

mod common;

use common::FakeChannel;

fn config(dir: &std::path::Path) -> Config {
    let raw = format!(
        r#"
        [agent]
        max_packet_size = 4096
        max_inflight = 1

        [persistence]
        path = "{}"
        max_file_size = 4096
        max_file_count = 8

        [streams.gps]
        buf_size = 1
        topic = "/device/1/gps"
        "#,
        dir.display()
    );
    Config::parse(&raw).unwrap()
}

fn first_value(payload: &[u8]) -> Value {
    let points: Vec<Value> = serde_json::from_slice(payload).unwrap();
    points.into_iter().next().unwrap()
}

#[test]
fn agent_checkpoint_offline_batches_replay_before_later_traffic() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let (tx, mut rx) = mpsc::channel(16);
    let router = StreamRouter::new(&config, tx);
    let mut core = AgentCore::new(&config, FakeChannel::default()).unwrap();

    // two batches arrive while the channel is down: both spill
    for n in 0..2 {
        router.write("gps", DataPoint::at(n, json!({ "n": n }))).unwrap();
        core.handle_batch(rx.try_recv().unwrap()).unwrap();
    }
    assert_eq!(core.metrics().counter("dispatch.spilled"), 2);

    // reconnect: with one inflight slot, only the oldest record goes out
    core.handle_event(ChannelEvent::Connected).unwrap();
    assert_eq!(core.pipeline().state(), PipelineState::Replaying);
    assert_eq!(core.pipeline().channel().sent.len(), 1);

    // a batch arriving mid-replay queues up behind the spilled ones
    router.write("gps", DataPoint::at(2, json!({ "n": 2 }))).unwrap();
    core.handle_batch(rx.try_recv().unwrap()).unwrap();
    assert_eq!(core.metrics().counter("dispatch.spilled"), 3);

    // acks drain the queue strictly in arrival order
    for id in 1..=3 {
        core.handle_event(ChannelEvent::PacketAcked(id)).unwrap();
    }
    assert_eq!(core.pipeline().state(), PipelineState::Live);
    let sent: Vec<u64> = core
        .pipeline()
        .channel()
        .sent
        .iter()
        .map(|(_, p)| first_value(&p.payload)["n"].as_u64().unwrap())
        .collect();
    assert_eq!(sent, vec![0, 1, 2]);
}

#[test]
fn agent_checkpoint_metrics_stream_publishes_counters() {
    let dir = tempfile::tempdir().unwrap();
    let raw = format!(
        r#"
        [agent]
        max_packet_size = 4096
        max_inflight = 4

        [persistence]
        path = "{}"
        max_file_size = 4096
        max_file_count = 8

        [streams.gps]
        buf_size = 1
        topic = "/device/1/gps"

        [streams.serializer_metrics]
        buf_size = 1
        topic = "/device/1/metrics"
        "#,
        dir.path().display()
    );
    let config = Config::parse(&raw).unwrap();
    let (tx, mut rx) = mpsc::channel(16);
    let router = StreamRouter::new(&config, tx);
    let mut core = AgentCore::new(&config, FakeChannel::default()).unwrap();

    core.handle_event(ChannelEvent::Connected).unwrap();
    router.write("gps", DataPoint::at(1, json!({ "n": 1 }))).unwrap();
    core.handle_batch(rx.try_recv().unwrap()).unwrap();

    core.emit_metrics();
    let (_, metrics_packet) = core
        .pipeline()
        .channel()
        .sent
        .iter()
        .find(|(_, p)| p.topic == "/device/1/metrics")
        .expect("metrics packet published");
    let payload = first_value(&metrics_packet.payload);
    assert_eq!(payload["batches_serialized"].as_u64(), Some(1));
    assert_eq!(payload["sequence"].as_u64(), Some(1));
}
