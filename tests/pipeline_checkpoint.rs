use fieldgate::config::PersistenceConfig;
use fieldgate::packet::{Packet, QosLevel};
use fieldgate::pipeline::{PipelineState, PublishPipeline, SubmitError};
use fieldgate::spill::SpillQueue;
use std::time::{Duration, Instant};

mod common;

use common::FakeChannel;

const ACK_GRACE: Duration = Duration::from_secs(60);

fn packet(n: u8) -> Packet {
    Packet::new("t", QosLevel::AtLeastOnce, vec![n])
}

fn open_queue(dir: &std::path::Path) -> SpillQueue {
    SpillQueue::open(&PersistenceConfig {
        path: dir.to_path_buf(),
        max_file_size: 4096,
        max_file_count: 8,
    })
    .unwrap()
}

#[test]
fn pipeline_checkpoint_replays_spilled_records_before_live_traffic() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = open_queue(dir.path());
    for n in 1..=2 {
        queue.append(&packet(n)).unwrap();
    }

    let mut pipeline = PublishPipeline::new(FakeChannel::default(), 4, ACK_GRACE);
    let now = Instant::now();
    pipeline.handle_connect(Some(&mut queue), now).unwrap();
    assert_eq!(pipeline.state(), PipelineState::Replaying);

    // fresh traffic is diverted while the replay drains
    let err = pipeline
        .submit(packet(3), Some(&mut queue), now)
        .unwrap_err();
    let rejected = match err {
        SubmitError::Saturated(packet) => packet,
        other => panic!("expected saturated, got {other:?}"),
    };
    queue.append(&rejected).unwrap();

    // acknowledging the replayed records drains the diverted packet too
    for id in 1..=3 {
        pipeline.on_ack(id, Some(&mut queue), now).unwrap();
    }
    assert_eq!(pipeline.state(), PipelineState::Live);
    let payloads = pipeline.channel().sent_payloads();
    assert_eq!(payloads, vec![vec![1], vec![2], vec![3]]);

    // live again: submissions go straight to the channel
    pipeline.submit(packet(4), Some(&mut queue), now).unwrap();
    assert_eq!(pipeline.channel().sent.len(), 4);
}

#[test]
fn pipeline_checkpoint_saturation_never_grows_inflight() {
    let mut pipeline = PublishPipeline::new(FakeChannel::default(), 2, ACK_GRACE);
    let now = Instant::now();
    pipeline.handle_connect(None, now).unwrap();

    pipeline.submit(packet(1), None, now).unwrap();
    pipeline.submit(packet(2), None, now).unwrap();
    for n in 3..6 {
        let err = pipeline.submit(packet(n), None, now).unwrap_err();
        assert!(matches!(err, SubmitError::Saturated(_)));
        assert_eq!(pipeline.inflight_len(), 2);
    }

    // an ack frees exactly one slot
    pipeline.on_ack(1, None, now).unwrap();
    pipeline.submit(packet(6), None, now).unwrap();
    assert_eq!(pipeline.inflight_len(), 2);
}

#[test]
fn pipeline_checkpoint_disconnect_respills_unacked_live_packets() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = open_queue(dir.path());

    let mut pipeline = PublishPipeline::new(FakeChannel::default(), 4, ACK_GRACE);
    let now = Instant::now();
    pipeline.handle_connect(Some(&mut queue), now).unwrap();
    assert_eq!(pipeline.state(), PipelineState::Live);

    pipeline.submit(packet(1), Some(&mut queue), now).unwrap();
    pipeline.submit(packet(2), Some(&mut queue), now).unwrap();
    pipeline.on_ack(1, Some(&mut queue), now).unwrap();
    pipeline.on_disconnect(Some(&mut queue));
    assert_eq!(pipeline.state(), PipelineState::Disconnected);
    assert_eq!(pipeline.inflight_len(), 0);

    // only the unacknowledged packet is replayed after reconnecting
    pipeline.handle_connect(Some(&mut queue), now).unwrap();
    let payloads = pipeline.channel().sent_payloads();
    assert_eq!(payloads[2], vec![2]);
    assert_eq!(payloads.len(), 3);
}

#[test]
fn pipeline_checkpoint_acks_advance_the_durable_cursor() {
    let dir = tempfile::tempdir().unwrap();
    {
        let mut queue = open_queue(dir.path());
        for n in 1..=3 {
            queue.append(&packet(n)).unwrap();
        }
        let mut pipeline = PublishPipeline::new(FakeChannel::default(), 4, ACK_GRACE);
        let now = Instant::now();
        pipeline.handle_connect(Some(&mut queue), now).unwrap();
        // ack the first two replayed packets, then crash
        pipeline.on_ack(1, Some(&mut queue), now).unwrap();
        pipeline.on_ack(2, Some(&mut queue), now).unwrap();
        assert_eq!(queue.consumed(), 2);
    }

    let mut queue = open_queue(dir.path());
    let record = queue.read_next().unwrap().unwrap();
    assert_eq!(record.packet.payload, vec![3]);
    assert!(queue.read_next().unwrap().is_none());
}

#[test]
fn pipeline_checkpoint_out_of_order_ack_never_skips_a_record() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = open_queue(dir.path());
    for n in 1..=2 {
        queue.append(&packet(n)).unwrap();
    }

    let mut pipeline = PublishPipeline::new(FakeChannel::default(), 4, ACK_GRACE);
    let now = Instant::now();
    pipeline.handle_connect(Some(&mut queue), now).unwrap();
    assert_eq!(pipeline.channel().sent.len(), 2);

    // the channel makes no ordering promise: the second record is acked
    // while the first is still in flight
    pipeline.on_ack(2, Some(&mut queue), now).unwrap();
    assert_eq!(queue.consumed(), 0);

    // the unacknowledged record survives the reconnect
    pipeline.on_disconnect(Some(&mut queue));
    pipeline.handle_connect(Some(&mut queue), now).unwrap();
    let payloads = pipeline.channel().sent_payloads();
    assert_eq!(payloads[2], vec![1]);

    // acking it closes the gap and releases the later ack too
    pipeline.on_ack(3, Some(&mut queue), now).unwrap();
    assert_eq!(queue.consumed(), 2);
}

#[test]
fn pipeline_checkpoint_ack_grace_expiry_forces_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let mut queue = open_queue(dir.path());

    let mut pipeline = PublishPipeline::new(FakeChannel::default(), 4, ACK_GRACE);
    let now = Instant::now();
    pipeline.handle_connect(Some(&mut queue), now).unwrap();
    pipeline.submit(packet(1), Some(&mut queue), now).unwrap();

    assert!(!pipeline.tick(now + Duration::from_secs(30), Some(&mut queue)));
    assert!(pipeline.tick(now + Duration::from_secs(61), Some(&mut queue)));
    assert_eq!(pipeline.state(), PipelineState::Disconnected);
    assert_eq!(pipeline.ack_timeouts(), 1);

    // the respilled packet comes back on reconnect
    pipeline
        .handle_connect(Some(&mut queue), now + Duration::from_secs(61))
        .unwrap();
    assert_eq!(pipeline.state(), PipelineState::Replaying);
    assert_eq!(pipeline.channel().sent.len(), 2);
}

#[test]
fn pipeline_checkpoint_send_failure_drops_to_disconnected() {
    let mut pipeline = PublishPipeline::new(FakeChannel::default(), 4, ACK_GRACE);
    let now = Instant::now();
    pipeline.handle_connect(None, now).unwrap();

    pipeline.channel_mut().fail_sends = true;
    let err = pipeline.submit(packet(1), None, now).unwrap_err();
    assert!(matches!(err, SubmitError::Disconnected(_)));
    assert_eq!(pipeline.state(), PipelineState::Disconnected);
}
