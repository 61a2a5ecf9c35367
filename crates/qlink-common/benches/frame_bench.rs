use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use qlink_common::crypto::{self, SessionSecret};
use qlink_common::frame::Frame;
use qlink_common::types::{sport_cmd, topic, VENDOR_PREFIX};
use serde_json::json;

const SPORT_STATE: &str = r#"{"type":"msg","topic":"rt/lf/sportmodestate","data":{"stamp":{"sec":1700000000,"nanosec":12345},"error_code":0,"imu_state":{"quaternion":[0.99,0.01,0.02,0.0],"gyroscope":[0.0,0.1,0.0],"accelerometer":[0.1,0.0,9.8],"rpy":[0.0,0.0,0.1],"temperature":40},"mode":1,"progress":0.0,"gait_type":0,"foot_raise_height":0.09,"position":[0.1,0.2,0.3],"body_height":0.32,"velocity":[0.0,0.0,0.0],"yaw_speed":0.0,"range_obstacle":[1.0,1.0,1.0,1.0],"foot_force":[20,21,22,23],"foot_position_body":[0.1,0.1,0.1,0.1,0.1,0.1,0.1,0.1,0.1,0.1,0.1,0.1],"foot_speed_body":[0,0,0,0,0,0,0,0,0,0,0,0]}}"#;

const RESPONSE: &str = r#"{"type":"res","topic":"rt/api/sport/response","data":{"header":{"identity":{"id":123456789,"api_id":1004},"status":{"code":0}},"data":""}}"#;

fn bench_state_parse(c: &mut Criterion) {
    c.bench_function("sport_state_parse", |b| {
        b.iter(|| black_box(Frame::parse(black_box(SPORT_STATE)).unwrap()));
    });
}

fn bench_response_correlate(c: &mut Criterion) {
    c.bench_function("response_parse_correlate", |b| {
        b.iter(|| {
            let frame = Frame::parse(black_box(RESPONSE)).unwrap();
            black_box(frame.correlation_id())
        });
    });
}

fn bench_request_serialize(c: &mut Criterion) {
    let params = json!({ "x": 0.3, "y": 0.0, "z": 0.0 });
    let frame = Frame::request(topic::SPORT_MOD, 123_456_789, Some(sport_cmd::MOVE), Some(&params));

    c.bench_function("request_serialize", |b| {
        b.iter(|| black_box(frame.to_json().unwrap()));
    });
}

fn bench_heartbeat_build(c: &mut Criterion) {
    c.bench_function("heartbeat_build_serialize", |b| {
        b.iter(|| black_box(Frame::heartbeat(Utc::now()).to_json().unwrap()));
    });
}

fn bench_validation_reply(c: &mut Criterion) {
    c.bench_function("validation_reply", |b| {
        b.iter(|| black_box(crypto::validation_reply(VENDOR_PREFIX, black_box("a1b2c3d4e5"))));
    });
}

fn bench_aes_offer_roundtrip(c: &mut Criterion) {
    let secret = SessionSecret::generate();
    let offer = format!(r#"{{"type":"offer","sdp":"{}"}}"#, "a=candidate ".repeat(200));

    c.bench_function("aes_ecb_offer_roundtrip", |b| {
        b.iter(|| {
            let ct = crypto::aes_ecb_encrypt(secret.key(), offer.as_bytes()).unwrap();
            black_box(crypto::aes_ecb_decrypt(secret.key(), &ct).unwrap())
        });
    });
}

criterion_group!(
    benches,
    bench_state_parse,
    bench_response_correlate,
    bench_request_serialize,
    bench_heartbeat_build,
    bench_validation_reply,
    bench_aes_offer_roundtrip,
);
criterion_main!(benches);
