use async_trait::async_trait;
use bytes::Bytes;
use mqttstream::mqtt::publisher::PublishSink;
use mqttstream::persistence::{replay_once, Recorder};
use mqttstream::{Envelope, ReplayOptions, Result, StreamStats};
use rumqttc::QoS;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
struct Published {
    topic: String,
    payload: Bytes,
    qos: QoS,
    retain: bool,
}

#[derive(Default)]
struct CapturingSink {
    published: Mutex<Vec<(Published, Instant)>>,
}

impl CapturingSink {
    fn messages(&self) -> Vec<Published> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(message, _)| message.clone())
            .collect()
    }

    fn instants(&self) -> Vec<Instant> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl PublishSink for CapturingSink {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        self.published.lock().unwrap().push((
            Published {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
            },
            Instant::now(),
        ));
        Ok(())
    }
}

#[tokio::test]
async fn recorded_traffic_replays_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("trace.jsonl");
    let stats = Arc::new(StreamStats::default());

    let binary: Vec<u8> = vec![0x00, 0xff, 0xfe, 0x10, 0x80, b'\n'];
    let inputs = vec![
        Envelope::received("sensors/temp", r#"{"celsius":21.5}"#),
        Envelope::received("sensors/raw", binary.clone()).with_delivery(QoS::AtLeastOnce, true),
        Envelope::received("sensors/text", "plain text, not json"),
        Envelope::received("sensors/spaced", r#"{ "a" : 1 }"#),
        Envelope::received("sensors/string", r#""quoted""#).with_delivery(QoS::ExactlyOnce, false),
        Envelope::received("sensors/empty", Bytes::new()),
    ];

    let recorder = Recorder::start(&path, stats.clone(), None).await.unwrap();
    let sink = recorder.sink();
    for envelope in &inputs {
        assert!(sink.record(envelope.clone()));
    }
    assert_eq!(recorder.stop(Duration::from_secs(2)).await.unwrap(), inputs.len() as u64);

    let capture = CapturingSink::default();
    let summary = replay_once(&path, ReplayOptions { speed: 100.0, loop_playback: false }, &capture, &stats)
        .await
        .unwrap();
    assert_eq!(summary.published, inputs.len() as u64);
    assert_eq!(summary.skipped, 0);

    let expected: Vec<Published> = inputs
        .iter()
        .map(|envelope| Published {
            topic: envelope.topic().to_string(),
            payload: envelope.payload().clone(),
            qos: envelope.qos(),
            retain: envelope.retain(),
        })
        .collect();
    assert_eq!(capture.messages(), expected);
    assert_eq!(stats.snapshot().recorded, inputs.len() as u64);
}

#[tokio::test]
async fn replay_reproduces_recorded_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("timed.jsonl");
    std::fs::write(
        &path,
        concat!(
            r#"{"timestamp":"2024-05-01T12:00:00.000000Z","topic":"t","payload":"0"}"#, "\n",
            r#"{"timestamp":"2024-05-01T12:00:02.000000Z","topic":"t","payload":"1"}"#, "\n",
            r#"{"timestamp":"2024-05-01T12:00:02.300000Z","topic":"t","payload":"2"}"#, "\n",
        ),
    )
    .unwrap();

    let capture = CapturingSink::default();
    let started = Instant::now();
    replay_once(&path, ReplayOptions::default(), &capture, &StreamStats::default())
        .await
        .unwrap();

    let at = capture.instants();
    assert_eq!(at.len(), 3);
    let tolerance = Duration::from_millis(150);
    let first = at[0].duration_since(started);
    let second_gap = at[1].duration_since(at[0]);
    let third_gap = at[2].duration_since(at[1]);

    assert!(first < tolerance, "first publish after {:?}", first);
    assert!(
        second_gap >= Duration::from_millis(1990) && second_gap < Duration::from_secs(2) + tolerance,
        "second gap {:?}",
        second_gap
    );
    assert!(
        third_gap >= Duration::from_millis(290) && third_gap < Duration::from_millis(300) + tolerance,
        "third gap {:?}",
        third_gap
    );
}

#[tokio::test]
async fn truncated_tail_is_skipped_and_counted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cut.jsonl");
    std::fs::write(
        &path,
        concat!(
            r#"{"timestamp":"2024-05-01T12:00:00Z","topic":"a","payload":{"v":1}}"#, "\n",
            r#"{"timestamp":"2024-05-01 12:00:00.5","topic":"b","payload":"two","qos":0}"#, "\n",
            r#"{"timestamp":"2024-05-01T12:00:01Z","topic":"c","pay"#,
        ),
    )
    .unwrap();

    let capture = CapturingSink::default();
    let stats = StreamStats::default();
    let summary = replay_once(
        &path,
        ReplayOptions { speed: 100.0, loop_playback: false },
        &capture,
        &stats,
    )
    .await
    .unwrap();

    assert_eq!(summary.published, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(stats.snapshot().replay_skipped, 1);

    let messages = capture.messages();
    assert_eq!(messages[0].topic, "a");
    assert_eq!(messages[0].payload, Bytes::from_static(br#"{"v":1}"#));
    // qos defaults to 1 when a record carries none
    assert_eq!(messages[0].qos, QoS::AtLeastOnce);
    assert_eq!(messages[1].topic, "b");
    assert_eq!(messages[1].qos, QoS::AtMostOnce);
}
