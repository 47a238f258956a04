//! End-to-end replay scenarios over a scripted in-memory session.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use bson::doc;
use mongoreplay::{
    error::{Error, Result},
    op::{RecordedOp, TypedOp},
    options::{ReplayOptions, ServerAddress},
    session::{Connect, ReplyMessage, Session},
    source::{BufferedSource, SourceItem},
    stats::{self, OpExecution},
    wire::{legacy, MessageHeader, OpCode},
    Replay, ReplaySummary,
};
use tokio::time::Instant;

const CLIENT: &str = "10.1.0.1:40000";
const SERVER: &str = "10.2.0.1:27017";

#[derive(Debug, Clone)]
struct Executed {
    request_id: i32,
    op: TypedOp,
    at: Instant,
}

#[derive(Debug, Default)]
struct Behavior {
    fail_dial: bool,
    connects: AtomicU64,
    replies: Mutex<HashMap<i32, ReplyMessage>>,
    executed: Mutex<Vec<Executed>>,
}

impl Behavior {
    fn executed(&self) -> Vec<Executed> {
        self.executed.lock().unwrap().clone()
    }

    fn script_reply(&self, request_id: i32, cursor_id: i64) {
        let reply = legacy::Reply {
            response_flags: Default::default(),
            cursor_id,
            starting_from: 0,
            number_returned: 1,
            documents: vec![doc! { "_id": 1 }],
        };
        let body = reply.to_body().unwrap();
        let message = ReplyMessage {
            header: MessageHeader {
                length: (MessageHeader::LENGTH + body.len()) as i32,
                request_id: 90_000 + request_id,
                response_to: request_id,
                op_code: OpCode::Reply as i32,
            },
            op: TypedOp::Reply(reply),
        };
        self.replies.lock().unwrap().insert(request_id, message);
    }
}

#[derive(Clone, Debug)]
struct ScriptedConnector {
    behavior: Arc<Behavior>,
}

impl ScriptedConnector {
    fn new() -> (Self, Arc<Behavior>) {
        let behavior = Arc::new(Behavior::default());
        (
            Self {
                behavior: behavior.clone(),
            },
            behavior,
        )
    }

    fn failing_dials() -> (Self, Arc<Behavior>) {
        let behavior = Arc::new(Behavior {
            fail_dial: true,
            ..Default::default()
        });
        (
            Self {
                behavior: behavior.clone(),
            },
            behavior,
        )
    }
}

struct ScriptedSession {
    behavior: Arc<Behavior>,
}

impl Connect for ScriptedConnector {
    type Session = ScriptedSession;

    async fn connect(&self, target: &ServerAddress) -> Result<ScriptedSession> {
        if self.behavior.fail_dial {
            return Err(Error::dial(format!("{}: connection refused", target)));
        }
        self.behavior.connects.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedSession {
            behavior: self.behavior.clone(),
        })
    }
}

impl Session for ScriptedSession {
    async fn execute(
        &mut self,
        op: &TypedOp,
        header: &MessageHeader,
    ) -> Result<Option<ReplyMessage>> {
        self.behavior.executed.lock().unwrap().push(Executed {
            request_id: header.request_id,
            op: op.clone(),
            at: Instant::now(),
        });

        if !op.expects_reply() {
            return Ok(None);
        }
        Ok(self
            .behavior
            .replies
            .lock()
            .unwrap()
            .get(&header.request_id)
            .cloned())
    }

    async fn close(self) {}
}

fn at_ms(ms: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_millis(ms)
}

fn recorded(
    op: &TypedOp,
    request_id: i32,
    response_to: i32,
    src: &str,
    dst: &str,
    seen_ms: u64,
) -> RecordedOp {
    let frame = op.encode(request_id, response_to).unwrap();
    let header = MessageHeader::from_slice(&frame).unwrap();
    RecordedOp::new(
        at_ms(seen_ms),
        src,
        dst,
        header,
        frame[MessageHeader::LENGTH..].to_vec(),
    )
}

fn find_query(request_id: i32, src: &str, dst: &str, seen_ms: u64) -> RecordedOp {
    let query = TypedOp::Query(legacy::Query {
        flags: Default::default(),
        collection: "test.events".to_string(),
        number_to_skip: 0,
        number_to_return: 0,
        query: doc! { "request": request_id },
        return_fields: None,
    });
    recorded(&query, request_id, 0, src, dst, seen_ms)
}

fn recorded_reply(response_to: i32, cursor_id: i64, seen_ms: u64) -> RecordedOp {
    let reply = TypedOp::Reply(legacy::Reply {
        response_flags: Default::default(),
        cursor_id,
        starting_from: 0,
        number_returned: 1,
        documents: vec![doc! { "_id": 1 }],
    });
    recorded(&reply, 50_000 + response_to, response_to, SERVER, CLIENT, seen_ms)
}

fn options_with_speed(speed: f64) -> ReplayOptions {
    ReplayOptions::builder()
        .target(ServerAddress {
            host: "replay-target".to_string(),
            port: Some(27017),
        })
        .speed(speed)
        .build()
}

async fn run_replay(
    options: ReplayOptions,
    connector: ScriptedConnector,
    ops: Vec<SourceItem>,
) -> (ReplaySummary, Vec<OpExecution>) {
    let (sink, receiver) = stats::channel();
    let collector = tokio::spawn(stats::StatCollector::new(receiver).collect_all());

    let replay = Replay::new(options, connector).unwrap();
    let summary = replay.run(BufferedSource::new(ops), sink).await.unwrap();

    (summary, collector.await.unwrap())
}

#[tokio::test(start_paused = true)]
async fn cursor_remap_through_get_more() {
    let (connector, behavior) = ScriptedConnector::new();
    // The live server hands out 9999 where the capture saw 1111.
    behavior.script_reply(1, 9999);
    behavior.script_reply(2, 0);

    let get_more = TypedOp::GetMore(legacy::GetMore {
        collection: "test.events".to_string(),
        number_to_return: 0,
        cursor_id: 1111,
    });

    let ops = vec![
        SourceItem::Op(find_query(1, CLIENT, SERVER, 0)),
        SourceItem::Op(recorded_reply(1, 1111, 10)),
        SourceItem::Op(recorded(&get_more, 2, 0, CLIENT, SERVER, 20)),
    ];

    let (summary, records) = run_replay(options_with_speed(1.0), connector, ops).await;

    assert_eq!(summary.ops_played, 2);
    assert_eq!(records.len(), 2);

    let executed = behavior.executed();
    assert_eq!(executed.len(), 2);
    match &executed[1].op {
        TypedOp::GetMore(live) => assert_eq!(live.cursor_id, 9999),
        other => panic!("second execute was not a getMore: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn driver_ops_are_never_executed() {
    let (connector, behavior) = ScriptedConnector::new();

    let handshake = TypedOp::Query(legacy::Query {
        flags: Default::default(),
        collection: "admin.$cmd".to_string(),
        number_to_skip: 0,
        number_to_return: -1,
        query: doc! { "isMaster": 1 },
        return_fields: None,
    });

    let ops = vec![
        SourceItem::Op(recorded(&handshake, 1, 0, CLIENT, SERVER, 0)),
        SourceItem::Op(find_query(2, CLIENT, SERVER, 5)),
    ];

    let (summary, records) = run_replay(options_with_speed(f64::INFINITY), connector, ops).await;

    assert_eq!(summary.ops_skipped, 1);
    assert_eq!(summary.ops_played, 1);
    assert_eq!(records.len(), 1);

    let executed = behavior.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].request_id, 2);
}

#[tokio::test(start_paused = true)]
async fn speed_compresses_capture_gaps() {
    let (connector, behavior) = ScriptedConnector::new();

    // Two connections, one second apart in capture time.
    let ops = vec![
        SourceItem::Op(find_query(1, CLIENT, SERVER, 0)),
        SourceItem::Op(find_query(2, "10.1.0.2:40001", SERVER, 1_000)),
    ];

    let (summary, records) = run_replay(options_with_speed(10.0), connector, ops).await;
    assert_eq!(summary.ops_played, 2);

    let executed = behavior.executed();
    assert_eq!(executed.len(), 2);
    let gap = executed[1].at.duration_since(executed[0].at);
    approx::assert_abs_diff_eq!(gap.as_secs_f64(), 0.100, epsilon = 0.010);

    // Deadlines were honored, not merely approximated.
    for record in &records {
        assert!(record.played_at >= record.play_at);
    }
}

#[tokio::test(start_paused = true)]
async fn socket_reuse_splits_generations() {
    let (connector, behavior) = ScriptedConnector::new();

    // Same endpoints, same request id, a 60 s capture-time gap: two
    // original connections back to back on one address pair.
    let ops = vec![
        SourceItem::Op(find_query(1, CLIENT, SERVER, 0)),
        SourceItem::Op(find_query(1, CLIENT, SERVER, 60_000)),
    ];

    let (summary, records) = run_replay(options_with_speed(f64::INFINITY), connector, ops).await;

    assert_eq!(summary.ops_played, 2);
    assert_eq!(behavior.connects.load(Ordering::SeqCst), 2);

    let connection_nums: Vec<u64> = records.iter().map(|r| r.connection_num).collect();
    assert_eq!(connection_nums.len(), 2);
    assert_ne!(connection_nums[0], connection_nums[1]);
}

#[tokio::test(start_paused = true)]
async fn ops_replay_in_enqueue_order_per_connection() {
    let (connector, behavior) = ScriptedConnector::new();

    let ops: Vec<SourceItem> = (1..=3)
        .map(|i| SourceItem::Op(find_query(i, CLIENT, SERVER, 0)))
        .collect();

    let (summary, _records) = run_replay(options_with_speed(f64::INFINITY), connector, ops).await;
    assert_eq!(summary.ops_played, 3);

    let order: Vec<i32> = behavior.executed().iter().map(|e| e.request_id).collect();
    assert_eq!(order, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn empty_source_shuts_down_cleanly() {
    let (connector, behavior) = ScriptedConnector::new();
    let (summary, records) = run_replay(options_with_speed(1.0), connector, Vec::new()).await;

    assert_eq!(summary, ReplaySummary::default());
    assert!(records.is_empty());
    assert!(behavior.executed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reply_only_capture_executes_nothing() {
    let (connector, behavior) = ScriptedConnector::new();

    let ops = vec![
        SourceItem::Op(recorded_reply(1, 1111, 0)),
        SourceItem::Op(recorded_reply(2, 2222, 10)),
    ];

    let (summary, records) = run_replay(options_with_speed(1.0), connector, ops).await;

    assert_eq!(summary.ops_played, 0);
    assert!(records.is_empty());
    assert!(behavior.executed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dial_failure_drains_in_skip_mode() {
    let (connector, behavior) = ScriptedConnector::failing_dials();

    let ops: Vec<SourceItem> = (1..=5)
        .map(|i| SourceItem::Op(find_query(i, CLIENT, SERVER, (i as u64) * 10)))
        .collect();

    let (summary, records) = run_replay(options_with_speed(f64::INFINITY), connector, ops).await;

    assert_eq!(summary.ops_played, 0);
    assert_eq!(summary.ops_skipped, 5);
    assert!(records.is_empty());
    assert!(behavior.executed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn decode_errors_skip_and_continue() {
    let (connector, behavior) = ScriptedConnector::new();

    let ops = vec![
        SourceItem::Err(Error::source_decode("truncated frame")),
        SourceItem::Err(Error::packets_dropped("7 packets unaccounted for")),
        SourceItem::Op(find_query(1, CLIENT, SERVER, 0)),
    ];

    let (summary, records) = run_replay(options_with_speed(1.0), connector, ops).await;

    assert_eq!(summary.ops_played, 1);
    assert_eq!(summary.source_errors, 2);
    assert_eq!(summary.dropped_packet_errors, 1);
    assert!(summary.packets_were_dropped());
    assert_eq!(records.len(), 1);
    assert_eq!(behavior.executed().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn msg_cursor_remap_applies_to_op_msg_traffic() {
    use mongoreplay::wire::{Message, MessageFlags, MessageSection};

    let (connector, behavior) = ScriptedConnector::new();

    // Live find reply carrying the live cursor id in OP_MSG form.
    let live_reply_doc = doc! {
        "cursor": { "id": 9999_i64, "ns": "test.events", "firstBatch": [] },
        "ok": 1.0,
    };
    let live_message = Message {
        flags: MessageFlags::empty(),
        sections: vec![MessageSection::Document(live_reply_doc)],
        checksum: None,
    };
    let live_body = live_message.to_body().unwrap();
    behavior.replies.lock().unwrap().insert(
        1,
        ReplyMessage {
            header: MessageHeader {
                length: (MessageHeader::LENGTH + live_body.len()) as i32,
                request_id: 90_001,
                response_to: 1,
                op_code: OpCode::Message as i32,
            },
            op: TypedOp::Msg(live_message),
        },
    );

    let find = TypedOp::Msg(Message {
        flags: MessageFlags::empty(),
        sections: vec![MessageSection::Document(
            doc! { "find": "events", "$db": "test" },
        )],
        checksum: None,
    });
    let recorded_find_reply = TypedOp::Msg(Message {
        flags: MessageFlags::empty(),
        sections: vec![MessageSection::Document(doc! {
            "cursor": { "id": 1111_i64, "ns": "test.events", "firstBatch": [] },
            "ok": 1.0,
        })],
        checksum: None,
    });
    let get_more = TypedOp::Msg(Message {
        flags: MessageFlags::empty(),
        sections: vec![MessageSection::Document(
            doc! { "getMore": 1111_i64, "collection": "events", "$db": "test" },
        )],
        checksum: None,
    });

    let ops = vec![
        SourceItem::Op(recorded(&find, 1, 0, CLIENT, SERVER, 0)),
        SourceItem::Op(recorded(&recorded_find_reply, 50_001, 1, SERVER, CLIENT, 10)),
        SourceItem::Op(recorded(&get_more, 2, 0, CLIENT, SERVER, 20)),
    ];

    let (summary, _records) = run_replay(options_with_speed(1.0), connector, ops).await;
    assert_eq!(summary.ops_played, 2);

    let executed = behavior.executed();
    assert_eq!(executed.len(), 2);
    match &executed[1].op {
        TypedOp::Msg(message) => {
            let doc = message.command_document().unwrap();
            assert_eq!(doc.get_i64("getMore").unwrap(), 9999);
        }
        other => panic!("second execute was not an OP_MSG: {:?}", other),
    }
}
