//! End-to-end tests over real shard fixtures.

mod common;

use common::{Fixture, Row, truncated_blob};
use wechat_chat_export::engine::{CancelToken, Engine, EngineOptions, TimeRange};
use wechat_chat_export::{EngineError, Message};

const GROUP: &str = "group123@chatroom";

fn collect(engine: &Engine, id: &str, range: TimeRange, limit: Option<usize>) -> Vec<Message> {
    engine
        .stream_messages(id, range, limit)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

#[test]
fn merges_group_across_shards_and_survives_corrupt_blob() {
    let fx = Fixture::new();
    fx.shard(
        0,
        &[
            Row::text(GROUP, 1, 100, "first").from_member("wxid_alice"),
            Row::text(GROUP, 3, 300, "third").from_member("wxid_bob"),
        ],
    );
    fx.shard(
        1,
        &[
            Row::text(GROUP, 2, 200, "second").with_extra(truncated_blob()),
            Row::text(GROUP, 4, 400, "fourth").sent(),
        ],
    );
    fx.contacts(
        &[("wxid_alice", "", "Alice", ""), (GROUP, "", "Family", "")],
        &[(GROUP, "wxid_bob", "", "Bobby", "")],
    );

    let engine = Engine::open(fx.root(), EngineOptions::default()).unwrap();
    assert_eq!(engine.shards().len(), 2);

    let mut stream = engine
        .stream_messages(GROUP, TimeRange::default(), None)
        .unwrap();
    let messages: Vec<Message> = stream.by_ref().map(Result::unwrap).collect();

    let times: Vec<i64> = messages.iter().map(|m| m.timestamp).collect();
    assert_eq!(times, vec![100, 200, 300, 400]);
    let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["first", "second", "third", "fourth"]);

    assert_eq!(messages[0].sender.display, "Alice");
    assert_eq!(messages[0].conversation.display, "Family");
    // corrupt blob: sender falls back to the group itself
    assert_eq!(messages[1].sender.id, GROUP);
    assert!(messages[1].metadata.contains_key("binary_field_error"));
    assert_eq!(messages[2].sender.display, "Bobby");
    assert_eq!(messages[3].sender.id, "self");
    assert_eq!(messages[3].sender.display, "Me");
    assert!(messages.iter().all(|m| m.is_group));

    let report = stream.report();
    assert_eq!(report.malformed_fields, 1);
    assert_eq!(report.yielded, 4);
    assert!(report.unreadable_shards.is_empty());
}

#[test]
fn limit_applies_after_merge() {
    let fx = Fixture::new();
    let a: Vec<Row> = (0..5)
        .map(|i| Row::text("wxid_x", 10 + i, 10 + i * 2, "a"))
        .collect();
    let b: Vec<Row> = (0..5)
        .map(|i| Row::text("wxid_x", 20 + i, 11 + i * 2, "b"))
        .collect();
    fx.shard(0, &a);
    fx.shard(1, &b);

    let engine = Engine::open(fx.root(), EngineOptions::default()).unwrap();
    let messages = collect(&engine, "wxid_x", TimeRange::default(), Some(6));
    let times: Vec<i64> = messages.iter().map(|m| m.timestamp).collect();
    assert_eq!(times, vec![10, 11, 12, 13, 14, 15]);
}

#[test]
fn small_pages_keep_order() {
    let fx = Fixture::new();
    let rows: Vec<Row> = (0..25)
        .map(|i| Row::text("wxid_x", i + 1, 1000 + i / 3, &format!("m{i}")))
        .collect();
    fx.shard(0, &rows);

    let options = EngineOptions {
        page_size: 4,
        ..Default::default()
    };
    let engine = Engine::open(fx.root(), options).unwrap();
    let messages = collect(&engine, "wxid_x", TimeRange::default(), None);
    let texts: Vec<String> = messages.iter().map(|m| m.text.clone()).collect();
    let expected: Vec<String> = (0..25).map(|i| format!("m{i}")).collect();
    assert_eq!(texts, expected);
}

#[test]
fn real_create_time_at_page_boundary_still_advances() {
    let fx = Fixture::new();
    fx.shard(
        0,
        &[
            Row::text("wxid_x", 0, 100, "a").at_real_time(100.5),
            Row::text("wxid_x", 0, 200, "b"),
            Row::text("wxid_x", 9, 150, "c").at_real_time(150.25),
        ],
    );
    let options = EngineOptions {
        page_size: 1,
        ..Default::default()
    };
    let engine = Engine::open(fx.root(), options).unwrap();

    let messages = collect(&engine, "wxid_x", TimeRange::default(), Some(5));
    let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, vec!["a", "c", "b"]);
    assert_eq!(messages[0].timestamp, 100);
    assert_eq!(messages[1].timestamp, 150);
}

#[test]
fn corrupt_card_is_yielded_with_fallback_text() {
    let fx = Fixture::new();
    fx.shard(
        0,
        &[
            Row::text("wxid_x", 1, 100, "shared a link").card(vec![0xff; 8]),
            Row::text("wxid_x", 2, 200, "after"),
        ],
    );
    let engine = Engine::open(fx.root(), EngineOptions::default()).unwrap();

    let mut stream = engine
        .stream_messages("wxid_x", TimeRange::default(), None)
        .unwrap();
    let messages: Vec<Message> = stream.by_ref().map(Result::unwrap).collect();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].msg_type, 49);
    assert_eq!(messages[0].text, "shared a link");
    assert_eq!(messages[0].metadata["decompression_failed"], "true");
    assert_eq!(messages[1].text, "after");
    assert_eq!(stream.report().decompression_failures, 1);
    assert_eq!(stream.report().malformed_fields, 0);
}

#[test]
fn time_range_is_half_open() {
    let fx = Fixture::new();
    fx.shard(
        0,
        &[
            Row::text("wxid_x", 1, 100, "a"),
            Row::text("wxid_x", 2, 200, "b"),
            Row::text("wxid_x", 3, 300, "c"),
        ],
    );
    let engine = Engine::open(fx.root(), EngineOptions::default()).unwrap();
    let messages = collect(&engine, "wxid_x", TimeRange::new(Some(200), Some(300)), None);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text, "b");

    let empty = collect(&engine, "wxid_x", TimeRange::new(Some(400), None), None);
    assert!(empty.is_empty());
}

#[test]
fn unreadable_shard_is_skipped() {
    let fx = Fixture::new();
    fx.shard(0, &[Row::text("wxid_x", 1, 100, "ok")]);
    fx.garbage_shard(9);

    let engine = Engine::open(fx.root(), EngineOptions::default()).unwrap();
    assert_eq!(engine.open_report().unreadable_shards.len(), 1);

    let mut stream = engine
        .stream_messages("wxid_x", TimeRange::default(), None)
        .unwrap();
    let messages: Vec<Message> = stream.by_ref().map(Result::unwrap).collect();
    assert_eq!(messages.len(), 1);
    let report = stream.into_report();
    assert_eq!(report.unreadable_shards.len(), 1);
    assert!(report.unreadable_shards[0].path.ends_with("MSG9.db"));
    assert!(!report.is_clean());
}

#[test]
fn duplicate_server_ids_are_skipped() {
    let fx = Fixture::new();
    fx.shard(0, &[Row::text("wxid_x", 7, 100, "copy"), Row::text("wxid_x", 0, 150, "local")]);
    fx.shard(1, &[Row::text("wxid_x", 7, 100, "copy"), Row::text("wxid_x", 0, 150, "local")]);

    let engine = Engine::open(fx.root(), EngineOptions::default()).unwrap();
    let mut stream = engine
        .stream_messages("wxid_x", TimeRange::default(), None)
        .unwrap();
    let count = stream.by_ref().filter_map(Result::ok).count();
    // zero server ids are never treated as duplicates
    assert_eq!(count, 3);
    assert_eq!(stream.report().duplicates_skipped, 1);
}

#[test]
fn conversations_fall_back_to_talkers() {
    let fx = Fixture::new();
    fx.bare_shard(0, &[Row::text("wxid_y", 1, 1, "hi")]);
    fx.shard(1, &[Row::text("wxid_x", 2, 2, "hi")]);

    let engine = Engine::open(fx.root(), EngineOptions::default()).unwrap();
    let ids: Vec<&str> = engine
        .list_conversations()
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(ids, vec!["wxid_x", "wxid_y"]);
}

#[test]
fn unknown_conversation_is_an_error() {
    let fx = Fixture::new();
    fx.shard(0, &[Row::text("wxid_x", 1, 1, "hi")]);
    let engine = Engine::open(fx.root(), EngineOptions::default()).unwrap();
    assert!(matches!(
        engine.stream_messages("nobody", TimeRange::default(), None),
        Err(EngineError::ConversationNotFound(_))
    ));
}

#[test]
fn missing_root_is_fatal() {
    let fx = Fixture::new();
    let missing = fx.root().join("nope");
    assert!(matches!(
        Engine::open(&missing, EngineOptions::default()),
        Err(EngineError::RootNotFound(_))
    ));
}

#[test]
fn queries_resolve_by_name_and_report_ambiguity() {
    let fx = Fixture::new();
    fx.shard(
        0,
        &[
            Row::text("wxid_anna", 1, 1, "a"),
            Row::text("wxid_annabel", 2, 2, "b"),
            Row::text(GROUP, 3, 3, "c"),
        ],
    );
    fx.contacts(
        &[
            ("wxid_anna", "", "Anna", ""),
            ("wxid_annabel", "", "Annabel", ""),
            (GROUP, "", "Family", ""),
        ],
        &[],
    );
    let engine = Engine::open(fx.root(), EngineOptions::default()).unwrap();

    let one = engine.resolve_conversation_query("family").unwrap();
    assert_eq!(one.into_iter().collect::<Vec<_>>(), vec![GROUP.to_string()]);

    // exact name beats the substring match on Annabel
    let anna = engine.resolve_conversation_query("Anna").unwrap();
    assert!(anna.contains("wxid_anna"));

    match engine.resolve_conversation_query("ann") {
        Err(EngineError::AmbiguousConversationQuery { candidates, .. }) => {
            assert_eq!(candidates, vec!["wxid_anna", "wxid_annabel"]);
        }
        other => panic!("expected ambiguity, got {other:?}"),
    }
    assert!(matches!(
        engine.resolve_conversation_query("zzz"),
        Err(EngineError::ConversationNotFound(_))
    ));

    let both = engine
        .resolve_conversation_queries(&["Anna", "Family"])
        .unwrap();
    assert_eq!(both.len(), 2);
}

#[test]
fn cancellation_ends_the_stream() {
    let fx = Fixture::new();
    let rows: Vec<Row> = (0..10).map(|i| Row::text("wxid_x", i + 1, i, "m")).collect();
    fx.shard(0, &rows);
    let engine = Engine::open(fx.root(), EngineOptions::default()).unwrap();

    let token = CancelToken::new();
    let mut stream = engine
        .stream_messages("wxid_x", TimeRange::default(), None)
        .unwrap()
        .with_cancellation(token.clone());
    assert!(stream.next().unwrap().is_ok());
    token.cancel();
    assert!(matches!(stream.next(), Some(Err(EngineError::Cancelled))));
    assert!(stream.next().is_none());
    assert!(stream.report().cancelled);

    let pre = CancelToken::new();
    pre.cancel();
    let mut stream = engine
        .stream_messages("wxid_x", TimeRange::default(), None)
        .unwrap()
        .with_cancellation(pre);
    assert!(matches!(stream.next(), Some(Err(EngineError::Cancelled))));
}

#[test]
fn streams_run_concurrently() {
    let fx = Fixture::new();
    let rows: Vec<Row> = (0..50)
        .flat_map(|i| {
            [
                Row::text("wxid_a", i * 2 + 1, i, "a"),
                Row::text("wxid_b", i * 2 + 2, i, "b"),
            ]
        })
        .collect();
    fx.shard(0, &rows);
    let engine = Engine::open(fx.root(), EngineOptions::default()).unwrap();

    std::thread::scope(|s| {
        let a = s.spawn(|| collect(&engine, "wxid_a", TimeRange::default(), None).len());
        let b = s.spawn(|| collect(&engine, "wxid_b", TimeRange::default(), None).len());
        assert_eq!(a.join().unwrap(), 50);
        assert_eq!(b.join().unwrap(), 50);
    });
}
