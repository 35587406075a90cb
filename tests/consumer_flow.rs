//! Integration tests for pull-consumer flow control against a scripted
//! stream API.

mod common;

use std::time::Duration;

use subwire::{
    Client, ClientConfig, ConsumerConfig, ConsumerError, PullConsumer, PullOptions,
};

use common::{MockDialer, ServerConn};

fn config() -> ClientConfig {
    ClientConfig {
        servers: vec!["mock:4222".into()],
        ..ClientConfig::default()
    }
}

async fn connected() -> (
    Client,
    ServerConn,
    tokio::sync::mpsc::UnboundedReceiver<tokio::io::DuplexStream>,
) {
    let (dialer, mut accepts) = MockDialer::new();
    let server = tokio::spawn(async move {
        let mut conn = ServerConn::accept(&mut accepts).await;
        conn.handshake().await;
        (conn, accepts)
    });
    let client = Client::connect_with(config(), dialer)
        .await
        .expect("connect");
    let (conn, accepts) = server.await.expect("server task");
    (client, conn, accepts)
}

fn info_json(stream: &str, name: &str) -> Vec<u8> {
    format!(
        r#"{{"stream_name":"{stream}","name":"{name}","config":{{"ack_policy":"none","deliver_policy":"all"}},"num_pending":0}}"#
    )
    .into_bytes()
}

/// Ack reply subject carrying `(stream_seq, delivery_seq)` metadata.
fn ack_subject(stream: &str, name: &str, stream_seq: u64, delivery_seq: u64) -> String {
    format!("$JS.ACK.{stream}.{name}.1.{stream_seq}.{delivery_seq}.1693000000.0")
}

/// Serve the consumer-create exchange; returns the mux sid, the delivery
/// inbox, and its sid.
async fn serve_create(conn: &mut ServerConn, stream: &str, name: &str) -> (u64, String, u64) {
    // The first API request sets up the shared reply inbox.
    let (_, _, mux_sid) = conn.read_sub().await;
    let (subject, reply, _body) = conn.read_publish().await;
    assert!(
        subject.starts_with(&format!("$STR.API.CONSUMER.CREATE.{stream}")),
        "got {subject:?}"
    );
    let reply = reply.expect("create is a request");
    conn.deliver(&reply, mux_sid, None, &info_json(stream, name))
        .await;
    let (inbox, _, inbox_sid) = conn.read_sub().await;
    (mux_sid, inbox, inbox_sid)
}

/// Read a pull request; returns its JSON body.
async fn read_pull(conn: &mut ServerConn, stream: &str, name: &str, inbox: &str) -> Vec<u8> {
    let (subject, reply, body) = conn.read_publish().await;
    assert_eq!(
        subject,
        format!("$STR.API.CONSUMER.MSG.NEXT.{stream}.{name}")
    );
    assert_eq!(reply.as_deref(), Some(inbox));
    body
}

#[tokio::test]
async fn fetch_delivers_the_batch_and_ends_on_no_messages() {
    let (client, mut conn, _accepts) = connected().await;
    let server = tokio::spawn(async move {
        let (_, inbox, inbox_sid) = serve_create(&mut conn, "EVENTS", "c1").await;
        let body = read_pull(&mut conn, "EVENTS", "c1", &inbox).await;
        let text = String::from_utf8(body).expect("utf8 pull body");
        assert!(text.contains(r#""batch":3"#));
        conn.deliver(&inbox, inbox_sid, None, b"m1").await;
        conn.deliver(&inbox, inbox_sid, None, b"m2").await;
        conn.deliver_status(
            &inbox,
            inbox_sid,
            None,
            "404 No Messages",
            &[("Pending-Messages", "1")],
        )
        .await;
        conn
    });

    let mut consumer = PullConsumer::create(
        &client,
        "EVENTS",
        ConsumerConfig {
            name: Some("c1".into()),
            ..ConsumerConfig::default()
        },
    )
    .await
    .expect("create");

    let mut batch = consumer.fetch(3);
    let mut payloads = Vec::new();
    while let Some(message) = batch.next().await {
        payloads.push(message.expect("delivery").payload);
    }
    assert_eq!(payloads, vec!["m1", "m2"]);
    server.await.expect("server task");
}

#[tokio::test]
async fn discard_status_frees_budget_for_the_next_fetch() {
    let (client, mut conn, _accepts) = connected().await;
    let server = tokio::spawn(async move {
        let (_, inbox, inbox_sid) = serve_create(&mut conn, "EVENTS", "c1").await;

        // First fetch: one delivery, the rest discarded by an expiry.
        let _ = read_pull(&mut conn, "EVENTS", "c1", &inbox).await;
        conn.deliver(&inbox, inbox_sid, None, b"first").await;
        conn.deliver_status(
            &inbox,
            inbox_sid,
            None,
            "408 Request Timeout",
            &[("Pending-Messages", "4"), ("Pending-Bytes", "0")],
        )
        .await;

        // The next fetch pulls the full batch again.
        let body = read_pull(&mut conn, "EVENTS", "c1", &inbox).await;
        let text = String::from_utf8(body).expect("utf8 pull body");
        assert!(text.contains(r#""batch":5"#));
        conn.deliver(&inbox, inbox_sid, None, b"second").await;
        conn.deliver_status(&inbox, inbox_sid, None, "404 No Messages", &[])
            .await;
        conn
    });

    let mut consumer = PullConsumer::create(
        &client,
        "EVENTS",
        ConsumerConfig {
            name: Some("c1".into()),
            ..ConsumerConfig::default()
        },
    )
    .await
    .expect("create")
    .with_options(PullOptions {
        max_messages: 5,
        ..PullOptions::default()
    });

    let mut batch = consumer.fetch(5);
    let mut first = Vec::new();
    while let Some(message) = batch.next().await {
        first.push(message.expect("delivery").payload);
    }
    drop(batch);
    assert_eq!(first, vec!["first"]);

    let mut batch = consumer.fetch(5);
    let mut second = Vec::new();
    while let Some(message) = batch.next().await {
        second.push(message.expect("delivery").payload);
    }
    assert_eq!(second, vec!["second"]);
    server.await.expect("server task");
}

#[tokio::test(start_paused = true)]
async fn quiet_heartbeat_windows_surface_as_a_recoverable_error() {
    let (client, mut conn, _accepts) = connected().await;
    let server = tokio::spawn(async move {
        let (_, inbox, _) = serve_create(&mut conn, "EVENTS", "c1").await;
        let _ = read_pull(&mut conn, "EVENTS", "c1", &inbox).await;
        // Send neither messages nor heartbeats.
        conn
    });

    let mut consumer = PullConsumer::create(
        &client,
        "EVENTS",
        ConsumerConfig {
            name: Some("c1".into()),
            ..ConsumerConfig::default()
        },
    )
    .await
    .expect("create")
    .with_options(PullOptions {
        idle_heartbeat: Duration::from_secs(1),
        heartbeat_misses: 2,
        ..PullOptions::default()
    });

    let mut batch = consumer.fetch(1);
    let error = batch.next().await.expect("an error, not end of fetch");
    assert!(matches!(
        error,
        Err(ConsumerError::MissedHeartbeats)
    ));
    server.await.expect("server task");
}

#[tokio::test]
async fn terminal_conflict_fails_the_consumer() {
    let (client, mut conn, _accepts) = connected().await;
    let server = tokio::spawn(async move {
        let (_, inbox, inbox_sid) = serve_create(&mut conn, "EVENTS", "c1").await;
        let _ = read_pull(&mut conn, "EVENTS", "c1", &inbox).await;
        conn.deliver_status(&inbox, inbox_sid, None, "409 Consumer Deleted", &[])
            .await;
        conn
    });

    let mut consumer = PullConsumer::create(
        &client,
        "EVENTS",
        ConsumerConfig {
            name: Some("c1".into()),
            ..ConsumerConfig::default()
        },
    )
    .await
    .expect("create");

    let error = consumer.next().await.expect_err("terminal 409");
    let ConsumerError::Terminal { code, description } = error else {
        panic!("expected a terminal error, got another variant");
    };
    assert_eq!(code, 409);
    assert_eq!(description, "Consumer Deleted");
    server.await.expect("server task");
}

#[tokio::test]
async fn api_error_envelopes_are_surfaced() {
    let (client, mut conn, _accepts) = connected().await;
    let server = tokio::spawn(async move {
        let (_, _, mux_sid) = conn.read_sub().await;
        let (_, reply, _) = conn.read_publish().await;
        let reply = reply.expect("create is a request");
        conn.deliver(
            &reply,
            mux_sid,
            None,
            br#"{"error":{"code":404,"description":"stream not found"}}"#,
        )
        .await;
        conn
    });

    let error = PullConsumer::create(&client, "MISSING", ConsumerConfig::default())
        .await
        .expect_err("api error");
    let ConsumerError::Api { code, description } = error else {
        panic!("expected an api error, got another variant");
    };
    assert_eq!(code, 404);
    assert_eq!(description, "stream not found");
    server.await.expect("server task");
}

#[tokio::test]
async fn ordered_gap_triggers_exactly_one_recreate_from_the_next_sequence() {
    let (client, mut conn, _accepts) = connected().await;
    let server = tokio::spawn(async move {
        let (mux_sid, inbox, inbox_sid) = serve_create(&mut conn, "EVENTS", "o1").await;

        let _ = read_pull(&mut conn, "EVENTS", "o1", &inbox).await;
        conn.deliver(
            &inbox,
            inbox_sid,
            Some(&ack_subject("EVENTS", "o1", 1, 1)),
            b"a",
        )
        .await;
        conn.deliver(
            &inbox,
            inbox_sid,
            Some(&ack_subject("EVENTS", "o1", 2, 2)),
            b"b",
        )
        .await;
        // Delivery sequence 4 after 2: a gap.
        conn.deliver(
            &inbox,
            inbox_sid,
            Some(&ack_subject("EVENTS", "o1", 4, 4)),
            b"lost",
        )
        .await;

        // Recovery: delete the stale consumer, rebind the inbox, recreate
        // from the sequence after the last accepted message.
        let (subject, reply, _) = conn.read_publish().await;
        assert_eq!(subject, "$STR.API.CONSUMER.DELETE.EVENTS.o1");
        conn.deliver(
            &reply.expect("delete is a request"),
            mux_sid,
            None,
            br#"{"success":true}"#,
        )
        .await;

        conn.expect_line(&format!("UNSUB {inbox_sid}")).await;
        let (new_inbox, _, new_sid) = conn.read_sub().await;
        assert_ne!(new_inbox, inbox);

        let (subject, reply, body) = conn.read_publish().await;
        assert!(subject.starts_with("$STR.API.CONSUMER.CREATE.EVENTS."));
        let text = String::from_utf8(body).expect("utf8 create body");
        assert!(text.contains(r#""deliver_policy":"by_start_sequence""#));
        assert!(text.contains(r#""opt_start_seq":3"#));
        conn.deliver(
            &reply.expect("create is a request"),
            mux_sid,
            None,
            &info_json("EVENTS", "o2"),
        )
        .await;

        let _ = read_pull(&mut conn, "EVENTS", "o2", &new_inbox).await;
        conn.deliver(
            &new_inbox,
            new_sid,
            Some(&ack_subject("EVENTS", "o2", 3, 1)),
            b"c",
        )
        .await;
        conn
    });

    let mut consumer = PullConsumer::create_ordered(&client, "EVENTS")
        .await
        .expect("create ordered");

    let mut messages = consumer.consume();
    let mut payloads = Vec::new();
    for _ in 0..3 {
        let message = messages
            .next()
            .await
            .expect("stream continues")
            .expect("delivery");
        payloads.push(message.payload);
    }
    // The gap message is absorbed by recovery and redelivered in order.
    assert_eq!(payloads, vec!["a", "b", "c"]);
    server.await.expect("server task");
}
