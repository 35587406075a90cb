//! Integration tests for the publish/subscribe surface against a scripted
//! in-memory server.

mod common;

use subwire::{ClientConfig, Client, ConnState, HeaderMap};

use common::{MockDialer, ServerConn};

fn config() -> ClientConfig {
    ClientConfig {
        servers: vec!["mock:4222".into()],
        ..ClientConfig::default()
    }
}

async fn connected() -> (Client, ServerConn, tokio::sync::mpsc::UnboundedReceiver<tokio::io::DuplexStream>) {
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

#[tokio::test]
async fn connect_sends_connect_and_ping() {
    let (dialer, mut accepts) = MockDialer::new();
    let server = tokio::spawn(async move {
        let mut conn = ServerConn::accept(&mut accepts).await;
        let connect = conn.handshake().await;
        (conn, connect)
    });
    let client = Client::connect_with(config(), dialer)
        .await
        .expect("connect");
    // The connection must outlive the assertions or the client starts
    // reconnecting underneath them.
    let (_conn, connect) = server.await.expect("server task");
    assert!(connect.contains(r#""protocol":1"#));
    assert!(connect.contains(r#""headers":true"#));
    assert_eq!(client.state(), ConnState::Connected);
    assert_eq!(client.server_info().max_payload, 1_048_576);
}

#[tokio::test]
async fn publish_emits_exact_wire_bytes() {
    let (client, mut conn, _accepts) = connected().await;
    client.publish("foo", "bar").await.expect("publish");
    assert_eq!(conn.read_exact(16).await, b"PUB foo 3\r\nbar\r\n");
}

#[tokio::test]
async fn publish_with_reply_and_headers() {
    let (client, mut conn, _accepts) = connected().await;

    client
        .publish_with_reply("svc", "me.reply", "hi")
        .await
        .expect("publish");
    let (subject, reply, payload) = conn.read_publish().await;
    assert_eq!(subject, "svc");
    assert_eq!(reply.as_deref(), Some("me.reply"));
    assert_eq!(payload, b"hi");

    let mut headers = HeaderMap::new();
    headers.insert("Trace-Id", "t1");
    client
        .publish_with_headers("evt", headers, "x")
        .await
        .expect("publish");
    let (subject, _reply, payload) = conn.read_publish().await;
    assert_eq!(subject, "evt");
    let text = String::from_utf8(payload).expect("utf8");
    assert!(text.starts_with("PROTO/1.0\r\n"));
    assert!(text.contains("Trace-Id: t1\r\n"));
    assert!(text.ends_with("\r\n\r\nx"));
}

#[tokio::test]
async fn publish_rejects_bad_subject_and_oversize() {
    let (client, _conn, _accepts) = connected().await;
    assert!(client.publish("has space", "x").await.is_err());
    assert!(client.publish("", "x").await.is_err());
    let oversize = vec![0u8; 1_048_577];
    assert!(client.publish("big", oversize).await.is_err());
}

#[tokio::test]
async fn subscribe_receives_messages_in_order() {
    let (client, mut conn, _accepts) = connected().await;
    let mut sub = client.subscribe("foo").await.expect("subscribe");
    let (subject, queue, sid) = conn.read_sub().await;
    assert_eq!(subject, "foo");
    assert_eq!(queue, None);
    assert_eq!(sid, 1);

    conn.deliver("foo", sid, None, b"bar").await;
    conn.deliver("foo", sid, None, b"baz").await;
    let first = sub.next().await.expect("first message");
    assert_eq!(first.subject, "foo");
    assert_eq!(first.sid, 1);
    assert_eq!(&first.payload[..], b"bar");
    let second = sub.next().await.expect("second message");
    assert_eq!(&second.payload[..], b"baz");
}

#[tokio::test]
async fn queue_subscription_includes_the_group() {
    let (client, mut conn, _accepts) = connected().await;
    let _sub = client
        .queue_subscribe("jobs", "workers")
        .await
        .expect("subscribe");
    let (subject, queue, _sid) = conn.read_sub().await;
    assert_eq!(subject, "jobs");
    assert_eq!(queue.as_deref(), Some("workers"));
}

#[tokio::test]
async fn sids_are_distinct_and_increasing() {
    let (client, mut conn, _accepts) = connected().await;
    let mut sids = Vec::new();
    for subject in ["a", "b", "c"] {
        let sub = client.subscribe(subject).await.expect("subscribe");
        let (_, _, sid) = conn.read_sub().await;
        sids.push(sid);
        // Dropping the handle unsubscribes.
        drop(sub);
        conn.expect_line(&format!("UNSUB {sid}")).await;
    }
    assert!(sids.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn unsubscribe_after_caps_deliveries() {
    let (client, mut conn, _accepts) = connected().await;
    let mut sub = client.subscribe("foo").await.expect("subscribe");
    let (_, _, sid) = conn.read_sub().await;

    sub.unsubscribe_after(1).await;
    conn.expect_line(&format!("UNSUB {sid} 1")).await;

    conn.deliver("foo", sid, None, b"kept").await;
    conn.deliver("foo", sid, None, b"dropped").await;
    assert_eq!(&sub.next().await.expect("capped delivery").payload[..], b"kept");
    assert!(sub.next().await.is_none());
}

#[tokio::test]
async fn header_delivery_exposes_status_and_entries() {
    let (client, mut conn, _accepts) = connected().await;
    let mut sub = client.subscribe("evt").await.expect("subscribe");
    let (_, _, sid) = conn.read_sub().await;

    conn.deliver_with_headers(
        "evt",
        sid,
        None,
        b"PROTO/1.0\r\nContent-Type: text/plain\r\n\r\n",
        b"body",
    )
    .await;
    let message = sub.next().await.expect("delivery");
    assert_eq!(message.header("content-type"), Some("text/plain"));
    assert_eq!(&message.payload[..], b"body");
    assert_eq!(message.status(), None);
}

#[tokio::test]
async fn server_ping_is_answered() {
    let (_client, mut conn, _accepts) = connected().await;
    conn.send(b"PING\r\n").await;
    conn.expect_line("PONG").await;
}

#[tokio::test]
async fn close_rejects_further_publishes() {
    let (client, _conn, _accepts) = connected().await;
    client.close().await;
    assert_eq!(client.state(), ConnState::Closed);
    assert!(client.publish("foo", "bar").await.is_err());
}
