use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{StreamExt as _, TryStreamExt as _};
use sling::stream::{channel, failed, stream, Consumer, Terminal};
use sling::{get_context, Client, ClientConfig, ClientExt as _, Code, Server, ServerHandle};
use sling::{Result, ServerConfig, Service, Status};
use tokio::time::{sleep, Instant};

const SERVICE: &str = "test.Test";

#[derive(Clone, PartialEq, prost::Message)]
struct Ping {
    #[prost(string, tag = "1")]
    text: String,
}

#[derive(Clone, PartialEq, prost::Message)]
struct Count {
    #[prost(uint64, tag = "1")]
    value: u64,
}

fn ping(text: &str) -> Ping {
    Ping {
        text: text.to_owned(),
    }
}

type Events = Arc<Mutex<Vec<(&'static str, Terminal)>>>;

#[derive(Default, Clone)]
struct Recorder {
    pulled: Arc<AtomicU64>,
    events: Events,
}

fn record(events: &Events, name: &'static str) -> impl FnOnce(&Terminal) + Send + 'static {
    let events = events.clone();
    move |terminal| events.lock().unwrap().push((name, terminal.clone()))
}

fn test_service(recorder: &Recorder) -> Service {
    let pulled = recorder.pulled.clone();
    let events = recorder.events.clone();

    Service::new(SERVICE)
        .unary("Echo", |req: Ping| async move {
            if req.text.is_empty() {
                return Err(Status::invalid_argument("No text"));
            }
            Ok(req)
        })
        .unary("Header", |_: Ping| async move {
            let ctx = get_context();
            Ok(ping(ctx.metadata.get("x-name").unwrap_or_default()))
        })
        .unary("Panic", |_: Ping| async move {
            if true {
                panic!("handler blew up");
            }
            Ok(ping(""))
        })
        .unary("Sleep", |req: Ping| async move {
            sleep(Duration::from_secs(3600)).await;
            Ok(req)
        })
        .client_streaming("Collect", |requests: Consumer<Ping>| async move {
            let texts: Vec<String> = requests.map_ok(|req| req.text).try_collect().await?;
            Ok(ping(&texts.join(",")))
        })
        .client_streaming("TakeTwo", |requests: Consumer<Ping>| async move {
            requests.request(2);
            let texts: Vec<String> = requests.map_ok(|req| req.text).try_collect().await?;
            Ok(ping(&texts.join(",")))
        })
        .server_streaming("Count", move |_: Ping| {
            let pulled = pulled.clone();
            stream! {
                for value in 0.. {
                    pulled.fetch_add(1, Ordering::SeqCst);
                    yield Ok::<_, Status>(Count { value });
                }
            }
        })
        .server_streaming("Fail", |_: Ping| {
            stream! {
                yield Ok(Count { value: 1 });
                yield Ok(Count { value: 2 });
                yield Err(Status::not_found("Nothing more"));
            }
        })
        .server_streaming("Reject", |_: Ping| {
            failed::<Count>(Status::invalid_argument("No name found"))
        })
        .server_streaming("Pair", |_: Ping| {
            stream! {
                yield Ok::<_, Status>(Count { value: 1 });
                yield Ok(Count { value: 2 });
            }
        })
        .duplex_streaming("Chat", |requests: Consumer<Ping>| requests)
        .duplex_streaming("Stall", move |requests: Consumer<Ping>| {
            let (replies, out) = channel::<Ping>();
            requests.on_terminal(record(&events, "requests"));
            replies.on_terminal(record(&events, "replies"));
            tokio::spawn(async move {
                // never answers, holds both ends until the call is torn down
                let _requests = requests;
                replies.closed().await;
            });
            out
        })
}

fn serve(server: &Server, config: ClientConfig) -> (Client, ServerHandle) {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let handle = server.serve(server_end);
    (Client::with_config(client_end, config), handle)
}

fn connect(recorder: &Recorder, config: ClientConfig) -> (Client, ServerHandle) {
    let mut server = Server::new();
    server.add_service(test_service(recorder));
    serve(&server, config)
}

fn setup() -> (Client, ServerHandle, Recorder) {
    let recorder = Recorder::default();
    let (client, handle) = connect(&recorder, ClientConfig::default());
    (client, handle, recorder)
}

async fn drain<T>(mut replies: Consumer<T>) -> (usize, Option<Status>) {
    let mut count = 0;
    while let Some(reply) = replies.next().await {
        match reply {
            Ok(_) => count += 1,
            Err(status) => return (count, Some(status)),
        }
    }
    (count, None)
}

#[tokio::test]
async fn unary_call_returns_the_reply() {
    let (client, _server, _) = setup();

    let reply: Result<Ping> = client.unary(SERVICE, "Echo").invoke(ping("hello")).await;
    assert_eq!(reply.unwrap().text, "hello");
}

#[tokio::test]
async fn unary_failure_reaches_the_caller() {
    let (client, _server, _) = setup();

    let status = client
        .unary::<Ping, Ping>(SERVICE, "Echo")
        .invoke(ping(""))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(status.message, "No text");
}

#[tokio::test]
async fn unknown_methods_are_unimplemented() {
    let (client, _server, _) = setup();

    let status = client
        .unary::<Ping, Ping>(SERVICE, "Missing")
        .invoke(ping("hello"))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);
    assert_eq!(status.message, "/test.Test/Missing is not supported");

    let status = client
        .unary::<Ping, Ping>("test.Other", "Echo")
        .invoke(ping("hello"))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unimplemented);
}

#[tokio::test]
async fn calling_with_the_wrong_shape_is_rejected() {
    let (client, _server, _) = setup();

    // "Count" streams its replies, so it expects a request stream to stay closed
    let replies = client
        .duplex_streaming::<Ping, Count>(SERVICE, "Count")
        .invoke(futures::stream::empty());
    let (count, status) = drain(replies).await;
    assert_eq!(count, 0);
    assert_eq!(status.unwrap().code(), Code::InvalidArgument);
}

#[tokio::test]
async fn handler_panics_become_internal_errors() {
    let (client, _server, _) = setup();

    let status = client
        .unary::<Ping, Ping>(SERVICE, "Panic")
        .invoke(ping("hello"))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert_eq!(status.message, "Internal error");

    // the connection survives
    let reply: Ping = client
        .unary(SERVICE, "Echo")
        .invoke(ping("still here"))
        .await
        .unwrap();
    assert_eq!(reply.text, "still here");
}

#[tokio::test]
async fn metadata_reaches_the_handler() {
    let (client, _server, _) = setup();

    let reply: Ping = client
        .unary(SERVICE, "Header")
        .add_header("x-name", "alice")
        .invoke(ping(""))
        .await
        .unwrap();
    assert_eq!(reply.text, "alice");

    let client = client.with_metadata([("x-name", "bob")]);
    let reply: Ping = client
        .unary(SERVICE, "Header")
        .invoke(ping(""))
        .await
        .unwrap();
    assert_eq!(reply.text, "bob");
}

#[tokio::test]
async fn client_streaming_collects_every_request() {
    let (client, _server, _) = setup();

    let requests = futures::stream::iter(["a", "b", "c"].map(ping));
    let reply: Ping = client
        .client_streaming(SERVICE, "Collect")
        .invoke(requests)
        .await
        .unwrap();
    assert_eq!(reply.text, "a,b,c");
}

#[tokio::test]
async fn duplex_streaming_echoes_in_order() {
    let (client, _server, _) = setup();

    let texts: Vec<String> = (0..40).map(|n| n.to_string()).collect();
    let requests = futures::stream::iter(texts.clone()).map(|text| Ping { text });
    let replies: Vec<String> = client
        .duplex_streaming::<Ping, Ping>(SERVICE, "Chat")
        .invoke(requests)
        .map_ok(|reply| reply.text)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(replies, texts);
}

#[tokio::test]
async fn server_stream_failure_follows_its_elements() {
    let (client, _server, _) = setup();

    let mut replies = client
        .server_streaming::<Ping, Count>(SERVICE, "Fail")
        .invoke(ping(""));
    assert_eq!(replies.next().await.unwrap().unwrap().value, 1);
    assert_eq!(replies.next().await.unwrap().unwrap().value, 2);
    let status = replies.next().await.unwrap().unwrap_err();
    assert_eq!(status.code(), Code::NotFound);
    assert!(replies.next().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn demand_limits_what_the_server_produces() {
    let recorder = Recorder::default();
    let config = ClientConfig {
        reply_window: 4,
        ..Default::default()
    };
    let (client, _server) = connect(&recorder, config);

    let mut replies = client
        .server_streaming::<Ping, Count>(SERVICE, "Count")
        .invoke(ping(""));

    // the window, plus the element waiting for credit
    sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.pulled.load(Ordering::SeqCst), 5);

    for expected in 0..2 {
        assert_eq!(replies.next().await.unwrap().unwrap().value, expected);
    }

    // consuming half of the window tops it up again
    sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.pulled.load(Ordering::SeqCst), 7);

    drop(replies);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.pulled.load(Ordering::SeqCst), 7);
}

#[tokio::test(start_paused = true)]
async fn deadline_cancels_both_streams() {
    let (client, _server, recorder) = setup();

    let replies = client
        .duplex_streaming::<Ping, Ping>(SERVICE, "Stall")
        .with_timeout(Duration::from_secs(1))
        .invoke(futures::stream::pending());

    let (count, status) = drain(replies).await;
    assert_eq!(count, 0);
    assert_eq!(status.unwrap().code(), Code::DeadlineExceeded);

    sleep(Duration::from_millis(100)).await;
    let mut events = recorder.events.lock().unwrap().clone();
    events.sort_by_key(|(name, _)| *name);
    assert_eq!(
        events,
        [
            ("replies", Terminal::Cancelled),
            ("requests", Terminal::Cancelled)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn waiting_for_a_reply_can_time_out() {
    let (client, _server, _) = setup();

    let mut reply = client.unary::<Ping, Ping>(SERVICE, "Sleep").invoke(ping("zzz"));
    let status = reply.wait(Duration::from_secs(2)).await.unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert!(status.message.starts_with("Timed out after"));

    reply.cancel();
    let status = reply.await.unwrap_err();
    assert_eq!(status.code(), Code::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn closing_the_client_cancels_calls_in_flight() {
    let (client, _server, _) = setup();

    let mut replies = client
        .server_streaming::<Ping, Count>(SERVICE, "Count")
        .invoke(ping(""));
    assert_eq!(replies.next().await.unwrap().unwrap().value, 0);

    client.close();
    assert!(client.is_closed());

    let (_, status) = drain(replies).await;
    assert_eq!(status.unwrap().code(), Code::Cancelled);

    let status = client
        .unary::<Ping, Ping>(SERVICE, "Echo")
        .invoke(ping("late"))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Cancelled);
    assert_eq!(status.message, "Client was closed");
}

#[tokio::test(start_paused = true)]
async fn server_shutdown_cancels_calls_in_flight() {
    let (client, server, _) = setup();

    let reply = client.unary::<Ping, Ping>(SERVICE, "Sleep").invoke(ping("zzz"));
    sleep(Duration::from_millis(10)).await;

    server.shutdown();
    let status = reply.await.unwrap_err();
    assert_eq!(status.code(), Code::Cancelled);
    assert_eq!(status.message, "Server is shutting down");

    server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dropping_the_server_fails_pending_calls() {
    let (client, server, _) = setup();

    let reply = client.unary::<Ping, Ping>(SERVICE, "Sleep").invoke(ping("zzz"));
    sleep(Duration::from_millis(10)).await;

    server.terminate();
    let status = reply.await.unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
}

#[tokio::test]
async fn calls_can_wait_on_an_idle_stream() {
    let (client, _server, _) = setup();

    let mut replies = client
        .duplex_streaming::<Ping, Ping>(SERVICE, "Chat")
        .invoke(stream! {
            yield ping("first");
            pending::<()>().await;
        });
    assert_eq!(replies.next().await.unwrap().unwrap().text, "first");
    let waited = replies.recv_timeout(Duration::from_millis(20)).await;
    assert_eq!(waited.unwrap_err().code(), Code::DeadlineExceeded);
    assert!(replies.terminal().is_none());
}

#[tokio::test(start_paused = true)]
async fn replies_end_and_fail_without_demand() {
    let config = ClientConfig {
        reply_window: 0,
        ..Default::default()
    };
    let (client, _server) = connect(&Recorder::default(), config);
    let patience = Duration::from_secs(1);

    let mut replies = client
        .server_streaming::<Ping, Count>(SERVICE, "Reject")
        .invoke(ping(""));
    let status = replies.recv_timeout(patience).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(status.message, "No name found");

    let mut replies = client
        .server_streaming::<Ping, Count>(SERVICE, "Pair")
        .invoke(ping(""));
    replies.request(2);
    for expected in 1..=2 {
        let reply = replies.recv_timeout(patience).await.unwrap().unwrap();
        assert_eq!(reply.value, expected);
    }
    assert!(replies.recv_timeout(patience).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn requests_end_without_demand() {
    let mut server = Server::with_config(ServerConfig { request_window: 0 });
    server.add_service(test_service(&Recorder::default()));
    let (client, _server) = serve(&server, ClientConfig::default());
    let patience = Duration::from_secs(1);

    // the service asks for exactly two requests and nothing more
    let requests = futures::stream::iter(["a", "b"].map(ping));
    let reply: Ping = client
        .client_streaming(SERVICE, "TakeTwo")
        .invoke(requests)
        .wait(patience)
        .await
        .unwrap();
    assert_eq!(reply.text, "a,b");

    let reply: Ping = client
        .client_streaming(SERVICE, "TakeTwo")
        .invoke(futures::stream::empty::<Ping>())
        .wait(patience)
        .await
        .unwrap();
    assert_eq!(reply.text, "");
}

#[tokio::test(start_paused = true)]
async fn the_earlier_of_deadline_and_timeout_applies() {
    let (client, _server, _) = setup();

    let start = Instant::now();
    let status = client
        .unary::<Ping, Ping>(SERVICE, "Sleep")
        .with_timeout(Duration::from_secs(10))
        .with_deadline(start + Duration::from_secs(1))
        .invoke(ping("zzz"))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert!(start.elapsed() < Duration::from_secs(2));

    let start = Instant::now();
    let status = client
        .unary::<Ping, Ping>(SERVICE, "Sleep")
        .with_deadline(start + Duration::from_secs(10))
        .with_timeout(Duration::from_secs(1))
        .invoke(ping("zzz"))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert!(start.elapsed() < Duration::from_secs(2));
}
