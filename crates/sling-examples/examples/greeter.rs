use std::time::{Duration, Instant};

use futures::StreamExt as _;
use sling::{Client, ClientExt as _, Server};
use sling_examples::{Greeter as _, GreeterClient, GreeterServiceImpl, HelloRequest};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::interval;
use tokio_stream::wrappers::IntervalStream;

async fn single_request_reply(client: &GreeterClient) {
    let reply = client
        .say_hello()
        .add_header("key", "value")
        .invoke(HelloRequest::new("Alice"))
        .wait(Duration::from_secs(5))
        .await;
    println!("> say_hello() -> {reply:?}");
}

async fn streaming_request(client: &GreeterClient) {
    let requests = futures::stream::iter(["Alice", "Bob", "Peter"].map(HelloRequest::new));
    let reply = client
        .it_keeps_talking()
        .add_header("key", "value")
        .invoke(requests)
        .wait(Duration::from_secs(5))
        .await;
    println!("> it_keeps_talking() -> {reply:?}");
}

async fn streaming_reply(client: &GreeterClient) {
    let replies = client
        .it_keeps_replying()
        .add_header("key", "value")
        .invoke(HelloRequest::new("Alice"));

    // the server would keep going forever, dropping the stream cancels the call
    let mut replies = replies.take(5);
    while let Some(reply) = replies.next().await {
        println!("> it_keeps_replying() -> {reply:?}");
    }
}

async fn streaming_request_reply(client: &GreeterClient, start: Instant) {
    let ticks = IntervalStream::new(interval(Duration::from_secs(1)));
    let requests = ticks
        .enumerate()
        .take(10)
        .map(|(i, _)| HelloRequest::new(format!("Alice-{i}")));

    let mut replies = client
        .with_timeout(Duration::from_secs(60))
        .stream_hellos()
        .add_header("key", "value")
        .invoke(requests);

    while let Some(reply) = replies.next().await {
        println!("> stream_hellos() -> {reply:?} ({:?})", start.elapsed());
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;
    println!("Listening on {address}");

    let mut server = Server::new();
    server.add_service(GreeterServiceImpl.into_service());
    tokio::spawn(async move { server.start(&mut listener).await });

    let start = Instant::now();
    let client = GreeterClient::new(Client::new(TcpStream::connect(address).await?));

    single_request_reply(&client).await;
    streaming_request(&client).await;
    streaming_reply(&client).await;
    streaming_request_reply(&client, start).await;

    client.close();
    Ok(())
}
