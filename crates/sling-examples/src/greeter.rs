use futures::{StreamExt as _, TryStreamExt as _};
use sling::stream::{failed, Consumer, ReplyStream};
use sling::{get_context, Result, Status};

use crate::helloworld::{Greeter, HelloReply, HelloRequest};

fn greet(name: impl std::fmt::Display) -> HelloReply {
    HelloReply {
        message: format!("Hi, {name}"),
    }
}

fn check_name(request: &HelloRequest) -> Result<()> {
    if request.name.is_empty() {
        return Err(Status::invalid_argument("No name found"));
    }
    Ok(())
}

#[derive(Clone, Default)]
pub struct GreeterServiceImpl;

impl Greeter for GreeterServiceImpl {
    async fn say_hello(&self, request: HelloRequest) -> Result<HelloReply> {
        log::debug!("say_hello({:?}) - {:?}", request.name, get_context());
        check_name(&request)?;
        Ok(greet(request.name))
    }

    async fn it_keeps_talking(&self, requests: Consumer<HelloRequest>) -> Result<HelloReply> {
        let names: Vec<String> = requests.map_ok(|req| req.name).try_collect().await?;
        log::debug!("it_keeps_talking() heard from {} callers", names.len());
        Ok(greet(names.join(", ")))
    }

    fn it_keeps_replying(&self, request: HelloRequest) -> ReplyStream<HelloReply> {
        if let Err(status) = check_name(&request) {
            return failed(status).boxed();
        }
        // never ends on its own; the caller's demand paces it
        let name = request.name;
        futures::stream::iter(1..)
            .map(move |n: u64| Ok(greet(format!("{name} #{n}"))))
            .boxed()
    }

    fn stream_hellos(&self, requests: Consumer<HelloRequest>) -> ReplyStream<HelloReply> {
        requests.map_ok(|req| greet(req.name)).boxed()
    }
}
