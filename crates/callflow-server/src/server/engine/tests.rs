use super::{
    Engine, EngineConfig,
    acceptor::{AcceptorRegistry, IncomingCall, Responder},
    call::CallState,
    context::CallContext,
    dispatch::dispatch_loop,
    queue::{Completion, CompletionKind, completion_queue},
    stats::StatsCounters,
};
use crate::server::service::reply::{DispatchHandler, ReplyHandler};
use callflow_core::{
    Error, Result,
    proto::{ReplyMessage, RequestMessage, dispatcher_client::DispatcherClient},
    types::DEFAULT_REQUEST,
};
use core::time::Duration;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, task::JoinHandle, time::timeout};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Code, transport::Channel};

const DEADLINE: Duration = Duration::from_secs(10);

fn request(text: &str) -> RequestMessage {
    RequestMessage {
        request_string: text.to_string(),
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let reached = timeout(DEADLINE, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

struct Running {
    engine: Engine,
    addr: SocketAddr,
    handle: JoinHandle<Result<()>>,
}

impl Running {
    async fn start<H: ReplyHandler>(config: EngineConfig, handler: H) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let engine = Engine::new(config, handler);

        let runner = engine.clone();
        let handle = tokio::spawn(async move {
            runner
                .run_with_incoming(TcpListenerStream::new(listener))
                .await
        });

        eventually("the seed call", || engine.stats().awaiting >= 1).await;
        Self {
            engine,
            addr,
            handle,
        }
    }

    async fn client(&self) -> DispatcherClient<Channel> {
        DispatcherClient::connect(format!("http://{}", self.addr))
            .await
            .unwrap()
    }

    async fn stop(self) -> (Engine, Result<()>) {
        self.engine.shutdown();
        let res = timeout(DEADLINE, self.handle)
            .await
            .expect("run did not return after shutdown")
            .unwrap();
        (self.engine, res)
    }
}

fn test_context(handler: impl ReplyHandler) -> (Arc<CallContext>, super::queue::CompletionQueue) {
    let (sender, queue) = completion_queue();
    let acceptors = Arc::new(AcceptorRegistry::new(sender.clone()));
    let ctx = CallContext::new(
        acceptors,
        sender,
        Arc::new(handler),
        64,
        Arc::new(StatsCounters::default()),
    );
    (Arc::new(ctx), queue)
}

#[tokio::test]
async fn call_walks_create_processing_finished() {
    let (ctx, queue) = test_context(DispatchHandler);
    let first = ctx.spawn_call();
    assert_eq!(ctx.table().count_in(CallState::Create), 1);

    let (responder, reply_rx) = Responder::new();
    ctx.acceptors()
        .deliver(IncomingCall {
            request: request(DEFAULT_REQUEST),
            responder,
        })
        .unwrap();

    // CREATE -> PROCESSING: a replacement is spawned and the reply is sent
    let arrived = queue.next().await.unwrap();
    assert_eq!(arrived.tag, first);
    ctx.dispatch(arrived);

    let reply = reply_rx.await.unwrap().unwrap();
    assert_eq!(reply.reply_string, "Dispatched some answer to the request");
    assert_eq!(ctx.table().count_in(CallState::Create), 1);
    assert_eq!(ctx.table().count_in(CallState::Processing), 1);
    assert_eq!(ctx.acceptors().waiting_acceptors(), 1);

    // PROCESSING -> FINISHED: the call is released
    let sent = queue.next().await.unwrap();
    assert_eq!(sent.tag, first);
    assert!(sent.ok);
    assert!(matches!(sent.kind, CompletionKind::SendComplete));
    ctx.dispatch(sent);

    assert_eq!(ctx.table().len(), 1);
    assert!(ctx.table().checkout(first).is_none());

    let stats = ctx.stats().snapshot();
    assert_eq!((stats.awaiting, stats.processing), (1, 0));
    assert_eq!((stats.created, stats.finished, stats.failed), (2, 1, 0));
}

#[tokio::test]
async fn departed_client_still_finishes_the_call() {
    let (ctx, queue) = test_context(DispatchHandler);
    ctx.spawn_call();

    let (responder, reply_rx) = Responder::new();
    drop(reply_rx);
    ctx.acceptors()
        .deliver(IncomingCall {
            request: request("nobody listens"),
            responder,
        })
        .unwrap();

    ctx.dispatch(queue.next().await.unwrap());
    let sent = queue.next().await.unwrap();
    assert!(!sent.ok);
    ctx.dispatch(sent);

    let stats = ctx.stats().snapshot();
    assert_eq!((stats.finished, stats.failed), (1, 1));
    assert_eq!(stats.live(), 1);
}

#[tokio::test]
async fn completion_for_unknown_call_is_dropped() {
    let (ctx, _queue) = test_context(DispatchHandler);
    ctx.spawn_call();

    ctx.dispatch(Completion::send_complete(999, true));
    assert_eq!(ctx.table().len(), 1);
    assert_eq!(ctx.stats().snapshot().finished, 0);
}

#[tokio::test]
async fn unexpected_completion_leaves_the_call_alone() {
    let (ctx, _queue) = test_context(DispatchHandler);
    let id = ctx.spawn_call();

    ctx.dispatch(Completion::send_complete(id, true));
    assert_eq!(ctx.table().count_in(CallState::Create), 1);
}

#[tokio::test]
async fn cancelled_accept_leaves_a_replacement_waiting() {
    let (ctx, _queue) = test_context(DispatchHandler);
    let id = ctx.spawn_call();

    let (responder, reply_rx) = Responder::new();
    ctx.dispatch(Completion {
        tag: id,
        ok: false,
        kind: CompletionKind::RequestArrived(IncomingCall {
            request: request(DEFAULT_REQUEST),
            responder,
        }),
    });

    assert!(ctx.table().checkout(id).is_none());
    assert_eq!(ctx.table().count_in(CallState::Create), 1);
    assert_eq!(ctx.acceptors().waiting_acceptors(), 1);
    assert!(reply_rx.await.is_err());

    let stats = ctx.stats().snapshot();
    assert_eq!((stats.awaiting, stats.processing), (1, 0));
}

#[tokio::test]
async fn handler_panic_becomes_an_error_reply() {
    let handler = |req: &RequestMessage| -> Result<ReplyMessage> {
        assert_ne!(req.request_string, "bad", "cannot handle {}", req.request_string);
        Ok(ReplyMessage {
            reply_string: req.request_string.clone(),
        })
    };
    let (ctx, _queue) = test_context(handler);

    let err = ctx.reply_for(&request("bad")).unwrap_err();
    match err {
        Error::Handler { context } => assert!(context.contains("cannot handle bad")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(ctx.reply_for(&request("good")).unwrap().reply_string, "good");
}

#[tokio::test]
async fn release_all_empties_the_table() {
    let (ctx, _queue) = test_context(DispatchHandler);
    for _ in 0..3 {
        ctx.spawn_call();
    }
    assert_eq!(ctx.release_all(), 3);
    assert!(ctx.table().is_empty());
    assert_eq!(ctx.stats().snapshot().live(), 0);
}

#[tokio::test]
async fn lost_queue_ends_the_dispatch_loop() {
    let (ctx, _queue) = test_context(DispatchHandler);
    let (sender, orphan) = completion_queue();
    drop(sender);

    let res = timeout(DEADLINE, dispatch_loop(0, orphan, ctx)).await.unwrap();
    assert!(matches!(res, Err(Error::QueueClosed)));
}

#[tokio::test]
async fn shut_down_queue_ends_the_dispatch_loop_cleanly() {
    let (ctx, queue) = test_context(DispatchHandler);
    let handle = tokio::spawn(dispatch_loop(0, queue.clone(), ctx));
    queue.shutdown();
    assert!(timeout(DEADLINE, handle).await.unwrap().unwrap().is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replies_to_the_reference_request() {
    let running = Running::start(EngineConfig::default(), DispatchHandler).await;
    let mut client = running.client().await;

    let reply = client
        .handle_request(request(DEFAULT_REQUEST))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(reply.reply_string, "Dispatched some answer to the request");

    let (_, res) = running.stop().await;
    assert!(res.is_ok());
}

async fn concurrent_requests_are_correlated(dispatchers: usize) {
    const N: usize = 64;

    let config = EngineConfig {
        dispatchers,
        ..EngineConfig::default()
    };
    let running = Running::start(config, DispatchHandler).await;
    let client = running.client().await;

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..N {
        let mut client = client.clone();
        tasks.spawn(async move {
            let text = format!("request #{i}");
            let reply = client.handle_request(request(&text)).await?.into_inner();
            Ok::<_, tonic::Status>((text, reply.reply_string))
        });
    }

    let mut replies = 0;
    while let Some(res) = tasks.join_next().await {
        let (text, reply) = res.unwrap().unwrap();
        assert_eq!(reply, format!("Dispatched {text}"));
        replies += 1;
    }
    assert_eq!(replies, N);

    let engine = running.engine.clone();
    eventually("every call to finish", || engine.stats().finished == N as u64).await;
    let stats = engine.stats();
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.created, N as u64 + 1);

    let (_, res) = running.stop().await;
    assert!(res.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_single_dispatcher() {
    concurrent_requests_are_correlated(1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_many_dispatchers() {
    concurrent_requests_are_correlated(4).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn malformed_request_fails_alone() {
    let config = EngineConfig {
        max_request_bytes: 8,
        ..EngineConfig::default()
    };
    let running = Running::start(config, DispatchHandler).await;
    let mut client = running.client().await;

    let status = client.handle_request(request("")).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let status = client
        .handle_request(request("far too long"))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    let reply = client.handle_request(request("fine")).await.unwrap();
    assert_eq!(reply.into_inner().reply_string, "Dispatched fine");

    let engine = running.engine.clone();
    eventually("all three calls to finish", || engine.stats().finished == 3).await;
    assert_eq!(engine.stats().failed, 2);

    let (_, res) = running.stop().await;
    assert!(res.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_errors_reach_the_client() {
    let handler = |req: &RequestMessage| -> Result<ReplyMessage> {
        if req.request_string == "explode" {
            return Err(Error::Handler {
                context: "refused".to_string(),
            });
        }
        Ok(ReplyMessage {
            reply_string: req.request_string.clone(),
        })
    };
    let running = Running::start(EngineConfig::default(), handler).await;
    let mut client = running.client().await;

    let status = client.handle_request(request("explode")).await.unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("refused"));

    let reply = client.handle_request(request("echo")).await.unwrap();
    assert_eq!(reply.into_inner().reply_string, "echo");

    let (_, res) = running.stop().await;
    assert!(res.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_handler_fails_alone() {
    let handler = |req: &RequestMessage| -> Result<ReplyMessage> {
        if req.request_string == "bad" {
            panic!("handler gave up on {}", req.request_string);
        }
        Ok(ReplyMessage {
            reply_string: req.request_string.clone(),
        })
    };
    let running = Running::start(EngineConfig::default(), handler).await;
    let mut client = running.client().await;

    let status = client.handle_request(request("bad")).await.unwrap_err();
    assert_eq!(status.code(), Code::Internal);
    assert!(status.message().contains("handler gave up on bad"));

    let reply = client.handle_request(request("good")).await.unwrap();
    assert_eq!(reply.into_inner().reply_string, "good");

    // a fresh connection still reaches the same engine
    let mut fresh = running.client().await;
    let reply = fresh.handle_request(request("again")).await.unwrap();
    assert_eq!(reply.into_inner().reply_string, "again");

    let engine = running.engine.clone();
    assert!(engine.is_running());
    eventually("all three calls to finish", || engine.stats().finished == 3).await;
    assert_eq!(engine.stats().failed, 1);

    let (_, res) = running.stop().await;
    assert!(res.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn an_acceptor_is_always_waiting() {
    let running = Running::start(EngineConfig::default(), DispatchHandler).await;
    let client = running.client().await;

    let mut load = tokio::task::JoinSet::new();
    for worker in 0..8 {
        let mut client = client.clone();
        load.spawn(async move {
            for i in 0..25 {
                let text = format!("{worker}-{i}");
                client.handle_request(request(&text)).await.unwrap();
            }
        });
    }

    let engine = running.engine.clone();
    while !load.is_empty() {
        assert!(engine.stats().awaiting >= 1);
        if let Ok(Some(res)) = timeout(Duration::from_millis(1), load.join_next()).await {
            res.unwrap();
        }
    }
    assert!(engine.stats().awaiting >= 1);

    let (_, res) = running.stop().await;
    assert!(res.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_twice_is_shutdown_once() {
    let running = Running::start(EngineConfig::default(), DispatchHandler).await;
    let mut client = running.client().await;
    client.handle_request(request("before")).await.unwrap();

    running.engine.shutdown();
    running.engine.shutdown();
    assert!(running.engine.is_shutdown());

    let (engine, res) = running.stop().await;
    assert!(res.is_ok());
    assert!(!engine.is_running());

    engine.shutdown();
    assert!(engine.is_shutdown());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_call_outlives_run() {
    let running = Running::start(
        EngineConfig {
            dispatchers: 2,
            ..EngineConfig::default()
        },
        DispatchHandler,
    )
    .await;
    let client = running.client().await;

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..16 {
        let mut client = client.clone();
        tasks.spawn(async move { client.handle_request(request(&format!("{i}"))).await });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap().unwrap();
    }

    let (engine, res) = running.stop().await;
    assert!(res.is_ok());

    let stats = engine.stats();
    assert_eq!(stats.awaiting, 0);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.live(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_before_run_returns_immediately() {
    let engine = Engine::default();
    engine.shutdown();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let res = timeout(
        DEADLINE,
        engine.run_with_incoming(TcpListenerStream::new(listener)),
    )
    .await
    .unwrap();
    assert!(res.is_ok());
    assert_eq!(engine.stats().created, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_run_is_rejected() {
    let running = Running::start(EngineConfig::default(), DispatchHandler).await;
    assert!(running.engine.is_running());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let res = running
        .engine
        .run_with_incoming(TcpListenerStream::new(listener))
        .await;
    assert!(matches!(res, Err(Error::AlreadyRunning)));

    let (_, res) = running.stop().await;
    assert!(res.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bind_failure_is_a_startup_error() {
    let taken = TcpListener::bind("0.0.0.0:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let engine = Engine::default();
    let res = timeout(DEADLINE, engine.run(port)).await.unwrap();
    assert!(matches!(res, Err(Error::Bind { .. })));
    assert!(!engine.is_running());
    assert_eq!(engine.stats().created, 0);
}
