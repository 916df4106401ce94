use adt_agent::backoff::ReconnectPolicy;
use adt_agent::executor::{ExecError, Execute};
use adt_agent::{ConnectionManager, ConnectionState, ManagerConfig};
use adt_core::protocol::{Envelope, ExecuteRecurringCommand};
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use url::Url;

const WAIT: Duration = Duration::from_secs(10);

/// Answers every run with the number of runs so far.
#[derive(Default)]
struct CountingExecutor {
    runs: AtomicU64,
}

impl Execute for CountingExecutor {
    fn execute<'a>(&'a self, _command: &'a str) -> BoxFuture<'a, Result<String, ExecError>> {
        Box::pin(async move {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(run.to_string())
        })
    }
}

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = timeout(WAIT, listener.accept())
        .await
        .expect("agent never dialed")
        .expect("accept");
    accept_async(stream).await.expect("handshake")
}

/// Reads frames until the next recurring response and returns its run number.
async fn next_tick(ws: &mut WebSocketStream<TcpStream>) -> u64 {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("no tick in time")
            .expect("stream ended")
            .expect("read");
        let Message::Text(text) = frame else {
            continue;
        };
        match Envelope::decode(&text).expect("decode") {
            Envelope::ExecuteRecurringCommandResponse(output) => {
                assert_eq!(output.id, 5);
                return output.output.parse().expect("run number");
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn schedule_survives_reconnect_without_replaying_the_gap() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let url = Url::parse(&format!("ws://{addr}/api/v1/agents/1/ws")).expect("url");
    let delay = Duration::from_millis(2500);
    let config = ManagerConfig {
        reconnect: ReconnectPolicy::fixed(delay),
        ..ManagerConfig::new(url)
    };
    let manager = ConnectionManager::new(config, Arc::new(CountingExecutor::default()));
    let scheduler = manager.scheduler();
    let mut agent_state = manager.state();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let agent = tokio::spawn(manager.run(shutdown_rx));

    let mut first = accept(&listener).await;
    let request = Envelope::ExecuteRecurringCommand(ExecuteRecurringCommand {
        id: 5,
        command: "uptime".to_string(),
        interval: 1,
    });
    first
        .send(Message::Text(request.encode().expect("encode")))
        .await
        .expect("send");
    let before_drop = next_tick(&mut first).await;
    drop(first);
    let dropped_at = Instant::now();

    timeout(
        WAIT,
        agent_state.wait_for(|state| *state == ConnectionState::Disconnected),
    )
    .await
    .expect("agent never noticed the drop")
    .expect("manager dropped");

    let mut second = accept(&listener).await;
    assert!(dropped_at.elapsed() >= delay - Duration::from_millis(100));
    assert_eq!(scheduler.active().len(), 1);

    // Ticks that ran during the gap were dropped, not queued for the new socket.
    let after_reconnect = next_tick(&mut second).await;
    assert!(
        after_reconnect >= before_drop + 2,
        "tick {after_reconnect} replayed from the gap after {before_drop}"
    );
    let following = next_tick(&mut second).await;
    assert_eq!(following, after_reconnect + 1);

    shutdown_tx.send(true).expect("shutdown");
    timeout(WAIT, agent)
        .await
        .expect("agent did not stop")
        .expect("join")
        .expect("run");
    assert!(scheduler.active().is_empty());
}
