//! Socket Transport Integration Tests
//!
//! The real engine server fronting an embedded interpreter, plus scripted
//! fake servers for reply ordering and connection loss.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Map};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use flowbridge_core::transport::frame::{write_frame, FrameReader};
use flowbridge_core::transport::socket::{
    ClientFrame, ReplyOutcome, ServerFrame, PROTOCOL_VERSION,
};
use flowbridge_core::{
    CallError, CapabilityClient, ClientEvent, ConnectionStatus, EmbeddedSettings,
    EmbeddedTransportClient, EngineServer, Marshalled, ReturnValue, ServerOptions, SessionCall,
    SocketSettings, SocketTransportClient, TransportError,
};

// =============================================================================
// Helpers
// =============================================================================

struct RunningServer {
    address: String,
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn start_engine_server(options: ServerOptions) -> RunningServer {
    let engine = EmbeddedTransportClient::start(&EmbeddedSettings::default()).unwrap();
    engine.wait_ready().await.unwrap();

    let server = EngineServer::bind("127.0.0.1:0", Arc::new(engine), options)
        .await
        .unwrap();
    let address = server.local_addr().unwrap().to_string();
    let (stop, stopped) = oneshot::channel();
    tokio::spawn(server.serve(async move {
        let _ = stopped.await;
    }));

    RunningServer {
        address,
        stop: Some(stop),
    }
}

/// Bind a listener and run `script` against the first accepted connection
/// after completing the handshake
async fn fake_engine<F, Fut>(script: F) -> String
where
    F: FnOnce(
            FrameReader<tokio::net::tcp::OwnedReadHalf>,
            tokio::net::tcp::OwnedWriteHalf,
        ) -> Fut
        + Send
        + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);

        let hello: Option<ClientFrame> = reader.next().await.unwrap();
        assert!(matches!(hello, Some(ClientFrame::Hello { .. })));
        write_frame(
            &mut write_half,
            &ServerFrame::Welcome {
                protocol_version: PROTOCOL_VERSION,
                allows_run_code: true,
            },
        )
        .await
        .unwrap();

        script(reader, write_half).await;
    });

    address
}

fn echo_reply(id: u64, call: &SessionCall) -> ServerFrame {
    ServerFrame::Reply {
        id,
        outcome: ReplyOutcome::Return(ReturnValue::from(Marshalled::Converted(json!(
            call.method_name
        )))),
    }
}

// =============================================================================
// Against the real engine server
// =============================================================================

#[tokio::test]
async fn test_roundtrip_through_engine_server() {
    let server = start_engine_server(ServerOptions::default()).await;
    let client = SocketTransportClient::connect_with(SocketSettings::new(&server.address))
        .await
        .unwrap();
    assert_eq!(client.status(), ConnectionStatus::READY);
    assert!(client.capabilities().allows_run_code);

    let mut events = client.subscribe();
    let mut inputs = Map::new();
    inputs.insert("a".into(), json!(2));
    let node = client
        .create_node("Multiply", inputs, BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(node.class_id, "Multiply");

    // The engine's snapshot push reaches the socket client
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let ClientEvent::Snapshot(snapshot) = events.recv().await.unwrap() {
                assert!(snapshot.nodes > 0.0);
                break;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(client.get_nodes().await.unwrap().len(), 1);
    assert_eq!(client.run_code("session.node_count()").await.unwrap(), "1");
    assert_eq!(
        client.invoke(SessionCall::named("explode")).await,
        Err(CallError::UnknownMethod("explode".into()))
    );
}

#[tokio::test]
async fn test_run_code_refused_when_server_disallows_it() {
    let server = start_engine_server(ServerOptions {
        allows_run_code: false,
        ..Default::default()
    })
    .await;
    let client = SocketTransportClient::connect_with(SocketSettings::new(&server.address))
        .await
        .unwrap();

    assert!(!client.capabilities().allows_run_code);
    assert_eq!(
        client.run_code("files()").await,
        Err(CallError::Unsupported("run_code".into()))
    );
}

#[tokio::test]
async fn test_apply_settings_reconnects() {
    let first = start_engine_server(ServerOptions::default()).await;
    let second = start_engine_server(ServerOptions::default()).await;

    let client = SocketTransportClient::connect_with(SocketSettings::new(&first.address))
        .await
        .unwrap();
    client
        .apply_settings(SocketSettings::new(&second.address))
        .await
        .unwrap();

    assert_eq!(client.settings().address, second.address);
    assert_eq!(client.status(), ConnectionStatus::READY);
    assert!(client.get_nodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_connects_install_one_connection() {
    let server = start_engine_server(ServerOptions::default()).await;
    let client = SocketTransportClient::new(SocketSettings::new(&server.address));

    let (first, second) = tokio::join!(client.connect(), client.connect());
    assert!(first.is_ok());
    assert!(matches!(second, Err(TransportError::InvalidState(_))));
    assert_eq!(client.status(), ConnectionStatus::READY);
    assert!(client.get_nodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_apply_settings_leave_last_one_connected() {
    let first = start_engine_server(ServerOptions::default()).await;
    let second = start_engine_server(ServerOptions::default()).await;
    let client = SocketTransportClient::connect_with(SocketSettings::new(&first.address))
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        client.apply_settings(SocketSettings::new(&first.address)),
        client.apply_settings(SocketSettings::new(&second.address)),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(client.settings().address, second.address);
    assert_eq!(client.status(), ConnectionStatus::READY);
    assert!(client.get_nodes().await.unwrap().is_empty());
}

// =============================================================================
// Against scripted fake servers
// =============================================================================

#[tokio::test]
async fn test_out_of_order_replies_reach_their_callers() {
    let address = fake_engine(|mut reader, mut writer| async move {
        let mut calls = Vec::new();
        while calls.len() < 2 {
            if let Some(ClientFrame::Invoke { id, call }) = reader.next::<ClientFrame>().await.unwrap() {
                calls.push((id, call));
            }
        }
        for (id, call) in calls.iter().rev() {
            write_frame(&mut writer, &echo_reply(*id, call)).await.unwrap();
        }
        // Keep the connection open until the client is done
        let _ = reader.next::<ClientFrame>().await;
    })
    .await;

    let client = SocketTransportClient::connect_with(SocketSettings::new(address))
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        client.invoke(SessionCall::named("first")),
        client.invoke(SessionCall::named("second")),
    );
    assert_eq!(first.unwrap().into_value(), Some(json!("first")));
    assert_eq!(second.unwrap().into_value(), Some(json!("second")));
}

#[tokio::test]
async fn test_connection_loss_fails_in_flight_calls() {
    let address = fake_engine(|mut reader, writer| async move {
        let _invoke: Option<ClientFrame> = reader.next().await.unwrap();
        drop(writer);
        drop(reader);
    })
    .await;

    let client = SocketTransportClient::connect_with(SocketSettings::new(address))
        .await
        .unwrap();
    let mut status = client.watch_status();

    assert_eq!(
        client.invoke(SessionCall::named("get_nodes")).await,
        Err(CallError::TransportLost)
    );
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| *s == ConnectionStatus::NOT_CONNECTED),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(matches!(
        client.invoke(SessionCall::named("get_nodes")).await,
        Err(CallError::NotReady(_))
    ));
}

#[tokio::test]
async fn test_request_timeout_rejects_call() {
    let address = fake_engine(|mut reader, writer| async move {
        let _writer = writer;
        // Read forever, never reply
        while let Ok(Some(_)) = reader.next::<ClientFrame>().await {}
    })
    .await;

    let settings = SocketSettings {
        request_timeout_ms: 100,
        ..SocketSettings::new(address)
    };
    let client = SocketTransportClient::connect_with(settings).await.unwrap();

    assert_eq!(
        client.invoke(SessionCall::named("get_flows")).await,
        Err(CallError::Timeout(100))
    );
    // A timeout is call-scoped; the connection stays up
    assert_eq!(client.status(), ConnectionStatus::READY);
}
