//! The TCP front driven through the bundled client.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use vessel_kernel::{Service, Settings};
use vessel_server::front;
use vessel_server::{Client, ClientError};
use vessel_types::{
    BoundFunction, Configuration, EnvironmentDefinition, LogSource, TaskId, TaskStatus,
};

use common::*;

struct TestServer {
    addr: String,
    service: Service,
    shutdown: CancellationToken,
}

impl TestServer {
    async fn start(service: Service) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        tokio::spawn(front::serve(listener, service.clone(), shutdown.clone()));
        Self {
            addr,
            service,
            shutdown,
        }
    }

    async fn with_settings(settings: Settings) -> Self {
        let builds = Arc::new(AtomicUsize::new(0));
        Self::start(Service::with_registry(settings, test_registry(builds))).await
    }

    fn client(&self) -> Client {
        Client::new(self.addr.clone())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.service.shutdown();
    }
}

#[tokio::test]
async fn test_run_over_tcp() {
    let server = TestServer::with_settings(settings("front-run")).await;
    let mut seen = 0;
    let reply = server
        .client()
        .run_with(
            &BoundFunction::new(shell("echo one; echo two"), vec![local()]),
            |_| seen += 1,
        )
        .await
        .unwrap();

    assert_eq!(reply.result.as_json(), Some(json!("two")));
    assert_eq!(reply.chunks, seen);
    assert_eq!(user_messages(&reply.logs), vec!["one", "two"]);
    assert!(reply.logs.iter().any(|e| e.source == LogSource::Build));
}

#[tokio::test]
async fn test_unknown_kind_over_tcp() {
    let server = TestServer::with_settings(settings("front-unknown")).await;
    let err = server
        .client()
        .run(&BoundFunction::new(
            shell("true"),
            vec![EnvironmentDefinition::new("docker", Configuration::new())],
        ))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some("unknown_environment_kind"));
}

#[tokio::test]
async fn test_build_error_carries_logs() {
    let server = TestServer::with_settings(settings("front-build")).await;
    let err = server
        .client()
        .run(&BoundFunction::new(
            shell("true"),
            vec![
                EnvironmentDefinition::new("failing", Configuration::new())
                    .with("requirements", vec!["$$$$"]),
            ],
        ))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some("build_error"));
    let ClientError::Remote { logs, message, .. } = err else {
        panic!("expected a remote error");
    };
    assert!(message.starts_with("A problem occurred while creating the environment"));
    assert!(logs.iter().any(|e| e.message.contains("Invalid requirement: '$$$$'")));
}

#[tokio::test]
async fn test_oversized_request_rejected_by_server() {
    let server =
        TestServer::with_settings(settings("front-recv").with_max_receive_message_length(1024))
            .await;
    let script = format!("echo {}", "z".repeat(4096));
    let err = server
        .client()
        .run(&BoundFunction::new(shell(&script), vec![local()]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some("transport_limit_exceeded"));
    assert!(err.to_string().contains("Received message larger than max"));
}

#[tokio::test]
async fn test_oversized_request_rejected_by_client() {
    let server = TestServer::with_settings(settings("front-send")).await;
    let script = format!("echo {}", "z".repeat(400));
    let err = server
        .client()
        .with_max_send_message_length(100)
        .run(&BoundFunction::new(shell(&script), vec![local()]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), Some("transport_limit_exceeded"));
    assert!(err.to_string().contains("Sent message larger than max"));
}

#[tokio::test]
async fn test_malformed_request() {
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{Framed, LinesCodec};

    let server = TestServer::with_settings(settings("front-malformed")).await;
    let stream = tokio::net::TcpStream::connect(&server.addr).await.unwrap();
    let mut framed = Framed::new(stream, LinesCodec::new());
    framed.send("{\"op\":\"launch\"}".to_string()).await.unwrap();
    let line = framed.next().await.unwrap().unwrap();
    let response: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["type"], "error");
    assert_eq!(response["kind"], "invalid_request");
}

#[tokio::test]
async fn test_task_lifecycle_over_tcp() {
    let server = TestServer::with_settings(settings("front-tasks")).await;
    let client = server.client();

    let id = client
        .submit(&BoundFunction::new(shell("sleep 30"), vec![local()]))
        .await
        .unwrap();
    client
        .set_metadata(id, BTreeMap::from([("owner".to_string(), "ci".to_string())]))
        .await
        .unwrap();
    client.cancel(id).await.unwrap();

    let record = tokio::time::timeout(Duration::from_secs(10), server.service.wait(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);

    let tasks = client.list().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, id);
    assert_eq!(tasks[0].status, TaskStatus::Cancelled);
    assert_eq!(tasks[0].metadata["owner"], "ci");

    let err = client.cancel(TaskId(424242)).await.unwrap_err();
    assert_eq!(err.kind(), Some("not_found"));
}
