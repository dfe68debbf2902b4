//! REST client behaviour against a mock API server.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use warden_reconciler::{
    ClusterApi, DaemonKind, Error, KubeClient, KubeConfig, Node, NodeLabelReconciler,
    ReconcileAction, WatchEvent,
};
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> KubeClient {
    KubeClient::new(KubeConfig::from_url(&server.uri()).unwrap().with_token("s3cret")).unwrap()
}

fn pod_json(name: &str, node: &str) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": name,
            "namespace": "default",
            "labels": { "component": "ws-daemon" },
            "resourceVersion": "11"
        },
        "spec": { "nodeName": node },
        "status": { "conditions": [{ "type": "Ready", "status": "True" }] }
    })
}

fn node_json(labels: serde_json::Value) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": { "name": "node-a", "resourceVersion": "5", "labels": labels },
        "status": { "nodeInfo": { "kubeletVersion": "v1.30.0" } }
    })
}

#[tokio::test]
async fn test_get_pod_sends_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/default/pods/ws-daemon-1"))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(pod_json("ws-daemon-1", "node-a")))
        .expect(1)
        .mount(&server)
        .await;

    let pod = client(&server).get_pod("default", "ws-daemon-1").await.unwrap();
    assert_eq!(pod.node_name(), Some("node-a"));
    assert!(pod.is_ready());
}

#[tokio::test]
async fn test_status_codes_map_to_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/default/pods/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "kind": "Status", "code": 404, "message": "pods \"missing\" not found"
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/nodes/node-a"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "kind": "Status", "code": 409, "message": "the object has been modified"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/nodes/node-a"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let client = client(&server);
    assert!(client.get_pod("default", "missing").await.unwrap_err().is_not_found());
    assert!(client.update_node(&Node::new("node-a")).await.unwrap_err().is_conflict());

    let err = client.get_node("node-a").await.unwrap_err();
    assert!(matches!(err, Error::Api { status: 503, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_list_pods_uses_label_selector() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/default/pods"))
        .and(query_param("labelSelector", "component=ws-daemon"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "kind": "PodList",
            "metadata": { "resourceVersion": "100" },
            "items": [pod_json("ws-daemon-1", "node-a"), pod_json("ws-daemon-2", "node-b")]
        })))
        .mount(&server)
        .await;

    let list = client(&server)
        .list_pods("default", "component=ws-daemon")
        .await
        .unwrap();
    assert_eq!(list.items.len(), 2);
    assert_eq!(list.metadata.resource_version.as_deref(), Some("100"));
}

#[tokio::test]
async fn test_watch_stream_decodes_lines_and_expiry() {
    let body = [
        json!({ "type": "ADDED", "object": pod_json("ws-daemon-1", "node-a") }).to_string(),
        json!({ "type": "MODIFIED", "object": pod_json("ws-daemon-1", "node-a") }).to_string(),
        json!({ "type": "ERROR", "object": { "kind": "Status", "code": 410, "message": "too old" } })
            .to_string(),
    ]
    .join("\n");

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/default/pods"))
        .and(query_param("watch", "true"))
        .and(query_param("resourceVersion", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let mut watch = client(&server)
        .watch_pods("default", "component=ws-daemon", "100")
        .await
        .unwrap();

    assert!(matches!(watch.next().await, Some(Ok(WatchEvent::Added(_)))));
    assert!(matches!(watch.next().await, Some(Ok(WatchEvent::Modified(_)))));
    assert!(matches!(
        watch.next().await,
        Some(Err(Error::WatchExpired { .. }))
    ));
    assert!(watch.next().await.is_none());
}

#[tokio::test]
async fn test_reconcile_over_rest_preserves_node_fields() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/default/pods/ws-daemon-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(pod_json("ws-daemon-1", "node-a")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/nodes/node-a"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(node_json(json!({ "zone": "a" }))),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/nodes/node-a"))
        .and(body_partial_json(json!({
            "metadata": {
                "resourceVersion": "5",
                "labels": { "zone": "a", "warden.io/ready_for_workspaces_ns_default": "true" }
            },
            "status": { "nodeInfo": { "kubeletVersion": "v1.30.0" } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(node_json(json!({
            "zone": "a", "warden.io/ready_for_workspaces_ns_default": "true"
        }))))
        .expect(1)
        .mount(&server)
        .await;

    let api = Arc::new(client(&server));
    let reconciler = NodeLabelReconciler::new(api, DaemonKind::ws_daemon(), "default");
    let result = reconciler.reconcile("ws-daemon-1").await.unwrap();

    assert_eq!(
        result.action,
        ReconcileAction::EnsureLabel {
            node: "node-a".to_string()
        }
    );
    assert!(result.node_written);
}
