//! Helper methods only available for tests: a scriptable stand-in for the
//! API server backing a mocked `kube::Client`.
use std::sync::{Arc, Mutex};

use http::{Request, Response};
use hyper::Body;
use kube::core::GroupVersionKind;
use kube::discovery::ApiResource;
use kube::Client;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::mapper::RestMapper;

pub type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

/// One request the fake API server answered.
#[derive(Debug, Clone)]
pub struct ApiCall {
    pub method: String,
    /// Path including the query string.
    pub path: String,
    pub body: Value,
    /// Virtual timestamp of the request under paused tokio time.
    pub at: Instant,
}

impl ApiCall {
    pub fn is(&self, method: &str, path_part: &str) -> bool {
        self.method == method && self.path.contains(path_part)
    }
}

/// Shared log of the calls the fake server saw, in arrival order.
pub type CallLog = Arc<Mutex<Vec<ApiCall>>>;

/// Create a mocked client plus the handle driving its API server side.
pub fn mock_client() -> (Client, ApiServerHandle) {
    let (mock_service, handle) =
        tower_test::mock::pair::<Request<Body>, Response<Body>>();
    (Client::new(mock_service, "default"), handle)
}

/// Spawn a responder answering every request with `respond`, recording calls.
///
/// Drop the client (and everything holding it) to end the task.
pub fn spawn_api_server<F>(mut handle: ApiServerHandle, mut respond: F) -> (JoinHandle<()>, CallLog)
where
    F: FnMut(&ApiCall) -> Response<Body> + Send + 'static,
{
    let log: CallLog = Arc::new(Mutex::new(Vec::new()));
    let calls = log.clone();
    let join = tokio::spawn(async move {
        while let Some((request, send)) = handle.next_request().await {
            let call = read_call(request).await;
            let response = respond(&call);
            calls.lock().expect("call log lock").push(call);
            send.send_response(response);
        }
    });
    (join, log)
}

async fn read_call(request: Request<Body>) -> ApiCall {
    let method = request.method().to_string();
    let path = request
        .uri()
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_default();
    let bytes = hyper::body::to_bytes(request.into_body())
        .await
        .expect("request body should be readable");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    ApiCall {
        method,
        path,
        body,
        at: Instant::now(),
    }
}

/// 200 response carrying a JSON body.
pub fn json_response(body: Value) -> Response<Body> {
    Response::builder()
        .status(200)
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_vec(&body).expect("response should serialize"),
        ))
        .expect("response should build")
}

/// List response wrapping `items`.
pub fn list_response(items: Vec<Value>) -> Response<Body> {
    json_response(json!({
        "apiVersion": "v1",
        "kind": "List",
        "metadata": {},
        "items": items,
    }))
}

/// Kubernetes error status response.
pub fn status_response(code: u16, reason: &str) -> Response<Body> {
    let body = json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": reason,
        "reason": reason,
        "code": code,
    });
    Response::builder()
        .status(code)
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_vec(&body).expect("status should serialize"),
        ))
        .expect("response should build")
}

/// Success status response, as DELETE returns.
pub fn success_response() -> Response<Body> {
    json_response(json!({"kind": "Status", "apiVersion": "v1", "status": "Success", "metadata": {}}))
}

/// Default behavior: echo creates and patches, empty lists, success deletes.
pub fn default_respond(call: &ApiCall) -> Response<Body> {
    match call.method.as_str() {
        "POST" => json_response(call.body.clone()),
        "PATCH" | "PUT" => json_response(call.body.clone()),
        "GET" => list_response(vec![]),
        "DELETE" => success_response(),
        _ => status_response(405, "MethodNotAllowed"),
    }
}

/// A running, ready pod as the server would return it.
pub fn pod_item(name: &str, ns: &str, labels: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": name, "namespace": ns, "labels": labels},
        "status": {
            "phase": "Running",
            "containerStatuses": [{"name": "main", "ready": true}],
        },
    })
}

/// A deployment with the given replica counts.
pub fn deployment_item(name: &str, ns: &str, replicas: i64, ready: i64) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name, "namespace": ns, "labels": {"app": name}},
        "spec": {"replicas": replicas},
        "status": {"readyReplicas": ready},
    })
}

/// Mapper covering the kinds the tests dispatch.
pub fn test_mapper() -> RestMapper {
    RestMapper::from_resources([
        (
            ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Pod")),
            true,
        ),
        (
            ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "Service")),
            true,
        ),
        (
            ApiResource::from_gvk(&GroupVersionKind::gvk("apps", "v1", "Deployment")),
            true,
        ),
        (
            ApiResource::from_gvk(&GroupVersionKind::gvk("kubevirt.io", "v1", "VirtualMachine")),
            true,
        ),
    ])
}
