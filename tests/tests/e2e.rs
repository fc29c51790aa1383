//! Mocked-client integration tests, following the `ApiServerVerifier`
//! pattern: a `tower_test::mock::pair` stands in for the Kubernetes API
//! server, and a spawned task replies to requests in the order the code
//! under test is expected to issue them.

use http::{Request, Response};
use http_body_util::BodyExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{client::Body, Client};
use kite_core::Store;

fn mock_client() -> (Client, tower_test::mock::Handle<Request<Body>, Response<Body>>) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    let client = Client::new(mock_service, "default");
    (client, handle)
}

async fn timeout(
    fut: impl std::future::Future<Output = ()> + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::timeout(std::time::Duration::from_secs(1), fut)
            .await
            .expect("timeout waiting on mocked apiserver")
    })
}

#[tokio::test]
async fn store_init_creates_the_configmap_when_absent() {
    let (client, mut handle) = mock_client();

    let server = timeout(async move {
        // Store::init() first GETs the object.
        let (request, send) = handle.next_request().await.expect("get not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().to_string(),
            "/api/v1/namespaces/store-ns/configmaps/store-name"
        );
        send.send_response(
            Response::builder()
                .status(http::StatusCode::NOT_FOUND)
                .body(Body::from(
                    serde_json::to_vec(&serde_json::json!({
                        "kind": "Status",
                        "apiVersion": "v1",
                        "status": "Failure",
                        "reason": "NotFound",
                        "code": 404
                    }))
                    .unwrap(),
                ))
                .unwrap(),
        );

        // Not found, so init() creates an empty ConfigMap.
        let (request, send) = handle.next_request().await.expect("create not called");
        assert_eq!(request.method(), http::Method::POST);
        let created = ConfigMap::default();
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&created).unwrap()))
                .unwrap(),
        );
        // `Store::init` only constructs its watch; the watch's own list
        // and watch requests are not issued until something calls
        // `Store::advance`, which this test doesn't exercise.
    })
    .await;

    let store = Store::init(client, "store-ns", "store-name")
        .await
        .expect("store should initialize by creating the configmap");
    assert_eq!(store.get("absent-key"), None);

    server.await.expect("server scenario completed");
}

#[tokio::test]
async fn store_init_decodes_existing_data() {
    let (client, mut handle) = mock_client();

    let server = timeout(async move {
        let (request, send) = handle.next_request().await.expect("get not called");
        assert_eq!(request.method(), http::Method::GET);
        let existing = serde_json::json!({
            "kind": "ConfigMap",
            "apiVersion": "v1",
            "metadata": { "name": "store-name", "namespace": "store-ns" },
            "data": { "count": "3", "label": "\"backup\"" },
        });
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&existing).unwrap()))
                .unwrap(),
        );
    })
    .await;

    let store = Store::init(client, "store-ns", "store-name")
        .await
        .expect("store should initialize from the existing configmap");
    assert_eq!(store.get("count"), Some(serde_json::json!(3)));
    assert_eq!(store.get("label"), Some(serde_json::json!("backup")));

    server.await.expect("server scenario completed");
}

#[tokio::test]
async fn store_set_round_trips_through_a_watch_event() {
    let (client, mut handle) = mock_client();

    let server = timeout(async move {
        // init(): the backing configmap already exists, with no data yet.
        let (request, send) = handle.next_request().await.expect("get not called");
        assert_eq!(request.method(), http::Method::GET);
        let empty = serde_json::json!({
            "kind": "ConfigMap",
            "apiVersion": "v1",
            "metadata": { "name": "store-name", "namespace": "store-ns", "resourceVersion": "1" },
            "data": {},
        });
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&empty).unwrap()))
                .unwrap(),
        );

        // set("greeting", "hello"): a merge patch carrying just that key.
        let (request, send) = handle.next_request().await.expect("patch not called");
        assert_eq!(request.method(), http::Method::PATCH);
        let body = request.into_body().collect().await.unwrap().to_bytes();
        let patch: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(patch["data"]["greeting"], serde_json::json!("\"hello\""));
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&empty).unwrap()))
                .unwrap(),
        );

        // advance(): the store's watch lists once to establish a
        // resourceVersion, matching spec.md's "cache is not updated
        // synchronously by set()" note -- the write only reaches the cache
        // once a watch event reports it back.
        let (request, send) = handle.next_request().await.expect("list not called");
        assert_eq!(request.method(), http::Method::GET);
        let list = serde_json::json!({
            "kind": "ConfigMapList",
            "apiVersion": "v1",
            "metadata": { "resourceVersion": "1" },
            "items": [],
        });
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&list).unwrap()))
                .unwrap(),
        );

        // ...then watches from it, and we stream back a single MODIFIED
        // event carrying the key just written, as a real apiserver would
        // once the patch above actually landed.
        let (request, send) = handle.next_request().await.expect("watch not called");
        assert_eq!(request.method(), http::Method::GET);
        let modified = serde_json::json!({
            "kind": "ConfigMap",
            "apiVersion": "v1",
            "metadata": { "name": "store-name", "namespace": "store-ns", "resourceVersion": "2" },
            "data": { "greeting": "\"hello\"" },
        });
        let event = serde_json::json!({ "type": "MODIFIED", "object": modified });
        let mut line = serde_json::to_vec(&event).unwrap();
        line.push(b'\n');
        send.send_response(Response::builder().body(Body::from(line)).unwrap());
    })
    .await;

    let store = Store::init(client, "store-ns", "store-name")
        .await
        .expect("store should initialize from the existing configmap");
    assert_eq!(store.get("greeting"), None);

    store
        .set("greeting".to_string(), serde_json::json!("hello"))
        .await
        .expect("set should patch the backing configmap");
    assert_eq!(
        store.get("greeting"),
        None,
        "a write must not be visible before a watch event reconciles it"
    );

    store
        .advance(std::time::Duration::from_millis(300))
        .await
        .expect("advance should process the watch event");
    assert_eq!(store.get("greeting"), Some(serde_json::json!("hello")));

    server.await.expect("server scenario completed");
}
