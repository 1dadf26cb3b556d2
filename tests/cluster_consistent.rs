use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use hivelimit::app::App;
use hivelimit::config::HivelimitConfig;
use hivelimit::http::LimitResponseBody;
use hivelimit::mesh::Owner;
use hivelimit::store::CounterKey;

const WINDOW_MS: u64 = 3_600_000;

fn node_config(
    name: &str,
    http_port: u16,
    gossip_port: u16,
    seed: Option<u16>,
) -> HivelimitConfig {
    let seeds = seed
        .map(|port| format!("[\"127.0.0.1:{}\"]", port))
        .unwrap_or_else(|| "[]".to_string());
    let yaml = format!(
        r#"
server:
  http_addr: "127.0.0.1:{http_port}"
rate_limiting:
  default_consistency: consistent
  unavailable_policy: fail_closed
cluster:
  enabled: true
  node_id: "{name}"
  listen_addr: "127.0.0.1:{gossip_port}"
  seed_nodes: {seeds}
  cluster_id: "hivelimit-two-node"
  gossip_interval_ms: 50
  secret: "mesh-secret"
auth:
  root_keys:
    - key: "root_cluster"
      workspace_id: "ws_cluster"
      permissions: ["ratelimit.*.limit"]
"#
    );
    HivelimitConfig::from_yaml(&yaml).unwrap()
}

fn serve(app: App) -> (oneshot::Sender<()>, JoinHandle<hivelimit::error::Result<()>>) {
    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(app.run(async move {
        let _ = rx.await;
    }));
    (tx, handle)
}

async fn wait_until_ready(client: &reqwest::Client, port: u16) {
    for _ in 0..100 {
        let url = format!("http://127.0.0.1:{}/v1/liveness", port);
        if let Ok(response) = client.get(&url).send().await {
            if response.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("node on port {} never became ready", port);
}

#[tokio::test]
async fn test_two_nodes_share_consistent_limit() {
    let a = App::build(node_config("node-a", 18180, 18970, None)).await.unwrap();
    let b = App::build(node_config("node-b", 18181, 18971, Some(18970))).await.unwrap();

    let identifier = uuid::Uuid::new_v4().to_string();
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64;
    let key = CounterKey::new("ws_cluster:namespace", &identifier, now / WINDOW_MS * WINDOW_MS);
    let store_key = key.to_store_key();

    // Both nodes must agree on a single owner, which then is remote for one of them.
    let cluster_a = a.cluster().unwrap().clone();
    let cluster_b = b.cluster().unwrap().clone();
    let mut agreed = false;
    for _ in 0..200 {
        let owner_a = cluster_a.owner_of(&store_key).await;
        let owner_b = cluster_b.owner_of(&store_key).await;
        agreed = match (&owner_a, &owner_b) {
            (Owner::Local, Owner::Remote { node_id, .. }) => node_id == "node-a",
            (Owner::Remote { node_id, .. }, Owner::Local) => node_id == "node-b",
            _ => false,
        };
        if agreed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(agreed, "nodes never agreed on a counter owner");

    let (stop_a, run_a) = serve(a);
    let (stop_b, run_b) = serve(b);

    let client = reqwest::Client::new();
    wait_until_ready(&client, 18180).await;
    wait_until_ready(&client, 18181).await;

    let mut passed = 0;
    for i in 0..10 {
        let port = if i % 2 == 0 { 18180 } else { 18181 };
        let response = client
            .post(format!("http://127.0.0.1:{}/v1/ratelimits.limit", port))
            .bearer_auth("root_cluster")
            .json(&json!({
                "namespace": "namespace",
                "identifier": identifier,
                "limit": 5,
                "duration": WINDOW_MS,
            }))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());

        let body: LimitResponseBody = response.json().await.unwrap();
        assert_eq!(body.limit, 5);
        if body.pass {
            passed += 1;
        }
    }
    assert_eq!(passed, 5);

    stop_a.send(()).unwrap();
    stop_b.send(()).unwrap();
    run_a.await.unwrap().unwrap();
    run_b.await.unwrap().unwrap();
}
