use std::time::Duration;

use request_orchestrator::{
    ConnectivityMonitor, OrchestratorOptions, RequestConfig, RequestOrchestrator, ReqwestTransport,
};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let base_url = std::env::var("ORCHESTRATOR_BASE_URL")
        .unwrap_or_else(|_| "https://httpbin.org/".to_owned());
    let monitor = ConnectivityMonitor::new(false);
    let api = RequestOrchestrator::new(ReqwestTransport::new().with_base_url(&base_url)?)
        .with_connectivity(monitor.clone())
        .with_options(OrchestratorOptions {
            replay_delay_ms: 250,
            ..OrchestratorOptions::default()
        });
    let worker = api.spawn_replay_worker();

    // Issued while offline: the call waits in the queue.
    let pending = {
        let api = api.clone();
        tokio::spawn(async move {
            api.execute(RequestConfig::post("post", json!({"note": "written offline"})))
                .await
        })
    };
    api.enqueue_offline(RequestConfig::post("anything", json!({"seq": 2})))?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("queued: {:?}", api.queued_requests().iter().map(|c| &c.url).collect::<Vec<_>>());

    monitor.set_online(true);
    let response = pending.await??;
    println!("replayed: {}", response.status);

    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("still queued: {}", api.queued_request_count());
    println!("{:?}", api.stats());

    worker.abort();
    Ok(())
}
