use request_orchestrator::{
    OrchestratorOptions, RequestConfig, RequestOrchestrator, ReqwestTransport, RetryOverride,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let base_url = std::env::var("ORCHESTRATOR_BASE_URL")
        .unwrap_or_else(|_| "https://httpbin.org/".to_owned());
    let options = OrchestratorOptions::from_env().map_err(anyhow::Error::msg)?;

    let transport = ReqwestTransport::new().with_base_url(&base_url)?;
    let api = RequestOrchestrator::new(transport).with_options(options);

    // Three identical calls in flight share one exchange.
    let config = RequestConfig::get("get").with_header("Accept", "application/json");
    let (a, b, c) = tokio::join!(
        api.execute(config.clone()),
        api.execute(config.clone()),
        api.execute(config.clone()),
    );
    println!("shared status: {} {} {}", a?.status, b?.status, c?.status);

    // Served from cache.
    api.execute(config).await?;

    // A 503 endpoint, retried twice with short backoff.
    let flaky = api
        .execute_with(
            RequestConfig::get("status/503"),
            RetryOverride::max_retries(2).with_base_delay_ms(200),
        )
        .await;
    println!("flaky endpoint: {flaky:?}");

    let stats = api.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!(
        "success rate {:.1}%, deduplication rate {:.1}%",
        stats.success_rate(),
        stats.deduplication_rate()
    );

    Ok(())
}
