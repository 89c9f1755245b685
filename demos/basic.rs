use std::time::Duration;

use workhorse::{Enqueuer, JobContext, WorkerPool};

async fn send_email(ctx: JobContext) -> Result<(), String> {
    let to: String = ctx
        .unmarshal_payload::<serde_json::Value>()
        .map_err(|e| e.to_string())?
        .get("to")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_default();
    ctx.checkin(format!("sending to {to}")).await;
    println!("sent email to {to} (job {})", ctx.id());
    Ok(())
}

async fn produce_jobs(enqueuer: &Enqueuer) {
    for i in 0..5 {
        enqueuer
            .enqueue("send_email", serde_json::json!({"to": format!("test{i}@example.com")}))
            .await
            .unwrap();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    let client = redis::Client::open(redis_url)?;
    let conn = client.get_connection_manager().await?;

    let enqueuer = Enqueuer::new("workhorse-demo", conn.clone());
    produce_jobs(&enqueuer).await;

    let mut pool = WorkerPool::new(4, "workhorse-demo", conn)
        .job("send_email", send_email)
        .periodically_enqueue("0 */1 * * * *", "send_email");

    pool.start().await?;
    tokio::time::sleep(Duration::from_secs(10)).await;
    pool.stop().await;
    Ok(())
}
