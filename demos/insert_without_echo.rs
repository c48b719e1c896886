use std::error::Error;
use std::time::Duration;

use pendulum_sdk::{callback, ChangeEvent, PendulumClient, PendulumClientOptions};
use serde_json::json;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = PendulumClient::new(PendulumClientOptions::default().with_realtime(true))?;
        if let Some(realtime) = client.realtime.as_ref() {
            let on_change = callback(|event: &ChangeEvent| {
                println!(
                    "remote change topic={} action={} operation_id={}",
                    event.topic,
                    event.action(),
                    event.operation_id
                );
            });
            realtime.subscribe("todos", &on_change);
        }

        let inserted = client
            .db
            .insert("todos", &[json!({"title": "write docs", "done": false})])
            .await?;
        println!("inserted={inserted}");

        // Our own insert is dropped by the stream; anything else still prints.
        tokio::time::sleep(Duration::from_secs(10)).await;
        client.shutdown();
        Ok::<(), Box<dyn Error>>(())
    })?;

    Ok(())
}
