use std::error::Error;

use pendulum_sdk::stream::client::{StreamClient, StreamConfig};
use pendulum_sdk::{callback, ChangeEvent, ChangePayload, EchoSuppressor};

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let events_url = "http://localhost:8080/events".to_string();
    let collection = "users";

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = StreamClient::connect(StreamConfig::new(events_url), EchoSuppressor::new())?;
        let on_change = callback(|event: &ChangeEvent| match &event.payload {
            ChangePayload::Insert(data) => {
                println!("insert topic={} ids={:?}", event.topic, data.ids);
            }
            ChangePayload::Update(data) => {
                println!("update topic={} count={:?}", event.topic, data.count);
            }
            ChangePayload::Delete(data) => {
                println!("delete topic={} ids={:?}", event.topic, data.ids);
            }
        });
        client.subscribe(collection, &on_change);

        let reason = client.wait_closed().await;
        println!("stream closed: {reason:?}");
        Ok::<(), Box<dyn Error>>(())
    })?;

    Ok(())
}
