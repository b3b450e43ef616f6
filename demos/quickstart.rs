use futures::StreamExt;
use std::time::Duration;
use stomp_wire::{AckMode, ConnectOptions, Connection, SendOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // This example expects a STOMP broker on localhost:61613 (e.g. RabbitMQ with stomp plugin).
    let options = ConnectOptions::default()
        .login("guest")
        .passcode("guest")
        .connect_timeout(Duration::from_secs(5));
    let conn = Connection::connect("127.0.0.1:61613", options).await?;
    println!(
        "connected: version {:?}, heartbeats {:?}",
        conn.version(),
        conn.heartbeat()
    );

    let mut sub = conn.subscribe("/queue/test", AckMode::Client).await?;

    conn.send(
        "/queue/test",
        "hello from stomp-wire",
        SendOptions::default()
            .content_type("text/plain")
            .receipt_timeout(Duration::from_secs(5)),
    )
    .await?;

    // Wait for one message, but not forever.
    match tokio::time::timeout(Duration::from_secs(5), sub.next()).await {
        Ok(Some(frame)) => {
            println!("received frame:\n{}", frame);
            sub.ack(&frame).await?;
        }
        Ok(None) => println!("subscription ended, no frames received"),
        Err(_) => println!("timed out waiting for a frame"),
    }

    sub.unsubscribe_with_timeout(Some(Duration::from_secs(5)))
        .await?;
    conn.disconnect(Some(Duration::from_secs(5))).await?;
    Ok(())
}
