use std::time::Duration;
use stomp_wire::{ConnectOptions, Connection, SendOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // This example expects a STOMP broker on localhost:61613 (e.g. RabbitMQ with stomp plugin).
    let options = ConnectOptions::default().login("guest").passcode("guest");
    let conn = Connection::connect("127.0.0.1:61613", options).await?;

    let tx_id = "tx-example-1";
    conn.begin(tx_id).await?;
    println!("Transaction {} started", tx_id);

    for body in ["message 1 in transaction", "message 2 in transaction"] {
        conn.send("/queue/test", body, SendOptions::default().transaction(tx_id))
            .await?;
        println!("Sent '{}'", body);
    }

    // both messages are delivered together
    conn.commit(tx_id).await?;
    println!("Transaction {} committed", tx_id);

    let tx_id_2 = "tx-example-2";
    conn.begin(tx_id_2).await?;
    conn.send(
        "/queue/test",
        "this message will be aborted",
        SendOptions::default().transaction(tx_id_2),
    )
    .await?;
    println!("Sent message in transaction {} (will be aborted)", tx_id_2);

    conn.abort(tx_id_2).await?;
    println!("Transaction {} aborted", tx_id_2);

    conn.disconnect(Some(Duration::from_secs(5))).await?;
    Ok(())
}
