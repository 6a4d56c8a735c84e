//! Echo round-trip over a real TCP connection.

use std::time::Duration;

use basecamp_net::Commander;
use serde_json::json;

#[tokio::test]
async fn echo_round_trip_within_budget() {
    let server = Commander::new();
    let listener = server.bind("127.0.0.1", 0).await.unwrap();
    let port = server.endpoint().listener_addr(listener).unwrap().port();

    server
        .register("echo", |cmdr, body, serial| async move {
            let message = body.get("message").cloned().unwrap_or(json!(null));
            cmdr.send_command("echo_response", json!({ "message": message }), serial)
                .await?;
            Ok(())
        })
        .unwrap();

    let client = Commander::new();
    let serial = client.connect("127.0.0.1", port).await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel::<String>();
    let tx = std::sync::Mutex::new(Some(tx));
    client
        .register("echo_response", move |_, body, _| {
            let sender = tx.lock().unwrap().take();
            async move {
                if let Some(sender) = sender {
                    let _ = sender.send(body["message"].as_str().unwrap_or("").to_string());
                }
                Ok(())
            }
        })
        .unwrap();

    client
        .send_command("echo", json!({ "message": "Hello World" }), serial)
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("no echo_response within 5s")
        .unwrap();
    assert_eq!(reply, "Hello World");

    client.shutdown().await;
    server.shutdown().await;
}
