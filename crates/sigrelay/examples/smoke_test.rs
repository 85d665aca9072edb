//! Smoke test for a running sigrelay server.
//! Connects three peers, relays an offer and an answer, checks who got what.
//!
//! Usage: cargo run --example smoke_test -- ws://127.0.0.1:8081

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

type Ws =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(url: &str) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("WS connect failed");
    ws
}

async fn recv_text(ws: &mut Ws, wait: Duration) -> Option<String> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(text),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
            _ => return None,
        }
    }
}

fn check(name: &str, ok: bool) -> bool {
    if ok {
        println!("✓ {name}");
    } else {
        println!("✗ {name}");
    }
    ok
}

#[tokio::main]
async fn main() {
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:8081".to_string());
    println!("smoke testing {url}");

    let mut a = connect(&url).await;
    let mut b = connect(&url).await;
    let mut c = connect(&url).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let wait = Duration::from_secs(2);
    let quiet = Duration::from_millis(300);
    let mut passed = true;

    a.send(Message::Text("offer:123".into())).await.unwrap();
    passed &= check(
        "B receives offer",
        recv_text(&mut b, wait).await.as_deref() == Some("offer:123"),
    );
    passed &= check(
        "C receives offer",
        recv_text(&mut c, wait).await.as_deref() == Some("offer:123"),
    );
    passed &= check("A does not hear itself", recv_text(&mut a, quiet).await.is_none());

    b.close(None).await.ok();
    tokio::time::sleep(Duration::from_millis(100)).await;

    c.send(Message::Text("answer:456".into())).await.unwrap();
    passed &= check(
        "A receives answer",
        recv_text(&mut a, wait).await.as_deref() == Some("answer:456"),
    );
    passed &= check("C does not hear itself", recv_text(&mut c, quiet).await.is_none());

    if !passed {
        std::process::exit(1);
    }
    println!("all checks passed");
}
