/**
 * Session Negotiation Example
 *
 * Negotiates a v3.5 session key with one device and prints the negotiation
 * events as they arrive.
 *
 * Usage: negotiate <DEVICE_ID> <LOCAL_KEY> [DEVICE_IP]
 */
use futures_util::StreamExt;
use std::time::Duration;
use tuyalan::{DeviceInfo, LocalKey, Manager, ManagerConfig, NegotiationEvent};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("--- tuyalan - Session Negotiation ---");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (Some(id), Some(key)) = (args.first(), args.get(1)) else {
        println!("Usage: negotiate <DEVICE_ID> <LOCAL_KEY> [DEVICE_IP]");
        return;
    };

    let local_key: LocalKey = match key.parse() {
        Ok(k) => k,
        Err(e) => {
            println!("[ERROR] Invalid local key: {}", e);
            return;
        }
    };

    let mut device = DeviceInfo::new(id.as_str(), local_key);
    if let Some(ip) = args.get(2).and_then(|s| s.parse().ok()) {
        device = device.with_ip(ip);
    }

    // 1. Bind the shared negotiation socket
    let config = ManagerConfig::default().with_timeout(Duration::from_secs(5));
    let manager = match Manager::bind(config).await {
        Ok(m) => m,
        Err(e) => {
            println!("[ERROR] Failed to bind: {}", e);
            return;
        }
    };

    // 2. Print events in the background
    let events = manager.stream();
    tokio::spawn(async move {
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            match event {
                NegotiationEvent::Success { device_id, ip, port, .. } => {
                    println!("[EVENT] {} established from {}:{}", device_id, ip, port)
                }
                NegotiationEvent::Error { device_id, reason } => {
                    println!("[EVENT] {} failed: {} (code {})", device_id, reason, reason.code())
                }
                NegotiationEvent::Offline { device_id } => println!("[EVENT] {} is offline", device_id),
            }
        }
    });

    // 3. Negotiate
    println!("[INFO] Negotiating with {}...", id);
    match manager.negotiate(device, None).await {
        Ok(session) => println!(
            "[SUCCESS] Session key: {} (iv {})",
            hex::encode(session.session_key),
            hex::encode(session.session_iv)
        ),
        Err(e) => println!("[ERROR] Negotiation failed: {}", e),
    }

    manager.shutdown();
}
