//! Local mesh example running several broadcast nodes in one process.
//!
//! This example shows how to:
//! - Build one configuration per node from a list of local addresses
//! - Run the handshake on every node concurrently
//! - Broadcast a string and a structured value to every other node

use futures::future::try_join_all;
use secure_p2p_broadcast::{NodeConfig, Runner};
use serde::{Deserialize, Serialize};

const NODES: u16 = 3;
const FIRST_PORT: u16 = 5100;

#[derive(Debug, Serialize, Deserialize)]
struct Coefficients {
    node: u16,
    values: Vec<f64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("🔐 Secure P2P Broadcast - Local Mesh Example");
    println!("=============================================");

    let hosts: Vec<String> = (0..NODES)
        .map(|i| format!("127.0.0.1:{}", FIRST_PORT + i))
        .collect();

    let nodes = hosts.iter().enumerate().map(|(i, host)| {
        let peers = hosts.iter().filter(|p| *p != host).cloned().collect();
        let mut config = NodeConfig::new(host.clone(), peers, "Example".to_string());
        // Short timings keep the example snappy
        config.crypto.asymmetric = false;
        config.timing.retry_base_ms = 100;
        config.timing.retry_step_ms = 100;
        config.timing.send_interval_ms = 10;
        let node = u16::try_from(i)?;

        Ok::<_, Box<dyn std::error::Error>>(tokio::spawn(async move {
            let mut runner = Runner::connect(config).await?;
            let greetings = runner.broadcast_str(&format!("Hello from node {node}")).await?;
            let coefficients = runner
                .broadcast_obj(&Coefficients {
                    node,
                    values: vec![f64::from(node) * 0.5, 1.0, -2.25],
                })
                .await?;
            Ok::<_, secure_p2p_broadcast::P2pError>((node, greetings, coefficients))
        }))
    });

    let handles = nodes.collect::<Result<Vec<_>, _>>()?;
    for outcome in try_join_all(handles).await? {
        let (node, greetings, coefficients) = outcome?;
        println!("📨 Node {node} received:");
        for (sender, greeting) in &greetings {
            println!("   {sender}: {greeting}");
        }
        for (sender, received) in &coefficients {
            println!("   {sender}: node {} sent {:?}", received.node, received.values);
        }
    }

    println!("✅ Every node heard from every other node");
    Ok(())
}
