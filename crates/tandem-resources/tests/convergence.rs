//! End-to-end gossip test: three counter replicas on localhost TCP
//! converge to the sum of everyone's writes.

use std::collections::HashMap;
use std::time::Duration;

use tandem_core::{ArchetypeResource, Value};
use tandem_resources::{GCounter, GCounterConfig};

fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

fn fast_config() -> GCounterConfig {
    GCounterConfig {
        broadcast_interval: Duration::from_millis(100),
        broadcast_timeout: Duration::from_secs(1),
        connection_timeout: Duration::from_secs(1),
    }
}

#[tokio::test]
async fn three_replicas_converge_to_the_global_sum() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let ids: Vec<Value> = (1..=3).map(Value::number).collect();
    let addrs: HashMap<Value, String> =
        ids.iter().map(|id| (id.clone(), free_addr())).collect();

    let mut replicas = Vec::new();
    for id in &ids {
        let addrs = addrs.clone();
        let replica = GCounter::start(
            id.clone(),
            ids.clone(),
            move |peer| addrs[peer].clone(),
            fast_config(),
        )
        .await
        .unwrap();
        replicas.push(replica);
    }

    for (replica, count) in replicas.iter_mut().zip([7, 4, 9]) {
        replica.write(&[], Value::number(count)).await.unwrap();
        replica.commit().await;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    'poll: loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "replicas did not converge"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        for replica in replicas.iter_mut() {
            let sum = replica.read(&[]).await.unwrap();
            replica.commit().await;
            if sum != Value::number(20) {
                continue 'poll;
            }
        }
        break;
    }

    for replica in replicas.iter_mut() {
        replica.close().await.unwrap();
        // close is idempotent
        replica.close().await.unwrap();
    }
}
