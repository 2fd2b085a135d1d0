//! End-to-end client tests using testcontainers.
//!
//! Run with: cargo test --test client_nats -- --nocapture
//!
//! These tests spin up NATS with JetStream in a container and simulate the
//! broker's provisioning side with responders on the real request subjects,
//! so the full create/produce/consume/destroy paths run over the wire.

use std::collections::HashSet;
use std::time::Duration;

use async_nats::jetstream;
use futures::StreamExt;
use memphis_client::{
    ConsumerOptions, Memphis, MemphisError, Options, ProduceOptions, ProducerOptions,
    StationOptions,
};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Start NATS container with JetStream enabled.
async fn start_nats() -> (
    testcontainers::ContainerAsync<GenericImage>,
    async_nats::Client,
    String,
    u16,
) {
    let image = GenericImage::new("nats", "2.10")
        .with_exposed_port(4222.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "Listening for client connections",
        ))
        .with_cmd(vec!["-js"]); // Enable JetStream

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start NATS container");

    let port = container
        .get_host_port_ipv4(4222)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host")
        .to_string();

    let url = format!("nats://{}:{}", host, port);
    println!("NATS available at: {}", url);

    let client = async_nats::connect(&url)
        .await
        .expect("Failed to connect to NATS");

    (container, client, host, port)
}

/// Simulate the broker's provisioning side: answer resource lifecycle
/// requests and back each station with a JetStream stream.
///
/// `producer_reply` is the creation response sent to producers; empty means
/// plain success with no schema.
async fn start_broker_sim(client: async_nats::Client, producer_reply: Vec<u8>) {
    // Station creations: create the backing stream, reject duplicates the
    // way the broker words it.
    {
        let client = client.clone();
        let js = jetstream::new(client.clone());
        let mut sub = client
            .subscribe("$memphis_station_creations")
            .await
            .expect("Failed to subscribe to station creations");
        tokio::spawn(async move {
            let mut created: HashSet<String> = HashSet::new();
            while let Some(msg) = sub.next().await {
                let payload: serde_json::Value =
                    serde_json::from_slice(&msg.payload).expect("station creation payload");
                let name = payload["name"].as_str().expect("station name").to_string();

                let reply_body = if created.contains(&name) {
                    "memphis: station already exists"
                } else {
                    js.get_or_create_stream(jetstream::stream::Config {
                        name: name.clone(),
                        subjects: vec![format!("{}.final", name)],
                        ..Default::default()
                    })
                    .await
                    .expect("Failed to create backing stream");
                    created.insert(name);
                    ""
                };

                if let Some(reply) = msg.reply {
                    client
                        .publish(reply, reply_body.into())
                        .await
                        .expect("Failed to reply");
                }
            }
        });
    }

    // Station destructions: first one succeeds, repeats get "does not exist".
    {
        let client = client.clone();
        let mut sub = client
            .subscribe("$memphis_station_destructions")
            .await
            .expect("Failed to subscribe to station destructions");
        tokio::spawn(async move {
            let mut destroyed: HashSet<String> = HashSet::new();
            while let Some(msg) = sub.next().await {
                let payload: serde_json::Value =
                    serde_json::from_slice(&msg.payload).expect("station destruction payload");
                let name = payload["station_name"]
                    .as_str()
                    .expect("station name")
                    .to_string();

                let reply_body = if destroyed.insert(name) {
                    ""
                } else {
                    "memphis: station does not exist"
                };

                if let Some(reply) = msg.reply {
                    client
                        .publish(reply, reply_body.into())
                        .await
                        .expect("Failed to reply");
                }
            }
        });
    }

    // Producer creations get the configured response; everything else gets
    // plain success.
    respond_with(client.clone(), "$memphis_producer_creations", producer_reply).await;
    for subject in [
        "$memphis_producer_destructions",
        "$memphis_consumer_creations",
        "$memphis_consumer_destructions",
        "$memphis_schema_attachments",
        "$memphis_schema_detachments",
    ] {
        respond_with(client.clone(), subject, Vec::new()).await;
    }
}

async fn respond_with(client: async_nats::Client, subject: &'static str, body: Vec<u8>) {
    let mut sub = client
        .subscribe(subject)
        .await
        .expect("Failed to subscribe responder");
    tokio::spawn(async move {
        while let Some(msg) = sub.next().await {
            if let Some(reply) = msg.reply {
                client
                    .publish(reply, body.clone().into())
                    .await
                    .expect("Failed to reply");
            }
        }
    });
}

async fn connect_client(host: &str, port: u16) -> Memphis {
    Memphis::connect(
        host,
        "test-user",
        "test-token",
        Options {
            port,
            ..Default::default()
        },
    )
    .await
    .expect("Failed to connect client")
}

#[tokio::test]
async fn test_station_lifecycle_is_tolerant() {
    println!("=== test_station_lifecycle_is_tolerant ===");
    init_tracing();
    let (_container, raw, host, port) = start_nats().await;
    start_broker_sim(raw, Vec::new()).await;

    let memphis = connect_client(&host, port).await;

    let station = memphis
        .create_station("orders", StationOptions::default())
        .await
        .expect("Failed to create station");
    assert_eq!(station.name(), "orders");

    // Creating an existing station hands back a usable handle.
    let again = memphis
        .create_station("Orders", StationOptions::default())
        .await
        .expect("Recreating an existing station should succeed");
    assert_eq!(again.name(), "orders");

    station.destroy().await.expect("Failed to destroy station");
    // Destroying a station that is already gone is not an error.
    again
        .destroy()
        .await
        .expect("Destroying a missing station should succeed");

    memphis.close().await;
    println!("  PASSED");
}

#[tokio::test]
async fn test_produce_consume_roundtrip() {
    println!("=== test_produce_consume_roundtrip ===");
    init_tracing();
    let (_container, raw, host, port) = start_nats().await;
    start_broker_sim(raw, Vec::new()).await;

    let memphis = connect_client(&host, port).await;
    memphis
        .create_station("orders", StationOptions::default())
        .await
        .expect("Failed to create station");

    let producer = memphis
        .producer("orders", "order-writer", ProducerOptions::default())
        .await
        .expect("Failed to create producer");

    for i in 0..3 {
        producer
            .produce(
                format!("message-{}", i).as_bytes(),
                ProduceOptions::default(),
            )
            .await
            .expect("Failed to produce");
    }

    let consumer = memphis
        .consumer(
            "orders",
            "order-reader",
            ConsumerOptions {
                batch_size: 1,
                pull_interval: Duration::from_millis(100),
                batch_max_time_to_wait: Duration::from_secs(1),
                ..Default::default()
            },
        )
        .await
        .expect("Failed to create consumer");

    let mut messages = consumer.consume().expect("Failed to start consuming");

    // Batches of one must still arrive in publish order.
    for i in 0..3 {
        let msg = tokio::time::timeout(Duration::from_secs(10), messages.next())
            .await
            .expect("Timeout waiting for message")
            .expect("Message stream closed");
        assert_eq!(msg.data(), format!("message-{}", i).as_bytes());
        msg.ack().await.expect("Failed to ack");
    }

    consumer.destroy().await.expect("Failed to destroy consumer");
    producer.destroy().await.expect("Failed to destroy producer");
    // Destroying a producer that is already gone is not an error.
    producer
        .destroy()
        .await
        .expect("Destroying a destroyed producer should succeed");
    memphis.close().await;
    println!("  PASSED");
}

#[tokio::test]
async fn test_dead_letter_resends_survive_stop() {
    println!("=== test_dead_letter_resends_survive_stop ===");
    init_tracing();
    let (_container, raw, host, port) = start_nats().await;
    start_broker_sim(raw.clone(), Vec::new()).await;

    let memphis = connect_client(&host, port).await;
    memphis
        .create_station("orders", StationOptions::default())
        .await
        .expect("Failed to create station");

    let consumer = memphis
        .consumer("orders", "order-reader", ConsumerOptions::default())
        .await
        .expect("Failed to create consumer");

    let mut messages = consumer.consume().expect("Failed to start consuming");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let dls_subject = "$memphis_dls_orders_order-reader";
    raw.publish(dls_subject, "resend-1".into())
        .await
        .expect("Failed to publish resend");

    let msg = tokio::time::timeout(Duration::from_secs(5), messages.next())
        .await
        .expect("Timeout waiting for resend")
        .expect("Message stream closed");
    assert_eq!(msg.data(), b"resend-1");

    // Stopping cancels the fetch loop only; resends keep flowing until the
    // consumer is destroyed.
    consumer.stop_consuming().expect("Stop should succeed");
    raw.publish(dls_subject, "resend-2".into())
        .await
        .expect("Failed to publish resend");

    let msg = tokio::time::timeout(Duration::from_secs(5), messages.next())
        .await
        .expect("Resend should still arrive after stop")
        .expect("Message stream closed");
    assert_eq!(msg.data(), b"resend-2");

    consumer.destroy().await.expect("Failed to destroy consumer");
    memphis.close().await;
    println!("  PASSED");
}

#[tokio::test]
async fn test_concurrent_producer_churn() {
    println!("=== test_concurrent_producer_churn ===");
    init_tracing();
    let (_container, raw, host, port) = start_nats().await;
    start_broker_sim(raw, Vec::new()).await;

    let memphis = connect_client(&host, port).await;
    memphis
        .create_station("orders", StationOptions::default())
        .await
        .expect("Failed to create station");

    // Create and destroy producers on the same station from many tasks at
    // once; attach/detach pairs must balance without deadlock or leftover
    // state.
    let mut handles = Vec::new();
    for i in 0..8 {
        let memphis = memphis.clone();
        handles.push(tokio::spawn(async move {
            let producer = memphis
                .producer("orders", &format!("writer-{}", i), ProducerOptions::default())
                .await
                .expect("Failed to create producer");
            producer.destroy().await.expect("Failed to destroy producer");
        }));
    }
    for handle in handles {
        handle.await.expect("Churn task panicked");
    }

    // The station is fully detached again; a fresh producer works end to end.
    let producer = memphis
        .producer("orders", "writer-final", ProducerOptions::default())
        .await
        .expect("Failed to create producer after churn");
    producer
        .produce(b"after-churn", ProduceOptions::default())
        .await
        .expect("Failed to produce after churn");
    producer.destroy().await.expect("Failed to destroy producer");

    memphis.close().await;
    println!("  PASSED");
}

#[tokio::test]
async fn test_schema_rejection_routes_to_dead_letter() {
    println!("=== test_schema_rejection_routes_to_dead_letter ===");
    init_tracing();
    let (_container, raw, host, port) = start_nats().await;

    // Producer creation binds a JSON schema and turns on dead-letter routing
    // for validation failures.
    let schema = r#"{"type":"object","properties":{"id":{"type":"number"}},"required":["id"]}"#;
    let producer_reply = serde_json::json!({
        "error": "",
        "schema_update": {
            "schema_name": "order-schema",
            "active_version": {
                "version_number": 1,
                "descriptor": "",
                "schema_content": schema,
                "message_struct_name": ""
            },
            "type": "json"
        },
        "schemaverse_to_dls": true,
        "send_notification": false
    });
    start_broker_sim(raw.clone(), serde_json::to_vec(&producer_reply).unwrap()).await;

    let memphis = connect_client(&host, port).await;
    memphis
        .create_station("orders", StationOptions::default())
        .await
        .expect("Failed to create station");

    let producer = memphis
        .producer("orders", "order-writer", ProducerOptions::default())
        .await
        .expect("Failed to create producer");

    let mut dls = raw
        .subscribe("$memphis-orders-dls.>")
        .await
        .expect("Failed to subscribe to dead-letter subject");

    // Conforming payload goes through.
    producer
        .produce(br#"{"id":1}"#, ProduceOptions::default())
        .await
        .expect("Conforming payload should publish");

    // Rejected payload errors out and lands on the dead-letter subject.
    let err = producer
        .produce(br#"{"id":"not-a-number"}"#, ProduceOptions::default())
        .await
        .expect_err("Non-conforming payload should fail");
    assert!(matches!(err, MemphisError::SchemaValidation { .. }));

    let record = tokio::time::timeout(Duration::from_secs(5), dls.next())
        .await
        .expect("Timeout waiting for dead-letter record")
        .expect("Dead-letter subscription closed");

    let record: serde_json::Value =
        serde_json::from_slice(&record.payload).expect("Dead-letter record should be JSON");
    assert_eq!(record["station_name"], "orders");
    assert_eq!(record["producer"]["name"], "order-writer");
    assert_eq!(record["message"]["data"], r#"{"id":"not-a-number"}"#);

    // Exactly one record for one rejection.
    let extra = tokio::time::timeout(Duration::from_millis(500), dls.next()).await;
    assert!(extra.is_err(), "Only one dead-letter record expected");

    memphis.close().await;
    println!("  PASSED");
}

#[tokio::test]
async fn test_consumer_state_guards() {
    println!("=== test_consumer_state_guards ===");
    init_tracing();
    let (_container, raw, host, port) = start_nats().await;
    start_broker_sim(raw, Vec::new()).await;

    let memphis = connect_client(&host, port).await;
    memphis
        .create_station("orders", StationOptions::default())
        .await
        .expect("Failed to create station");

    let consumer = memphis
        .consumer("orders", "order-reader", ConsumerOptions::default())
        .await
        .expect("Failed to create consumer");

    let _messages = consumer.consume().expect("First consume should start");
    let err = consumer
        .consume()
        .err()
        .expect("Second consume should be rejected");
    assert!(matches!(err, MemphisError::State(_)));

    consumer.stop_consuming().expect("Stop should succeed");
    let err = consumer
        .stop_consuming()
        .expect_err("Stopping an inactive consumer should fail");
    assert!(matches!(err, MemphisError::State(_)));

    // A stopped consumer can start again.
    let _messages = consumer.consume().expect("Consume after stop should start");

    consumer.destroy().await.expect("Failed to destroy consumer");
    memphis.close().await;
    println!("  PASSED");
}
