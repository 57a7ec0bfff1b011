use messages::wire;
use messages::{DirectMessage, Echo, EchoKind, RouterReply};
use network::peer_channel::PeerChannel;
use node::spawn_node;
use test_utils::{
    addresses, at2_configuration, gossips, keys, parameters, signed_batch, spawn_test_cluster,
};
use tokio::time::{sleep, Duration, Instant};

#[tokio::test]
async fn three_node_unicast_ping() {
    let endpoints = addresses(7_000, 3);
    let handles: Vec<_> = keys(3)
        .into_iter()
        .zip(endpoints.iter())
        .map(|(keypair, (router, publisher))| {
            spawn_node(
                keypair,
                at2_configuration(),
                parameters(),
                *router,
                *publisher,
            )
        })
        .collect();
    tokio::task::yield_now().await;

    // A pings B and C directly.
    let message = DirectMessage::new(handles[0].name().clone(), "ping");
    let expected = message.digest();
    handles[0]
        .direct_message(endpoints[1].0, &message)
        .await
        .unwrap();
    handles[0]
        .direct_message(endpoints[2].0, &message)
        .await
        .unwrap();

    // Both receivers hold the message hash within two seconds.
    let deadline = Instant::now() + Duration::from_secs(2);
    for handle in &handles[1..] {
        loop {
            if handle.snapshot().await.received_directs.contains(&expected) {
                break;
            }
            assert!(Instant::now() < deadline, "Direct message not received");
            sleep(Duration::from_millis(50)).await;
        }
    }
}

#[tokio::test]
async fn pub_sub_topic_filter() {
    let handles = spawn_test_cluster(7_100, 3, at2_configuration(), parameters()).await;

    for handle in &handles[1..] {
        handle.subscribe("yolo".to_string()).await;
    }
    sleep(Duration::from_millis(200)).await;

    // A publication on a subscribed topic reaches both subscribers.
    handles[0]
        .publish("yolo".to_string(), "Hey bro".to_string())
        .await;
    let deadline = Instant::now() + Duration::from_secs(5);
    for handle in &handles[1..] {
        loop {
            let snapshot = handle.snapshot().await;
            if snapshot
                .publications
                .contains(&("yolo".to_string(), "Hey bro".to_string()))
            {
                break;
            }
            assert!(Instant::now() < deadline, "Publication not received");
            sleep(Duration::from_millis(50)).await;
        }
    }

    // A publication on another topic is filtered out.
    handles[0]
        .publish("tumbo".to_string(), "nope".to_string())
        .await;
    sleep(Duration::from_millis(500)).await;
    for handle in &handles[1..] {
        let snapshot = handle.snapshot().await;
        assert!(!snapshot
            .publications
            .iter()
            .any(|(topic, _)| topic == "tumbo"));
    }

    // After unsubscribing, the original topic is filtered out too.
    for handle in &handles[1..] {
        handle.unsubscribe("yolo".to_string()).await;
    }
    sleep(Duration::from_millis(200)).await;
    handles[0]
        .publish("yolo".to_string(), "again".to_string())
        .await;
    sleep(Duration::from_millis(500)).await;
    for handle in &handles[1..] {
        let snapshot = handle.snapshot().await;
        assert!(!snapshot
            .publications
            .contains(&("yolo".to_string(), "again".to_string())));
    }
}

#[tokio::test]
async fn duplicate_batch_is_admitted_once() {
    let (router, publisher) = addresses(7_200, 1).pop().unwrap();
    let receiver_keypair = keys(2).pop().unwrap();
    let handle = spawn_node(
        receiver_keypair,
        at2_configuration(),
        parameters(),
        router,
        publisher,
    );
    tokio::task::yield_now().await;

    // A foreign node pushes the same signed batch twice on one channel.
    let sender = keys(1).pop().unwrap();
    let batch = signed_batch();
    let channel = PeerChannel::spawn(router);

    // An echo subscription before the batch arrives is acknowledged plainly.
    let echo = Echo::new(EchoKind::EchoSubscribe, batch.key(), sender.public());
    let frames = wire::echo("tester", &echo, &echo.sign(&sender));
    let reply = channel.send(frames.clone()).await.unwrap();
    assert!(matches!(
        RouterReply::from_frame(&reply).unwrap(),
        RouterReply::Ok
    ));

    // First push: admitted, congestion feedback comes back.
    let reply = channel.send(wire::batch("tester", &batch)).await.unwrap();
    assert!(matches!(
        RouterReply::from_frame(&reply).unwrap(),
        RouterReply::Congestion(_)
    ));

    // The same echo subscription now advertises the batch is held.
    let reply = channel.send(frames).await.unwrap();
    assert!(RouterReply::from_frame(&reply).unwrap().is_already_received());

    // Second push: suppressed.
    let reply = channel.send(wire::batch("tester", &batch)).await.unwrap();
    assert!(RouterReply::from_frame(&reply).unwrap().is_already_received());

    let snapshot = handle.snapshot().await;
    assert_eq!(snapshot.received_batches, 1);
}

#[tokio::test]
async fn broadcast_converges_on_identical_logs() {
    // Seven nodes so every echo/ready sample is the full peer set under the
    // canonical 6/6/6 configuration.
    let handles = spawn_test_cluster(7_300, 7, at2_configuration(), parameters()).await;
    for handle in &handles {
        handle.pause_congestion().await;
    }

    // One node feeds a handful of gossips.
    for gossip in gossips(5) {
        handles[0].submit(gossip).await;
        sleep(Duration::from_millis(50)).await;
    }

    // Every node ends up with the same non-empty, identically-ordered log.
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let mut snapshots = Vec::new();
        for handle in &handles {
            snapshots.push(handle.snapshot().await);
        }
        let reference = &snapshots[0];
        let converged = !reference.delivered.is_empty()
            && snapshots.iter().all(|snapshot| {
                snapshot.delivered.len() == reference.delivered.len()
                    && snapshot.delivered_digest == reference.delivered_digest
            });
        if converged {
            // No key appears twice in any log.
            for snapshot in &snapshots {
                let mut keys: Vec<_> =
                    snapshot.delivered.iter().map(|(_, key)| *key).collect();
                keys.sort_unstable();
                keys.dedup();
                assert_eq!(keys.len(), snapshot.delivered.len());
            }
            break;
        }
        assert!(
            Instant::now() < deadline,
            "Broadcast did not converge in time"
        );
        sleep(Duration::from_millis(250)).await;
    }
}

#[tokio::test]
async fn submissions_flow_through_the_batcher() {
    let handles = spawn_test_cluster(7_450, 7, at2_configuration(), parameters()).await;

    handles[1].submit(gossips(1).pop().unwrap()).await;

    // The submitting node itself delivers its own batch.
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if !handles[1].snapshot().await.delivered.is_empty() {
            break;
        }
        assert!(Instant::now() < deadline, "Own batch was not delivered");
        sleep(Duration::from_millis(250)).await;
    }
}
