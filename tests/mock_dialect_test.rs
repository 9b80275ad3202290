use std::sync::Arc;
use std::time::Duration;

use courier::{
    Client, CourierError, Dialect, Group, Message, MessageKind, MockDialect, Mode, Resolution,
    Result, Topic, Writer,
};

fn consume_topic(name: &str, kind: MessageKind) -> Topic {
    Topic::new(name, kind, Mode::CONSUME)
}

#[tokio::test]
async fn publish_delivers_in_order_with_offsets() -> Result<()> {
    let dialect = MockDialect::new();
    let consumer = dialect.consumer();
    let producer = dialect.producer();
    let topic = Topic::new("raw", MessageKind::Event, Mode::CONSUME | Mode::PRODUCE);

    let mut subscription = consumer.subscribe(&[topic.clone()]).await?;

    let mut first = Message::event("one", 1, b"1".to_vec());
    first.topic = topic.clone();
    producer.publish(first.clone()).await?;
    let mut second = Message::event("two", 1, b"2".to_vec());
    second.topic = topic.clone();
    producer.publish(second.clone()).await?;

    let received = subscription.inbound.recv().await.expect("first delivery");
    assert_eq!(received.id, first.id);
    assert_eq!(received.offset, 0);
    assert_eq!(received.partition, 0);
    subscription.marker.send(Resolution::Ack).await.unwrap();

    let received = subscription.inbound.recv().await.expect("second delivery");
    assert_eq!(received.id, second.id);
    assert_eq!(received.offset, 1);
    subscription.marker.send(Resolution::Ack).await.unwrap();

    dialect.close().await?;
    Ok(())
}

#[tokio::test]
async fn events_fan_out_to_every_produce_topic() -> Result<()> {
    let dialect = Arc::new(MockDialect::new());
    let group = Group::new(
        dialect.clone(),
        vec![
            Topic::new(
                "commands",
                MessageKind::Command,
                Mode::CONSUME | Mode::PRODUCE,
            ),
            Topic::new("events-a", MessageKind::Event, Mode::PRODUCE),
            Topic::new("events-b", MessageKind::Event, Mode::PRODUCE),
        ],
    );

    let consumer = dialect.consumer();
    let mut sub_a = consumer
        .subscribe(&[consume_topic("events-a", MessageKind::Event)])
        .await?;
    let mut sub_b = consumer
        .subscribe(&[consume_topic("events-b", MessageKind::Event)])
        .await?;

    let client = Client::new(vec![group.clone()]).await?;
    group.handle_func(
        MessageKind::Command,
        "Available",
        |_message: Message, writer: Writer| async move {
            let _ = writer
                .event("Created", 1, b"k1".to_vec(), b"payload".to_vec())
                .await;
        },
    );

    let mut command = Message::command("Available", 1, Vec::new());
    group.async_command(&mut command).await?;

    let event_a = tokio::time::timeout(Duration::from_secs(2), sub_a.inbound.recv())
        .await
        .expect("delivery on events-a")
        .expect("subscription open");
    sub_a.marker.send(Resolution::Ack).await.unwrap();

    let event_b = tokio::time::timeout(Duration::from_secs(2), sub_b.inbound.recv())
        .await
        .expect("delivery on events-b")
        .expect("subscription open");
    sub_b.marker.send(Resolution::Ack).await.unwrap();

    assert_eq!(event_a.id, event_b.id);
    assert_eq!(event_a.data, event_b.data);
    assert_eq!(event_a.data, b"payload");
    assert_eq!(event_a.context.parent_id(), Some(command.id.as_str()));
    assert_eq!(event_b.context.parent_id(), Some(command.id.as_str()));
    assert_eq!(event_a.topic.name, "events-a");
    assert_eq!(event_b.topic.name, "events-b");

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn redelivery_stops_after_max_retries() -> Result<()> {
    let dialect = MockDialect::new().with_max_retries(1);
    let consumer = dialect.consumer();
    let producer = dialect.producer();
    let topic = Topic::new("raw", MessageKind::Command, Mode::CONSUME | Mode::PRODUCE);

    let mut subscription = consumer.subscribe(&[topic.clone()]).await?;

    let mut doomed = Message::command("doomed", 1, Vec::new());
    doomed.topic = topic.clone();
    producer.publish(doomed.clone()).await?;

    let first = subscription.inbound.recv().await.expect("first delivery");
    assert_eq!(first.retries, 0);
    subscription.marker.send(Resolution::Nack).await.unwrap();

    let second = subscription.inbound.recv().await.expect("redelivery");
    assert_eq!(second.id, doomed.id);
    assert_eq!(second.retries, 1);
    subscription.marker.send(Resolution::Nack).await.unwrap();

    // The bound is exhausted; the next delivery is a fresh message.
    let mut fresh = Message::command("fresh", 1, Vec::new());
    fresh.topic = topic.clone();
    producer.publish(fresh.clone()).await?;

    let delivered = tokio::time::timeout(Duration::from_secs(2), subscription.inbound.recv())
        .await
        .expect("fresh delivery")
        .expect("subscription open");
    assert_eq!(delivered.id, fresh.id);
    subscription.marker.send(Resolution::Ack).await.unwrap();

    dialect.close().await?;
    Ok(())
}

#[tokio::test]
async fn unsubscribed_channels_are_closed() -> Result<()> {
    let dialect = MockDialect::new();
    let consumer = dialect.consumer();
    let topic = Topic::new("raw", MessageKind::Event, Mode::CONSUME | Mode::PRODUCE);

    let mut subscription = consumer.subscribe(&[topic.clone()]).await?;
    consumer.unsubscribe(subscription.id).await?;

    let inbound = tokio::time::timeout(Duration::from_secs(1), subscription.inbound.recv())
        .await
        .expect("channel closes promptly");
    assert!(inbound.is_none());

    dialect.close().await?;
    Ok(())
}

#[tokio::test]
async fn closed_dialects_reject_work() -> Result<()> {
    let dialect = MockDialect::new();
    assert!(dialect.healthy());

    dialect.close().await?;
    assert!(!dialect.healthy());

    let topic = Topic::new("raw", MessageKind::Event, Mode::CONSUME | Mode::PRODUCE);
    let subscribe = dialect.consumer().subscribe(&[topic.clone()]).await;
    assert!(matches!(subscribe, Err(CourierError::Closed)));

    let mut message = Message::event("late", 1, Vec::new());
    message.topic = topic;
    let publish = dialect.producer().publish(message).await;
    assert!(matches!(publish, Err(CourierError::Closed)));

    // Close is idempotent.
    dialect.close().await?;
    Ok(())
}
