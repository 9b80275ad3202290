use std::sync::Arc;
use std::time::Duration;

use courier::{
    Client, CourierError, Group, Message, MessageKind, MockDialect, Mode, Result, Topic, Writer,
};

fn standard_group(dialect: Arc<MockDialect>) -> Group {
    Group::new(
        dialect,
        vec![
            Topic::new(
                "commands",
                MessageKind::Command,
                Mode::CONSUME | Mode::PRODUCE,
            ),
            Topic::new("events", MessageKind::Event, Mode::CONSUME | Mode::PRODUCE),
        ],
    )
}

#[tokio::test]
async fn a_client_requires_at_least_one_group() {
    let result = Client::new(Vec::new()).await;
    assert!(matches!(result, Err(CourierError::Config(_))));
}

#[tokio::test]
async fn groups_cannot_publish_before_the_client_started() {
    let group = standard_group(Arc::new(MockDialect::new()));
    let mut command = Message::command("Early", 1, Vec::new());
    let result = group.async_command(&mut command).await;
    assert!(matches!(result, Err(CourierError::Closed)));
}

#[tokio::test]
async fn operations_after_close_fail() -> Result<()> {
    let group = standard_group(Arc::new(MockDialect::new()));
    let client = Client::new(vec![group.clone()]).await?;
    assert!(client.healthy());

    client.close().await?;
    assert!(!client.healthy());

    let mut command = Message::command("Late", 1, Vec::new());
    assert!(matches!(
        group.async_command(&mut command).await,
        Err(CourierError::Closed)
    ));
    assert!(matches!(
        group.sync_command(&mut command).await,
        Err(CourierError::Closed)
    ));

    // Close is idempotent.
    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn two_groups_can_share_one_dialect() -> Result<()> {
    let dialect = Arc::new(MockDialect::new());
    let orders = Group::new(
        dialect.clone(),
        vec![
            Topic::new(
                "order-commands",
                MessageKind::Command,
                Mode::CONSUME | Mode::PRODUCE,
            ),
            Topic::new(
                "order-events",
                MessageKind::Event,
                Mode::CONSUME | Mode::PRODUCE,
            ),
        ],
    );
    let shipments = Group::new(
        dialect,
        vec![
            Topic::new(
                "shipment-commands",
                MessageKind::Command,
                Mode::CONSUME | Mode::PRODUCE,
            ),
            Topic::new(
                "shipment-events",
                MessageKind::Event,
                Mode::CONSUME | Mode::PRODUCE,
            ),
        ],
    );

    let client = Client::new(vec![orders.clone(), shipments.clone()]).await?;

    orders.handle_func(
        MessageKind::Command,
        "Place",
        |_message: Message, writer: Writer| async move {
            let _ = writer.event("Placed", 1, Vec::new(), Vec::new()).await;
        },
    );
    shipments.handle_func(
        MessageKind::Command,
        "Ship",
        |_message: Message, writer: Writer| async move {
            let _ = writer.event("Shipped", 1, Vec::new(), Vec::new()).await;
        },
    );

    let mut place = Message::command("Place", 1, Vec::new());
    let placed = orders.sync_command(&mut place).await?;
    assert_eq!(placed.action, "Placed");
    placed.ack();

    let mut ship = Message::command("Ship", 1, Vec::new());
    let shipped = shipments.sync_command(&mut ship).await?;
    assert_eq!(shipped.action, "Shipped");
    shipped.ack();

    client.close().await?;
    Ok(())
}

#[tokio::test]
async fn the_group_timeout_bounds_sync_commands() -> Result<()> {
    let dialect = Arc::new(MockDialect::new());
    let group = Group::new(
        dialect,
        vec![
            Topic::new(
                "commands",
                MessageKind::Command,
                Mode::CONSUME | Mode::PRODUCE,
            ),
            Topic::new("events", MessageKind::Event, Mode::CONSUME),
        ],
    );
    group.set_timeout(Duration::from_millis(80));
    assert_eq!(group.timeout(), Duration::from_millis(80));

    let client = Client::new(vec![group.clone()]).await?;

    let mut command = Message::command("Quiet", 1, Vec::new());
    let started = tokio::time::Instant::now();
    let result = group.sync_command(&mut command).await;
    assert!(matches!(result, Err(CourierError::Timeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(80));
    assert!(started.elapsed() < Duration::from_secs(4));

    client.close().await?;
    Ok(())
}
