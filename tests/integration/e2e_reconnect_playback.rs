//! E2E: playback survives a lost controller link.
//!
//! The connection is dropped while a video is playing. Heartbeats stop until
//! the agent has reconnected; the first heartbeat on the new connection shows
//! the session still active.

use std::time::Duration;

use agent::connection::ConnectionState;
use display_fleet::{NODE_MAC, Node};
use ds_protocol::{
    AgentMessage, Command, ContentDescriptor, ContentKind, DeviceSettings, PlaybackStatus,
};

#[tokio::test]
async fn heartbeat_after_reconnect_reflects_active_playback() {
    let mut node = Node::start(|cfg| {
        cfg.heartbeat.interval = Duration::from_millis(500);
    })
    .await
    .unwrap();
    assert!(
        node.controller
            .wait_for_connections(1, Duration::from_secs(5))
            .await
    );

    let content =
        ContentDescriptor::new("stream", ContentKind::WebPage).with_url("https://example.com/live");
    node.controller
        .send_command(&Command::Play {
            content,
            settings: DeviceSettings::new(),
        })
        .unwrap();
    node.controller
        .recv_matching(Duration::from_secs(5), |m| {
            matches!(m, AgentMessage::PlaybackState(s) if s.status == PlaybackStatus::Playing)
        })
        .await
        .expect("REPRODUCIENDO");

    node.controller.drop_connection();
    tokio::time::timeout(
        Duration::from_secs(5),
        node.wait_for_state(ConnectionState::Disconnected),
    )
    .await
    .expect("agent notices the lost link");

    // First retry waits 2s; nothing can be delivered meanwhile.
    let during_outage = node.controller.collect_for(Duration::from_secs(1)).await;
    assert!(
        during_outage.iter().all(|r| r.connection == 0),
        "frames on a new connection during the outage: {during_outage:?}"
    );
    assert_eq!(node.connection_state(), ConnectionState::Disconnected);

    assert!(
        node.controller
            .wait_for_connections(2, Duration::from_secs(10))
            .await,
        "agent reconnects"
    );
    assert_eq!(
        node.controller.header(1, "mac_address").as_deref(),
        Some(NODE_MAC)
    );

    let hb = node
        .controller
        .recv_matching(Duration::from_secs(5), |m| matches!(m, AgentMessage::Heartbeat(_)))
        .await
        .expect("heartbeat on the new connection");
    assert_eq!(hb.connection, 1);
    match hb.message {
        AgentMessage::Heartbeat(h) => {
            assert!(h.playback.active);
            assert_eq!(h.playback.content_id.as_deref(), Some("stream"));
        }
        other => panic!("unexpected {other:?}"),
    }

    // The player was never restarted.
    assert_eq!(node.driver.started().len(), 1);
    assert_eq!(node.driver.running(), 1);

    // Shutdown stops the player.
    let driver = node.driver.clone();
    node.stop().await;
    assert_eq!(driver.running(), 0);
}
