//! E2E: a controller that floods the agent with commands.
//!
//! Every command is answered, either with its reply or with a busy refusal,
//! and the link keeps heartbeating on the same connection afterwards.

use std::time::Duration;

use agent::connection::{BUSY_MESSAGE, ConnectionState};
use display_fleet::Node;
use ds_protocol::{AgentMessage, Command};

#[tokio::test]
async fn flood_of_state_requests_leaves_the_link_alive() {
    let mut node = Node::start(|cfg| {
        cfg.heartbeat.interval = Duration::from_millis(500);
        cfg.connection.ping_interval = Duration::from_secs(1);
        cfg.connection.ping_timeout = Duration::from_secs(2);
    })
    .await
    .unwrap();
    assert!(
        node.controller
            .wait_for_connections(1, Duration::from_secs(5))
            .await
    );

    let flood = 3000;
    for _ in 0..flood {
        node.controller.send_command(&Command::GetState).unwrap();
    }

    let (mut snapshots, mut refused) = (0, 0);
    while snapshots + refused < flood {
        let received = node
            .controller
            .recv(Duration::from_secs(10))
            .await
            .unwrap_or_else(|| panic!("stalled after {snapshots} replies and {refused} refusals"));
        match received.message {
            AgentMessage::StateSnapshot(_) => snapshots += 1,
            AgentMessage::Error(e) if e.message == BUSY_MESSAGE => refused += 1,
            _ => {}
        }
    }
    assert!(snapshots > 0);

    node.controller
        .recv_matching(Duration::from_secs(3), |m| matches!(m, AgentMessage::Heartbeat(_)))
        .await
        .expect("heartbeats resume after the flood");

    node.controller.send_command(&Command::GetState).unwrap();
    node.controller
        .recv_matching(Duration::from_secs(3), |m| {
            matches!(m, AgentMessage::StateSnapshot(_))
        })
        .await
        .expect("agent still answers commands");

    assert_eq!(node.connection_state(), ConnectionState::Connected);
    assert_eq!(node.controller.connection_count(), 1);
    assert!(node.controller.rejected_frames().is_empty());

    node.stop().await;
}
