//! E2E: content whose bytes do not match the declared checksum never plays.
//!
//! Controller sends REPRODUCIR_CONTENIDO with a `checksum` that the served
//! bytes do not hash to. The agent answers with an ERROR naming the integrity
//! failure and never reports REPRODUCIENDO for that content.

use std::time::Duration;

use display_fleet::Node;
use ds_protocol::{AgentMessage, Command, ContentDescriptor, ContentKind, DeviceSettings};

#[tokio::test]
async fn checksum_mismatch_is_reported_and_nothing_plays() {
    let mut node = Node::start(|_| {}).await.unwrap();
    assert!(
        node.controller
            .wait_for_connections(1, Duration::from_secs(5))
            .await
    );
    node.content.put("c2.mp4", b"not the video you expected".to_vec());

    let content = ContentDescriptor::new("c2", ContentKind::Video)
        .with_url(node.content.url("c2.mp4"))
        .with_checksum("00112233445566778899aabbccddeeff");
    node.controller
        .send_command(&Command::Play {
            content,
            settings: DeviceSettings::new(),
        })
        .unwrap();

    let error = node
        .controller
        .recv_matching(Duration::from_secs(5), |m| matches!(m, AgentMessage::Error(_)))
        .await
        .expect("error reported");
    match error.message {
        AgentMessage::Error(e) => {
            assert!(e.message.contains("integrity"), "message: {}", e.message);
            assert_eq!(e.command.as_deref(), Some("REPRODUCIR_CONTENIDO"));
            assert_eq!(e.content_id.as_deref(), Some("c2"));
        }
        other => panic!("unexpected {other:?}"),
    }

    // Nothing about c2 playing or being downloaded follows.
    let later = node.controller.collect_for(Duration::from_secs(1)).await;
    for received in &later {
        assert!(
            !matches!(
                received.message,
                AgentMessage::PlaybackState(_) | AgentMessage::DownloadComplete(_)
            ),
            "unexpected frame after integrity failure: {:?}",
            received.message
        );
    }
    assert!(node.driver.started().is_empty());
    assert_eq!(node.content.hits("c2.mp4"), 1);

    // The agent is still responsive.
    node.controller.send_command(&Command::GetState).unwrap();
    let state = node
        .controller
        .recv_matching(Duration::from_secs(5), |m| {
            matches!(m, AgentMessage::StateSnapshot(_))
        })
        .await
        .expect("state snapshot");
    match state.message {
        AgentMessage::StateSnapshot(s) => {
            assert!(!s.playback.active);
            assert!(s.cached_content.is_empty());
        }
        other => panic!("unexpected {other:?}"),
    }

    node.stop().await;
}

#[tokio::test]
async fn malformed_and_unknown_frames_do_not_break_the_link() {
    let mut node = Node::start(|_| {}).await.unwrap();
    assert!(
        node.controller
            .wait_for_connections(1, Duration::from_secs(5))
            .await
    );

    node.controller.send_text("this is not json").unwrap();
    node.controller
        .send_text(r#"{"comando":"FORMATEAR_DISCO"}"#)
        .unwrap();

    let mut errors = Vec::new();
    while errors.len() < 2 {
        let received = node
            .controller
            .recv_matching(Duration::from_secs(5), |m| matches!(m, AgentMessage::Error(_)))
            .await
            .expect("error reply");
        if let AgentMessage::Error(e) = received.message {
            errors.push(e);
        }
    }
    assert!(errors[0].message.starts_with("Mensaje invalido"));
    assert_eq!(errors[1].message, "Comando no soportado: FORMATEAR_DISCO");
    assert_eq!(errors[1].command.as_deref(), Some("FORMATEAR_DISCO"));
    assert_eq!(node.controller.connection_count(), 1);

    node.stop().await;
}
