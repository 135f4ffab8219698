//! E2E: an image played for a fixed duration completes on its own.
//!
//! Controller sends REPRODUCIR_CONTENIDO for an image with `duracion`; the
//! agent downloads it, reports REPRODUCIENDO and, once the duration has
//! elapsed, COMPLETADO without any further command.

use std::time::{Duration, Instant};

use display_fleet::Node;
use ds_protocol::{AgentMessage, Command, ContentDescriptor, ContentKind, DeviceSettings, PlaybackStatus};

fn playback_status(msg: &AgentMessage, status: PlaybackStatus, id: &str) -> bool {
    matches!(msg, AgentMessage::PlaybackState(s) if s.status == status && s.content_id.as_deref() == Some(id))
}

#[tokio::test]
async fn image_with_duration_reports_completed() {
    let mut node = Node::start(|cfg| {
        cfg.heartbeat.interval = Duration::from_secs(1);
    })
    .await
    .unwrap();
    assert!(
        node.controller
            .wait_for_connections(1, Duration::from_secs(5))
            .await
    );
    node.content.put("c1.jpg", b"\xff\xd8\xff\xe0 jpeg bytes".to_vec());

    let content = ContentDescriptor::new("c1", ContentKind::Image)
        .with_url(node.content.url("c1.jpg"))
        .with_duration(2);
    node.controller
        .send_command(&Command::Play {
            content,
            settings: DeviceSettings::new(),
        })
        .unwrap();

    let download = node
        .controller
        .recv_matching(Duration::from_secs(5), |m| {
            matches!(m, AgentMessage::DownloadComplete(d) if d.content_id == "c1")
        })
        .await
        .expect("download reported");
    match download.message {
        AgentMessage::DownloadComplete(d) => assert_eq!(d.file_size, 15),
        other => panic!("unexpected {other:?}"),
    }

    node.controller
        .recv_matching(Duration::from_secs(5), |m| {
            playback_status(m, PlaybackStatus::Playing, "c1")
        })
        .await
        .expect("REPRODUCIENDO for c1");
    let started = Instant::now();

    node.controller
        .recv_matching(Duration::from_secs(6), |m| {
            playback_status(m, PlaybackStatus::Completed, "c1")
        })
        .await
        .expect("COMPLETADO for c1");
    assert!(
        started.elapsed() >= Duration::from_millis(1500),
        "completed too early: {:?}",
        started.elapsed()
    );

    assert_eq!(node.driver.running(), 0);
    assert!(!node.supervisor().snapshot().is_active());

    // Heartbeats now show nothing playing.
    node.controller
        .recv_matching(Duration::from_secs(3), |m| {
            matches!(m, AgentMessage::Heartbeat(h) if !h.playback.active && h.playback.content_id.is_none())
        })
        .await
        .expect("idle heartbeat after completion");

    node.stop().await;
}
