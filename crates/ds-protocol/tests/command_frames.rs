/// Frame-boundary tests: controller command decoding and the wire shape of
/// agent messages the controller depends on.
use ds_protocol::{
    AgentMessage, Command, ContentDescriptor, ContentKind, DecodeError, DeviceMetrics,
    DeviceSettings, HeartbeatReport, PlaybackStatus, PlaybackSummary, STATUS_CONNECTED,
};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[test]
fn play_frame_decodes_descriptor_and_settings() {
    let frame = r#"{
        "comando": "REPRODUCIR_CONTENIDO",
        "contenido": {
            "id": "c1",
            "tipo": "imagen",
            "url": "http://x/c1.jpg",
            "checksum": "d41d8cd98f00b204e9800998ecf8427e",
            "duracion": 5
        },
        "configuracion": {"volumen": 30}
    }"#;

    match Command::decode(frame).expect("decode") {
        Command::Play { content, settings } => {
            assert_eq!(content.id, "c1");
            assert_eq!(content.kind, ContentKind::Image);
            assert_eq!(content.url.as_deref(), Some("http://x/c1.jpg"));
            assert_eq!(content.duration_secs, Some(5));
            assert_eq!(settings.percent(DeviceSettings::VOLUME), Some(Ok(30)));
        }
        other => panic!("expected Play, got {other:?}"),
    }
}

#[test]
fn simple_commands_decode_without_payload() {
    assert_eq!(
        Command::decode(r#"{"comando":"DETENER_REPRODUCCION"}"#),
        Ok(Command::Stop)
    );
    assert_eq!(
        Command::decode(r#"{"comando":"REINICIAR_DISPOSITIVO"}"#),
        Ok(Command::Reboot)
    );
    assert_eq!(
        Command::decode(r#"{"comando":"ACTUALIZAR_SOFTWARE"}"#),
        Ok(Command::UpdateSoftware)
    );
    assert_eq!(
        Command::decode(r#"{"comando":"OBTENER_ESTADO"}"#),
        Ok(Command::GetState)
    );
}

#[test]
fn apply_config_tolerates_missing_or_null_settings() {
    assert_eq!(
        Command::decode(r#"{"comando":"ACTUALIZAR_CONFIGURACION"}"#),
        Ok(Command::ApplyConfig(DeviceSettings::new()))
    );
    assert_eq!(
        Command::decode(r#"{"comando":"ACTUALIZAR_CONFIGURACION","configuracion":null}"#),
        Ok(Command::ApplyConfig(DeviceSettings::new()))
    );
}

#[test]
fn unknown_command_is_reported_by_name() {
    let err = Command::decode(r#"{"comando":"BAILAR","contenido":"garbage"}"#).unwrap_err();
    assert_eq!(err, DecodeError::Unsupported("BAILAR".to_owned()));
    assert_eq!(err.to_string(), "Comando no soportado: BAILAR");
}

#[test]
fn frame_without_command_is_unsupported_unknown() {
    let err = Command::decode(r#"{"contenido":{}}"#).unwrap_err();
    assert_eq!(err, DecodeError::Unsupported("UNKNOWN".to_owned()));
}

#[test]
fn malformed_frames_are_decode_errors() {
    assert!(matches!(
        Command::decode("not json"),
        Err(DecodeError::Malformed(_))
    ));
    assert!(matches!(
        Command::decode("[1,2,3]"),
        Err(DecodeError::Malformed(_))
    ));
    // Play without its content descriptor.
    assert!(matches!(
        Command::decode(r#"{"comando":"REPRODUCIR_CONTENIDO"}"#),
        Err(DecodeError::Malformed(_))
    ));
}

#[test]
fn to_frame_is_accepted_by_decode() {
    let cmd = Command::Play {
        content: ContentDescriptor::new("w1", ContentKind::WebPage).with_url("https://example.com"),
        settings: DeviceSettings::new().with(DeviceSettings::BRIGHTNESS, 80),
    };
    assert_eq!(Command::decode(&cmd.to_frame()), Ok(cmd));
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[test]
fn heartbeat_uses_controller_field_names() {
    let msg = AgentMessage::Heartbeat(HeartbeatReport {
        timestamp: "2026-01-01T00:00:00.000Z".to_owned(),
        mac_address: "AA:BB:CC:DD:EE:FF".to_owned(),
        device_id: "AABBCCDDEEFF".to_owned(),
        ip_address: "10.0.0.5".to_owned(),
        software_version: "0.1.0".to_owned(),
        status: STATUS_CONNECTED.to_owned(),
        metrics: DeviceMetrics {
            cpu_usage: 12.5,
            memory_total: 1000,
            memory_used: 250,
            memory_percent: 25.0,
            disk_total: 2000,
            disk_used: 500,
            disk_percent: 25.0,
            cpu_temperature: None,
        },
        playback: PlaybackSummary {
            active: true,
            content_id: Some("c1".to_owned()),
        },
    });

    let json: Value = serde_json::to_value(&msg).unwrap();
    assert_eq!(json["tipo"], "HEARTBEAT");
    assert_eq!(json["estado"], "CONECTADO");
    assert_eq!(json["version_software"], "0.1.0");
    assert_eq!(json["metricas"]["memoria_porcentaje"], 25.0);
    assert_eq!(json["metricas"]["disco_usado"], 500);
    assert!(json["metricas"]["temperatura_cpu"].is_null());
    assert_eq!(json["reproduccion"]["activa"], true);
    assert_eq!(json["reproduccion"]["contenido_id"], "c1");
}

#[test]
fn playback_state_serializes_spanish_status_words() {
    let cases = [
        (PlaybackStatus::Playing, "REPRODUCIENDO"),
        (PlaybackStatus::Stopped, "DETENIDO"),
        (PlaybackStatus::Completed, "COMPLETADO"),
        (PlaybackStatus::Error, "ERROR"),
    ];
    for (status, word) in cases {
        let json: Value =
            serde_json::to_value(AgentMessage::playback(status, Some("c9".to_owned()))).unwrap();
        assert_eq!(json["tipo"], "ESTADO_REPRODUCCION");
        assert_eq!(json["estado"], word);
        assert_eq!(json["contenido_id"], "c9");
    }
}

#[test]
fn error_and_download_frames_carry_timestamps() {
    for msg in [
        AgentMessage::error("boom"),
        AgentMessage::download_complete("c1", 4096),
    ] {
        let json: Value = serde_json::to_value(&msg).unwrap();
        let ts = json["timestamp"].as_str().expect("timestamp string");
        assert!(
            chrono::DateTime::parse_from_rfc3339(ts).is_ok(),
            "not ISO-8601: {ts}"
        );
    }
    let json: Value = serde_json::to_value(AgentMessage::download_complete("c1", 4096)).unwrap();
    assert_eq!(json["tamano_archivo"], 4096);
}
