mod common;

use std::time::Duration;

use stream_probe::{
    CloseReason, Error, ErrorKind, Message, Session, SessionConfig, Target,
    frames::{Frame, FrameDecoder, Opcode, fragment},
};
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn frames_sent_with_the_handshake_are_not_lost() {
    let (listener, target) = common::listen().await;
    let server = tokio::spawn(async move {
        let extra = common::encode(&[Frame::text("hello"), Frame::text("world")]);
        let _stream = common::accept(&listener, &extra).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let mut session = Session::connect(&target, SessionConfig::default()).await.unwrap();
    assert_eq!(
        session.receive_next_message().await.unwrap(),
        Some(Message::Text("hello".into()))
    );
    assert_eq!(
        session.receive_next_message().await.unwrap(),
        Some(Message::Text("world".into()))
    );

    // server hangs up between frames
    assert_eq!(session.receive_next_message().await.unwrap(), None);
    assert!(session.is_closed());
    assert_eq!(session.receive_next_message().await.unwrap(), None);
    server.await.unwrap();
}

#[tokio::test]
async fn fragments_with_interleaved_ping() {
    let (listener, target) = common::listen().await;
    let server = tokio::spawn(async move {
        let mut stream = common::accept(&listener, &[]).await;
        let mut frames = fragment(Opcode::Text, b"hello fragmented world", 3);
        frames.insert(1, Frame::ping("abc"));
        stream.write_all(&common::encode(&frames)).await.unwrap();

        let mut decoder = FrameDecoder::new(1 << 20);
        let pong = common::read_frame(&mut stream, &mut decoder).await;
        assert_eq!(pong.opcode, Opcode::Pong);
        assert!(pong.is_masked());
        assert_eq!(&pong.payload[..], b"abc");

        stream
            .write_all(&Frame::close(CloseReason::Normal, "bye").encode())
            .await
            .unwrap();
        let close = common::read_frame(&mut stream, &mut decoder).await;
        assert_eq!(close.opcode, Opcode::Close);
        assert!(close.is_masked());
        assert_eq!(CloseReason::from_payload(&close.payload), Some(CloseReason::Normal));
    });

    let mut session = Session::connect(&target, SessionConfig::default()).await.unwrap();
    let msg = session.receive_next_message().await.unwrap().unwrap();
    assert_eq!(msg.as_str(), Some("hello fragmented world"));

    assert_eq!(session.receive_next_message().await.unwrap(), None);
    assert!(session.is_closed());
    server.await.unwrap();
}

#[tokio::test]
async fn stream_ending_mid_frame_is_truncated() {
    let (listener, target) = common::listen().await;
    let server = tokio::spawn(async move {
        // announces 10 bytes, delivers 3
        let _stream = common::accept(&listener, &[0x81, 0x0A, b'a', b'b', b'c']).await;
    });

    let mut session = Session::connect(&target, SessionConfig::default()).await.unwrap();
    server.await.unwrap();

    let err = session.receive_next_message().await.unwrap_err();
    assert!(matches!(err, Error::TruncatedFrame { buffered: 3 }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::TruncatedFrame);
    assert!(session.is_closed());
    assert_eq!(session.receive_next_message().await.unwrap(), None);
}

#[tokio::test]
async fn reserved_opcode_closes_with_protocol_error() {
    let (listener, target) = common::listen().await;
    let server = tokio::spawn(async move {
        let mut stream = common::accept(&listener, &[0x83, 0x00]).await;
        let close = common::read_frame(&mut stream, &mut FrameDecoder::new(1 << 20)).await;
        assert_eq!(close.opcode, Opcode::Close);
        assert_eq!(CloseReason::from_payload(&close.payload), Some(CloseReason::ProtoError));
    });

    let mut session = Session::connect(&target, SessionConfig::default()).await.unwrap();
    let err = session.receive_next_message().await.unwrap_err();
    assert!(matches!(err, Error::ReservedOpcode(3)));
    assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    server.await.unwrap();
}

#[tokio::test]
async fn timeout_keeps_partial_frame() {
    let (listener, target) = common::listen().await;
    let server = tokio::spawn(async move {
        let mut stream = common::accept(&listener, &[]).await;
        let bytes = Frame::text("split across a pause").encode();
        let (head, tail) = bytes.split_at(4);
        stream.write_all(head).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        stream.write_all(tail).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let mut session = Session::connect(&target, SessionConfig::default()).await.unwrap();
    let err = session
        .receive_timeout(Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert!(!session.is_closed());

    let msg = session.receive_next_message().await.unwrap().unwrap();
    assert_eq!(msg.as_str(), Some("split across a pause"));
    session.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn binary_messages_are_skipped_for_payloads() {
    let (listener, target) = common::listen().await;
    let server = tokio::spawn(async move {
        let mut extra = common::encode(&[Frame::binary(vec![1, 2, 3])]);
        extra.extend(common::text(&common::snapshot()));
        let _stream = common::accept(&listener, &extra).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let mut session = Session::connect(&target, SessionConfig::default()).await.unwrap();
    let payload = session.receive_next_payload().await.unwrap();
    assert!(matches!(payload, Some(stream_probe::Payload::Snapshot(_))));
    session.close().await;
    server.await.unwrap();
}

#[tokio::test]
async fn non_101_response_fails_handshake() {
    let (listener, target) = common::listen().await;
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        common::respond(&mut stream, "HTTP/1.1 403 Forbidden", &[]).await;
    });

    let err = Session::connect(&target, SessionConfig::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Handshake(_)), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::HandshakeFailure);
    server.await.unwrap();
}

#[tokio::test]
async fn refused_connection_is_a_connect_failure() {
    let (listener, target) = common::listen().await;
    drop(listener);

    let err = Session::connect(&target, SessionConfig::default())
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::ConnectFailure);
}

#[tokio::test]
async fn retries_until_the_server_is_up() {
    let (listener, target) = common::listen().await;
    let port = target.port;
    drop(listener);

    let server = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let _stream = common::accept(&listener, &common::text(&common::snapshot())).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let retry = stream_probe::RetryPolicy {
        attempts: 20,
        delay: Duration::from_millis(100),
    };
    let mut session = Session::connect_with_retry(&Target::new("127.0.0.1", port), SessionConfig::default(), retry)
        .await
        .unwrap();
    assert!(session.receive_next_message().await.unwrap().is_some());
    session.close().await;
    server.await.unwrap();
}
