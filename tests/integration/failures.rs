use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use canopy_core::crypto;
use canopy_core::tree::DEFAULT_MAX_DEPTH;
use canopy_core::wire::{self, Datum, DirectoryEntry, Frame, Hello, MessageType};
use canopy_core::Hash;
use canopy_services::download::DownloadError;
use canopy_services::{
    DatumOutcome, DownloadEngine, DownloadRequest, ExchangeError, ExchangePolicy,
    IntegrityViolation,
};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Misbehaving peers
// ══════════════════════════════════════════════════════════════════════════════

/// Wait for the next GetDatum and answer it with `respond`.
async fn answer_get_datum(raw: &RawPeer, respond: impl FnOnce(&Frame) -> Vec<Frame>) {
    loop {
        let (frame, from) = raw.recv(Duration::from_secs(3)).await.expect("no request arrived");
        if frame.msg_type != MessageType::GetDatum {
            continue;
        }
        for reply in respond(&frame) {
            raw.send(&reply, from).await.unwrap();
        }
        return;
    }
}

fn datum_frame(id: u32, echoed: &Hash, datum: &Datum) -> Frame {
    Frame::new(id, MessageType::Datum, wire::encode_datum_body(echoed, datum))
}

fn chunk(bytes: &'static [u8]) -> Datum {
    Datum::Chunk(Bytes::from_static(bytes))
}

#[tokio::test]
async fn echoed_hash_must_match_the_request() {
    let alice = spawn_peer("alice", None).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();
    let wanted = crypto::hash(b"wanted");
    let other = crypto::hash(b"other");

    let (result, ()) = tokio::join!(
        alice.node.exchange().get_datum(raw.addr(), &wanted),
        answer_get_datum(&raw, |f| vec![datum_frame(f.id, &other, &chunk(b"other"))]),
    );
    match result {
        Err(ExchangeError::Integrity(IntegrityViolation::EchoMismatch { requested, echoed })) => {
            assert_eq!(requested, wanted);
            assert_eq!(echoed, other);
        }
        other => panic!("expected echo mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn content_must_hash_to_the_request() {
    let alice = spawn_peer("alice", None).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();
    let wanted = crypto::hash(b"good");

    let (result, ()) = tokio::join!(
        alice.node.exchange().get_datum(raw.addr(), &wanted),
        answer_get_datum(&raw, |f| vec![datum_frame(f.id, &wanted, &chunk(b"evil"))]),
    );
    let err = result.unwrap_err();
    assert!(err.is_integrity());
    assert!(!err.is_retryable());
    match err {
        ExchangeError::Integrity(IntegrityViolation::DigestMismatch { requested, computed }) => {
            assert_eq!(requested, wanted);
            assert_eq!(computed, crypto::hash(b"evil"));
        }
        other => panic!("expected digest mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn stale_reply_is_skipped() {
    let alice = spawn_peer("alice", None).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();
    let wanted = crypto::hash(b"good");

    let (result, ()) = tokio::join!(
        alice.node.exchange().get_datum(raw.addr(), &wanted),
        answer_get_datum(&raw, |f| {
            vec![
                datum_frame(f.id.wrapping_add(1000), &wanted, &chunk(b"evil")),
                datum_frame(f.id, &wanted, &chunk(b"good")),
            ]
        }),
    );
    assert_eq!(result.unwrap(), DatumOutcome::Found(chunk(b"good")));
}

#[tokio::test]
async fn no_datum_is_absent_only_when_echoed_correctly() {
    let alice = spawn_peer("alice", None).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();
    let wanted = crypto::hash(b"missing");
    let ex = alice.node.exchange();

    let (result, ()) = tokio::join!(
        ex.get_datum(raw.addr(), &wanted),
        answer_get_datum(&raw, |f| vec![f.reply(MessageType::NoDatum, wanted.to_vec())]),
    );
    assert_eq!(result.unwrap(), DatumOutcome::Absent);

    let wrong = crypto::hash(b"something else");
    let (result, ()) = tokio::join!(
        ex.get_datum(raw.addr(), &wanted),
        answer_get_datum(&raw, |f| vec![f.reply(MessageType::NoDatum, wrong.to_vec())]),
    );
    assert!(matches!(
        result,
        Err(ExchangeError::Integrity(IntegrityViolation::EchoMismatch { .. }))
    ));
}

#[tokio::test]
async fn datum_request_is_resent_until_the_deadline() {
    let policy = ExchangePolicy {
        datum_deadline: Duration::from_millis(1000),
        datum_read_timeout: Duration::from_millis(200),
        ..fast_policy()
    };
    let alice = spawn_peer_with("alice", None, policy).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();
    let wanted = crypto::hash(b"never");

    let count_requests = async {
        let mut ids = Vec::new();
        while let Some((frame, _)) = raw.recv(Duration::from_millis(1500)).await {
            if frame.msg_type == MessageType::GetDatum {
                ids.push(frame.id);
            }
        }
        ids
    };
    let (result, ids) = tokio::join!(alice.node.exchange().get_datum(raw.addr(), &wanted), count_requests);

    assert!(matches!(result, Err(ExchangeError::DeadlineExceeded(_))));
    assert!(ids.len() >= 3, "only {} sends", ids.len());
    // Re-sends carry the original id.
    assert!(ids.iter().all(|id| *id == ids[0]));
}

#[tokio::test]
async fn error_reply_surfaces_the_peer_message() {
    let alice = spawn_peer("alice", None).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();
    let wanted = crypto::hash(b"x");

    let (result, ()) = tokio::join!(
        alice.node.exchange().get_datum(raw.addr(), &wanted),
        answer_get_datum(&raw, |f| vec![f.reply(MessageType::ErrorReply, b"not today".to_vec())]),
    );
    match result {
        Err(ExchangeError::Remote(message)) => assert_eq!(message, "not today"),
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn wrong_reply_type_is_a_protocol_error() {
    let alice = spawn_peer("alice", None).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();
    let wanted = crypto::hash(b"x");

    let (result, ()) = tokio::join!(
        alice.node.exchange().get_datum(raw.addr(), &wanted),
        answer_get_datum(&raw, |f| vec![f.reply(MessageType::RootReply, wanted.to_vec())]),
    );
    assert!(matches!(
        result,
        Err(ExchangeError::Protocol { got: MessageType::RootReply, .. })
    ));
}

#[tokio::test]
async fn garbage_does_not_stop_the_responder() {
    let bob = spawn_peer("bob", None).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();

    raw.socket.send_to(&[1, 2, 3], bob.addr()).await.unwrap();
    raw.socket.send_to(&[0, 0, 0, 1, 2, 0xff, 0xff], bob.addr()).await.unwrap();
    raw.socket.send_to(&[0xab; 1500], bob.addr()).await.unwrap();

    raw.send(&Frame::new(9, MessageType::Hello, Hello::new("raw").encode()), bob.addr())
        .await
        .unwrap();
    // The 0xab datagram has an unknown type tag and earns an Error first.
    let reply = loop {
        let (frame, _) = raw.recv(Duration::from_secs(2)).await.unwrap();
        if frame.id == 9 {
            break frame;
        }
    };
    assert_eq!(reply.msg_type, MessageType::HelloReply);
}

#[tokio::test]
async fn unknown_type_gets_an_error_with_the_same_id() {
    let bob = spawn_peer("bob", None).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();

    // id 7, type 42, empty body, blank signature
    let mut datagram = vec![0, 0, 0, 7, 42, 0, 0];
    datagram.extend_from_slice(&[0u8; 64]);
    raw.socket.send_to(&datagram, bob.addr()).await.unwrap();

    let (reply, _) = raw.recv(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply.id, 7);
    assert_eq!(reply.msg_type, MessageType::Error);
}

/// Serve canned datum bodies from a raw socket, NoDatum for anything else.
async fn serve_bodies(raw: RawPeer, bodies: HashMap<Hash, Vec<u8>>) {
    while let Some((frame, from)) = raw.recv(Duration::from_secs(10)).await {
        if frame.msg_type != MessageType::GetDatum {
            continue;
        }
        let Ok(hash) = wire::read_hash(&frame.body) else {
            continue;
        };
        let reply = match bodies.get(&hash) {
            Some(body) => frame.reply(MessageType::Datum, body.clone()),
            None => frame.reply(MessageType::NoDatum, hash.to_vec()),
        };
        let _ = raw.send(&reply, from).await;
    }
}

#[tokio::test]
async fn corrupt_entry_abandons_only_its_branch() {
    let dir = scratch("corrupt-branch");
    let good = crypto::hash(b"good");
    let bad = crypto::hash(b"bad");
    let root = crypto::hash_concat([&good, &bad]);
    let listing = Datum::Directory(vec![
        DirectoryEntry { name: "good.txt".into(), hash: good },
        DirectoryEntry { name: "bad.txt".into(), hash: bad },
    ]);

    let mut bodies = HashMap::new();
    bodies.insert(root, wire::encode_datum_body(&root, &listing));
    bodies.insert(good, wire::encode_datum_body(&good, &chunk(b"good")));
    bodies.insert(bad, wire::encode_datum_body(&bad, &chunk(b"evil")));

    let raw = RawPeer::bind().await.unwrap();
    let addr = raw.addr();
    let server = tokio::spawn(serve_bodies(raw, bodies));

    let alice = spawn_peer("alice", None).await.unwrap();
    let engine = DownloadEngine::new(alice.node.remote(addr), DEFAULT_MAX_DEPTH);
    let out = dir.join("out");
    let report = engine
        .run(&DownloadRequest::by_hash(root, &out).with_root_name("r"))
        .await
        .unwrap();

    assert_eq!(report.files_written, 1);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].remote_path.ends_with("bad.txt"));
    assert!(!report.is_complete());
    assert_eq!(std::fs::read(out.join("r/good.txt")).unwrap(), b"good");
    assert!(!out.join("r/bad.txt").exists());

    server.abort();
    let _ = std::fs::remove_dir_all(&dir);
}

/// An empty directory digests to the empty root, so it cannot stand in
/// for a file.
#[tokio::test]
async fn empty_directory_cannot_replace_a_file() {
    let dir = scratch("empty-dir-swap");
    let file = crypto::hash(b"the real file contents");
    let root = crypto::hash_concat([&file]);
    let listing = Datum::Directory(vec![DirectoryEntry { name: "report.txt".into(), hash: file }]);

    let mut bodies = HashMap::new();
    bodies.insert(root, wire::encode_datum_body(&root, &listing));
    bodies.insert(file, wire::encode_datum_body(&file, &Datum::Directory(Vec::new())));

    let raw = RawPeer::bind().await.unwrap();
    let addr = raw.addr();
    let server = tokio::spawn(serve_bodies(raw, bodies));

    let alice = spawn_peer("alice", None).await.unwrap();
    let engine = DownloadEngine::new(alice.node.remote(addr), DEFAULT_MAX_DEPTH);
    let out = dir.join("out");
    let report = engine
        .run(&DownloadRequest::by_hash(root, &out).with_root_name("r"))
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].remote_path, "r/report.txt");
    assert!(matches!(
        &report.failures[0].error,
        DownloadError::Exchange(ExchangeError::Integrity(IntegrityViolation::DigestMismatch { .. }))
    ));
    assert!(!out.join("r/report.txt").exists());
    assert_eq!(report.directories_created, 1);

    server.abort();
    let _ = std::fs::remove_dir_all(&dir);
}
