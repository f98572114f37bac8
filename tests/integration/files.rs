use std::time::Duration;

use canopy_core::crypto;
use canopy_core::tree::DEFAULT_MAX_DEPTH;
use canopy_core::wire::{Datum, Frame, MessageType, MAX_DIRECTORY_ENTRIES};
use canopy_services::{DatumOutcome, DownloadEngine, DownloadRequest};

use crate::*;

// ══════════════════════════════════════════════════════════════════════════════
//  Content transfer between two live nodes
// ══════════════════════════════════════════════════════════════════════════════

fn found(outcome: DatumOutcome) -> Datum {
    match outcome {
        DatumOutcome::Found(d) => d,
        DatumOutcome::Absent => panic!("datum unexpectedly absent"),
    }
}

/// One 2500-byte file: three chunks of 1024, 1024 and 452 bytes under a
/// big-file node, reassembled in order by fetching each child.
#[tokio::test]
async fn single_file_fetched_chunk_by_chunk() {
    let dir = scratch("a-bin");
    let share = dir.join("share");
    std::fs::create_dir_all(&share).unwrap();
    std::fs::write(share.join("a.bin"), pattern(2500)).unwrap();

    let bob = spawn_peer("bob", Some(&share)).await.unwrap();
    let alice = spawn_peer("alice", None).await.unwrap();
    let ex = alice.node.exchange();

    let root = ex.root(bob.addr()).await.unwrap();
    let entries = match found(ex.get_datum(bob.addr(), &root).await.unwrap()) {
        Datum::Directory(entries) => entries,
        other => panic!("root is not a directory: {other:?}"),
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "a.bin");

    let children = match found(ex.get_datum(bob.addr(), &entries[0].hash).await.unwrap()) {
        Datum::BigFile(children) => children,
        other => panic!("a.bin is not a big file: {other:?}"),
    };
    assert_eq!(children.len(), 3);

    let mut bytes = Vec::new();
    let mut sizes = Vec::new();
    for child in &children {
        match found(ex.get_datum(bob.addr(), child).await.unwrap()) {
            Datum::Chunk(data) => {
                assert_eq!(crypto::hash(&data), *child);
                sizes.push(data.len());
                bytes.extend_from_slice(&data);
            }
            other => panic!("leaf is not a chunk: {other:?}"),
        }
    }
    assert_eq!(sizes, vec![1024, 1024, 452]);
    assert_eq!(bytes, pattern(2500));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn repeated_download_produces_identical_output() {
    let dir = scratch("repeat");
    let share = dir.join("share");
    std::fs::create_dir_all(share.join("sub")).unwrap();
    std::fs::write(share.join("big.bin"), pattern(40_000)).unwrap();
    std::fs::write(share.join("sub/small.txt"), b"small").unwrap();

    let bob = spawn_peer("bob", Some(&share)).await.unwrap();
    let alice = spawn_peer("alice", None).await.unwrap();
    let root = alice.node.exchange().root(bob.addr()).await.unwrap();

    let engine = DownloadEngine::new(alice.node.remote(bob.addr()), DEFAULT_MAX_DEPTH);
    let first = engine
        .run(&DownloadRequest::by_hash(root, dir.join("one")).with_root_name("bob"))
        .await
        .unwrap();
    let second = engine
        .run(&DownloadRequest::by_hash(root, dir.join("two")).with_root_name("bob"))
        .await
        .unwrap();
    assert!(first.is_complete() && second.is_complete());
    assert_eq!(first.bytes_written, 40_005);
    assert_eq!(second.bytes_written, first.bytes_written);

    for rel in ["bob/big.bin", "bob/sub/small.txt"] {
        let a = std::fs::read(dir.join("one").join(rel)).unwrap();
        let b = std::fs::read(dir.join("two").join(rel)).unwrap();
        assert_eq!(a, b, "{rel} differs between runs");
    }
    assert_eq!(std::fs::read(dir.join("one/bob/big.bin")).unwrap(), pattern(40_000));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn download_by_path_over_the_wire() {
    let dir = scratch("by-path");
    let share = dir.join("share");
    std::fs::create_dir_all(share.join("docs/deep")).unwrap();
    std::fs::write(share.join("docs/deep/target.txt"), b"found me").unwrap();
    std::fs::write(share.join("docs/other.txt"), b"not me").unwrap();

    let bob = spawn_peer("bob", Some(&share)).await.unwrap();
    let alice = spawn_peer("alice", None).await.unwrap();
    let root = alice.node.exchange().root(bob.addr()).await.unwrap();

    let engine = DownloadEngine::new(alice.node.remote(bob.addr()), DEFAULT_MAX_DEPTH);
    let out = dir.join("out");
    let report = engine
        .run(&DownloadRequest::by_path(root, "docs/deep/target.txt", &out))
        .await
        .unwrap();
    assert_eq!(report.files_written, 1);
    assert_eq!(std::fs::read(out.join("target.txt")).unwrap(), b"found me");
    assert!(!out.join("other.txt").exists());

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn listing_reports_every_entry() {
    let dir = scratch("listing");
    let share = dir.join("share");
    std::fs::create_dir_all(share.join("d")).unwrap();
    std::fs::write(share.join("d/x"), b"x").unwrap();
    std::fs::write(share.join("y"), b"y").unwrap();

    let bob = spawn_peer("bob", Some(&share)).await.unwrap();
    let alice = spawn_peer("alice", None).await.unwrap();
    let root = alice.node.exchange().root(bob.addr()).await.unwrap();

    let engine = DownloadEngine::new(alice.node.remote(bob.addr()), DEFAULT_MAX_DEPTH);
    let report = engine
        .run(&DownloadRequest::print(root).with_root_name("bob"))
        .await
        .unwrap();
    let listing: Vec<(&str, _)> = report.listing.iter().map(|(p, h)| (p.as_str(), *h)).collect();
    assert_eq!(listing.len(), 3);
    assert_eq!(listing[0].0, "bob/d");
    assert_eq!(listing[1], ("bob/d/x", crypto::hash(b"x")));
    assert_eq!(listing[2], ("bob/y", crypto::hash(b"y")));
    assert_eq!(report.files_written, 0);

    let _ = std::fs::remove_dir_all(&dir);
}

/// Only the first 16 entries of a directory make it into the tree.
#[tokio::test]
async fn directory_entries_are_capped() {
    let dir = scratch("cap");
    let share = dir.join("share");
    std::fs::create_dir_all(&share).unwrap();
    for i in 0..20 {
        std::fs::write(share.join(format!("f{i:02}")), format!("file {i}")).unwrap();
    }

    let bob = spawn_peer("bob", Some(&share)).await.unwrap();
    let alice = spawn_peer("alice", None).await.unwrap();
    let ex = alice.node.exchange();
    let root = ex.root(bob.addr()).await.unwrap();

    let entries = match found(ex.get_datum(bob.addr(), &root).await.unwrap()) {
        Datum::Directory(entries) => entries,
        other => panic!("root is not a directory: {other:?}"),
    };
    assert_eq!(entries.len(), MAX_DIRECTORY_ENTRIES);
    assert_eq!(entries.last().unwrap().name, "f15");

    let dropped = crypto::hash(b"file 19");
    assert_eq!(ex.get_datum(bob.addr(), &dropped).await.unwrap(), DatumOutcome::Absent);

    let _ = std::fs::remove_dir_all(&dir);
}

/// A peer with nothing shared still answers Root and NoDatum.
#[tokio::test]
async fn empty_peer_answers_with_empty_root() {
    let bob = spawn_peer("bob", None).await.unwrap();
    let raw = RawPeer::bind().await.unwrap();

    raw.send(&Frame::new(1, MessageType::Root, crypto::empty_root().to_vec()), bob.addr())
        .await
        .unwrap();
    let (reply, _) = raw.recv(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply.msg_type, MessageType::RootReply);
    assert_eq!(&reply.body[..], &crypto::empty_root()[..]);

    raw.send(&Frame::new(2, MessageType::GetDatum, reply.body.to_vec()), bob.addr())
        .await
        .unwrap();
    let (reply, _) = raw.recv(Duration::from_secs(2)).await.unwrap();
    assert_eq!(reply.id, 2);
    assert_eq!(reply.msg_type, MessageType::NoDatum);
}

/// An empty directory is named by the hash of its path, which its (empty)
/// listing cannot reproduce. The entry is reported instead of created.
#[tokio::test]
async fn empty_directory_is_reported_not_trusted() {
    let dir = scratch("empty-dir");
    let share = dir.join("share");
    std::fs::create_dir_all(share.join("nothing")).unwrap();
    std::fs::write(share.join("note.txt"), b"kept").unwrap();

    let bob = spawn_peer("bob", Some(&share)).await.unwrap();
    let alice = spawn_peer("alice", None).await.unwrap();
    let root = alice.node.exchange().root(bob.addr()).await.unwrap();

    let engine = DownloadEngine::new(alice.node.remote(bob.addr()), DEFAULT_MAX_DEPTH);
    let out = dir.join("out");
    let report = engine
        .run(&DownloadRequest::by_hash(root, &out).with_root_name("bob"))
        .await
        .unwrap();

    assert_eq!(std::fs::read(out.join("bob/note.txt")).unwrap(), b"kept");
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].remote_path, "bob/nothing");
    assert!(!out.join("bob/nothing").exists());

    let _ = std::fs::remove_dir_all(&dir);
}
