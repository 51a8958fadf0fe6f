//! Unit tests for directory transfer

use super::*;
use crate::client::ControlPlaneClient;
use crate::server::{ControlPlaneServer, TunnelService, WorkspaceTunnel};
use crate::workspace::WorkspaceSource;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::duplex;
use tokio_util::sync::CancellationToken;

async fn connect<S: TunnelService>(service: S) -> ControlPlaneClient {
    let (client_reader, server_writer) = duplex(64 * 1024);
    let (server_reader, client_writer) = duplex(64 * 1024);

    let server = Arc::new(ControlPlaneServer::new(service));
    tokio::spawn(async move {
        let _ = server
            .serve(server_reader, server_writer, CancellationToken::new())
            .await;
    });

    let client = ControlPlaneClient::new(client_reader, client_writer);
    client.ping().await.unwrap();
    client
}

/// Relative path to contents for every regular file under `root`
fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    fn walk(root: &Path, dir: &Path, files: &mut BTreeMap<PathBuf, Vec<u8>>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            let file_type = std::fs::symlink_metadata(&path).unwrap().file_type();
            if file_type.is_dir() {
                walk(root, &path, files);
            } else if file_type.is_file() {
                let relative = path.strip_prefix(root).unwrap().to_path_buf();
                files.insert(relative, std::fs::read(&path).unwrap());
            }
        }
    }

    let mut files = BTreeMap::new();
    walk(root, root, &mut files);
    files
}

fn write(root: &Path, relative: &str, contents: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[tokio::test]
async fn test_directory_round_trip() {
    let source = tempfile::tempdir().unwrap();
    write(source.path(), "README.md", b"# workspace\n");
    write(source.path(), "src/main.rs", b"fn main() {}\n");
    write(source.path(), ".devcontainer/devcontainer.json", b"{\"image\":\"ubuntu\"}");
    write(source.path(), ".env", b"KEY=value\n");
    let large: Vec<u8> = (0..200 * 1024).map(|i| (i % 251) as u8).collect();
    write(source.path(), "assets/blob.bin", &large);
    std::fs::create_dir_all(source.path().join("empty")).unwrap();

    let client = connect(WorkspaceTunnel::new().with_source(WorkspaceSource::local_folder(source.path()))).await;

    let target = tempfile::tempdir().unwrap();
    let destination = target.path().join("workspace");
    let reader = client.stream_workspace().await.unwrap();
    receive_directory(reader, &destination, TransferStage::ReadWorkspace)
        .await
        .unwrap();

    assert_eq!(snapshot(&destination), snapshot(source.path()));
    assert!(destination.join("empty").is_dir());
}

#[tokio::test]
async fn test_ignore_file_excludes_entries() {
    let source = tempfile::tempdir().unwrap();
    write(source.path(), IGNORE_FILE, b"node_modules/\n*.log\n");
    write(source.path(), "node_modules/left-pad/index.js", b"module.exports = 1;\n");
    write(source.path(), "debug.log", b"noise\n");
    write(source.path(), "src/app.js", b"console.log('hi');\n");
    write(source.path(), "src/trace.log", b"more noise\n");

    let client = connect(WorkspaceTunnel::new().with_source(WorkspaceSource::local_folder(source.path()))).await;

    let target = tempfile::tempdir().unwrap();
    let reader = client.stream_workspace().await.unwrap();
    receive_directory(reader, target.path(), TransferStage::ReadWorkspace)
        .await
        .unwrap();

    let files: Vec<PathBuf> = snapshot(target.path()).into_keys().collect();
    assert_eq!(
        files,
        vec![PathBuf::from(IGNORE_FILE), PathBuf::from("src/app.js")]
    );
}

#[tokio::test]
async fn test_missing_folder_is_a_read_failure() {
    let parent = tempfile::tempdir().unwrap();
    let missing = parent.path().join("gone");
    let client = connect(WorkspaceTunnel::new().with_source(WorkspaceSource::local_folder(&missing))).await;

    let target = tempfile::tempdir().unwrap();
    let reader = client.stream_workspace().await.unwrap();
    let error = receive_directory(reader, target.path(), TransferStage::ReadWorkspace)
        .await
        .unwrap_err();

    assert_eq!(error.to_string(), "read workspace");
    let message = std::error::Error::source(&error).unwrap().to_string();
    assert!(message.starts_with("read workspace"), "{}", message);
}

/// Streams bytes that are not an archive
struct Garbage;

#[async_trait]
impl TunnelService for Garbage {
    async fn stream_workspace(&self, sink: &mut ChunkSink<'_>) -> anyhow::Result<()> {
        sink.send(Bytes::from(vec![b'x'; 2048])).await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_corrupt_archive_is_an_extract_failure() {
    let client = connect(Garbage).await;

    let target = tempfile::tempdir().unwrap();
    let reader = client.stream_workspace().await.unwrap();
    let error = receive_directory(reader, target.path(), TransferStage::ReadWorkspace)
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        TunnelError::Transfer {
            stage: TransferStage::Extract,
            ..
        }
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_modes_and_symlinks_survive() {
    use std::os::unix::fs::{symlink, PermissionsExt};

    let source = tempfile::tempdir().unwrap();
    write(source.path(), "bin/run.sh", b"#!/bin/sh\necho hi\n");
    std::fs::set_permissions(
        source.path().join("bin/run.sh"),
        std::fs::Permissions::from_mode(0o755),
    )
    .unwrap();
    symlink("bin/run.sh", source.path().join("run")).unwrap();

    let client = connect(WorkspaceTunnel::new().with_source(WorkspaceSource::local_folder(source.path()))).await;

    let target = tempfile::tempdir().unwrap();
    let reader = client.stream_workspace().await.unwrap();
    receive_directory(reader, target.path(), TransferStage::ReadWorkspace)
        .await
        .unwrap();

    let mode = std::fs::metadata(target.path().join("bin/run.sh"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o755);

    let link = target.path().join("run");
    assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    assert_eq!(std::fs::read_link(&link).unwrap(), PathBuf::from("bin/run.sh"));
}

#[test]
fn test_chunk_writer_caps_chunk_size() {
    let (chunks, mut pending) = mpsc::channel(4);
    let mut writer = ChunkWriter { chunks };

    let data = vec![7u8; CHUNK_SIZE * 2 + 10];
    let written = writer.write(&data).unwrap();
    assert_eq!(written, CHUNK_SIZE);
    assert_eq!(writer.write(&[]).unwrap(), 0);

    drop(writer);
    let first = pending.blocking_recv().unwrap();
    assert_eq!(first.len(), CHUNK_SIZE);
    assert!(pending.blocking_recv().is_none());
}
