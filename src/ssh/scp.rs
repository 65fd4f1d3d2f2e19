//! File upload by driving a remote `scp` sink over a session channel.
//!
//! The remote side runs `scp -t` (sink mode); we play the source role and
//! write one `C` record per file: header line, raw bytes, NUL.

use std::path::{Path, PathBuf};

use russh::client::Handle;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{FleetError, Result};
use crate::ssh::client::ClientHandler;
use crate::ssh::exec::{drain_output, open_session};

/// Remote command that receives the stream; the destination dir is appended.
pub const SCP_SINK_COMMAND: &str = "/usr/bin/scp -qtr";

/// A local file opened for upload.
#[derive(Debug)]
pub struct SourceFile {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    file: File,
}

/// Open every source up front so a missing file fails before any session work.
pub async fn open_sources(paths: &[PathBuf]) -> Result<Vec<SourceFile>> {
    let mut sources = Vec::with_capacity(paths.len());

    for path in paths {
        sources.push(open_source(path).await?);
    }

    Ok(sources)
}

async fn open_source(path: &Path) -> Result<SourceFile> {
    let file = File::open(path)
        .await
        .map_err(|e| FleetError::Copy(format!("open {}: {}", path.display(), e)))?;

    let metadata = file
        .metadata()
        .await
        .map_err(|e| FleetError::Copy(format!("stat {}: {}", path.display(), e)))?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| FleetError::Copy(format!("{} has no file name", path.display())))?;

    Ok(SourceFile {
        name,
        size: metadata.len(),
        mode: permission_bits(&metadata),
        file,
    })
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

/// SCP `C` record header, e.g. `C0644 12 notes.txt\n`.
pub fn file_header(mode: u32, size: u64, name: &str) -> String {
    format!("C0{:03o} {} {}\n", mode & 0o777, size, name)
}

/// Write every file as a sink record, then shut the writer down (EOF).
pub async fn write_sink_stream<W>(mut writer: W, sources: Vec<SourceFile>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for source in sources {
        writer
            .write_all(file_header(source.mode, source.size, &source.name).as_bytes())
            .await?;

        let mut body = source.file.take(source.size);
        let sent = tokio::io::copy(&mut body, &mut writer).await?;
        if sent != source.size {
            tracing::warn!(
                "{} shrank while uploading ({} of {} bytes)",
                source.name,
                sent,
                source.size
            );
        }

        writer.write_all(&[0]).await?;
    }

    writer.shutdown().await
}

/// Upload `paths` into `dest_dir` on the remote host.
///
/// The writer runs as its own task while this side drains the sink's output,
/// so neither end can stall the other. Writer failures are only logged; the
/// result reflects the remote `scp` exit.
pub async fn copy_files(
    session: &Handle<ClientHandler>,
    paths: &[PathBuf],
    dest_dir: &str,
) -> Result<()> {
    let sources = open_sources(paths).await?;

    let mut channel = open_session(session).await?;

    let command = format!("{} {}", SCP_SINK_COMMAND, dest_dir);
    if let Err(e) = channel.exec(true, command.as_bytes()).await {
        let _ = channel.close().await;
        return Err(FleetError::Copy(format!("Failed to start scp sink: {}", e)));
    }

    let stdin = Box::pin(channel.make_writer());
    let target = dest_dir.to_string();
    let writer = tokio::spawn(async move {
        if let Err(e) = write_sink_stream(stdin, sources).await {
            tracing::warn!("Failed writing scp stream to {}: {}", target, e);
        }
    });

    let output = drain_output(&mut channel).await;

    // The sink is gone; a writer still blocked on the window can never finish.
    if !writer.is_finished() {
        writer.abort();
    }
    let _ = channel.close().await;

    match output.error {
        None => Ok(()),
        Some(error) => {
            let message = sink_message(&output.output);
            if message.is_empty() {
                Err(FleetError::Copy(error))
            } else {
                Err(FleetError::Copy(format!("{}: {}", error, message)))
            }
        }
    }
}

/// Sink output with the protocol's ack/warning/fatal bytes removed.
fn sink_message(output: &str) -> String {
    output
        .chars()
        .filter(|c| !matches!(c, '\0' | '\x01' | '\x02'))
        .collect::<String>()
        .trim()
        .to_string()
}
