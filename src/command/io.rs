//! Background copy tasks behind stream redirection.
//!
//! Each redirection claims a stream slot on the command and runs one of
//! these loops; the task handle joins the command's I/O set so completion
//! implies the copy finished. Source/sink I/O failures surface through
//! `wait()`; writes into an exited child do not (the stdin writer swallows
//! them).

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::pipe::CHUNK_SIZE;
use crate::stdio::{InputWriter, OutputReader};

pub(super) async fn feed_from_reader<R>(mut source: R, mut stdin: InputWriter) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match source.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                stdin.close();
                return Err(Error::io(&e));
            }
        };
        stdin.write(&chunk[..n]).await?;
    }
    stdin.close();
    Ok(())
}

pub(super) async fn feed_from_bytes(data: Vec<u8>, mut stdin: InputWriter) -> Result<()> {
    stdin.write(&data).await?;
    stdin.close();
    Ok(())
}

pub(super) async fn feed_from_file(path: PathBuf, stdin: InputWriter) -> Result<()> {
    let file = tokio::fs::File::open(&path).await.map_err(|e| Error::io(&e))?;
    feed_from_reader(file, stdin).await
}

pub(super) async fn feed_from_lines(lines: Vec<String>, mut stdin: InputWriter) -> Result<()> {
    for line in lines {
        stdin.write_line(&line).await?;
    }
    stdin.close();
    Ok(())
}

pub(super) async fn copy_to_writer<W>(mut source: OutputReader, mut sink: W) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let n = source.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        sink.write_all(&chunk[..n]).await.map_err(|e| Error::io(&e))?;
    }
    sink.flush().await.map_err(|e| Error::io(&e))?;
    Ok(())
}

pub(super) async fn copy_to_file(source: OutputReader, path: PathBuf) -> Result<()> {
    let file = tokio::fs::File::create(&path).await.map_err(|e| Error::io(&e))?;
    copy_to_writer(source, file).await
}

pub(super) async fn collect_lines(
    mut source: OutputReader,
    sink: Arc<Mutex<Vec<String>>>,
) -> Result<()> {
    while let Some(line) = source.next_line().await? {
        match sink.lock() {
            Ok(mut lines) => lines.push(line),
            Err(poisoned) => poisoned.into_inner().push(line),
        }
    }
    Ok(())
}

pub(super) async fn collect_bytes(
    mut source: OutputReader,
    sink: Arc<Mutex<Vec<u8>>>,
) -> Result<()> {
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let n = source.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        match sink.lock() {
            Ok(mut bytes) => bytes.extend_from_slice(&chunk[..n]),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(&chunk[..n]),
        }
    }
    Ok(())
}
