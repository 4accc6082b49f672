//! Named-pipe prompt delivery
//!
//! The FIFO lives in a private temp dir that is removed when the
//! [`PromptPipe`] drops, so it must outlive the child.

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use relay_foundation::{Error, Result};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;

/// Replaced in agent args with the FIFO path
pub const PROMPT_PATH_PLACEHOLDER: &str = "{prompt_path}";

const OPEN_RETRY: Duration = Duration::from_millis(10);

pub struct PromptPipe {
    _dir: TempDir,
    path: PathBuf,
}

impl PromptPipe {
    /// Create `prompt.fifo` (mode 0600) in a fresh temp dir
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("relay-prompt-")
            .tempdir()
            .map_err(|e| Error::Subprocess(format!("failed to create prompt dir: {}", e)))?;
        let path = dir.path().join("prompt.fifo");
        mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| Error::Subprocess(format!("mkfifo {}: {}", path.display(), e)))?;
        Ok(Self { _dir: dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open both ends for a child that reads the prompt on stdin.
    ///
    /// Returns the blocking read end for the child and our write end.
    pub fn open_for_stdin(&self) -> Result<(OwnedFd, pipe::Sender)> {
        let receiver = pipe::OpenOptions::new()
            .open_receiver(&self.path)
            .map_err(|e| Error::Subprocess(format!("open prompt fifo for reading: {}", e)))?;
        let sender = pipe::OpenOptions::new()
            .open_sender(&self.path)
            .map_err(|e| Error::Subprocess(format!("open prompt fifo for writing: {}", e)))?;
        let fd = receiver
            .into_blocking_fd()
            .map_err(|e| Error::Subprocess(format!("prompt fifo fd: {}", e)))?;
        Ok((fd, sender))
    }

    /// Wait for the child to open the path, then return the write end
    pub async fn open_sender_when_ready(&self) -> Result<pipe::Sender> {
        loop {
            match pipe::OpenOptions::new().open_sender(&self.path) {
                Ok(sender) => return Ok(sender),
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                    tokio::time::sleep(OPEN_RETRY).await;
                }
                Err(e) => {
                    return Err(Error::Subprocess(format!(
                        "open prompt fifo for writing: {}",
                        e
                    )))
                }
            }
        }
    }
}

/// Write the whole prompt and close the write end (EOF for the reader)
pub async fn write_prompt(mut sender: pipe::Sender, prompt: &[u8]) -> Result<()> {
    sender
        .write_all(prompt)
        .await
        .map_err(|e| Error::Subprocess(format!("write prompt to fifo: {}", e)))?;
    sender
        .flush()
        .await
        .map_err(|e| Error::Subprocess(format!("flush prompt fifo: {}", e)))?;
    drop(sender);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_fifo_created_and_removed() {
        let pipe = PromptPipe::create().unwrap();
        let path = pipe.path().to_path_buf();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());
        drop(pipe);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_roundtrip_through_stdin_ends() {
        let pipe = PromptPipe::create().unwrap();
        let (fd, sender) = pipe.open_for_stdin().unwrap();
        let prompt = "p".repeat(200 * 1024);

        let writer = tokio::spawn({
            let prompt = prompt.clone();
            async move { write_prompt(sender, prompt.as_bytes()).await }
        });

        let mut reader = tokio::fs::File::from_std(std::fs::File::from(fd));
        let mut read = String::new();
        reader.read_to_string(&mut read).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(read.len(), prompt.len());
    }
}
