//! Local IPC endpoint naming and helpers.
//!
//! Windows endpoints are named pipes under `\\?\pipe\`; everywhere else they
//! are Unix domain sockets on the filesystem.

use crate::stream::{StreamChannel, StreamChannelHost};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether_types::TetherResult;
use uuid::Uuid;

/// Build an IPC endpoint path from `segments`, or a fresh unique path when
/// `segments` is empty.
///
/// On POSIX systems the parent directory of a segment-based path is created.
pub fn generate_path(segments: &[String]) -> std::io::Result<PathBuf> {
    let parts: Vec<&str> = segments
        .iter()
        .map(|s| s.trim_matches(|c| c == '/' || c == '\\'))
        .filter(|s| !s.is_empty())
        .collect();

    if cfg!(windows) {
        let name = if parts.is_empty() {
            format!("tether\\{}", Uuid::new_v4())
        } else {
            parts.join("\\")
        };
        return Ok(PathBuf::from(format!(r"\\?\pipe\{name}")));
    }

    if parts.is_empty() {
        return Ok(std::env::temp_dir().join(format!("tether-{}.sock", Uuid::new_v4())));
    }
    let path = PathBuf::from(format!("/{}", parts.join("/")));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(path)
}

/// Listen on a new IPC endpoint.
pub fn host(segments: &[String]) -> TetherResult<Arc<StreamChannelHost>> {
    let path = generate_path(segments)?;
    host_at(&path)
}

/// Listen on an explicit IPC endpoint.
#[cfg(unix)]
pub fn host_at(path: &Path) -> TetherResult<Arc<StreamChannelHost>> {
    StreamChannelHost::bind_unix(path)
}

/// Listen on an explicit IPC endpoint.
#[cfg(not(unix))]
pub fn host_at(path: &Path) -> TetherResult<Arc<StreamChannelHost>> {
    Err(tether_types::TetherError::Unsupported(format!(
        "IPC host at {} (named pipes)",
        path.display()
    )))
}

/// Connect to an IPC endpoint.
#[cfg(unix)]
pub async fn connect(path: &Path) -> TetherResult<Arc<StreamChannel>> {
    StreamChannel::connect_unix(path).await
}

/// Connect to an IPC endpoint.
#[cfg(not(unix))]
pub async fn connect(path: &Path) -> TetherResult<Arc<StreamChannel>> {
    Err(tether_types::TetherError::Unsupported(format!(
        "IPC connect to {} (named pipes)",
        path.display()
    )))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::channel::ChannelHostProxy;

    #[test]
    fn test_generated_paths_are_unique() {
        let a = generate_path(&[]).unwrap();
        let b = generate_path(&[]).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(std::env::temp_dir()));
    }

    #[test]
    fn test_segment_path_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let mut segments: Vec<String> = dir
            .path()
            .components()
            .filter_map(|c| c.as_os_str().to_str().map(String::from))
            .collect();
        segments.push("nested".to_string());
        segments.push("host.sock".to_string());

        let path = generate_path(&segments).unwrap();
        assert_eq!(path, dir.path().join("nested").join("host.sock"));
        assert!(dir.path().join("nested").is_dir());
    }

    #[tokio::test]
    async fn test_host_and_connect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        let host = host_at(&path).unwrap();
        let info = host.connection_info();
        assert_eq!(info.init_function, "ipc.connect");
        assert_eq!(info.first_param_str(), Some(path.display().to_string().as_str()));
        let client = connect(&path).await.unwrap();
        assert!(client.label().starts_with("unix:"));
    }
}
