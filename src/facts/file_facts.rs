//! Destination file facts: content hash and metadata

use super::is_missing_file;
use crate::connection::HostSession;
use crate::error::FactError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileFacts {
    pub exists: bool,
    /// Lowercase hex SHA-256 of the content
    pub sha256: Option<String>,
    /// Octal mode as printed by `stat -c %a`
    pub mode: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
}

/// Parse `stat -c %a:%U:%G` output
pub(crate) fn parse_stat(output: &str) -> Result<(String, String, String), FactError> {
    let mut parts = output.trim().splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(mode), Some(owner), Some(group)) if !mode.is_empty() => {
            Ok((mode.to_string(), owner.to_string(), group.to_string()))
        }
        _ => Err(FactError::Parse {
            fact: "stat".to_string(),
            message: format!("unexpected output '{}'", output.trim()),
        }),
    }
}

pub(super) async fn gather(session: &HostSession, path: &str) -> Result<FileFacts, FactError> {
    let hash = session.probe("checksum", &["sha256sum", "--", path]).await?;
    if is_missing_file(&hash) {
        return Ok(FileFacts::default());
    }
    if !hash.success() {
        return Err(FactError::Unexpected {
            command: format!("sha256sum -- {path}"),
            status: hash.status,
            stderr: hash.stderr.trim().to_string(),
        });
    }
    let sha256 = hash
        .stdout
        .split_whitespace()
        .next()
        .map(str::to_lowercase)
        .ok_or_else(|| FactError::Parse {
            fact: "checksum".to_string(),
            message: "empty sha256sum output".to_string(),
        })?;

    let stat = session
        .probe_ok("file metadata", &["stat", "-c", "%a:%U:%G", "--", path])
        .await?;
    let (mode, owner, group) = parse_stat(&stat.stdout)?;

    Ok(FileFacts {
        exists: true,
        sha256: Some(sha256),
        mode: Some(mode),
        owner: Some(owner),
        group: Some(group),
    })
}
