use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ssh2::{FileStat, OpenFlags, OpenType, Session};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{ErrorKind, JobError};

const WRITE_BLOCK_SIZE: usize = 32 * 1024;

/// Resolved destination for one transfer: hostname from the job, port
/// and identity from the owner's settings (with process-level
/// fallbacks).
#[derive(Debug, Clone)]
pub struct TransferTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
}

/// Pushes a finished export file to the target over SFTP and returns
/// the final remote path. The upload overwrites any existing remote
/// file, so a rerun converges instead of appending; the byte count is
/// verified after the write. ssh2 is synchronous, so the whole session
/// runs on the blocking pool.
pub async fn push_file(
    local: PathBuf,
    target: TransferTarget,
    remote_dir: String,
    remote_name: String,
    token: CancellationToken,
) -> Result<String, JobError> {
    tokio::task::spawn_blocking(move || {
        push_file_sync(&local, &target, &remote_dir, &remote_name, &token)
    })
    .await
    .map_err(|err| JobError::internal(format!("transfer task failed: {err}")))?
}

fn push_file_sync(
    local: &Path,
    target: &TransferTarget,
    remote_dir: &str,
    remote_name: &str,
    token: &CancellationToken,
) -> Result<String, JobError> {
    let local_size = std::fs::metadata(local)
        .map_err(|err| transfer_error(format!("local export unreadable: {err}")))?
        .len();

    let session = open_session(target)?;
    let sftp = session
        .sftp()
        .map_err(|err| transfer_error(format!("failed starting sftp subsystem: {err}")))?;

    ensure_remote_dir(&sftp, remote_dir)?;
    let remote_path = join_remote(remote_dir, remote_name);

    let mut remote = sftp
        .open_mode(
            Path::new(&remote_path),
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            0o644,
            OpenType::File,
        )
        .map_err(|err| transfer_error(format!("failed creating remote file: {err}")))?;
    let mut local_file = std::fs::File::open(local)
        .map_err(|err| transfer_error(format!("failed opening local export: {err}")))?;

    let mut buf = [0u8; WRITE_BLOCK_SIZE];
    loop {
        if token.is_cancelled() {
            drop(remote);
            let _ = sftp.unlink(Path::new(&remote_path));
            return Err(JobError::canceled());
        }
        let read = local_file
            .read(&mut buf)
            .map_err(|err| transfer_error(format!("failed reading local export: {err}")))?;
        if read == 0 {
            break;
        }
        remote
            .write_all(&buf[..read])
            .map_err(|err| transfer_error(format!("remote write failed: {err}")))?;
    }
    drop(remote);

    let stat = sftp
        .stat(Path::new(&remote_path))
        .map_err(|err| transfer_error(format!("remote verification failed: {err}")))?;
    if stat.size != Some(local_size) {
        return Err(transfer_error(format!(
            "remote size {:?} does not match local size {local_size}",
            stat.size
        )));
    }

    // Match the permissions a plain scp would leave behind.
    let _ = sftp.setstat(
        Path::new(&remote_path),
        FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(0o644),
            atime: None,
            mtime: None,
        },
    );

    debug!(remote_path = %remote_path, bytes = local_size, "transfer verified");
    Ok(remote_path)
}

fn open_session(target: &TransferTarget) -> Result<Session, JobError> {
    let addr = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|err| connect_error(format!("failed resolving {}: {err}", target.host)))?
        .next()
        .ok_or_else(|| connect_error(format!("no address for {}", target.host)))?;

    let tcp = TcpStream::connect_timeout(&addr, target.connect_timeout)
        .map_err(|err| connect_error(format!("failed connecting to {addr}: {err}")))?;
    let _ = tcp.set_read_timeout(Some(Duration::from_secs(60)));
    let _ = tcp.set_write_timeout(Some(Duration::from_secs(60)));

    let mut session = Session::new()
        .map_err(|err| connect_error(format!("failed creating ssh session: {err}")))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|err| connect_error(format!("ssh handshake failed: {err}")))?;

    match &target.auth {
        SshAuth::Password(password) => session
            .userauth_password(&target.username, password)
            .map_err(|err| auth_error(format!("password auth failed: {err}")))?,
        SshAuth::PrivateKey { key, passphrase } => session
            .userauth_pubkey_memory(&target.username, None, key, passphrase.as_deref())
            .map_err(|err| auth_error(format!("key auth failed: {err}")))?,
    }
    if !session.authenticated() {
        return Err(auth_error(format!(
            "authentication rejected for user {}",
            target.username
        )));
    }

    Ok(session)
}

/// Creates the remote directory chain best-effort; a directory that
/// still does not exist afterwards (no permission) is fatal.
fn ensure_remote_dir(sftp: &ssh2::Sftp, remote_dir: &str) -> Result<(), JobError> {
    if remote_dir.is_empty() {
        return Ok(());
    }
    for prefix in dir_prefixes(remote_dir) {
        if sftp.stat(Path::new(&prefix)).is_err() {
            let _ = sftp.mkdir(Path::new(&prefix), 0o755);
        }
    }
    sftp.stat(Path::new(remote_dir))
        .map_err(|err| transfer_error(format!("remote directory {remote_dir} unavailable: {err}")))?;
    Ok(())
}

fn dir_prefixes(remote_dir: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = if remote_dir.starts_with('/') {
        "/".to_string()
    } else {
        String::new()
    };
    for segment in remote_dir.split('/').filter(|s| !s.is_empty()) {
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(segment);
        prefixes.push(current.clone());
    }
    prefixes
}

fn join_remote(remote_dir: &str, name: &str) -> String {
    let dir = remote_dir.trim_end_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

fn connect_error(detail: String) -> JobError {
    JobError::new(ErrorKind::SshConnect, detail)
}

fn auth_error(detail: String) -> JobError {
    JobError::new(ErrorKind::SshAuth, detail)
}

fn transfer_error(detail: String) -> JobError {
    JobError::new(ErrorKind::SshTransfer, detail)
}

#[cfg(test)]
mod tests {
    use super::{dir_prefixes, join_remote};

    #[test]
    fn remote_path_joins_cleanly() {
        assert_eq!(join_remote("/srv/exports/", "out.csv"), "/srv/exports/out.csv");
        assert_eq!(join_remote("", "out.csv"), "out.csv");
        assert_eq!(join_remote("exports", "out.csv"), "exports/out.csv");
    }

    #[test]
    fn dir_prefixes_walk_the_chain() {
        assert_eq!(
            dir_prefixes("/srv/exports/alice"),
            vec!["/srv", "/srv/exports", "/srv/exports/alice"]
        );
        assert_eq!(dir_prefixes("exports/daily"), vec!["exports", "exports/daily"]);
    }
}
