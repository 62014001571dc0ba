//! SSH/SFTP destination.
//!
//! ssh2 is blocking, so every operation opens its own session inside
//! `spawn_blocking`. Writes land in a hidden partial file that is renamed
//! into place once complete.

use super::keys::validate_key;
use super::{
    delete_in_batches, paginate, BackendKind, DeleteFailure, DeleteReport, DownloadOptions,
    ListOptions, ListPage, ObjectEntry, SignedOperation, StorageBackend, StorageError, SyncParams,
    UploadOptions, UploadReceipt,
};
use crate::transfer::{ProgressCallback, ProgressReporter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ssh2::{ErrorCode, Session, Sftp};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUFFER_SIZE: usize = 128 * 1024;
const PARTIAL_PREFIX: &str = ".partial-";
const DELETE_BATCH: usize = 1000;

// libssh2 session codes for rejected credentials.
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
// SFTP status codes.
const SFTP_NO_SUCH_FILE: i32 = 2;
const SFTP_PERMISSION_DENIED: i32 = 3;
const SFTP_NO_SUCH_PATH: i32 = 10;

pub struct SyncBackend {
    params: SyncParams,
}

impl SyncBackend {
    pub fn new(params: SyncParams) -> Self {
        Self { params }
    }

    /// Run `f` against a fresh SFTP channel on the blocking pool.
    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp, &Remote) -> Result<T, StorageError> + Send + 'static,
    {
        let params = self.params.clone();
        tokio::task::spawn_blocking(move || {
            let session = connect(&params)?;
            let sftp = session
                .sftp()
                .map_err(|e| map_ssh_error("sftp subsystem", e))?;
            let remote = Remote {
                base: params.base_path.trim_end_matches('/').to_string(),
            };
            f(&sftp, &remote)
        })
        .await
        .map_err(|e| StorageError::Backend(format!("{op} task failed: {e}")))?
    }
}

/// Key-to-path mapping under the configured base directory.
struct Remote {
    base: String,
}

impl Remote {
    fn path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(PathBuf::from(format!("{}/{}", self.base, key)))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let s = path.to_string_lossy();
        s.strip_prefix(&self.base)
            .map(|rest| rest.trim_start_matches('/').to_string())
    }
}

fn connect(params: &SyncParams) -> Result<Session, StorageError> {
    let endpoint = format!("{}:{}", params.host, params.port);
    let timeout = Duration::from_secs(params.connect_timeout_secs.max(1));

    let addr = endpoint
        .to_socket_addrs()
        .map_err(|e| StorageError::Connection(format!("resolve {endpoint}: {e}")))?
        .next()
        .ok_or_else(|| StorageError::Connection(format!("no address for {endpoint}")))?;
    let tcp = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| StorageError::Connection(format!("connect {endpoint}: {e}")))?;

    let mut session = Session::new().map_err(|e| map_ssh_error("session", e))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis() as u32);
    session
        .handshake()
        .map_err(|e| StorageError::Connection(format!("handshake with {endpoint}: {e}")))?;

    let auth = match (&params.private_key_path, &params.password) {
        (Some(key), _) => session.userauth_pubkey_file(
            &params.username,
            None,
            key,
            params.private_key_passphrase.as_deref(),
        ),
        (None, Some(password)) => session.userauth_password(&params.username, password),
        (None, None) => {
            return Err(StorageError::Validation(
                "sync backend requires a password or a private key".into(),
            ))
        }
    };
    auth.map_err(|e| StorageError::Auth(format!("SSH authentication failed: {e}")))?;

    if !session.authenticated() {
        return Err(StorageError::Auth("SSH authentication failed".into()));
    }
    Ok(session)
}

fn map_ssh_error(context: &str, err: ssh2::Error) -> StorageError {
    match err.code() {
        ErrorCode::SFTP(SFTP_NO_SUCH_FILE) | ErrorCode::SFTP(SFTP_NO_SUCH_PATH) => {
            StorageError::NotFound(context.to_string())
        }
        ErrorCode::SFTP(SFTP_PERMISSION_DENIED) => {
            StorageError::Auth(format!("{context}: permission denied"))
        }
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)
        | ErrorCode::Session(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED) => {
            StorageError::Auth(format!("{context}: {}", err.message()))
        }
        ErrorCode::Session(_) => StorageError::Connection(format!("{context}: {}", err.message())),
        ErrorCode::SFTP(code) => {
            StorageError::Backend(format!("{context}: sftp status {code}: {}", err.message()))
        }
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{PARTIAL_PREFIX}{:08x}-{name}", rand::random::<u32>()))
}

/// Remote file operations used by the write path.
trait RemoteFiles {
    fn create_file(&self, path: &Path) -> Result<Box<dyn Write + '_>, ssh2::Error>;
    fn rename_file(&self, from: &Path, to: &Path) -> Result<(), ssh2::Error>;
    fn remove_file(&self, path: &Path) -> Result<(), ssh2::Error>;
    fn is_present(&self, path: &Path) -> bool;
    fn make_dir(&self, path: &Path) -> Result<(), ssh2::Error>;
}

impl RemoteFiles for Sftp {
    fn create_file(&self, path: &Path) -> Result<Box<dyn Write + '_>, ssh2::Error> {
        Ok(Box::new(self.create(path)?))
    }

    fn rename_file(&self, from: &Path, to: &Path) -> Result<(), ssh2::Error> {
        self.rename(from, to, None)
    }

    fn remove_file(&self, path: &Path) -> Result<(), ssh2::Error> {
        self.unlink(path)
    }

    fn is_present(&self, path: &Path) -> bool {
        self.stat(path).is_ok()
    }

    fn make_dir(&self, path: &Path) -> Result<(), ssh2::Error> {
        self.mkdir(path, 0o755)
    }
}

fn mkdir_p(fs: &dyn RemoteFiles, dir: &Path) -> Result<(), StorageError> {
    let mut current = PathBuf::new();
    for component in dir.components() {
        current.push(component);
        if fs.is_present(&current) {
            continue;
        }
        if let Err(e) = fs.make_dir(&current) {
            // Another writer may have created it in between.
            if !fs.is_present(&current) {
                return Err(map_ssh_error(&current.display().to_string(), e));
            }
        }
    }
    Ok(())
}

/// Stream `reader` into a remote partial file, then rename it over `target`.
/// On failure the partial file is removed and `target` is left as it was.
fn write_remote(
    fs: &dyn RemoteFiles,
    target: &Path,
    key: &str,
    reader: &mut dyn Read,
    limit: Option<u64>,
    progress: Option<ProgressCallback>,
) -> Result<u64, StorageError> {
    if let Some(parent) = target.parent() {
        mkdir_p(fs, parent)?;
    }
    let partial = partial_path(target);
    let result = (|| {
        let mut file = fs.create_file(&partial).map_err(|e| map_ssh_error(key, e))?;
        let written = pump(reader, &mut *file, limit, progress, |e| {
            StorageError::from_remote_io(key, e)
        })?;
        drop(file);
        let _ = fs.remove_file(target);
        fs.rename_file(&partial, target)
            .map_err(|e| map_ssh_error(key, e))?;
        Ok(written)
    })();
    if result.is_err() {
        let _ = fs.remove_file(&partial);
    }
    result
}

/// Copy up to `limit` bytes from `reader` to `writer`.
fn pump(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    limit: Option<u64>,
    progress: Option<ProgressCallback>,
    map_err: impl Fn(std::io::Error) -> StorageError,
) -> Result<u64, StorageError> {
    let mut reporter = ProgressReporter::new(progress);
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut remaining = limit.unwrap_or(u64::MAX);
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).map_err(&map_err)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).map_err(&map_err)?;
        remaining -= n as u64;
        reporter.advance(n as u64);
    }
    writer.flush().map_err(&map_err)?;
    Ok(reporter.finish())
}

fn walk(
    sftp: &Sftp,
    remote: &Remote,
    dir: &Path,
    prefix: &str,
    out: &mut Vec<ObjectEntry>,
) -> Result<(), StorageError> {
    let listing = match sftp.readdir(dir) {
        Ok(listing) => listing,
        Err(e) => {
            return match map_ssh_error(&dir.display().to_string(), e) {
                StorageError::NotFound(_) => Ok(()),
                other => Err(other),
            }
        }
    };
    for (path, stat) in listing {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name == "." || name == ".." || name.starts_with(PARTIAL_PREFIX) {
            continue;
        }
        if stat.is_dir() {
            walk(sftp, remote, &path, prefix, out)?;
            continue;
        }
        let Some(key) = remote.key_for(&path) else {
            continue;
        };
        if key.starts_with(prefix) {
            out.push(ObjectEntry {
                key,
                size: stat.size.unwrap_or(0),
                last_modified: stat
                    .mtime
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t as i64, 0)),
            });
        }
    }
    Ok(())
}

/// Deepest directory that contains every key starting with `prefix`.
fn listing_root(remote: &Remote, prefix: &str) -> PathBuf {
    match prefix.rfind('/') {
        Some(idx) => PathBuf::from(format!("{}/{}", remote.base, &prefix[..idx])),
        None => PathBuf::from(&remote.base),
    }
}

#[async_trait]
impl StorageBackend for SyncBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sync
    }

    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        options: &UploadOptions,
    ) -> Result<UploadReceipt, StorageError> {
        let local = local_path.to_path_buf();
        let key = key.to_string();
        let progress = options.progress.clone();
        let (key, written) = self
            .run("upload", move |sftp, remote| {
                let target = remote.path(&key)?;
                let mut file =
                    std::fs::File::open(&local).map_err(|e| StorageError::local(&local, e))?;
                let written = write_remote(sftp, &target, &key, &mut file, None, progress)?;
                Ok((key, written))
            })
            .await?;

        tracing::debug!(key = %key, bytes = written, "Stored object over SFTP");
        Ok(UploadReceipt {
            key,
            size: written,
            etag: None,
            parts: 1,
        })
    }

    async fn download(
        &self,
        key: &str,
        local_path: &Path,
        options: &DownloadOptions,
    ) -> Result<u64, StorageError> {
        let local = local_path.to_path_buf();
        let key = key.to_string();
        let range = options.range;
        let progress = options.progress.clone();
        self.run("download", move |sftp, remote| {
            let source = remote.path(&key)?;
            let mut file = sftp.open(&source).map_err(|e| map_ssh_error(&key, e))?;
            let limit = match range {
                Some(r) => {
                    let size = sftp
                        .stat(&source)
                        .map_err(|e| map_ssh_error(&key, e))?
                        .size
                        .unwrap_or(0);
                    file.seek(SeekFrom::Start(r.start))
                        .map_err(|e| StorageError::from_remote_io(&key, e))?;
                    Some(r.length_within(size))
                }
                None => None,
            };

            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::local(parent, e))?;
            }
            let partial = partial_path(&local);
            let result = (|| {
                let mut out = std::fs::File::create(&partial)
                    .map_err(|e| StorageError::local(&partial, e))?;
                let n = pump(&mut file, &mut out, limit, progress, |e| {
                    StorageError::from_remote_io(&key, e)
                })?;
                std::fs::rename(&partial, &local).map_err(|e| StorageError::local(&local, e))?;
                Ok(n)
            })();
            if result.is_err() {
                let _ = std::fs::remove_file(&partial);
            }
            result
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let key = key.to_string();
        self.run("exists", move |sftp, remote| {
            let path = remote.path(&key)?;
            match sftp.stat(&path) {
                Ok(stat) => Ok(stat.is_file()),
                Err(e) => match map_ssh_error(&key, e) {
                    StorageError::NotFound(_) => Ok(false),
                    other => Err(other),
                },
            }
        })
        .await
    }

    async fn list(&self, prefix: &str, options: &ListOptions) -> Result<ListPage, StorageError> {
        let prefix = prefix.to_string();
        let entries = self
            .run("list", move |sftp, remote| {
                let mut entries = Vec::new();
                let root = listing_root(remote, &prefix);
                walk(sftp, remote, &root, &prefix, &mut entries)?;
                Ok(entries)
            })
            .await?;
        Ok(paginate(entries, options))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let key = key.to_string();
        self.run("delete", move |sftp, remote| {
            let path = remote.path(&key)?;
            match sftp.unlink(&path) {
                Ok(()) => Ok(()),
                Err(e) => match map_ssh_error(&key, e) {
                    StorageError::NotFound(_) => Ok(()),
                    other => Err(other),
                },
            }
        })
        .await
    }

    async fn delete_many(&self, keys: &[String]) -> Result<DeleteReport, StorageError> {
        delete_in_batches(keys, DELETE_BATCH, |batch| {
            self.run("delete_many", move |sftp, remote| {
                let mut report = DeleteReport::default();
                for key in batch {
                    let outcome = remote.path(&key).and_then(|path| {
                        sftp.unlink(&path).or_else(|e| match map_ssh_error(&key, e) {
                            StorageError::NotFound(_) => Ok(()),
                            other => Err(other),
                        })
                    });
                    match outcome {
                        Ok(()) => report.deleted.push(key),
                        Err(e) if e.is_auth() || e.is_retryable() => return Err(e),
                        Err(e) => report.failed.push(DeleteFailure {
                            key,
                            message: e.to_string(),
                        }),
                    }
                }
                Ok(report)
            })
        })
        .await
    }

    async fn copy(&self, src_key: &str, dst_key: &str) -> Result<(), StorageError> {
        let src_key = src_key.to_string();
        let dst_key = dst_key.to_string();
        self.run("copy", move |sftp, remote| {
            let source = remote.path(&src_key)?;
            let target = remote.path(&dst_key)?;
            let mut input = sftp.open(&source).map_err(|e| map_ssh_error(&src_key, e))?;
            write_remote(sftp, &target, &dst_key, &mut input, None, None)?;
            Ok(())
        })
        .await
    }

    async fn move_object(&self, src_key: &str, dst_key: &str) -> Result<(), StorageError> {
        let src_key = src_key.to_string();
        let dst_key = dst_key.to_string();
        self.run("move", move |sftp, remote| {
            let source = remote.path(&src_key)?;
            let target = remote.path(&dst_key)?;
            sftp.stat(&source).map_err(|e| map_ssh_error(&src_key, e))?;
            if let Some(parent) = target.parent() {
                mkdir_p(sftp, parent)?;
            }
            let _ = sftp.unlink(&target);
            sftp.rename(&source, &target, None)
                .map_err(|e| map_ssh_error(&src_key, e))
        })
        .await
    }

    async fn signed_url(
        &self,
        _operation: SignedOperation,
        _key: &str,
        _ttl: Duration,
    ) -> Result<String, StorageError> {
        Err(StorageError::Unsupported {
            backend: "sync",
            operation: "signed_url",
        })
    }

    async fn test_connection(&self) -> Result<bool, StorageError> {
        self.run("test_connection", |sftp, remote| {
            let base = PathBuf::from(&remote.base);
            match sftp.stat(&base) {
                Ok(stat) => Ok(stat.is_dir()),
                Err(_) => {
                    mkdir_p(sftp, &base)?;
                    Ok(true)
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{BTreeMap, BTreeSet};

    fn remote() -> Remote {
        Remote {
            base: "/srv/backups".into(),
        }
    }

    #[test]
    fn test_remote_paths() {
        let r = remote();
        assert_eq!(
            r.path("p/objects/ab/abcd").unwrap(),
            PathBuf::from("/srv/backups/p/objects/ab/abcd")
        );
        assert!(r.path("../../etc/shadow").is_err());
        assert_eq!(
            r.key_for(Path::new("/srv/backups/p/objects/ab/abcd")).as_deref(),
            Some("p/objects/ab/abcd")
        );
    }

    #[test]
    fn test_listing_root() {
        let r = remote();
        assert_eq!(
            listing_root(&r, "p/manifests/db/"),
            PathBuf::from("/srv/backups/p/manifests/db")
        );
        assert_eq!(listing_root(&r, "p/objects/a"), PathBuf::from("/srv/backups/p/objects"));
        assert_eq!(listing_root(&r, ""), PathBuf::from("/srv/backups"));
    }

    #[test]
    fn test_pump_respects_limit_and_reports() {
        use std::sync::{Arc, Mutex};
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut input: &[u8] = b"abcdefghij";
        let mut out = Vec::new();
        let n = pump(
            &mut input,
            &mut out,
            Some(4),
            Some(Arc::new(move |n| sink.lock().unwrap().push(n))),
            |e| StorageError::from_remote_io("k", e),
        )
        .unwrap();
        assert_eq!(n, 4);
        assert_eq!(out, b"abcd");
        assert_eq!(seen.lock().unwrap().last().copied(), Some(4));
    }

    /// In-memory remote tree. Writers fail once `fail_after` bytes went in.
    #[derive(Default)]
    struct MemoryFiles {
        files: RefCell<BTreeMap<PathBuf, Vec<u8>>>,
        dirs: RefCell<BTreeSet<PathBuf>>,
        fail_after: Option<usize>,
    }

    struct MemoryWriter<'a> {
        files: &'a RefCell<BTreeMap<PathBuf, Vec<u8>>>,
        path: PathBuf,
        fail_after: Option<usize>,
    }

    impl Write for MemoryWriter<'_> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut files = self.files.borrow_mut();
            let data = files.entry(self.path.clone()).or_default();
            if self.fail_after.is_some_and(|limit| data.len() + buf.len() > limit) {
                return Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
            }
            data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn no_such_file() -> ssh2::Error {
        ssh2::Error::new(ErrorCode::SFTP(SFTP_NO_SUCH_FILE), "no such file")
    }

    impl RemoteFiles for MemoryFiles {
        fn create_file(&self, path: &Path) -> Result<Box<dyn Write + '_>, ssh2::Error> {
            self.files.borrow_mut().insert(path.to_path_buf(), Vec::new());
            Ok(Box::new(MemoryWriter {
                files: &self.files,
                path: path.to_path_buf(),
                fail_after: self.fail_after,
            }))
        }

        fn rename_file(&self, from: &Path, to: &Path) -> Result<(), ssh2::Error> {
            let mut files = self.files.borrow_mut();
            let data = files.remove(from).ok_or_else(no_such_file)?;
            files.insert(to.to_path_buf(), data);
            Ok(())
        }

        fn remove_file(&self, path: &Path) -> Result<(), ssh2::Error> {
            self.files.borrow_mut().remove(path).map(|_| ()).ok_or_else(no_such_file)
        }

        fn is_present(&self, path: &Path) -> bool {
            self.files.borrow().contains_key(path) || self.dirs.borrow().contains(path)
        }

        fn make_dir(&self, path: &Path) -> Result<(), ssh2::Error> {
            self.dirs.borrow_mut().insert(path.to_path_buf());
            Ok(())
        }
    }

    #[test]
    fn test_write_remote_renames_into_place() {
        let fs = MemoryFiles::default();
        let target = PathBuf::from("/srv/backups/p/objects/ab/abcd");
        let mut input: &[u8] = b"object body";

        let written = write_remote(&fs, &target, "p/objects/ab/abcd", &mut input, None, None).unwrap();
        assert_eq!(written, 11);
        let files = fs.files.borrow();
        assert_eq!(files.keys().collect::<Vec<_>>(), vec![&target]);
        assert_eq!(files[&target], b"object body");
        assert!(fs.dirs.borrow().contains(Path::new("/srv/backups/p/objects/ab")));
    }

    #[test]
    fn test_failed_write_leaves_no_partial_and_keeps_target() {
        let fs = MemoryFiles {
            fail_after: Some(4),
            ..Default::default()
        };
        let target = PathBuf::from("/srv/backups/p/objects/ab/abcd");
        fs.files.borrow_mut().insert(target.clone(), b"previous".to_vec());
        let mut input: &[u8] = b"a body longer than four bytes";

        let err = write_remote(&fs, &target, "p/objects/ab/abcd", &mut input, None, None).unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err:?}");
        let files = fs.files.borrow();
        assert_eq!(files.len(), 1);
        assert_eq!(files[&target], b"previous");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connection_error() {
        let backend = SyncBackend::new(SyncParams {
            host: "127.0.0.1".into(),
            port: 1,
            username: "backup".into(),
            password: Some("secret".into()),
            private_key_path: None,
            private_key_passphrase: None,
            base_path: "/srv/backups".into(),
            connect_timeout_secs: 2,
        });
        let err = backend.exists("a").await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err:?}");
    }
}
