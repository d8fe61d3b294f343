//! The client library: originates chains and waits for them to come back.

use std::{
    collections::HashMap,
    ffi::OsStr,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tarpc::{context::Context, serde_transport::tcp::listen, tokio_serde::formats::Json};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::{
    chain::{EntryPoint, Operation, OperationArgs, RpcChain, StatusCode},
    composer,
    config::{Settings, LIST_SEPARATOR, MAX_FILE_SIZE, UNSUPPORTED_REPLY},
    error::ClientError,
    replica::Snapshot,
    serve_incoming,
    tracelog::VectorLog,
    Node,
};

/// Handle to a running client. Cloning shares the callback listener.
#[derive(Clone, Debug)]
pub struct Client(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    /// Where the frontend calls us back.
    address: String,
    frontend: String,
    settings: Settings,
    tracelog: VectorLog,
    pending: Mutex<HashMap<String, oneshot::Sender<OperationArgs>>>,
}

impl Client {
    /// Listens for callbacks on `listen_addr` and talks to the frontend's
    /// chain address.
    pub async fn bind(listen_addr: &str, frontend: impl Into<String>, settings: Settings) -> io::Result<Self> {
        let listener = listen(listen_addr, Json::default).await?;
        let address = listener.local_addr().to_string();

        let client = Self(Arc::new(Inner {
            tracelog: VectorLog::new(format!("client-{address}")),
            address,
            frontend: frontend.into(),
            settings,
            pending: Mutex::new(HashMap::new()),
        }));

        tokio::spawn(serve_incoming!(listener, Node::serve, client.clone()));
        info!(address = %client.0.address, "client listening");

        Ok(client)
    }

    pub fn address(&self) -> &str {
        &self.0.address
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<OperationArgs>>> {
        self.0.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn store(&self, file_name: &str, content: &str, secret: &str) -> Result<(), ClientError> {
        check_name(file_name)?;
        check_content(content)?;
        self.run(Operation::Store, OperationArgs::new(file_name, content, secret))
            .await
            .map(|_| ())
    }

    /// Empty content means the file is unknown.
    pub async fn retrieve(&self, file_name: &str, secret: &str) -> Result<String, ClientError> {
        check_name(file_name)?;
        let args = self
            .run(Operation::Retrieve, OperationArgs::new(file_name, "", secret))
            .await?;
        Ok(args.content)
    }

    pub async fn list(&self) -> Result<Vec<String>, ClientError> {
        let args = self.run(Operation::List, OperationArgs::default()).await?;
        Ok(args
            .file_name
            .split(LIST_SEPARATOR)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Dispatches an origin chain and waits for it to return.
    #[instrument(skip(self, args), fields(file = %args.file_name))]
    async fn run(&self, op: Operation, args: OperationArgs) -> Result<OperationArgs, ClientError> {
        let mut chain = composer::origin_chain(&self.0.address, &self.0.frontend, op, args);
        let id = chain.id.clone();

        let (tx, mut rx) = oneshot::channel();
        self.pending().insert(id.clone(), tx);
        self.0.tracelog.stamp(&mut chain, &op.origin_entry().to_string());

        let acked = match chain.call_next(self.0.settings.hop_timeout).await {
            Ok(acked) => acked,
            Err(err) => {
                self.pending().remove(&id);
                return Err(err.into());
            }
        };

        // a rejected chain may still have been answered before the rejection
        let returned = if acked {
            tokio::time::timeout(self.0.settings.rpc_deadline, rx)
                .await
                .ok()
                .and_then(Result::ok)
        } else {
            rx.try_recv().ok()
        };

        let Some(args) = returned else {
            self.pending().remove(&id);
            return Err(if acked { ClientError::NoReply(id) } else { ClientError::Disrupted });
        };

        match args.status {
            StatusCode::Success => Ok(args),
            StatusCode::AuthInvalid => Err(ClientError::AuthInvalid),
            StatusCode::Incomplete => Err(ClientError::Disrupted),
        }
    }
}

impl Node for Client {
    #[instrument(skip(self, chain), fields(chain = %chain.id))]
    async fn invoke(self, _: Context, chain: RpcChain) -> bool {
        let Some(entry) = chain.current_hop().map(|hop| hop.entry_point) else {
            return false;
        };
        self.0.tracelog.observe(&chain, &entry.to_string());

        if !matches!(entry, EntryPoint::Store | EntryPoint::Retrieve | EntryPoint::List) {
            warn!("{}: {}", UNSUPPORTED_REPLY, entry);
            return false;
        }

        let Ok(args) = chain.operation().cloned() else {
            return false;
        };
        let Some(waiter) = self.pending().remove(&chain.id) else {
            warn!("no operation waiting for this chain");
            return false;
        };

        debug!(status = ?args.status, "chain returned");
        waiter.send(args).is_ok()
    }

    async fn store_validation(self, _: Context, _file_name: String) -> String {
        UNSUPPORTED_REPLY.to_string()
    }

    async fn update_consistency(self, _: Context, _snapshot: Snapshot) -> String {
        UNSUPPORTED_REPLY.to_string()
    }

    async fn auth_recovery(self, _: Context, _snapshot: Snapshot) -> String {
        UNSUPPORTED_REPLY.to_string()
    }
}

fn check_name(file_name: &str) -> Result<(), ClientError> {
    if file_name.is_empty() {
        return Err(ClientError::EmptyName);
    }
    if Path::new(file_name).file_name() != Some(OsStr::new(file_name)) {
        return Err(ClientError::InvalidName(file_name.to_string()));
    }
    Ok(())
}

fn check_content(content: &str) -> Result<(), ClientError> {
    if content.is_empty() {
        return Err(ClientError::EmptyContent);
    }
    if content.len() > MAX_FILE_SIZE {
        return Err(ClientError::TooLarge {
            size: content.len(),
            limit: MAX_FILE_SIZE,
        });
    }
    Ok(())
}

/// The client's local directory. Files are read from and written to `root`
/// by plain name only.
#[derive(Clone, Debug)]
pub struct LocalFiles {
    root: PathBuf,
}

impl LocalFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads a file that is about to be stored.
    pub fn read(&self, file_name: &str) -> Result<String, ClientError> {
        check_name(file_name)?;
        let path = self.root.join(file_name);

        let size = fs::metadata(&path)?.len() as usize;
        if size > MAX_FILE_SIZE {
            return Err(ClientError::TooLarge {
                size,
                limit: MAX_FILE_SIZE,
            });
        }

        let content = fs::read_to_string(&path)?;
        check_content(&content)?;
        Ok(content)
    }

    pub fn write(&self, file_name: &str, content: &str) -> Result<(), ClientError> {
        check_name(file_name)?;
        fs::create_dir_all(&self.root)?;
        fs::write(self.root.join(file_name), content)?;
        Ok(())
    }

    /// Regular files in `root`, sorted by name.
    pub fn list(&self) -> Result<Vec<String>, ClientError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn names_must_be_plain() {
        assert!(check_name("a.txt").is_ok());
        assert!(matches!(check_name(""), Err(ClientError::EmptyName)));
        assert!(matches!(check_name("../etc/passwd"), Err(ClientError::InvalidName(_))));
        assert!(matches!(check_name("dir/a.txt"), Err(ClientError::InvalidName(_))));
        assert!(matches!(check_name(".."), Err(ClientError::InvalidName(_))));
    }

    #[test]
    fn content_is_bounded() {
        assert!(matches!(check_content(""), Err(ClientError::EmptyContent)));
        let oversized = "x".repeat(MAX_FILE_SIZE + 1);
        assert!(matches!(
            check_content(&oversized),
            Err(ClientError::TooLarge { limit: MAX_FILE_SIZE, .. })
        ));
        assert!(check_content("hi").is_ok());
    }

    #[test]
    fn local_files_round_trip_through_root() {
        let dir = TempDir::new("chainfs-local").unwrap();
        let files = LocalFiles::new(dir.path());

        files.write("b.txt", "second").unwrap();
        files.write("a.txt", "first").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        assert_eq!(files.read("a.txt").unwrap(), "first");
        assert_eq!(files.list().unwrap(), vec!["a.txt", "b.txt"]);
        assert!(matches!(files.read("missing.txt"), Err(ClientError::Io(_))));
    }

    #[test]
    fn empty_local_files_are_refused() {
        let dir = TempDir::new("chainfs-local").unwrap();
        let files = LocalFiles::new(dir.path());
        fs::write(dir.path().join("empty.txt"), "").unwrap();

        assert!(matches!(files.read("empty.txt"), Err(ClientError::EmptyContent)));
    }
}
