//! Transfer engine: sharded encrypted upload and retrieval
//!
//! Upload holds at most `concurrency` shards in memory. Shards are submitted
//! in index order to a `FuturesOrdered`, so locators come back in shard order
//! no matter which upload finishes first. The first failure stops new
//! submissions, in-flight uploads are drained, and the locator of every
//! submitted shard is deleted before the error is returned, acknowledged or
//! not.

use futures::stream::{FuturesOrdered, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use shardrop_chunks::{hash_to_hex, ContentHasher, ShardPlan, ShardReader};
use shardrop_core::config::ShardropConfig;
use shardrop_core::{Locator, RetrievalCode, ShardropError, ShardropResult, TransferPhase};
use shardrop_crypto::{
    decrypt_shard, derive_shard_key, encrypt_shard, generate_salt, hash_access_secret,
    salt_to_hex, verify_access_secret, AccessParams, KdfParams, ShardAad, ShardKey,
    FILE_ID_SIZE, SALT_SIZE,
};
use shardrop_storage::{BlobStore, ShardTransport};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, error, info, warn};

use crate::manifest::{now_secs, FileManifest, MANIFEST_VERSION};
use crate::store::ManifestStore;

/// Buffer to reserve for an in-memory download. `original_size` comes from
/// the manifest store, so the reservation stops at one window of shards and
/// the buffer grows past that as data is verified.
fn initial_capacity(original_size: u64, settings: &TransferSettings) -> usize {
    let window = settings
        .shard_size
        .saturating_mul(settings.concurrency.max(1) as u64);
    usize::try_from(original_size.min(window)).unwrap_or(0)
}

/// Progress callback type (done, total, message)
pub type ProgressFn = Box<dyn Fn(u64, u64, &str) + Send + Sync>;

/// Per-deployment transfer parameters
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Plaintext bytes per shard
    pub shard_size: u64,
    /// Shards in flight per transfer
    pub concurrency: usize,
    pub min_password_len: usize,
    /// Lifetime of a committed manifest
    pub ttl: Duration,
    /// PBKDF2 parameters for new uploads
    pub kdf: KdfParams,
    /// Argon2id parameters for new access secrets
    pub access: AccessParams,
    /// Retrieval-code rolls before giving up
    pub code_attempts: u32,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from_config(&ShardropConfig::default())
    }
}

impl TransferSettings {
    pub fn from_config(cfg: &ShardropConfig) -> Self {
        Self {
            shard_size: cfg.transfer.shard_size,
            concurrency: cfg.effective_concurrency(),
            min_password_len: cfg.transfer.min_password_len,
            ttl: Duration::from_secs(cfg.transfer.ttl_secs),
            kdf: KdfParams {
                iterations: cfg.crypto.pbkdf2_iterations,
            },
            access: AccessParams {
                mem_cost_kib: cfg.crypto.argon2_mem_cost_kib,
                time_cost: cfg.crypto.argon2_time_cost,
                parallelism: cfg.crypto.argon2_parallelism,
            },
            code_attempts: cfg.transfer.code_attempts,
        }
    }
}

/// Metadata for an upload whose bytes come from a reader
#[derive(Debug, Clone)]
pub struct UploadSource {
    /// Exact number of bytes the reader will yield
    pub size: u64,
    pub original_name: String,
    pub mime_type: String,
}

/// Result of a committed upload
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub code: RetrievalCode,
    pub shards: u64,
    pub bytes: u64,
    pub content_hash: String,
    pub expires_at: u64,
}

/// File metadata restored on retrieval
#[derive(Debug, Clone)]
pub struct RetrievedMeta {
    pub original_name: String,
    /// `original_name` reduced to a safe local base name
    pub safe_name: String,
    pub mime_type: String,
    pub bytes: u64,
    pub shards: u64,
}

/// A fully decrypted and verified file held in memory
#[derive(Debug, Clone)]
pub struct RetrievedFile {
    pub meta: RetrievedMeta,
    pub data: Vec<u8>,
}

/// Tracks the per-transfer state machine and mirrors it to the progress callback.
struct PhaseTracker<'a> {
    phase: TransferPhase,
    progress: Option<&'a ProgressFn>,
}

impl<'a> PhaseTracker<'a> {
    fn new(progress: Option<&'a ProgressFn>) -> Self {
        Self {
            phase: TransferPhase::Idle,
            progress,
        }
    }

    fn advance(&mut self, next: TransferPhase, done: u64, total: u64) {
        if !self.phase.can_advance_to(&next) {
            warn!(from = %self.phase, to = %next, "unexpected transfer phase transition");
        }
        debug!(from = %self.phase, to = %next, "transfer phase");
        self.phase = next;
        self.report(done, total);
    }

    fn report(&self, done: u64, total: u64) {
        if let Some(cb) = self.progress {
            cb(done, total, &self.phase.to_string());
        }
    }

    fn fail(&mut self, err: &ShardropError) {
        if !self.phase.is_terminal() {
            self.advance(TransferPhase::Failed(err.to_string()), 0, 0);
        }
    }
}

fn crypto_task_failed(e: tokio::task::JoinError) -> ShardropError {
    ShardropError::Other(anyhow::anyhow!("crypto task failed: {e}"))
}

/// Derive on the blocking pool; PBKDF2 at 100k rounds is tens of milliseconds.
async fn derive_key_blocking(
    password: &SecretString,
    salt: [u8; SALT_SIZE],
    kdf: KdfParams,
) -> ShardropResult<ShardKey> {
    let password = SecretString::from(password.expose_secret().to_owned());
    tokio::task::spawn_blocking(move || derive_shard_key(&password, &salt, &kdf))
        .await
        .map_err(crypto_task_failed)?
        .map_err(|e| ShardropError::Other(anyhow::anyhow!("key derivation: {e}")))
}

/// Uploads and retrieves sharded encrypted files.
pub struct TransferEngine<S, M> {
    transport: ShardTransport<S>,
    store: M,
    settings: TransferSettings,
}

impl<S: BlobStore, M: ManifestStore> TransferEngine<S, M> {
    pub fn new(transport: ShardTransport<S>, store: M, settings: TransferSettings) -> Self {
        Self {
            transport,
            store,
            settings,
        }
    }

    pub fn transport(&self) -> &ShardTransport<S> {
        &self.transport
    }

    pub fn store(&self) -> &M {
        &self.store
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Upload a local file. The MIME type is guessed from the extension
    /// unless `mime_type` is given; the stored name defaults to the file name.
    pub async fn upload_file(
        &self,
        path: &Path,
        name: Option<&str>,
        mime_type: Option<&str>,
        password: &SecretString,
        progress: Option<&ProgressFn>,
    ) -> ShardropResult<UploadReceipt> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| ShardropError::Validation(format!("{}: {e}", path.display())))?;
        if !meta.is_file() {
            return Err(ShardropError::Validation(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let original_name = match name {
            Some(n) => n.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "file".to_string()),
        };
        let mime_type = match mime_type {
            Some(m) => m.to_string(),
            None => mime_guess::from_path(path)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        };

        let file = tokio::fs::File::open(path).await?;
        let source = UploadSource {
            size: meta.len(),
            original_name,
            mime_type,
        };
        self.upload(BufReader::new(file), source, password, progress)
            .await
    }

    /// Shard, encrypt and store `source.size` bytes from `reader`, then commit
    /// a manifest. Returns the retrieval code.
    pub async fn upload<R>(
        &self,
        reader: R,
        source: UploadSource,
        password: &SecretString,
        progress: Option<&ProgressFn>,
    ) -> ShardropResult<UploadReceipt>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut phase = PhaseTracker::new(progress);
        match self.run_upload(reader, source, password, &mut phase).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                phase.fail(&e);
                Err(e)
            }
        }
    }

    fn check_password(&self, password: &SecretString) -> ShardropResult<()> {
        let len = password.expose_secret().chars().count();
        if len == 0 {
            return Err(ShardropError::Validation("a password is required".into()));
        }
        if len < self.settings.min_password_len {
            return Err(ShardropError::Validation(format!(
                "password must be at least {} characters",
                self.settings.min_password_len
            )));
        }
        Ok(())
    }

    async fn run_upload<R>(
        &self,
        reader: R,
        source: UploadSource,
        password: &SecretString,
        phase: &mut PhaseTracker<'_>,
    ) -> ShardropResult<UploadReceipt>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.check_password(password)?;
        if source.size == 0 {
            return Err(ShardropError::Validation("file is empty".into()));
        }
        let plan = ShardPlan::new(source.size, self.settings.shard_size).ok_or_else(|| {
            ShardropError::Validation(format!("invalid shard size {}", self.settings.shard_size))
        })?;
        let count = plan.count();

        phase.advance(TransferPhase::Deriving, 0, count);
        let salt = generate_salt();
        let file_id: [u8; FILE_ID_SIZE] = uuid::Uuid::new_v4().into_bytes();
        let file_id_hex = hex::encode(file_id);
        let key = derive_key_blocking(password, salt, self.settings.kdf).await?;

        info!(
            file_id = %file_id_hex,
            bytes = source.size,
            shards = count,
            "upload started"
        );

        let (stored, submitted, failure, hasher) = self
            .store_shards(reader, plan, &key, file_id, &file_id_hex, phase)
            .await;
        drop(key);

        if let Some(e) = failure {
            // a failed put may still have landed, so every submitted index is cleaned
            let attempted: Vec<Locator> = (0..submitted)
                .map(|index| self.transport.locator_for(&file_id_hex, index))
                .collect();
            self.compensate(&attempted, &e).await;
            return Err(e);
        }

        phase.advance(TransferPhase::Finalizing, count, count);
        let content_hash = hash_to_hex(&hasher.finalize());

        let access_secret = {
            let password = SecretString::from(password.expose_secret().to_owned());
            let params = self.settings.access.clone();
            tokio::task::spawn_blocking(move || hash_access_secret(&password, &params))
                .await
                .map_err(crypto_task_failed)
                .and_then(|r| {
                    r.map_err(|e| ShardropError::Other(anyhow::anyhow!("access secret: {e}")))
                })
        };
        let access_secret = match access_secret {
            Ok(s) => s,
            Err(e) => {
                self.compensate(&stored, &e).await;
                return Err(e);
            }
        };

        let created_at = now_secs();
        let mut manifest = FileManifest {
            version: MANIFEST_VERSION,
            retrieval_code: RetrievalCode::generate(),
            access_secret,
            key_salt: salt_to_hex(&salt),
            kdf: self.settings.kdf,
            file_id: file_id_hex,
            shard_size: self.settings.shard_size,
            original_size: source.size,
            content_hash,
            shard_locators: stored,
            original_name: source.original_name,
            mime_type: source.mime_type,
            created_at,
            expires_at: created_at.saturating_add(self.settings.ttl.as_secs()),
        };

        if let Err(e) = self.commit(&mut manifest).await {
            self.compensate(&manifest.shard_locators, &e).await;
            return Err(e);
        }

        phase.advance(TransferPhase::Done, count, count);
        info!(
            code = %manifest.retrieval_code,
            shards = count,
            bytes = manifest.original_size,
            "upload committed"
        );

        Ok(UploadReceipt {
            code: manifest.retrieval_code,
            shards: count,
            bytes: manifest.original_size,
            content_hash: manifest.content_hash,
            expires_at: manifest.expires_at,
        })
    }

    /// Returns every locator storage acknowledged (in shard order), how many
    /// shards were submitted, the first failure if any, and the content hash
    /// state. Reading the next shard and polling in-flight uploads happen
    /// together, so a slow source does not stall uploads.
    async fn store_shards<R>(
        &self,
        reader: R,
        plan: ShardPlan,
        key: &ShardKey,
        file_id: [u8; FILE_ID_SIZE],
        file_id_hex: &str,
        phase: &mut PhaseTracker<'_>,
    ) -> (Vec<Locator>, u64, Option<ShardropError>, ContentHasher)
    where
        R: AsyncRead + Unpin + Send,
    {
        let count = plan.count();
        let limit = self.settings.concurrency.max(1);
        // the unfold stream owns the pending read, so losing a select race
        // never drops a half-read shard
        let shards = futures::stream::unfold(ShardReader::new(reader, plan), |mut r| async move {
            match r.next_shard().await {
                Ok(Some(shard)) => Some((Ok(shard), r)),
                Ok(None) => None,
                Err(e) => Some((Err(e), r)),
            }
        });
        tokio::pin!(shards);

        let mut hasher = ContentHasher::new();
        let mut in_flight = FuturesOrdered::new();
        let mut stored = Vec::with_capacity(count as usize);
        let mut submitted = 0u64;
        let mut failure: Option<ShardropError> = None;
        let mut exhausted = false;

        loop {
            let can_read = !exhausted && failure.is_none() && in_flight.len() < limit;
            if !can_read && in_flight.is_empty() {
                break;
            }

            tokio::select! {
                next = shards.next(), if can_read => match next {
                    Some(Ok((index, plain))) => {
                        hasher.update(&plain);
                        submitted = index + 1;
                        phase.advance(
                            TransferPhase::UploadingShards {
                                index,
                                total: count,
                            },
                            stored.len() as u64,
                            count,
                        );
                        in_flight.push_back(self.store_shard(
                            key,
                            ShardAad::new(file_id, index, count),
                            file_id_hex,
                            plain,
                        ));
                    }
                    Some(Err(e)) => failure = Some(ShardropError::Io(e)),
                    None => exhausted = true,
                },
                done = in_flight.next(), if !in_flight.is_empty() => match done {
                    Some(Ok(locator)) => {
                        stored.push(locator);
                        phase.report(stored.len() as u64, count);
                    }
                    Some(Err(e)) => {
                        if failure.is_none() {
                            warn!(shard = ?e.shard(), error = %e, "shard failed, aborting upload");
                            failure = Some(e);
                        }
                    }
                    None => {}
                },
            }
        }

        (stored, submitted, failure, hasher)
    }

    async fn store_shard(
        &self,
        key: &ShardKey,
        aad: ShardAad,
        file_id_hex: &str,
        plain: Vec<u8>,
    ) -> ShardropResult<Locator> {
        let wire = encrypt_shard(key, aad, &plain).map_err(|e| {
            ShardropError::Other(anyhow::anyhow!("encrypting shard {}: {e}", aad.index))
        })?;
        drop(plain);
        self.transport.upload(file_id_hex, aad.index, wire).await
    }

    /// Allocate a free retrieval code and insert the manifest under it.
    async fn commit(&self, manifest: &mut FileManifest) -> ShardropResult<()> {
        let attempts = self.settings.code_attempts.max(1);
        for attempt in 1..=attempts {
            if self.store.insert_if_absent(manifest).await? {
                return Ok(());
            }
            debug!(attempt, code = %manifest.retrieval_code, "retrieval code taken, re-rolling");
            manifest.retrieval_code = RetrievalCode::generate();
        }
        Err(ShardropError::Persistence(format!(
            "no free retrieval code after {attempts} attempts"
        )))
    }

    /// Best-effort delete of shards written by an aborted upload. Missing
    /// objects count as deleted.
    async fn compensate(&self, stored: &[Locator], reason: &ShardropError) {
        if stored.is_empty() {
            return;
        }
        warn!(shards = stored.len(), error = %reason, "upload aborted, deleting shards");

        let orphans = self.transport.delete_all(stored).await;
        if !orphans.is_empty() {
            let list = orphans
                .iter()
                .map(Locator::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            error!(
                orphans = orphans.len(),
                locators = %list,
                "orphaned shards left in storage, delete manually"
            );
        }
    }

    /// Look up, authorize and derive. Performs no shard I/O.
    async fn open(
        &self,
        code: &str,
        password: &SecretString,
    ) -> ShardropResult<(FileManifest, ShardKey)> {
        let code = RetrievalCode::parse(code).ok_or_else(|| {
            ShardropError::Validation("retrieval code must be 6 digits".into())
        })?;
        if password.expose_secret().is_empty() {
            return Err(ShardropError::Validation("a password is required".into()));
        }

        let manifest = match self.store.find_by_code(&code).await? {
            Some(m) if !m.is_expired(now_secs()) => m,
            _ => {
                debug!(code = %code, "no live manifest");
                return Err(ShardropError::NotFound);
            }
        };
        manifest.validate()?;

        let digest = manifest.access_secret.clone();
        let candidate = SecretString::from(password.expose_secret().to_owned());
        let verified = tokio::task::spawn_blocking(move || verify_access_secret(&candidate, &digest))
            .await
            .map_err(crypto_task_failed)?
            .map_err(|e| {
                ShardropError::Persistence(format!("manifest {code} has an unreadable access secret: {e}"))
            })?;
        if !verified {
            info!(code = %code, "access denied");
            return Err(ShardropError::Auth);
        }

        let key = derive_key_blocking(password, manifest.salt_bytes()?, manifest.kdf).await?;
        Ok((manifest, key))
    }

    /// Fetch, decrypt and write every shard in manifest order, then verify
    /// the whole-file hash and length.
    async fn stream_shards<W>(
        &self,
        manifest: &FileManifest,
        key: &ShardKey,
        out: &mut W,
        progress: Option<&ProgressFn>,
    ) -> ShardropResult<RetrievedMeta>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let file_id = manifest.file_id_bytes()?;
        let count = manifest.shard_count();
        let limit = self.settings.concurrency.max(1);
        let mut pending = FuturesOrdered::new();
        let mut locators = manifest.shard_locators.iter().enumerate();
        let mut hasher = ContentHasher::new();
        let mut done = 0u64;

        loop {
            while pending.len() < limit {
                let Some((index, locator)) = locators.next() else {
                    break;
                };
                let aad = ShardAad::new(file_id, index as u64, count);
                pending.push_back(self.load_shard(key, aad, locator));
            }

            match pending.next().await {
                Some(Ok(plain)) => {
                    hasher.update(&plain);
                    out.write_all(&plain).await?;
                    done += 1;
                    if let Some(cb) = progress {
                        cb(done, count, &format!("shard {done}/{count}"));
                    }
                }
                Some(Err(e)) => {
                    warn!(code = %manifest.retrieval_code, shard = ?e.shard(), error = %e, "retrieval aborted");
                    return Err(e);
                }
                None => break,
            }
        }
        out.flush().await?;

        if hasher.len() != manifest.original_size
            || hash_to_hex(&hasher.finalize()) != manifest.content_hash
        {
            warn!(code = %manifest.retrieval_code, "reassembled file does not match content hash");
            return Err(ShardropError::integrity(None));
        }

        info!(
            code = %manifest.retrieval_code,
            shards = count,
            bytes = manifest.original_size,
            "retrieved"
        );

        Ok(RetrievedMeta {
            original_name: manifest.original_name.clone(),
            safe_name: manifest.safe_file_name(),
            mime_type: manifest.mime_type.clone(),
            bytes: manifest.original_size,
            shards: count,
        })
    }

    async fn load_shard(
        &self,
        key: &ShardKey,
        aad: ShardAad,
        locator: &Locator,
    ) -> ShardropResult<Vec<u8>> {
        let wire = self.transport.fetch(locator, aad.index).await?;
        decrypt_shard(key, aad, &wire).map_err(|e| {
            debug!(shard = aad.index, error = %e, "shard failed authentication");
            ShardropError::integrity(Some(aad.index))
        })
    }

    /// Retrieve a file into memory. Nothing is returned unless every shard
    /// decrypted and the content hash matched.
    pub async fn retrieve_bytes(
        &self,
        code: &str,
        password: &SecretString,
        progress: Option<&ProgressFn>,
    ) -> ShardropResult<RetrievedFile> {
        let (manifest, key) = self.open(code, password).await?;
        let mut data = Vec::with_capacity(initial_capacity(
            manifest.original_size,
            &self.settings,
        ));
        let meta = self
            .stream_shards(&manifest, &key, &mut data, progress)
            .await?;
        Ok(RetrievedFile { meta, data })
    }

    /// Retrieve a file to `dest`. Bytes go to a hidden sibling temp file that
    /// is renamed into place only after verification, and removed on failure.
    pub async fn retrieve_to_path(
        &self,
        code: &str,
        password: &SecretString,
        dest: &Path,
        progress: Option<&ProgressFn>,
    ) -> ShardropResult<RetrievedMeta> {
        let (manifest, key) = self.open(code, password).await?;
        self.write_verified(&manifest, &key, dest, progress).await
    }

    /// Retrieve a file into `dir` under its sanitized original name.
    /// Returns the path written.
    pub async fn retrieve_to_dir(
        &self,
        code: &str,
        password: &SecretString,
        dir: &Path,
        progress: Option<&ProgressFn>,
    ) -> ShardropResult<(PathBuf, RetrievedMeta)> {
        let (manifest, key) = self.open(code, password).await?;
        let dest = dir.join(manifest.safe_file_name());
        let meta = self.write_verified(&manifest, &key, &dest, progress).await?;
        Ok((dest, meta))
    }

    async fn write_verified(
        &self,
        manifest: &FileManifest,
        key: &ShardKey,
        dest: &Path,
        progress: Option<&ProgressFn>,
    ) -> ShardropResult<RetrievedMeta> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = temp_sibling(dest);
        let file = tokio::fs::File::create(&tmp).await?;
        let mut writer = BufWriter::new(file);

        let result = match self
            .stream_shards(manifest, key, &mut writer, progress)
            .await
        {
            Ok(meta) => finish_download(writer, &tmp, dest).await.map(|()| meta),
            Err(e) => {
                drop(writer);
                Err(e)
            }
        };

        if result.is_err() {
            if let Err(rm) = tokio::fs::remove_file(&tmp).await {
                warn!(path = %tmp.display(), error = %rm, "could not remove partial download");
            }
        }
        result
    }
}

async fn finish_download(
    writer: BufWriter<tokio::fs::File>,
    tmp: &Path,
    dest: &Path,
) -> ShardropResult<()> {
    let file = writer.into_inner();
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(tmp, dest).await?;
    Ok(())
}

fn temp_sibling(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    dest.with_file_name(format!(".{name}.shardrop-part"))
}
