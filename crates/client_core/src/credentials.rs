use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::Credential;
use tokio::sync::RwLock;

/// The single cookie key the credential lives under. Reads and writes use
/// the same key so a stored credential is always found again on restart.
pub const CREDENTIAL_COOKIE_KEY: &str = "authtoken";

/// One year, matching the session lifetime granted by the server.
const CREDENTIAL_COOKIE_MAX_AGE_SECS: u64 = 31_536_000;

/// Extracts the credential from a cookie header line, if present.
///
/// Entries are split on `;`, each entry on its first `=`. Values are
/// percent-decoded. Malformed entries (no `=`, bad percent-encoding, empty
/// value) are skipped rather than treated as errors. When the key appears
/// more than once the last occurrence wins.
pub fn parse_credential(cookie_line: &str) -> Option<Credential> {
    let mut found = None;
    for entry in cookie_line.split(';') {
        let entry = entry.trim();
        let Some((key, value)) = entry.split_once('=') else {
            continue;
        };
        if key != CREDENTIAL_COOKIE_KEY {
            continue;
        }
        match urlencoding::decode(value) {
            Ok(decoded) if !decoded.is_empty() => {
                found = Some(Credential::new(decoded.into_owned()));
            }
            _ => continue,
        }
    }
    found
}

/// Renders the credential as a cookie line that [`parse_credential`] will
/// read back under the same key.
pub fn serialize_credential(credential: &Credential) -> String {
    format!(
        "{CREDENTIAL_COOKIE_KEY}={}; Max-Age={CREDENTIAL_COOKIE_MAX_AGE_SECS}; Path=/; SameSite=Lax; Secure",
        urlencoding::encode(credential.as_str())
    )
}

/// Single source of truth for the current credential. Every transport reads
/// it at send time instead of capturing the value at construction, so a
/// rotation is visible to the next request without rebuilding anything.
///
/// Writes are crate-private: only the session bootstrap rotates credentials.
#[derive(Default)]
pub struct CredentialStore {
    current: RwLock<Option<Credential>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Option<Credential> {
        self.current.read().await.clone()
    }

    pub async fn is_present(&self) -> bool {
        self.current.read().await.is_some()
    }

    pub(crate) async fn install(&self, credential: Credential) {
        *self.current.write().await = Some(credential);
    }

    pub(crate) async fn clear(&self) {
        *self.current.write().await = None;
    }
}

/// Where the serialized cookie line is persisted between runs. The store
/// above holds the live value; a sink only sees confirmed credentials.
#[async_trait]
pub trait CredentialSink: Send + Sync {
    async fn load(&self) -> Result<Option<String>>;
    async fn store(&self, cookie_line: &str) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// Persists the cookie line to a file on disk.
pub struct FileCredentialSink {
    path: PathBuf,
}

impl FileCredentialSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialSink for FileCredentialSink {
    async fn load(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(contents.trim().to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context("read credential file"),
        }
    }

    async fn store(&self, cookie_line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("create credential directory")?;
            }
        }
        tokio::fs::write(&self.path, cookie_line)
            .await
            .context("write credential file")
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context("remove credential file"),
        }
    }
}

/// Keeps the cookie line in memory only. Used by contexts that must not
/// persist credentials, and by tests.
#[derive(Default)]
pub struct MemoryCredentialSink {
    line: RwLock<Option<String>>,
}

impl MemoryCredentialSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialSink for MemoryCredentialSink {
    async fn load(&self) -> Result<Option<String>> {
        Ok(self.line.read().await.clone())
    }

    async fn store(&self, cookie_line: &str) -> Result<()> {
        *self.line.write().await = Some(cookie_line.to_string());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.line.write().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_the_credential_among_other_cookies() {
        let line = "theme=dark; authtoken=abc123; locale=en";
        let credential = parse_credential(line).expect("credential");
        assert_eq!(credential.as_str(), "abc123");
    }

    #[test]
    fn percent_decodes_the_value() {
        let line = "authtoken=ey%2Fabc%3D%3D";
        let credential = parse_credential(line).expect("credential");
        assert_eq!(credential.as_str(), "ey/abc==");

        let line = "authtoken=abc%20def; other=1";
        let credential = parse_credential(line).expect("credential");
        assert_eq!(credential.as_str(), "abc def");
    }

    #[test]
    fn keeps_everything_after_the_first_equals() {
        let line = "authtoken=header.payload=sig";
        let credential = parse_credential(line).expect("credential");
        assert_eq!(credential.as_str(), "header.payload=sig");
    }

    #[test]
    fn skips_malformed_entries_without_failing() {
        let line = "garbage; =; authtoken=%ZZ; authtoken=good";
        let credential = parse_credential(line).expect("credential");
        assert_eq!(credential.as_str(), "good");
    }

    #[test]
    fn last_occurrence_wins() {
        let line = "authtoken=old; authtoken=new";
        let credential = parse_credential(line).expect("credential");
        assert_eq!(credential.as_str(), "new");
    }

    #[test]
    fn empty_or_absent_values_yield_none() {
        assert!(parse_credential("").is_none());
        assert!(parse_credential("authtoken=").is_none());
        assert!(parse_credential("theme=dark; locale=en").is_none());
        assert!(parse_credential("authtoken").is_none());
    }

    #[test]
    fn stored_credentials_are_found_again() {
        let credential = Credential::new("ey/with=padding==");
        let line = serialize_credential(&credential);
        assert!(line.starts_with("authtoken="));
        assert_eq!(parse_credential(&line).expect("round trip"), credential);
    }

    #[tokio::test]
    async fn store_rotation_is_visible_to_readers() {
        let store = CredentialStore::new();
        assert!(store.current().await.is_none());

        store.install(Credential::new("first")).await;
        assert_eq!(store.current().await.expect("installed").as_str(), "first");

        store.install(Credential::new("second")).await;
        assert_eq!(store.current().await.expect("rotated").as_str(), "second");

        store.clear().await;
        assert!(!store.is_present().await);
    }

    #[tokio::test]
    async fn file_sink_round_trips_and_clears() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = FileCredentialSink::new(dir.path().join("nested").join("cookie"));

        assert!(sink.load().await.expect("load missing").is_none());

        sink.store("authtoken=abc; Path=/").await.expect("store");
        let line = sink.load().await.expect("load").expect("present");
        assert_eq!(line, "authtoken=abc; Path=/");

        sink.clear().await.expect("clear");
        assert!(sink.load().await.expect("load cleared").is_none());
        sink.clear().await.expect("clear again is fine");
    }
}
