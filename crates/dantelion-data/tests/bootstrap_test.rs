//! End-to-end tests: discovery, key resolution, header cache and reads.
//!
//! Fixtures are real RSA-encrypted headers produced with a throwaway key. The
//! header plaintext is a JSON list of entries, parsed by a test-only
//! [`IndexParser`].

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dantelion_crypto::{AesEngine, CryptoError, HeaderDigest, PathHashKind};
use dantelion_data::{
    AesRange, ArchiveBootstrap, ArchiveId, ArchiveIndex, ArchiveState, DataConfig, DataError,
    EncryptedData, FileEntry, FileKey, FileTable, Game, HeaderCache, IndexParser, KeyStore,
    OutputDir, RemoteConfig, normalize_path,
};
use pretty_assertions::assert_eq;
use rand_08::SeedableRng;
use rand_08::rngs::StdRng;
use rsa::BigUint;
use rsa::RsaPrivateKey;
use rsa::pkcs1::{EncodeRsaPublicKey, LineEnding};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const GAME: Game = Game::EldenRing;
const FILE_KEY: [u8; 16] = *b"fixture-aes-key!";

/// Headers in these fixtures are JSON lists of entries
struct JsonIndexParser;

impl IndexParser for JsonIndexParser {
    fn parse(&self, header: &[u8], _game: Game) -> dantelion_data::Result<Box<dyn ArchiveIndex>> {
        let entries: Vec<FileEntry> =
            serde_json::from_slice(header).map_err(|e| DataError::Index(e.to_string()))?;
        Ok(Box::new(entries.into_iter().collect::<FileTable>()))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Bootstrap refuses to start without AES-NI, so these runs need it
fn aes_ni() -> bool {
    AesEngine::is_supported()
}

fn hash(path: &str) -> u64 {
    PathHashKind::Bits64.hash(&normalize_path(path))
}

struct Fixture {
    dir: TempDir,
    key: RsaPrivateKey,
}

impl Fixture {
    fn new() -> Self {
        init_tracing();
        let mut rng = StdRng::seed_from_u64(0x0b4d_5eed);
        Self {
            dir: TempDir::new().unwrap(),
            key: RsaPrivateKey::new(&mut rng, 512).expect("key generation"),
        }
    }

    fn root(&self) -> PathBuf {
        self.dir.path().join("Game")
    }

    fn data_dir(&self) -> PathBuf {
        self.dir.path().join("Data")
    }

    fn config(&self) -> DataConfig {
        DataConfig::new(self.root(), GAME)
            .with_data_dir(self.data_dir())
            .with_remote(None)
            .with_max_workers(2)
    }

    fn public_pem(&self) -> String {
        self.key
            .to_public_key()
            .to_pkcs1_pem(LineEnding::CRLF)
            .unwrap()
    }

    /// Raw RSA with the private exponent, the way shipped headers are made
    fn encrypt_header(&self, plaintext: &[u8]) -> Vec<u8> {
        let modulus_len = self.key.size();
        let chunk = (self.key.n().bits() - 1) / 8;
        let mut padded = plaintext.to_vec();
        padded.resize(plaintext.len().div_ceil(chunk) * chunk, b' ');

        let mut out = Vec::new();
        for block in padded.chunks(chunk) {
            let c = BigUint::from_bytes_be(block)
                .modpow(self.key.d(), self.key.n())
                .to_bytes_be();
            out.resize(out.len() + modulus_len - c.len(), 0);
            out.extend_from_slice(&c);
        }
        out
    }

    fn header_path(&self, id: &str) -> PathBuf {
        self.root().join(format!("{id}.bhd"))
    }

    fn write_archive(&self, id: &str, entries: &[FileEntry], data: Option<&[u8]>) {
        let header = self.header_path(id);
        fs::create_dir_all(header.parent().unwrap()).unwrap();
        let json = serde_json::to_vec(entries).unwrap();
        fs::write(&header, self.encrypt_header(&json)).unwrap();
        if let Some(data) = data {
            fs::write(header.with_extension("bdt"), data).unwrap();
        }
    }

    fn write_keys(&self, ids: &[&str]) {
        let mut store = KeyStore::new();
        for id in ids {
            store.insert(ArchiveId::new(*id), self.public_pem());
        }
        store.save(self.config().keys_path()).unwrap();
    }

    /// `data0` (keyed) with two files and `data1` (never keyed) with one
    fn standard_layout(&self) {
        let mut data0 = b"REGULATION-PARAMS-0123456789abcd".to_vec();
        data0.extend_from_slice(&[0x5Au8; 32]);
        self.write_archive(
            "data0",
            &[
                FileEntry::new(hash("regulation.bin"), 0, 32),
                FileEntry::new(hash("/chr/c0000.anibnd"), 32, 32),
                FileEntry::new(hash("/broken.bin"), 48, 64),
            ],
            Some(&data0),
        );
        self.write_archive(
            "data1",
            &[FileEntry::new(hash("/map/m10.msb"), 0, 16)],
            Some(&[0u8; 16]),
        );
    }
}

fn state(data: &EncryptedData, id: &str) -> ArchiveState {
    data.archive_states()
        .find(|(archive, _)| archive.as_str() == id)
        .map(|(_, state)| state.clone())
        .unwrap()
}

async fn open(fixture: &Fixture) -> EncryptedData {
    EncryptedData::open(fixture.config(), Arc::new(JsonIndexParser))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_keyed_and_keyless_archives() {
    if !aes_ni() {
        return;
    }
    let fixture = Fixture::new();
    fixture.standard_layout();
    fixture.write_keys(&["data0"]);

    let data = open(&fixture).await;

    assert_eq!(
        state(&data, "data0"),
        ArchiveState::Ready {
            entries: 3,
            cache_rebuilt: true
        }
    );
    assert_eq!(state(&data, "data1"), ArchiveState::KeyMissing);

    let regulation = data.get("Regulation.bin").unwrap().unwrap();
    assert_eq!(regulation, b"REGULATION-PARAMS-0123456789abcd");
    assert_eq!(data.regulation().unwrap().unwrap(), regulation);

    let output = OutputDir::new(fixture.dir.path().join("out"));
    let written = output.set("/dump/regulation.bin", &regulation).unwrap();
    assert_eq!(fs::read(written).unwrap(), regulation);
    assert_eq!(data.locate("/regulation.bin").unwrap().as_str(), "data0");
    assert!(data.exists("chr\\c0000.anibnd"));

    // Stored in data1, whose index is empty without a key
    assert!(data.get("/map/m10.msb").unwrap().is_none());
    assert!(!data.exists("/map/m10.msb"));
    assert_eq!(data.entries(&ArchiveId::new("data1")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_out_of_bounds_entry_fails_only_that_read() {
    if !aes_ni() {
        return;
    }
    let fixture = Fixture::new();
    fixture.standard_layout();
    fixture.write_keys(&["data0"]);

    let data = open(&fixture).await;
    assert!(matches!(
        data.get("/broken.bin"),
        Err(DataError::OutOfBounds {
            offset: 48,
            size: 64,
            len: 64
        })
    ));
    assert!(data.get("/regulation.bin").unwrap().is_some());
}

#[tokio::test]
async fn test_valid_cache_skips_rsa() {
    if !aes_ni() {
        return;
    }
    let fixture = Fixture::new();
    fixture.standard_layout();
    fixture.write_keys(&["data0"]);
    drop(open(&fixture).await);

    // A key that cannot be parsed proves the second run never needed it
    let mut store = KeyStore::new();
    store.insert(ArchiveId::new("data0"), "not a pem key\n");
    store.save(fixture.config().keys_path()).unwrap();

    let data = open(&fixture).await;
    assert_eq!(
        state(&data, "data0"),
        ArchiveState::Ready {
            entries: 3,
            cache_rebuilt: false
        }
    );
    assert!(data.get("/regulation.bin").unwrap().is_some());
}

#[tokio::test]
async fn test_changed_header_rebuilds_and_archives_old_cache() {
    if !aes_ni() {
        return;
    }
    let fixture = Fixture::new();
    fixture.standard_layout();
    fixture.write_keys(&["data0"]);
    drop(open(&fixture).await);

    let cache_dir = fixture.config().cache_dir();
    let old_digest = HeaderDigest::from_data(&fs::read(fixture.header_path("data0")).unwrap());

    let mut header = fs::read(fixture.header_path("data0")).unwrap();
    header[40] ^= 0x01;
    fs::write(fixture.header_path("data0"), &header).unwrap();
    assert!(
        !HeaderCache::open(fixture.header_path("data0"), &cache_dir, "data0")
            .unwrap()
            .is_valid()
    );

    let config = fixture.config().with_keep_old_cache(true);
    let data = EncryptedData::open(config, Arc::new(JsonIndexParser))
        .await
        .unwrap();

    // The corrupted header decrypts to garbage, so only that archive degrades
    assert!(matches!(state(&data, "data0"), ArchiveState::Failed(_)));
    assert_eq!(state(&data, "data1"), ArchiveState::KeyMissing);
    assert!(data.get("/regulation.bin").unwrap().is_none());

    let archived = cache_dir.join(format!("data0_{}.bhdcache", old_digest.short_hex_upper()));
    assert!(archived.is_file());
    assert!(
        HeaderCache::open(fixture.header_path("data0"), &cache_dir, "data0")
            .unwrap()
            .is_valid()
    );
}

#[tokio::test]
async fn test_worker_failure_is_isolated() {
    if !aes_ni() {
        return;
    }
    let fixture = Fixture::new();
    fixture.standard_layout();
    // Keyed, but its data file is missing
    fixture.write_archive("dlc01", &[FileEntry::new(hash("/dlc.bin"), 0, 16)], None);
    fixture.write_keys(&["data0", "dlc01"]);

    let data = EncryptedData::open(
        fixture.config().with_max_workers(1),
        Arc::new(JsonIndexParser),
    )
    .await
    .unwrap();

    assert!(matches!(state(&data, "dlc01"), ArchiveState::Failed(_)));
    assert!(state(&data, "data0").is_ready());
    assert!(data.get("/dlc.bin").unwrap().is_none());
    assert!(data.get("/regulation.bin").unwrap().is_some());
}

#[tokio::test]
async fn test_sd_archive_ids_and_cache_names() {
    if !aes_ni() {
        return;
    }
    let fixture = Fixture::new();
    fixture.standard_layout();
    fixture.write_archive(
        "sd/sd",
        &[FileEntry::new(hash("/sound/fe.bnk"), 0, 16)],
        Some(b"BANKBANKBANKBANK"),
    );
    fixture.write_keys(&["data0", "sd/sd"]);

    let data = open(&fixture).await;
    let ids: Vec<&str> = data.archive_ids().map(ArchiveId::as_str).collect();
    assert_eq!(ids, vec!["data0", "data1", "sd/sd"]);
    assert_eq!(data.get("/sound/fe.bnk").unwrap().unwrap(), b"BANKBANKBANKBANK");
    assert!(fixture.config().cache_dir().join("sd_sd.bhdcache").is_file());
}

#[tokio::test]
async fn test_remote_keys_are_fetched_and_persisted() {
    if !aes_ni() {
        return;
    }
    let fixture = Fixture::new();
    fixture.standard_layout();

    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/EldenRing_PC/Key/data0.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(fixture.public_pem()))
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/EldenRing_PC/Key/data1.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let config = fixture
        .config()
        .with_remote(Some(RemoteConfig::new(mock_server.uri()).with_timeout_secs(5)));
    let data = EncryptedData::open(config.clone(), Arc::new(JsonIndexParser))
        .await
        .unwrap();

    assert!(state(&data, "data0").is_ready());
    assert_eq!(state(&data, "data1"), ArchiveState::KeyMissing);

    let saved = KeyStore::load(config.keys_path()).unwrap().unwrap();
    assert_eq!(saved.len(), 1);
    assert!(saved.contains(&ArchiveId::new("data0")));
}

#[tokio::test]
async fn test_keys_missing_from_store_are_fetched_remotely() {
    if !aes_ni() {
        return;
    }
    let fixture = Fixture::new();
    fixture.standard_layout();
    fixture.write_archive(
        "dlc01",
        &[FileEntry::new(hash("/dlc.bin"), 0, 16)],
        Some(b"DLC-PAYLOAD-0001"),
    );
    fixture.write_keys(&["data0"]);

    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/EldenRing_PC/Key/dlc01.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(fixture.public_pem()))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/EldenRing_PC/Key/data1.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;
    // data0 is already in the store and must not be fetched
    Mock::given(method("GET"))
        .and(path("/EldenRing_PC/Key/data0.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("wrong key"))
        .expect(0)
        .mount(&mock_server)
        .await;

    let config = fixture
        .config()
        .with_remote(Some(RemoteConfig::new(mock_server.uri()).with_timeout_secs(5)));
    let data = EncryptedData::open(config.clone(), Arc::new(JsonIndexParser))
        .await
        .unwrap();

    assert!(state(&data, "data0").is_ready());
    assert!(state(&data, "dlc01").is_ready());
    assert_eq!(state(&data, "data1"), ArchiveState::KeyMissing);
    assert_eq!(data.get("/dlc.bin").unwrap().unwrap(), b"DLC-PAYLOAD-0001");

    let saved = KeyStore::load(config.keys_path()).unwrap().unwrap();
    let ids: Vec<&str> = saved.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["data0", "dlc01"]);
}

#[tokio::test]
async fn test_bootstrap_requires_aes_ni() {
    let fixture = Fixture::new();
    fixture.standard_layout();
    fixture.write_keys(&["data0"]);

    let result = EncryptedData::open(fixture.config(), Arc::new(JsonIndexParser)).await;
    if aes_ni() {
        assert!(result.is_ok());
    } else {
        assert!(matches!(
            result,
            Err(DataError::Crypto(CryptoError::HardwareUnsupported))
        ));
    }
}

#[tokio::test]
async fn test_no_archives_is_an_error() {
    if !aes_ni() {
        return;
    }
    let fixture = Fixture::new();
    fs::create_dir_all(fixture.root()).unwrap();

    let result = EncryptedData::open(fixture.config(), Arc::new(JsonIndexParser)).await;
    assert!(matches!(result, Err(DataError::NoArchives(_))));
}

#[tokio::test]
async fn test_encrypted_ranges_and_coverage() {
    if !aes_ni() {
        return;
    }
    let fixture = Fixture::new();

    let plain: Vec<u8> = (0..64u8).collect();
    let mut payload = plain.clone();
    let engine = AesEngine::new(&FILE_KEY).unwrap();
    for block in payload[16..48].chunks_exact_mut(16) {
        let ct = engine.cbc_encrypt_to_vec(block, &[0u8; 16]).unwrap();
        block.copy_from_slice(&ct[..16]);
    }

    let key = FileKey::new(
        FILE_KEY,
        vec![
            AesRange::new(16, 48),
            AesRange::new(-1, -1),
            AesRange::new(60, 50),
        ],
    );
    fixture.write_archive(
        "data0",
        &[FileEntry::new(hash("/param/gameparam.parambnd"), 0, 64).with_key(key)],
        Some(&payload),
    );
    fixture.write_keys(&["data0"]);

    let data = ArchiveBootstrap::new(fixture.config(), Arc::new(JsonIndexParser))
        .with_keys(KeyStore::load(fixture.config().keys_path()).unwrap().unwrap())
        .run()
        .await
        .map(|done| EncryptedData::from_bootstrapped(GAME, done, tracing::Span::none()))
        .unwrap();

    assert_eq!(data.get("/param/gameparam.parambnd").unwrap().unwrap(), plain);
    assert_eq!(data.diagnostics().malformed_ranges(), 1);
    assert_eq!(data.diagnostics().decrypted_ranges(), 1);
    assert_eq!(data.engine_count(), 1);

    let coverage = data.coverage(["/param/gameparam.parambnd", "/missing.bin"]);
    assert_eq!(coverage.requested, 2);
    assert_eq!(coverage.resolved, 1);
    assert_eq!(coverage.indexed, 1);
}

#[test]
fn test_fixture_paths_are_inside_root() {
    let fixture = Fixture::new();
    let header = fixture.header_path("sd/sd");
    assert!(header.starts_with(fixture.root()));
    assert_eq!(
        ArchiveId::from_header_path(&fixture.root(), Path::new(&header))
            .unwrap()
            .as_str(),
        "sd/sd"
    );
}
