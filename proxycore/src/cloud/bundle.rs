use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::errors::BundleError;
use crate::network::tls::{parse_certificates, parse_private_key, TlsError, TlsMaterial};

const CONFIG_ENTRY: &str = "config.json";
const DEFAULT_CA_CERT_ENTRY: &str = "ca.crt";
const DEFAULT_CERT_ENTRY: &str = "cert";
const DEFAULT_KEY_ENTRY: &str = "key";

/// `config.json` as found in the archive.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBundleConfig {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    keyspace: Option<String>,
    #[serde(rename = "localDC")]
    local_dc: Option<String>,
    #[serde(rename = "cql_port")]
    cql_port: Option<u16>,
    ca_cert_location: Option<String>,
    cert_location: Option<String>,
    key_location: Option<String>,
    #[serde(flatten)]
    other: HashMap<String, serde_json::Value>,
}

/// Settings read from the bundle's `config.json`.
#[derive(Clone, PartialEq, Eq)]
pub struct BundleConfig {
    host: String,
    port: u16,
    username: String,
    password: String,
    keyspace: Option<String>,
    local_dc: Option<String>,
    cql_port: Option<u16>,
}

impl BundleConfig {
    /// Host of the metadata service.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port of the metadata service.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Basic-auth user of the metadata service.
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
    }

    pub fn local_dc(&self) -> Option<&str> {
        self.local_dc.as_deref()
    }

    pub fn cql_port(&self) -> Option<u16> {
        self.cql_port
    }
}

impl fmt::Debug for BundleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("keyspace", &self.keyspace)
            .field("local_dc", &self.local_dc)
            .field("cql_port", &self.cql_port)
            .finish()
    }
}

impl TryFrom<RawBundleConfig> for BundleConfig {
    type Error = BundleError;

    fn try_from(raw: RawBundleConfig) -> Result<Self, BundleError> {
        fn required<T>(value: Option<T>, name: &str) -> Result<T, BundleError> {
            value.ok_or_else(|| BundleError::MissingField(format!("{CONFIG_ENTRY} field {name}")))
        }
        fn non_empty(value: Option<String>, name: &str) -> Result<String, BundleError> {
            required(value.filter(|v| !v.is_empty()), name)
        }

        for key in raw.other.keys() {
            warn!("Ignoring unknown bundle config field {:?}", key);
        }

        Ok(BundleConfig {
            host: non_empty(raw.host, "host")?,
            port: required(raw.port, "port")?,
            username: non_empty(raw.username, "username")?,
            password: non_empty(raw.password, "password")?,
            keyspace: raw.keyspace,
            local_dc: raw.local_dc,
            cql_port: raw.cql_port,
        })
    }
}

/// A secure connect bundle: the client's TLS identity, the CA of the
/// cluster's metadata service, and how to reach and log into that service.
///
/// Never changes after loading.
#[derive(Clone, PartialEq, Eq)]
pub struct Bundle {
    config: BundleConfig,
    tls: TlsMaterial,
}

impl Bundle {
    /// Reads a bundle from a zip archive on disk.
    ///
    /// This does blocking file I/O; in async code prefer
    /// [`load_bundle`](super::load_bundle).
    pub fn load_zip(path: impl AsRef<Path>) -> Result<Bundle, BundleError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            BundleError::Corrupt(format!("cannot open {}: {}", path.display(), err))
        })?;
        let bundle = Self::from_reader(file)?;
        debug!("Loaded bundle {}", path.display());
        Ok(bundle)
    }

    /// Reads a bundle from a zip archive.
    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Bundle, BundleError> {
        let mut archive =
            ZipArchive::new(reader).map_err(|err| BundleError::Corrupt(err.to_string()))?;

        let raw: RawBundleConfig = serde_json::from_slice(&read_entry(&mut archive, CONFIG_ENTRY)?)
            .map_err(|err| BundleError::Corrupt(format!("{CONFIG_ENTRY}: {err}")))?;
        let ca_cert_entry = entry_name(raw.ca_cert_location.as_deref(), DEFAULT_CA_CERT_ENTRY);
        let cert_entry = entry_name(raw.cert_location.as_deref(), DEFAULT_CERT_ENTRY);
        let key_entry = entry_name(raw.key_location.as_deref(), DEFAULT_KEY_ENTRY);
        let config = BundleConfig::try_from(raw)?;

        let ca_cert = read_entry(&mut archive, &ca_cert_entry)?;
        check_pem(&ca_cert_entry, parse_certificates(&ca_cert).map(drop))?;
        let cert = read_entry(&mut archive, &cert_entry)?;
        check_pem(&cert_entry, parse_certificates(&cert).map(drop))?;
        let key = read_entry(&mut archive, &key_entry)?;
        check_pem(&key_entry, parse_private_key(&key).map(drop))?;

        Ok(Bundle {
            config,
            tls: TlsMaterial::new(ca_cert, cert, key),
        })
    }

    pub fn config(&self) -> &BundleConfig {
        &self.config
    }

    /// CA certificate, client certificate and key, as PEM.
    pub fn tls_material(&self) -> &TlsMaterial {
        &self.tls
    }

    /// URL of the metadata service that lists the cluster's contact points.
    pub fn metadata_url(&self) -> String {
        let host = &self.config.host;
        if host.contains(':') {
            format!("https://[{}]:{}/metadata", host, self.config.port)
        } else {
            format!("https://{}:{}/metadata", host, self.config.port)
        }
    }
}

impl fmt::Debug for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundle")
            .field("config", &self.config)
            .field("tls", &self.tls)
            .finish()
    }
}

/// Loads a bundle without blocking the async runtime.
pub async fn load_bundle(path: impl Into<PathBuf>) -> Result<Bundle, BundleError> {
    let path = path.into();
    tokio::task::spawn_blocking(move || Bundle::load_zip(path))
        .await
        .map_err(|err| BundleError::Corrupt(format!("bundle loading task failed: {err}")))?
}

fn entry_name(location: Option<&str>, default: &str) -> String {
    match location {
        Some(location) => location.strip_prefix("./").unwrap_or(location).to_owned(),
        None => default.to_owned(),
    }
}

fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Vec<u8>, BundleError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(ZipError::FileNotFound) => return Err(BundleError::MissingField(name.to_owned())),
        Err(err) => return Err(BundleError::Corrupt(format!("{name}: {err}"))),
    };
    let mut contents = Vec::new();
    entry
        .read_to_end(&mut contents)
        .map_err(|err| BundleError::Corrupt(format!("{name}: {err}")))?;
    Ok(contents)
}

fn check_pem(entry: &str, parsed: Result<(), TlsError>) -> Result<(), BundleError> {
    parsed.map_err(|err| BundleError::BadCert {
        entry: entry.to_owned(),
        reason: err.to_string(),
    })
}
