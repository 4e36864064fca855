//! Resolving agent binaries for exec-mode clusters.

use std::{
    collections::HashMap,
    fmt, fs,
    future::Future,
    io::{self, Write as _},
    path::{Path, PathBuf},
    pin::Pin,
};

use futures_util::StreamExt as _;
use sha2::{Digest as _, Sha256};
use tracing::{debug, info};

use crate::{
    harness::Product,
    util::{chmod, ensure_dir, is_executable, tmp_path_next_to},
};

pub const DEFAULT_RELEASES_BASE_URL: &str = "https://releases.hashicorp.com";
pub const RELEASES_BASE_URL_ENV: &str = "CLUSTERLAB_RELEASES_BASE_URL";

pub type LocateFuture<'a> = Pin<Box<dyn Future<Output = Result<PathBuf, BinaryError>> + Send + 'a>>;

pub trait BinaryLocator: Send + Sync {
    fn locate<'a>(&'a self, product: Product, version: &'a str) -> LocateFuture<'a>;
}

#[derive(Debug)]
pub enum BinaryError {
    NotFound { product: Product, searched: String },
    UnsupportedPlatform { os: String, arch: String },
    Download { url: String, message: String },
    ChecksumMissing { asset: String },
    ChecksumMismatch { asset: String, expected: String, actual: String },
    Archive { message: String },
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for BinaryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { product, searched } => {
                write!(f, "{product} binary not found (searched {searched})")
            }
            Self::UnsupportedPlatform { os, arch } => {
                write!(f, "no release builds for {os}/{arch}")
            }
            Self::Download { url, message } => write!(f, "download {url}: {message}"),
            Self::ChecksumMissing { asset } => write!(f, "no checksum listed for {asset}"),
            Self::ChecksumMismatch {
                asset,
                expected,
                actual,
            } => write!(
                f,
                "checksum mismatch for {asset}: expected {expected}, got {actual}"
            ),
            Self::Archive { message } => write!(f, "bad release archive: {message}"),
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
        }
    }
}

impl std::error::Error for BinaryError {}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> BinaryError + '_ {
    move |source| BinaryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Finds binaries in a fixed directory, or on `$PATH` when none is given.
#[derive(Debug, Clone, Default)]
pub struct PathLocator {
    dir: Option<PathBuf>,
}

impl PathLocator {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn find(&self, product: Product) -> Result<PathBuf, BinaryError> {
        let name = product.as_str();
        let candidates: Vec<PathBuf> = match &self.dir {
            Some(dir) => vec![dir.join(name)],
            None => std::env::var_os("PATH")
                .map(|path| std::env::split_paths(&path).map(|d| d.join(name)).collect())
                .unwrap_or_default(),
        };

        candidates
            .iter()
            .find(|candidate| is_executable(candidate))
            .cloned()
            .ok_or_else(|| BinaryError::NotFound {
                product,
                searched: match &self.dir {
                    Some(dir) => dir.display().to_string(),
                    None => "$PATH".to_string(),
                },
            })
    }
}

impl BinaryLocator for PathLocator {
    fn locate<'a>(&'a self, product: Product, _version: &'a str) -> LocateFuture<'a> {
        Box::pin(async move { self.find(product) })
    }
}

/// Downloads release zips into a local cache, verified against the
/// published SHA256SUMS.
#[derive(Debug, Clone)]
pub struct ReleaseCache {
    dir: PathBuf,
    base_url: String,
    client: reqwest::Client,
}

impl ReleaseCache {
    pub fn new(dir: PathBuf) -> Result<Self, BinaryError> {
        let base_url = std::env::var(RELEASES_BASE_URL_ENV)
            .unwrap_or_else(|_| DEFAULT_RELEASES_BASE_URL.to_string());
        Self::with_base_url(dir, base_url)
    }

    pub fn with_base_url(dir: PathBuf, base_url: String) -> Result<Self, BinaryError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("clusterlab/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BinaryError::Download {
                url: base_url.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            dir,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn binary_path(&self, product: Product, version: &str) -> PathBuf {
        self.dir
            .join(product.as_str())
            .join(version)
            .join(product.as_str())
    }

    async fn fetch(&self, product: Product, version: &str) -> Result<PathBuf, BinaryError> {
        let dest = self.binary_path(product, version);
        if is_executable(&dest) {
            debug!(product = %product, version, path = %dest.display(), "using cached binary");
            return Ok(dest);
        }

        let asset = release_asset_name(product, version)?;
        let release_url = format!("{}/{}/{version}", self.base_url, product.as_str());
        let sums_url = format!("{release_url}/{}_{version}_SHA256SUMS", product.as_str());
        let zip_url = format!("{release_url}/{asset}");

        let sums = self.get_text(&sums_url).await?;
        let expected = parse_checksums(&sums)?
            .remove(&asset)
            .ok_or_else(|| BinaryError::ChecksumMissing {
                asset: asset.clone(),
            })?;

        let version_dir = dest.parent().unwrap_or(&self.dir).to_path_buf();
        ensure_dir(&version_dir).map_err(io_err(&version_dir))?;
        let zip_path = version_dir.join(&asset);

        info!(product = %product, version, url = %zip_url, "downloading release");
        self.download_to_path(&zip_url, &zip_path).await?;

        let actual = sha256_file(&zip_path)?;
        if actual != expected {
            let _ = fs::remove_file(&zip_path);
            return Err(BinaryError::ChecksumMismatch {
                asset,
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }

        extract_binary_from_zip(&zip_path, product.as_str(), &dest)?;
        chmod(&dest, 0o755).map_err(io_err(&dest))?;
        let _ = fs::remove_file(&zip_path);

        info!(product = %product, version, path = %dest.display(), "cached release binary");
        Ok(dest)
    }

    async fn get_text(&self, url: &str) -> Result<String, BinaryError> {
        let download_err = |e: reqwest::Error| BinaryError::Download {
            url: url.to_string(),
            message: e.to_string(),
        };
        self.client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(download_err)?
            .text()
            .await
            .map_err(download_err)
    }

    async fn download_to_path(&self, url: &str, dest: &Path) -> Result<(), BinaryError> {
        let download_err = |e: reqwest::Error| BinaryError::Download {
            url: url.to_string(),
            message: e.to_string(),
        };
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(download_err)?;

        let tmp = tmp_path_next_to(dest);
        let mut file = fs::File::create(&tmp).map_err(io_err(&tmp))?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let buf = chunk.map_err(download_err)?;
            file.write_all(&buf).map_err(io_err(&tmp))?;
        }
        file.flush().map_err(io_err(&tmp))?;
        fs::rename(&tmp, dest).map_err(io_err(dest))
    }
}

impl BinaryLocator for ReleaseCache {
    fn locate<'a>(&'a self, product: Product, version: &'a str) -> LocateFuture<'a> {
        Box::pin(self.fetch(product, version))
    }
}

/// Release platform naming, e.g. `("linux", "amd64")`.
pub fn release_platform() -> Result<(&'static str, &'static str), BinaryError> {
    let os = match std::env::consts::OS {
        "linux" => "linux",
        "macos" => "darwin",
        "windows" => "windows",
        "freebsd" => "freebsd",
        _ => "",
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "arm" => "arm",
        _ => "",
    };
    if os.is_empty() || arch.is_empty() {
        return Err(BinaryError::UnsupportedPlatform {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        });
    }
    Ok((os, arch))
}

pub fn release_asset_name(product: Product, version: &str) -> Result<String, BinaryError> {
    let (os, arch) = release_platform()?;
    Ok(format!("{}_{version}_{os}_{arch}.zip", product.as_str()))
}

fn parse_checksums(content: &str) -> Result<HashMap<String, [u8; 32]>, BinaryError> {
    let mut out = HashMap::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.split_whitespace();
        let sha = parts.next().unwrap_or("");
        let name = parts.next().unwrap_or("");
        let bytes = hex::decode(sha).ok().filter(|_| !name.is_empty());
        let Some(arr) = bytes.and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok()) else {
            return Err(BinaryError::Archive {
                message: format!("invalid SHA256SUMS line {}", idx + 1),
            });
        };

        out.insert(name.to_string(), arr);
    }
    Ok(out)
}

fn sha256_file(path: &Path) -> Result<[u8; 32], BinaryError> {
    let data = fs::read(path).map_err(io_err(path))?;
    let mut h = Sha256::new();
    h.update(&data);
    Ok(h.finalize().into())
}

fn extract_binary_from_zip(zip_path: &Path, name: &str, dest: &Path) -> Result<(), BinaryError> {
    let archive_err = |e: zip::result::ZipError| BinaryError::Archive {
        message: e.to_string(),
    };
    let f = fs::File::open(zip_path).map_err(io_err(zip_path))?;
    let mut archive = zip::ZipArchive::new(f).map_err(archive_err)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(archive_err)?;
        if file.is_dir() {
            continue;
        }
        let entry = file.name().replace('\\', "/");
        let base = entry.rsplit('/').next().unwrap_or("");
        if base != name && base != format!("{name}.exe") {
            continue;
        }

        let tmp = tmp_path_next_to(dest);
        let mut out = fs::File::create(&tmp).map_err(io_err(&tmp))?;
        io::copy(&mut file, &mut out).map_err(io_err(&tmp))?;
        out.flush().map_err(io_err(&tmp))?;
        fs::rename(&tmp, dest).map_err(io_err(dest))?;
        return Ok(());
    }

    Err(BinaryError::Archive {
        message: format!("{name} not found in {}", zip_path.display()),
    })
}
