use std::fmt;
use std::io::Read as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use anyhow::{Context, Result};
use nio_contracts::{ENTRY_POINT_EXPORT, MEMORY_EXPORT};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;
use wasmtime::{Config, Engine, ExternType, InstancePre, Linker, Module};

use crate::config::ImageConfig;
use crate::wasi::{self, WasiHost};

#[derive(Debug)]
pub enum LoadError {
    /// The image bytes could not be retrieved.
    Fetch { location: String, message: String },
    /// The bytes did not match the configured sha256 pin.
    Integrity { expected: String, actual: String },
    /// The bytes are not a valid module for this engine.
    Compile { message: String },
    /// The module lacks the command entry point or memory export.
    Entry { message: String },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Fetch { location, message } => {
                write!(f, "fetch program image {location}: {message}")
            }
            LoadError::Integrity { expected, actual } => write!(
                f,
                "program image sha256 mismatch: expected {expected} got {actual}"
            ),
            LoadError::Compile { message } => write!(f, "compile program image: {message}"),
            LoadError::Entry { message } => write!(f, "program image entry point: {message}"),
        }
    }
}

impl std::error::Error for LoadError {}

/// Caller-supplied image retrieval, for sources other than a location.
pub trait FetchImage: Send + Sync {
    fn describe(&self) -> String;
    fn fetch(&self) -> Result<Vec<u8>>;
}

#[derive(Clone)]
pub enum ImageSource {
    /// `http(s)://…`, `file://…`, or a filesystem path.
    Location(String),
    Bytes(Arc<[u8]>),
    Custom(Arc<dyn FetchImage>),
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Location(loc) => f.debug_tuple("Location").field(loc).finish(),
            ImageSource::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            ImageSource::Custom(src) => f.debug_tuple("Custom").field(&src.describe()).finish(),
        }
    }
}

impl ImageSource {
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        ImageSource::Bytes(Arc::from(bytes.into()))
    }

    pub fn describe(&self) -> String {
        match self {
            ImageSource::Location(loc) => loc.clone(),
            ImageSource::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
            ImageSource::Custom(src) => src.describe(),
        }
    }

    fn fetch(&self) -> Result<Vec<u8>> {
        match self {
            ImageSource::Location(loc) if loc.contains("://") => {
                let url = Url::parse(loc).with_context(|| format!("parse image url {loc:?}"))?;
                fetch_url(&url)
            }
            ImageSource::Location(loc) => {
                let path = PathBuf::from(loc);
                std::fs::read(&path).with_context(|| format!("read {}", path.display()))
            }
            ImageSource::Bytes(bytes) => Ok(bytes.to_vec()),
            ImageSource::Custom(src) => src.fetch(),
        }
    }
}

impl From<&str> for ImageSource {
    fn from(loc: &str) -> Self {
        ImageSource::Location(loc.to_string())
    }
}

impl From<String> for ImageSource {
    fn from(loc: String) -> Self {
        ImageSource::Location(loc)
    }
}

fn fetch_url(url: &Url) -> Result<Vec<u8>> {
    match url.scheme() {
        "file" => {
            let path = url.to_file_path().map_err(|_| {
                anyhow::anyhow!("file url could not be converted to a path: {:?}", url)
            })?;
            std::fs::read(&path).with_context(|| format!("read {}", path.display()))
        }
        "http" | "https" => {
            let resp = ureq::get(url.as_str())
                .call()
                .map_err(|e| anyhow::anyhow!("http GET {}: {e}", url))?;
            let mut reader = resp.into_body().into_reader();
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).context("read http response")?;
            Ok(buf)
        }
        other => anyhow::bail!("unsupported url scheme {other:?} for {}", url.as_str()),
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    let digest = h.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// A compiled, instantiable program image. Cloning shares the compiled code.
#[derive(Clone)]
pub struct ProgramImage {
    inner: Arc<ImageInner>,
}

struct ImageInner {
    engine: Engine,
    module: Module,
    pre: InstancePre<WasiHost>,
    sha256: String,
    size: usize,
    source: String,
}

impl fmt::Debug for ProgramImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramImage")
            .field("source", &self.inner.source)
            .field("sha256", &self.inner.sha256)
            .field("size", &self.inner.size)
            .finish()
    }
}

impl ProgramImage {
    /// Verifies, compiles and links `bytes`.
    pub fn compile(
        bytes: &[u8],
        source: impl Into<String>,
        sha256_pin: Option<&str>,
    ) -> Result<Self, LoadError> {
        let sha256 = sha256_hex(bytes);
        if let Some(pin) = sha256_pin {
            let expected = pin.trim().to_ascii_lowercase();
            if expected != sha256 {
                return Err(LoadError::Integrity {
                    expected,
                    actual: sha256,
                });
            }
        }

        let mut config = Config::new();
        config.consume_fuel(true);
        let engine = Engine::new(&config).map_err(|err| LoadError::Compile {
            message: format!("{err:#}"),
        })?;
        let module = Module::new(&engine, bytes).map_err(|err| LoadError::Compile {
            message: format!("{err:#}"),
        })?;
        check_exports(&module)?;

        let pre = link(&engine, &module).map_err(|err| LoadError::Compile {
            message: format!("{err:#}"),
        })?;

        Ok(ProgramImage {
            inner: Arc::new(ImageInner {
                engine,
                module,
                pre,
                sha256,
                size: bytes.len(),
                source: source.into(),
            }),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    pub fn module(&self) -> &Module {
        &self.inner.module
    }

    pub(crate) fn instance_pre(&self) -> &InstancePre<WasiHost> {
        &self.inner.pre
    }

    pub fn sha256(&self) -> &str {
        &self.inner.sha256
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    /// True when both handles share one compiled image.
    pub fn ptr_eq(a: &ProgramImage, b: &ProgramImage) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

fn check_exports(module: &Module) -> Result<(), LoadError> {
    match module.get_export(ENTRY_POINT_EXPORT) {
        Some(ExternType::Func(ty)) if ty.params().len() == 0 && ty.results().len() == 0 => {}
        Some(ExternType::Func(ty)) => {
            return Err(LoadError::Entry {
                message: format!(
                    "export {ENTRY_POINT_EXPORT:?} has {} params and {} results, expected none",
                    ty.params().len(),
                    ty.results().len()
                ),
            })
        }
        Some(_) => {
            return Err(LoadError::Entry {
                message: format!("export {ENTRY_POINT_EXPORT:?} is not a function"),
            })
        }
        None => {
            return Err(LoadError::Entry {
                message: format!("module does not export {ENTRY_POINT_EXPORT:?}"),
            })
        }
    }
    match module.get_export(MEMORY_EXPORT) {
        Some(ExternType::Memory(_)) => Ok(()),
        _ => Err(LoadError::Entry {
            message: format!("module does not export a memory named {MEMORY_EXPORT:?}"),
        }),
    }
}

fn link(engine: &Engine, module: &Module) -> Result<InstancePre<WasiHost>> {
    let mut linker = Linker::new(engine);
    wasi::add_to_linker(&mut linker)?;
    linker
        .define_unknown_imports_as_traps(module)
        .context("stub unsupported imports")?;
    linker.instantiate_pre(module).context("link program image")
}

/// Process-wide holder of at most one compiled image.
///
/// Concurrent [`ImageCache::load`] calls share a single fetch and compile. A
/// failed load is not remembered; the next call retries.
pub struct ImageCache {
    source: ImageSource,
    sha256_pin: Option<String>,
    cell: OnceCell<ProgramImage>,
    fetches: AtomicU64,
}

impl fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageCache")
            .field("source", &self.source)
            .field("sha256_pin", &self.sha256_pin)
            .field("loaded", &self.cell.initialized())
            .finish()
    }
}

impl ImageCache {
    pub fn new(source: impl Into<ImageSource>) -> Self {
        ImageCache {
            source: source.into(),
            sha256_pin: None,
            cell: OnceCell::new(),
            fetches: AtomicU64::new(0),
        }
    }

    pub fn with_sha256(mut self, pin: impl Into<String>) -> Self {
        self.sha256_pin = Some(pin.into());
        self
    }

    pub fn from_config(config: &ImageConfig) -> Self {
        let cache = ImageCache::new(config.location.clone());
        match &config.sha256 {
            Some(pin) => cache.with_sha256(pin.clone()),
            None => cache,
        }
    }

    /// The cache configured from the process environment.
    pub fn global() -> &'static ImageCache {
        static GLOBAL: OnceLock<ImageCache> = OnceLock::new();
        GLOBAL.get_or_init(|| ImageCache::from_config(&ImageConfig::from_env()))
    }

    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    /// Returns the compiled image, fetching and compiling it on first use.
    pub async fn load(&self) -> Result<ProgramImage, LoadError> {
        let image = self.cell.get_or_try_init(|| self.fetch_and_compile()).await?;
        Ok(image.clone())
    }

    /// The image if a load has already completed.
    pub fn get(&self) -> Option<ProgramImage> {
        self.cell.get().cloned()
    }

    /// How many times the image has been fetched.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Drops the cached image so the next load fetches again.
    ///
    /// Needs exclusive access, so it only applies to caches the caller owns.
    /// The image in [`ImageCache::global`] lives until the process exits.
    pub fn invalidate(&mut self) -> Option<ProgramImage> {
        self.cell.take()
    }

    async fn fetch_and_compile(&self) -> Result<ProgramImage, LoadError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let source = self.source.clone();
        let pin = self.sha256_pin.clone();
        let location = source.describe();
        info!(image = %location, "loading program image");

        let started = Instant::now();
        let task_location = location.clone();
        let res = tokio::task::spawn_blocking(move || {
            let bytes = source.fetch().map_err(|err| LoadError::Fetch {
                location: task_location.clone(),
                message: format!("{err:#}"),
            })?;
            debug!(image = %task_location, bytes = bytes.len(), "fetched program image");
            ProgramImage::compile(&bytes, task_location, pin.as_deref())
        })
        .await
        .map_err(|err| LoadError::Fetch {
            location: location.clone(),
            message: format!("load task failed: {err}"),
        })?;

        match &res {
            Ok(image) => info!(
                image = %location,
                sha256 = %image.sha256(),
                size = image.size(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "program image ready"
            ),
            Err(err) => warn!(image = %location, "program image load failed: {err}"),
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_is_lower_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn describe_hides_raw_bytes() {
        assert_eq!(ImageSource::bytes(vec![0u8; 3]).describe(), "<3 bytes>");
        assert_eq!(ImageSource::from("nio.wasm").describe(), "nio.wasm");
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let err = ImageSource::from("ftp://example.invalid/nio.wasm")
            .fetch()
            .unwrap_err();
        assert!(format!("{err:#}").contains("unsupported url scheme"), "err={err:#}");
    }
}
