use crate::models::CompressionAlgorithm;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Unsupported compression algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Compression level {level} is out of range for {algorithm}")]
    InvalidLevel {
        algorithm: CompressionAlgorithm,
        level: u32,
    },

    #[error("Compression I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Compression cancelled")]
    Cancelled,
}

/// Output of a compression run.
///
/// When a codec ran, the artifact owns a temp file that is unlinked as soon as
/// the artifact is dropped. The pass-through artifact borrows the input path.
#[derive(Debug)]
pub struct CompressedArtifact {
    path: PathBuf,
    _temp: Option<TempPath>,
    pub algorithm: CompressionAlgorithm,
    pub original_size: u64,
    pub compressed_size: u64,
    pub ratio: f64,
}

impl CompressedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn compression_ratio(original_size: u64, compressed_size: u64) -> f64 {
    if original_size == 0 {
        1.0
    } else {
        compressed_size as f64 / original_size as f64
    }
}

pub fn validate_level(algorithm: CompressionAlgorithm, level: u32) -> Result<(), CompressionError> {
    match algorithm.level_range() {
        Some(range) if !range.contains(&level) => {
            Err(CompressionError::InvalidLevel { algorithm, level })
        }
        _ => Ok(()),
    }
}

/// Stateless codec front-end. Artifacts are written under `work_dir`.
#[derive(Debug, Clone)]
pub struct CompressionEngine {
    work_dir: PathBuf,
}

impl CompressionEngine {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    /// Compresses `input` with `algorithm` at `level` on the blocking pool.
    ///
    /// `entry_name` names the single member written into zip archives.
    pub async fn compress(
        &self,
        input: &Path,
        entry_name: &str,
        algorithm: CompressionAlgorithm,
        level: u32,
        cancel: &CancellationToken,
    ) -> Result<CompressedArtifact, CompressionError> {
        validate_level(algorithm, level)?;
        let original_size = tokio::fs::metadata(input).await?.len();

        let Some(extension) = algorithm.extension() else {
            return Ok(CompressedArtifact {
                path: input.to_path_buf(),
                _temp: None,
                algorithm,
                original_size,
                compressed_size: original_size,
                ratio: 1.0,
            });
        };

        tokio::fs::create_dir_all(&self.work_dir).await?;
        let (output, temp_path) = tempfile::Builder::new()
            .prefix("relay-")
            .suffix(&format!(".{}", extension))
            .tempfile_in(&self.work_dir)?
            .into_parts();

        tracing::debug!(
            "Compressing {} ({} bytes) with {} level {}",
            input.display(),
            original_size,
            algorithm,
            level
        );

        let input = input.to_path_buf();
        let entry_name = entry_name.to_string();
        let cancel = cancel.clone();
        let compressed_size = tokio::task::spawn_blocking(move || {
            let source = File::open(&input)?;
            compress_to(
                source,
                output,
                &entry_name,
                algorithm,
                level,
                original_size,
                &cancel,
            )
        })
        .await
        .map_err(|e| io::Error::other(format!("compression task failed: {}", e)))??;

        Ok(CompressedArtifact {
            path: temp_path.to_path_buf(),
            _temp: Some(temp_path),
            algorithm,
            original_size,
            compressed_size,
            ratio: compression_ratio(original_size, compressed_size),
        })
    }
}

/// Reader that stops with an error once the token is cancelled.
struct CancellableReader<'a, R> {
    inner: R,
    cancel: &'a CancellationToken,
}

impl<R: Read> Read for CancellableReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::other("cancelled"));
        }
        self.inner.read(buf)
    }
}

fn compress_to(
    source: File,
    output: File,
    entry_name: &str,
    algorithm: CompressionAlgorithm,
    level: u32,
    original_size: u64,
    cancel: &CancellationToken,
) -> Result<u64, CompressionError> {
    let mut reader = CancellableReader {
        inner: BufReader::with_capacity(CHUNK_SIZE, source),
        cancel,
    };

    let result = match algorithm {
        CompressionAlgorithm::None => Err(CompressionError::UnsupportedAlgorithm(
            "none has no artifact".to_string(),
        )),
        CompressionAlgorithm::Zip => {
            let options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated)
                .compression_level(Some(level as i32))
                .large_file(original_size >= u32::MAX as u64);
            let mut writer = zip::ZipWriter::new(output);
            writer.start_file(entry_name, options).map_err(zip_io)?;
            copy_chunks(&mut reader, &mut writer)
                .and_then(|_| writer.finish().map_err(zip_io))
                .map_err(CompressionError::from)
        }
        CompressionAlgorithm::Gzip => {
            let mut encoder = flate2::write::GzEncoder::new(
                BufWriter::with_capacity(CHUNK_SIZE, output),
                flate2::Compression::new(level),
            );
            copy_chunks(&mut reader, &mut encoder)
                .and_then(|_| encoder.finish())
                .and_then(|w| w.into_inner().map_err(|e| e.into_error()))
                .map_err(CompressionError::from)
        }
        CompressionAlgorithm::Lzma => {
            let mut encoder =
                xz2::write::XzEncoder::new(BufWriter::with_capacity(CHUNK_SIZE, output), level);
            copy_chunks(&mut reader, &mut encoder)
                .and_then(|_| encoder.finish())
                .and_then(|w| w.into_inner().map_err(|e| e.into_error()))
                .map_err(CompressionError::from)
        }
    };

    if cancel.is_cancelled() {
        return Err(CompressionError::Cancelled);
    }

    let file = result?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

fn copy_chunks<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> io::Result<u64> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}

fn zip_io(e: zip::result::ZipError) -> io::Error {
    io::Error::other(e.to_string())
}

/// Reverses [`CompressionEngine::compress`], streaming `input` into `output`.
///
/// Zip archives yield their first member.
pub fn decompress<W: Write>(
    algorithm: CompressionAlgorithm,
    input: File,
    output: &mut W,
) -> Result<u64, CompressionError> {
    let written = match algorithm {
        CompressionAlgorithm::None => copy_chunks(&mut BufReader::new(input), output)?,
        CompressionAlgorithm::Zip => {
            let mut archive = zip::ZipArchive::new(input).map_err(zip_io)?;
            if archive.is_empty() {
                return Err(CompressionError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "zip archive is empty",
                )));
            }
            let mut entry = archive.by_index(0).map_err(zip_io)?;
            copy_chunks(&mut entry, output)?
        }
        CompressionAlgorithm::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(BufReader::new(input));
            copy_chunks(&mut decoder, output)?
        }
        CompressionAlgorithm::Lzma => {
            let mut decoder = xz2::read::XzDecoder::new(BufReader::new(input));
            copy_chunks(&mut decoder, output)?
        }
    };
    Ok(written)
}

/// Async wrapper over [`decompress`] for file-to-file use.
pub async fn decompress_file(
    algorithm: CompressionAlgorithm,
    input: &Path,
    output: &Path,
) -> Result<u64, CompressionError> {
    let input = input.to_path_buf();
    let output = output.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let source = File::open(&input)?;
        let mut sink = BufWriter::new(File::create(&output)?);
        let written = decompress(algorithm, source, &mut sink)?;
        sink.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok::<u64, CompressionError>(written)
    })
    .await
    .map_err(|e| io::Error::other(format!("decompression task failed: {}", e)))?
}
