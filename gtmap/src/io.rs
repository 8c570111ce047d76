use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

/// Open a file, possibly compressed. Supports gzip and zstd.
pub fn open_file<P: AsRef<Path>>(file: P) -> Result<Box<dyn Read + Send>> {
    let path = file.as_ref();
    let open = || File::open(path).with_context(|| format!("cannot open file: {}", path.display()));
    let reader: Box<dyn Read + Send> = match detect_compression(path)? {
        Some(Compression::Gzip) => Box::new(flate2::read::MultiGzDecoder::new(open()?)),
        Some(Compression::Zstd) => Box::new(
            zstd::stream::read::Decoder::new(open()?)
                .with_context(|| format!("cannot read zstd stream: {}", path.display()))?,
        ),
        None => Box::new(open()?),
    };
    Ok(reader)
}

/// Determine the file compression type from its magic bytes.
fn detect_compression(path: &Path) -> Result<Option<Compression>> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path).with_context(|| format!("cannot open file: {}", path.display()))?;
    let n = file.read(&mut magic)?;
    let compression = match &magic[..n] {
        [0x1f, 0x8b, ..] => Some(Compression::Gzip),
        [0x28, 0xb5, 0x2f, 0xfd] => Some(Compression::Zstd),
        _ => None,
    };
    Ok(compression)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zstd,
}

impl TryFrom<&PathBuf> for Compression {
    type Error = anyhow::Error;

    fn try_from(path: &PathBuf) -> Result<Self> {
        let ext = path.extension().unwrap_or(std::ffi::OsStr::new(""));
        if ext == "gz" {
            Ok(Compression::Gzip)
        } else if ext == "zst" {
            Ok(Compression::Zstd)
        } else {
            Err(anyhow!("unsupported compression: {:?}", path))
        }
    }
}

/// Create an output file. Without an explicit compression the extension
/// decides (`.gz`, `.zst`, plain otherwise).
pub fn create_file<P: AsRef<Path>>(
    filename: P,
    compression: Option<Compression>,
    compression_level: Option<u32>,
    num_threads: u32,
) -> Result<Box<dyn Write + Send>> {
    let path = filename.as_ref();
    let compression =
        compression.or_else(|| Compression::try_from(&path.to_path_buf()).ok());
    let buffer = BufWriter::new(
        File::create(path).with_context(|| format!("cannot create file: {}", path.display()))?,
    );
    let writer: Box<dyn Write + Send> = match compression {
        None => Box::new(buffer),
        Some(Compression::Gzip) => Box::new(flate2::write::GzEncoder::new(
            buffer,
            flate2::Compression::new(compression_level.unwrap_or(6)),
        )),
        Some(Compression::Zstd) => {
            let mut zstd =
                zstd::stream::Encoder::new(buffer, compression_level.unwrap_or(9) as i32)?;
            if num_threads > 1 {
                zstd.multithread(num_threads)?;
            }
            Box::new(zstd.auto_finish())
        }
    };
    Ok(writer)
}

/// Buffered variant of [`open_file`], the usual entry point for record input.
pub fn open_buffered<P: AsRef<Path>>(file: P) -> Result<BufReader<Box<dyn Read + Send>>> {
    Ok(BufReader::new(open_file(file)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;

    fn tmp(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gtmap-io-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_compressed_round_trip() {
        for (name, compression) in [
            ("plain.map", None),
            ("reads.map.gz", None),
            ("reads.map.zst", None),
            ("explicit", Some(Compression::Gzip)),
        ] {
            let path = tmp(name);
            {
                let mut writer = create_file(&path, compression, None, 1).unwrap();
                writer.write_all(b"r1\tACGT\t0\t-\n").unwrap();
            }
            let lines = open_buffered(&path)
                .unwrap()
                .lines()
                .collect::<std::io::Result<Vec<_>>>()
                .unwrap();
            assert_eq!(lines, vec!["r1\tACGT\t0\t-".to_string()], "{}", name);
            std::fs::remove_file(&path).unwrap();
        }
    }

    #[test]
    fn test_missing_file() {
        let err = open_file("/nonexistent/input.map").err().unwrap();
        assert!(format!("{:#}", err).contains("cannot open file"));
    }
}
