//! Patch container: `PATCH` magic, one compression-method byte, then the
//! compressed body:
//!
//! ```text
//! [3-byte big-endian manifest length][manifest][payload of op 1][payload of op 2]...
//! ```
//!
//! The whole container may additionally be sealed by an outer
//! [`ContainerCipher`]. Sealed containers are decrypted once, to a temporary
//! file, before the header is parsed.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{io_err, PatchError, Result};
use crate::interrupt::{self, Interrupter};
use crate::patch_format::{PatchManifest, MAGIC, MAX_MANIFEST_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Compression {
    Gzip,
    Lzma,
    Zstd,
}

impl Compression {
    pub fn code(self) -> u8 {
        match self {
            Compression::Gzip => 0,
            Compression::Lzma => 1,
            Compression::Zstd => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Compression::Gzip),
            1 => Ok(Compression::Lzma),
            2 => Ok(Compression::Zstd),
            other => Err(PatchError::format(format!(
                "unknown compression method {other}"
            ))),
        }
    }
}

/// Outer whole-file encryption, supplied by the embedding application
/// (AES-256-CBC/PKCS5 by convention). Key and IV live inside the implementor.
pub trait ContainerCipher {
    fn encrypt(&self, plain: &mut dyn Read, sealed: &mut dyn Write) -> io::Result<()>;
    fn decrypt(&self, sealed: &mut dyn Read, plain: &mut dyn Write) -> io::Result<()>;
}

enum Encoder<W: Write> {
    Gzip(flate2::write::GzEncoder<W>),
    Lzma(xz2::write::XzEncoder<W>),
    Zstd(zstd::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    fn new(compression: Compression, inner: W) -> io::Result<Self> {
        Ok(match compression {
            Compression::Gzip => Encoder::Gzip(flate2::write::GzEncoder::new(
                inner,
                flate2::Compression::default(),
            )),
            Compression::Lzma => Encoder::Lzma(xz2::write::XzEncoder::new(inner, 6)),
            Compression::Zstd => Encoder::Zstd(zstd::Encoder::new(inner, 3)?),
        })
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Encoder::Gzip(e) => e.finish(),
            Encoder::Lzma(e) => e.finish(),
            Encoder::Zstd(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Gzip(e) => e.write(buf),
            Encoder::Lzma(e) => e.write(buf),
            Encoder::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Gzip(e) => e.flush(),
            Encoder::Lzma(e) => e.flush(),
            Encoder::Zstd(e) => e.flush(),
        }
    }
}

fn decoder<R: io::BufRead + Send + 'static>(
    compression: Compression,
    inner: R,
) -> io::Result<Box<dyn Read + Send>> {
    Ok(match compression {
        Compression::Gzip => Box::new(flate2::bufread::GzDecoder::new(inner)),
        Compression::Lzma => Box::new(xz2::bufread::XzDecoder::new(inner)),
        Compression::Zstd => Box::new(zstd::Decoder::with_buffer(inner)?),
    })
}

/// Write a container holding `manifest` and the payload bytes in `payload`.
pub fn write_container(
    output: &Path,
    manifest: &PatchManifest,
    payload: &mut dyn Read,
    compression: Compression,
    cipher: Option<&dyn ContainerCipher>,
    interrupter: &Interrupter,
) -> Result<()> {
    let encoded = bincode::serialize(manifest)?;
    if encoded.len() > MAX_MANIFEST_LEN {
        return Err(PatchError::format(format!(
            "manifest is {} bytes, the container allows at most {MAX_MANIFEST_LEN}",
            encoded.len()
        )));
    }

    let Some(cipher) = cipher else {
        let file = File::create(output).map_err(|e| io_err(output, e))?;
        return write_plain(file, output, &encoded, payload, compression, interrupter);
    };

    // Sealed output goes through a plain container next to it first.
    let plain = NamedTempFile::new_in(parent_dir(output)).map_err(|e| io_err(output, e))?;
    let handle = plain.reopen().map_err(|e| io_err(plain.path(), e))?;
    write_plain(handle, plain.path(), &encoded, payload, compression, interrupter)?;

    let mut source = BufReader::new(plain.reopen().map_err(|e| io_err(plain.path(), e))?);
    let mut sealed = BufWriter::new(File::create(output).map_err(|e| io_err(output, e))?);
    cipher
        .encrypt(&mut source, &mut sealed)
        .map_err(|e| io_err(output, e))?;
    sealed.flush().map_err(|e| io_err(output, e))
}

fn write_plain(
    file: File,
    path: &Path,
    manifest: &[u8],
    payload: &mut dyn Read,
    compression: Compression,
    interrupter: &Interrupter,
) -> Result<()> {
    let mut out = BufWriter::new(file);
    out.write_all(MAGIC).map_err(|e| io_err(path, e))?;
    out.write_all(&[compression.code()]).map_err(|e| io_err(path, e))?;

    let mut body = Encoder::new(compression, out).map_err(|e| io_err(path, e))?;
    let len = (manifest.len() as u32).to_be_bytes();
    body.write_all(&len[1..]).map_err(|e| io_err(path, e))?;
    body.write_all(manifest).map_err(|e| io_err(path, e))?;
    interrupt::copy_to_end(payload, &mut body, interrupter, Path::new("<payload>"), path)?;

    let mut out = body.finish().map_err(|e| io_err(path, e))?;
    out.flush().map_err(|e| io_err(path, e))?;
    out.get_ref().sync_all().map_err(|e| io_err(path, e))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// An opened container: the parsed manifest plus the forward-only payload.
pub struct PatchReader {
    pub manifest: PatchManifest,
    pub payload: Box<dyn Read + Send>,
    pub compression: Compression,
    source: PathBuf,
    _decrypted: Option<NamedTempFile>,
}

impl PatchReader {
    pub fn source(&self) -> &Path {
        &self.source
    }
}

/// Open a container, decrypting it first when `cipher` is given.
pub fn open_container(path: &Path, cipher: Option<&dyn ContainerCipher>) -> Result<PatchReader> {
    let (file, decrypted) = match cipher {
        None => (File::open(path).map_err(|e| io_err(path, e))?, None),
        Some(cipher) => {
            let mut sealed = BufReader::new(File::open(path).map_err(|e| io_err(path, e))?);
            let mut plain = NamedTempFile::new().map_err(|e| io_err(path, e))?;
            cipher
                .decrypt(&mut sealed, plain.as_file_mut())
                .map_err(|e| PatchError::format(format!("cannot decrypt {}: {e}", path.display())))?;
            let file = plain.reopen().map_err(|e| io_err(plain.path(), e))?;
            (file, Some(plain))
        }
    };

    let mut reader = BufReader::new(file);
    let mut header = [0u8; 6];
    reader
        .read_exact(&mut header)
        .map_err(|_| PatchError::format(format!("{} is too short", path.display())))?;
    if &header[..MAGIC.len()] != MAGIC {
        return Err(PatchError::format(format!(
            "{} is not a patch container (bad magic)",
            path.display()
        )));
    }
    let compression = Compression::from_code(header[MAGIC.len()])?;

    let mut body = decoder(compression, reader).map_err(|e| io_err(path, e))?;
    let mut len = [0u8; 4];
    body.read_exact(&mut len[1..])
        .map_err(|e| PatchError::format(format!("cannot read manifest length: {e}")))?;
    let len = u32::from_be_bytes(len) as usize;
    let mut encoded = vec![0u8; len];
    body.read_exact(&mut encoded)
        .map_err(|e| PatchError::format(format!("manifest truncated: {e}")))?;
    let manifest: PatchManifest = bincode::deserialize(&encoded)?;
    manifest.check()?;

    tracing::debug!(
        patch = %path.display(),
        id = %manifest.id,
        operations = manifest.operations.len(),
        ?compression,
        "opened patch container"
    );

    Ok(PatchReader {
        manifest,
        payload: body,
        compression,
        source: path.to_path_buf(),
        _decrypted: decrypted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch_format::{PatchKind, VersionFrom, VersionRange};

    fn manifest() -> PatchManifest {
        PatchManifest {
            id: "m".into(),
            kind: PatchKind::Full,
            versions: VersionRange {
                from: VersionFrom::Subsequent("1.0".parse().unwrap()),
                to: "2.0".parse().unwrap(),
            },
            operations: vec![],
            validations: vec![],
            encryption: None,
        }
    }

    struct Xor(u8);

    impl ContainerCipher for Xor {
        fn encrypt(&self, plain: &mut dyn Read, sealed: &mut dyn Write) -> io::Result<()> {
            let mut buf = Vec::new();
            plain.read_to_end(&mut buf)?;
            sealed.write_all(&buf.iter().map(|b| b ^ self.0).collect::<Vec<_>>())
        }

        fn decrypt(&self, sealed: &mut dyn Read, plain: &mut dyn Write) -> io::Result<()> {
            self.encrypt(sealed, plain)
        }
    }

    #[test]
    fn test_header_layout_and_payload_for_each_codec() {
        for compression in [Compression::Gzip, Compression::Lzma, Compression::Zstd] {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("p.patch");
            let mut payload: &[u8] = b"payload bytes";
            write_container(&path, &manifest(), &mut payload, compression, None, &Interrupter::new())
                .unwrap();

            let raw = std::fs::read(&path).unwrap();
            assert_eq!(&raw[..5], b"PATCH");
            assert_eq!(raw[5], compression.code());

            let mut reader = open_container(&path, None).unwrap();
            assert_eq!(reader.manifest, manifest());
            assert_eq!(reader.compression, compression);
            let mut rest = Vec::new();
            reader.payload.read_to_end(&mut rest).unwrap();
            assert_eq!(rest, b"payload bytes");
        }
    }

    #[test]
    fn test_bad_magic_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.patch");
        std::fs::write(&path, b"NOTAPATCH").unwrap();
        assert!(matches!(
            open_container(&path, None),
            Err(PatchError::Format { .. })
        ));
    }

    #[test]
    fn test_unknown_method_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.patch");
        std::fs::write(&path, b"PATCH\x09rest").unwrap();
        assert!(matches!(
            open_container(&path, None),
            Err(PatchError::Format { .. })
        ));
    }

    #[test]
    fn test_sealed_container_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.patch");
        let cipher = Xor(0x5A);
        let mut payload: &[u8] = b"secret";
        write_container(
            &path,
            &manifest(),
            &mut payload,
            Compression::Gzip,
            Some(&cipher),
            &Interrupter::new(),
        )
        .unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert_ne!(&raw[..5], b"PATCH");
        assert!(open_container(&path, None).is_err());

        let mut reader = open_container(&path, Some(&cipher)).unwrap();
        let mut rest = Vec::new();
        reader.payload.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"secret");
    }
}
