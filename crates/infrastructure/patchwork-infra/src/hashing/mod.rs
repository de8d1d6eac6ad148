use camino::{Utf8Path, Utf8PathBuf};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};

/// Files are streamed through the hasher in blocks of this size.
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Upper-case hex SHA-256 plus the number of bytes hashed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub hash: String,
    pub size: u64,
}

impl FileDigest {
    pub fn matches(&self, expected: &str) -> bool {
        self.hash.eq_ignore_ascii_case(expected)
    }
}

pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<FileDigest> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut size = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok(FileDigest {
        hash: hex::encode_upper(hasher.finalize()),
        size,
    })
}

/// Hash a file on disk. Blocking; call from `spawn_blocking` or a rayon pool.
pub fn hash_file(path: &Utf8Path) -> Result<FileDigest, HashError> {
    let io_err = |source| HashError::Io {
        path: path.to_owned(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    hash_reader(BufReader::with_capacity(CHUNK_SIZE, file)).map_err(io_err)
}

pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(data))
}
