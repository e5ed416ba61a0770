use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use stowage_types::{EntityKey, FileId, Result, StowageError};

/// Cap on the decompressed size of a single chunk (4x the largest supported
/// chunk window). Guards against decompression bombs in corrupted entities.
const MAX_DECOMPRESS_SIZE: u64 = 4 * 1024 * 1024;

/// One compressed fragment of a payload, stored as one ledger entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: uuid::Uuid,
    pub file_id: FileId,
    pub chunk_index: u32,
    /// Gzip-compressed slice bytes.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub bytes: Vec<u8>,
    pub original_size: u64,
    pub compressed_size: u64,
    /// SHA-256 of the uncompressed slice, hex.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub expiration_block: u64,
    pub ledger_key: Option<EntityKey>,
}

/// Descriptor for a stored payload; one metadata entity per file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub file_id: FileId,
    pub original_filename: String,
    pub content_type: String,
    pub file_extension: String,
    pub total_size: u64,
    pub chunk_count: u32,
    /// SHA-256 of the whole plaintext, hex.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub expiration_block: u64,
    pub btl_days: u32,
    pub ledger_key: Option<EntityKey>,
    pub owner: Option<String>,
}

/// Lowercased suffix after the last dot. Dotless names and a leading dot
/// both yield the empty string.
pub fn file_extension(filename: &str) -> String {
    match filename.rfind('.') {
        Some(0) | None => String::new(),
        Some(pos) => filename[pos + 1..].to_ascii_lowercase(),
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gzip_decompress(data: &[u8], expected_size: u64) -> Result<Vec<u8>> {
    let decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(expected_size.min(MAX_DECOMPRESS_SIZE) as usize);
    decoder
        .take(MAX_DECOMPRESS_SIZE + 1)
        .read_to_end(&mut out)
        .map_err(|e| StowageError::IntegrityFailed(format!("gzip decode: {e}")))?;
    if out.len() as u64 > MAX_DECOMPRESS_SIZE {
        return Err(StowageError::IntegrityFailed(format!(
            "chunk decompresses beyond the {MAX_DECOMPRESS_SIZE}-byte limit"
        )));
    }
    Ok(out)
}

/// Slice `payload` into `chunk_size` windows, compress each, and build the
/// metadata descriptor. Chunks come back in ascending `chunk_index`.
///
/// The caller has already admitted the payload: empty payloads never reach
/// this function.
#[allow(clippy::too_many_arguments)]
pub fn split_payload(
    payload: &[u8],
    file_id: FileId,
    original_filename: &str,
    content_type: &str,
    owner: Option<String>,
    expiration_block: u64,
    btl_days: u32,
    chunk_size: u64,
) -> Result<(FileMetadata, Vec<Chunk>)> {
    let chunk_size = chunk_size.max(1) as usize;
    let now = Utc::now();

    let mut chunks = Vec::with_capacity(payload.len().div_ceil(chunk_size));
    for (index, window) in payload.chunks(chunk_size).enumerate() {
        let bytes = gzip_compress(window)?;
        chunks.push(Chunk {
            id: uuid::Uuid::new_v4(),
            file_id,
            chunk_index: index as u32,
            compressed_size: bytes.len() as u64,
            bytes,
            original_size: window.len() as u64,
            checksum: sha256_hex(window),
            created_at: now,
            expiration_block,
            ledger_key: None,
        });
    }

    let metadata = FileMetadata {
        file_id,
        original_filename: original_filename.to_string(),
        content_type: content_type.to_string(),
        file_extension: file_extension(original_filename),
        total_size: payload.len() as u64,
        chunk_count: chunks.len() as u32,
        checksum: sha256_hex(payload),
        created_at: now,
        expiration_block,
        btl_days,
        ledger_key: None,
        owner,
    };

    Ok((metadata, chunks))
}

/// Decompressed chunk content paired with its index, ready for reassembly.
pub struct ChunkPiece {
    pub chunk_index: u32,
    pub bytes: Vec<u8>,
    pub original_size: u64,
}

/// Reassemble a payload from its pieces and verify the whole-file checksum.
///
/// The piece set must be dense and zero-based; gaps, duplicates, or a short
/// set surface as `FILE_INCOMPLETE` before any checksum work happens.
pub fn reassemble(metadata: &FileMetadata, mut pieces: Vec<ChunkPiece>) -> Result<Vec<u8>> {
    if pieces.len() as u32 != metadata.chunk_count {
        return Err(StowageError::FileIncomplete {
            expected: metadata.chunk_count,
            found: pieces.len() as u32,
        });
    }

    pieces.sort_by_key(|p| p.chunk_index);
    for (expected, piece) in pieces.iter().enumerate() {
        if piece.chunk_index as usize != expected {
            return Err(StowageError::FileIncomplete {
                expected: metadata.chunk_count,
                found: pieces.len() as u32,
            });
        }
    }

    let mut payload = Vec::with_capacity(metadata.total_size as usize);
    for piece in &pieces {
        let plain = gzip_decompress(&piece.bytes, piece.original_size)?;
        payload.extend_from_slice(&plain);
    }

    let checksum = sha256_hex(&payload);
    if checksum != metadata.checksum {
        return Err(StowageError::IntegrityFailed(format!(
            "file {} checksum mismatch: expected {}, computed {checksum}",
            metadata.file_id, metadata.checksum
        )));
    }

    Ok(payload)
}

/// Decompress one chunk entity's payload and wrap it for reassembly.
pub fn piece_from_compressed(chunk_index: u32, bytes: Vec<u8>, original_size: u64) -> ChunkPiece {
    ChunkPiece {
        chunk_index,
        bytes,
        original_size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_simple(payload: &[u8], chunk_size: u64) -> (FileMetadata, Vec<Chunk>) {
        split_payload(
            payload,
            FileId::new(),
            "test.txt",
            "text/plain",
            None,
            1000,
            7,
            chunk_size,
        )
        .unwrap()
    }

    fn pieces_of(chunks: &[Chunk]) -> Vec<ChunkPiece> {
        chunks
            .iter()
            .map(|c| piece_from_compressed(c.chunk_index, c.bytes.clone(), c.original_size))
            .collect()
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let (metadata, chunks) = split_simple(&payload, 32 * 1024);

        assert_eq!(metadata.chunk_count, 4);
        assert_eq!(metadata.total_size, payload.len() as u64);
        assert_eq!(metadata.checksum, sha256_hex(&payload));

        let back = reassemble(&metadata, pieces_of(&chunks)).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn chunk_indices_are_dense_and_zero_based() {
        let payload = vec![0xAB; 100];
        let (metadata, chunks) = split_simple(&payload, 30);
        assert_eq!(metadata.chunk_count, 4);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as u32);
        }
        // Last chunk carries the remainder.
        assert_eq!(chunks[3].original_size, 10);
        assert_eq!(
            chunks.iter().map(|c| c.original_size).sum::<u64>(),
            metadata.total_size
        );
    }

    #[test]
    fn per_chunk_checksum_covers_plaintext() {
        let payload = b"hello chunked world".to_vec();
        let (_, chunks) = split_simple(&payload, 5);
        assert_eq!(chunks[0].checksum, sha256_hex(b"hello"));
        assert_ne!(chunks[0].bytes, b"hello");
    }

    #[test]
    fn single_chunk_file_has_index_zero() {
        let (metadata, chunks) = split_simple(b"tiny", 32 * 1024);
        assert_eq!(metadata.chunk_count, 1);
        assert_eq!(chunks[0].chunk_index, 0);
    }

    #[test]
    fn reassemble_rejects_missing_chunk() {
        let payload = vec![7u8; 200];
        let (metadata, chunks) = split_simple(&payload, 50);
        let mut pieces = pieces_of(&chunks);
        pieces.remove(2);

        match reassemble(&metadata, pieces) {
            Err(StowageError::FileIncomplete { expected, found }) => {
                assert_eq!(expected, 4);
                assert_eq!(found, 3);
            }
            other => panic!("expected FileIncomplete, got {other:?}"),
        }
    }

    #[test]
    fn reassemble_rejects_duplicate_index() {
        let payload = vec![7u8; 100];
        let (metadata, chunks) = split_simple(&payload, 50);
        let mut pieces = pieces_of(&chunks);
        pieces[1] = piece_from_compressed(0, chunks[0].bytes.clone(), chunks[0].original_size);

        assert!(matches!(
            reassemble(&metadata, pieces),
            Err(StowageError::FileIncomplete { .. })
        ));
    }

    #[test]
    fn reassemble_detects_corruption() {
        let payload = vec![3u8; 100];
        let (metadata, chunks) = split_simple(&payload, 50);
        let other = gzip_compress(&[9u8; 50]).unwrap();
        let mut pieces = pieces_of(&chunks);
        pieces[0] = piece_from_compressed(0, other, 50);

        match reassemble(&metadata, pieces) {
            Err(StowageError::IntegrityFailed(_)) => {}
            other => panic!("expected IntegrityFailed, got {other:?}"),
        }
    }

    #[test]
    fn reassemble_out_of_order_pieces() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 7) as u8).collect();
        let (metadata, chunks) = split_simple(&payload, 100);
        let mut pieces = pieces_of(&chunks);
        pieces.reverse();
        assert_eq!(reassemble(&metadata, pieces).unwrap(), payload);
    }

    #[test]
    fn extension_rules() {
        assert_eq!(file_extension("report.PDF"), "pdf");
        assert_eq!(file_extension("archive.tar.gz"), "gz");
        assert_eq!(file_extension("README"), "");
        assert_eq!(file_extension(".gitignore"), "");
        assert_eq!(file_extension("trailing."), "");
    }

    #[test]
    fn decompress_rejects_bomb() {
        // A large run of zeros compresses very small but inflates past the cap.
        let huge = vec![0u8; (MAX_DECOMPRESS_SIZE + 1024) as usize];
        let bomb = gzip_compress(&huge).unwrap();
        assert!(gzip_decompress(&bomb, 1024).is_err());
    }
}
