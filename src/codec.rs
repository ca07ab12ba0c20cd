// Streaming symmetric codec used by the transfer layer. Files are encrypted
// with AES-256-CBC and PKCS7 padding; key and IV travel in the file record /
// session sidecar, never inside the ciphertext stream, so the on-disk
// encrypted length is always plaintext + pad with pad in [1, 16].

use std::io::{Read, Write};

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use sha2::{Digest, Sha256};

use crate::PilotError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Cipher block size; also the upper bound of the PKCS7 pad.
pub const BLOCK: usize = 16;
pub const KEY_LEN: usize = 32;
/// Work buffer for streaming encryption/decryption.
const WORK_BUF: usize = 16 * 1024;

/// Per-file key material. Generated locally, registered with the remote file
/// record so any process can decrypt later.
#[derive(Clone)]
pub struct FileKey {
    pub key: [u8; KEY_LEN],
    pub iv: [u8; BLOCK],
}

impl FileKey {
    pub fn generate() -> Self {
        FileKey { key: rand::random::<[u8; KEY_LEN]>(), iv: rand::random::<[u8; BLOCK]>() }
    }

    pub fn to_b64(&self) -> (String, String) {
        (B64.encode(self.key), B64.encode(self.iv))
    }

    pub fn from_b64(key_b64: &str, iv_b64: &str) -> anyhow::Result<Self> {
        let key_v = B64
            .decode(key_b64)
            .map_err(|e| PilotError::Validation(format!("非法密钥编码: {}", e)))?;
        let iv_v =
            B64.decode(iv_b64).map_err(|e| PilotError::Validation(format!("非法 IV 编码: {}", e)))?;
        let key: [u8; KEY_LEN] = key_v
            .try_into()
            .map_err(|_| PilotError::Validation("密钥长度必须为 32 字节".to_string()))?;
        let iv: [u8; BLOCK] =
            iv_v.try_into().map_err(|_| PilotError::Validation("IV 长度必须为 16 字节".to_string()))?;
        Ok(FileKey { key, iv })
    }
}

/// Exact ciphertext length for a plaintext of `plain` bytes.
pub fn encrypted_len(plain: u64) -> u64 {
    plain + (BLOCK as u64 - plain % BLOCK as u64)
}

/// Whether an encrypted artifact length is plausible for the given plaintext
/// length: inside the padding window and block aligned. Anything outside
/// marks the artifact corrupt.
pub fn len_in_padding_window(encrypted: u64, plain: u64) -> bool {
    encrypted % BLOCK as u64 == 0
        && encrypted >= plain + 1
        && encrypted <= plain + BLOCK as u64
}

/// Streaming encryptor: wraps a plaintext source and yields ciphertext
/// incrementally, so upload parts can be produced without a pre-encrypted
/// temp file. The final read emits the PKCS7 padding block.
pub struct EncryptingReader<R: Read> {
    inner: R,
    enc: Aes256CbcEnc,
    // plaintext carried over between refills, always < BLOCK
    residual: Vec<u8>,
    pending: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> EncryptingReader<R> {
    pub fn new(inner: R, key: &FileKey) -> Self {
        EncryptingReader {
            inner,
            enc: Aes256CbcEnc::new(GenericArray::from_slice(&key.key), GenericArray::from_slice(&key.iv)),
            residual: Vec::with_capacity(BLOCK),
            pending: Vec::with_capacity(WORK_BUF + BLOCK),
            pos: 0,
            done: false,
        }
    }

    fn refill(&mut self) -> std::io::Result<()> {
        self.pending.clear();
        self.pos = 0;
        let mut chunk = [0u8; WORK_BUF];
        let n = loop {
            match self.inner.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        if n == 0 {
            // EOF: pad the residual (pad byte count in [1, BLOCK])
            let pad = BLOCK - self.residual.len();
            self.residual.resize(BLOCK, pad as u8);
            let mut block = GenericArray::clone_from_slice(&self.residual);
            self.enc.encrypt_block_mut(&mut block);
            self.pending.extend_from_slice(&block);
            self.residual.clear();
            self.done = true;
            return Ok(());
        }
        self.residual.extend_from_slice(&chunk[..n]);
        let full = self.residual.len() / BLOCK * BLOCK;
        for piece in self.residual[..full].chunks_exact(BLOCK) {
            let mut block = GenericArray::clone_from_slice(piece);
            self.enc.encrypt_block_mut(&mut block);
            self.pending.extend_from_slice(&block);
        }
        self.residual.drain(..full);
        Ok(())
    }
}

impl<R: Read> Read for EncryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.pos < self.pending.len() {
                let n = (self.pending.len() - self.pos).min(buf.len());
                buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }
            self.refill()?;
        }
    }
}

/// Decrypt a ciphertext stream into `out`, validating the final PKCS7 block.
/// Returns the plaintext byte count. A truncated stream, a length not block
/// aligned or invalid padding raise `Integrity` — never a silent truncation.
pub fn decrypt_stream<R: Read, W: Write>(
    mut input: R,
    out: &mut W,
    key: &FileKey,
) -> anyhow::Result<u64> {
    let mut dec =
        Aes256CbcDec::new(GenericArray::from_slice(&key.key), GenericArray::from_slice(&key.iv));
    let mut chunk = [0u8; WORK_BUF];
    let mut carry: Vec<u8> = Vec::with_capacity(WORK_BUF + BLOCK);
    // last decrypted block is held back until EOF so its padding can be checked
    let mut holdback: Option<[u8; BLOCK]> = None;
    let mut written: u64 = 0;

    loop {
        let n = match input.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PilotError::from_io(&e, "读取密文").into()),
        };
        if n == 0 {
            break;
        }
        carry.extend_from_slice(&chunk[..n]);
        let full = carry.len() / BLOCK * BLOCK;
        for piece in carry[..full].chunks_exact(BLOCK) {
            if let Some(prev) = holdback.take() {
                out.write_all(&prev).map_err(|e| PilotError::from_io(&e, "写入明文"))?;
                written += BLOCK as u64;
            }
            let mut block = GenericArray::clone_from_slice(piece);
            dec.decrypt_block_mut(&mut block);
            let mut b = [0u8; BLOCK];
            b.copy_from_slice(&block);
            holdback = Some(b);
        }
        carry.drain(..full);
    }

    if !carry.is_empty() {
        return Err(PilotError::Integrity(format!(
            "密文长度未对齐块边界（余 {} 字节）",
            carry.len()
        ))
        .into());
    }
    let last = holdback.ok_or_else(|| PilotError::Integrity("密文为空".to_string()))?;
    let pad = last[BLOCK - 1] as usize;
    if pad == 0 || pad > BLOCK || last[BLOCK - pad..].iter().any(|&b| b as usize != pad) {
        return Err(PilotError::Integrity("填充校验失败，密钥错误或数据损坏".to_string()).into());
    }
    out.write_all(&last[..BLOCK - pad]).map_err(|e| PilotError::from_io(&e, "写入明文"))?;
    written += (BLOCK - pad) as u64;
    Ok(written)
}

/// Pre-encrypt mode: plaintext file -> ciphertext file (legacy interop).
/// Returns (plaintext_len, ciphertext_len).
pub fn encrypt_file(
    src: &std::path::Path,
    dst: &std::path::Path,
    key: &FileKey,
) -> anyhow::Result<(u64, u64)> {
    let f = std::fs::File::open(src).map_err(|e| PilotError::from_io(&e, "打开明文文件"))?;
    let plain_len = f.metadata().map_err(|e| PilotError::from_io(&e, "读取元数据"))?.len();
    let mut reader = EncryptingReader::new(f, key);
    let mut out = std::fs::File::create(dst).map_err(|e| PilotError::from_io(&e, "创建密文文件"))?;
    let enc_len = std::io::copy(&mut reader, &mut out)
        .map_err(|e| PilotError::from_io(&e, "写入密文文件"))?;
    out.sync_all().map_err(|e| PilotError::from_io(&e, "落盘密文文件"))?;
    Ok((plain_len, enc_len))
}

/// Decrypt a ciphertext file into a plaintext file.
pub fn decrypt_file(
    src: &std::path::Path,
    dst: &std::path::Path,
    key: &FileKey,
) -> anyhow::Result<u64> {
    let input = std::fs::File::open(src).map_err(|e| PilotError::from_io(&e, "打开密文文件"))?;
    let mut out =
        std::fs::File::create(dst).map_err(|e| PilotError::from_io(&e, "创建明文文件"))?;
    let written = decrypt_stream(std::io::BufReader::new(input), &mut out, key)?;
    out.sync_all().map_err(|e| PilotError::from_io(&e, "落盘明文文件"))?;
    Ok(written)
}

pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn sha256_file(path: &std::path::Path) -> anyhow::Result<String> {
    let mut f = std::fs::File::open(path).map_err(|e| PilotError::from_io(&e, "打开文件计算校验和"))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; WORK_BUF];
    loop {
        let n = match f.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(PilotError::from_io(&e, "读取文件计算校验和").into()),
        };
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(data: &[u8]) -> Vec<u8> {
        let key = FileKey::generate();
        let mut enc = Vec::new();
        let mut reader = EncryptingReader::new(std::io::Cursor::new(data.to_vec()), &key);
        std::io::copy(&mut reader, &mut enc).unwrap();
        assert_eq!(enc.len() as u64, encrypted_len(data.len() as u64));
        assert!(len_in_padding_window(enc.len() as u64, data.len() as u64));
        let mut plain = Vec::new();
        let n = decrypt_stream(std::io::Cursor::new(enc), &mut plain, &key).unwrap();
        assert_eq!(n as usize, plain.len());
        plain
    }

    #[test]
    fn roundtrip_boundary_sizes() {
        for size in [0usize, 1, BLOCK - 1, BLOCK, BLOCK + 1, 5 * BLOCK, WORK_BUF, WORK_BUF + 3] {
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            assert_eq!(roundtrip(&data), data, "size={}", size);
        }
    }

    #[test]
    fn empty_plaintext_gets_full_pad_block() {
        let key = FileKey::generate();
        let mut enc = Vec::new();
        let mut r = EncryptingReader::new(std::io::Cursor::new(Vec::new()), &key);
        std::io::copy(&mut r, &mut enc).unwrap();
        assert_eq!(enc.len(), BLOCK);
    }

    #[test]
    fn wrong_key_fails_integrity() {
        let key = FileKey::generate();
        let other = FileKey::generate();
        let mut enc = Vec::new();
        let mut r = EncryptingReader::new(std::io::Cursor::new(b"hello world".to_vec()), &key);
        std::io::copy(&mut r, &mut enc).unwrap();
        let mut out = Vec::new();
        // a wrong key either trips the padding check or yields garbage;
        // it must never reproduce the plaintext
        match decrypt_stream(std::io::Cursor::new(enc), &mut out, &other) {
            Err(err) => {
                let pe = err.downcast_ref::<PilotError>().unwrap();
                assert_eq!(pe.kind(), "integrity");
            }
            Ok(_) => assert_ne!(out, b"hello world"),
        }
    }

    #[test]
    fn truncated_stream_fails_integrity() {
        let key = FileKey::generate();
        let mut enc = Vec::new();
        let mut r = EncryptingReader::new(std::io::Cursor::new(vec![7u8; 100]), &key);
        std::io::copy(&mut r, &mut enc).unwrap();
        // chop off half a block
        enc.truncate(enc.len() - 7);
        let mut out = Vec::new();
        let err = decrypt_stream(std::io::Cursor::new(enc), &mut out, &key).unwrap_err();
        assert_eq!(err.downcast_ref::<PilotError>().unwrap().kind(), "integrity");
    }

    #[test]
    fn empty_ciphertext_fails_integrity() {
        let key = FileKey::generate();
        let mut out = Vec::new();
        let err =
            decrypt_stream(std::io::Cursor::new(Vec::new()), &mut out, &key).unwrap_err();
        assert_eq!(err.downcast_ref::<PilotError>().unwrap().kind(), "integrity");
    }

    #[test]
    fn padding_window_bounds() {
        assert!(len_in_padding_window(16, 0));
        assert!(len_in_padding_window(16, 15));
        assert!(len_in_padding_window(32, 16));
        assert!(!len_in_padding_window(16, 16));
        assert!(!len_in_padding_window(17, 10));
        assert!(!len_in_padding_window(48, 10));
    }

    #[test]
    fn file_mode_matches_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.dat");
        let enc = dir.path().join("in.dat.enc");
        let back = dir.path().join("out.dat");
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(&src, &data).unwrap();
        let key = FileKey::generate();
        let (plain_len, enc_len) = encrypt_file(&src, &enc, &key).unwrap();
        assert_eq!(plain_len, data.len() as u64);
        assert_eq!(enc_len, encrypted_len(plain_len));
        let n = decrypt_file(&enc, &back, &key).unwrap();
        assert_eq!(n, plain_len);
        assert_eq!(std::fs::read(&back).unwrap(), data);
    }

    #[test]
    fn key_b64_roundtrip() {
        let key = FileKey::generate();
        let (k, iv) = key.to_b64();
        let back = FileKey::from_b64(&k, &iv).unwrap();
        assert_eq!(back.key, key.key);
        assert_eq!(back.iv, key.iv);
        assert!(FileKey::from_b64("short", &iv).is_err());
    }
}
