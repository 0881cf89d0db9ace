//! C2: a transparent gzip wrapper around a streaming response sink.
//! Content-sniffs once, then compresses every subsequent write, mirroring
//! the reference implementation's `GZIPResponseWriter`.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;

const MIN_GZIP_SIZE: usize = 250;
const SNIFF_LEN: usize = 512;

/// Minimal MIME sniff: the reference implementation relies on
/// `http.DetectContentType`, which inspects the leading bytes for a small
/// fixed table of signatures and otherwise falls back to
/// `text/plain; charset=utf-8` for content without any recognizable binary
/// signature. This crate's bodies are always textual (JSON/HTML), so the
/// fallback is the only branch that matters in practice; detection is kept
/// here rather than delegated to a Content-Type sniffing crate because the
/// decision only ever needs this one fallback.
fn detect_content_type(buf: &[u8]) -> &'static str {
    if buf.starts_with(b"<!DOCTYPE HTML") || buf.starts_with(b"<html") || buf.starts_with(b"<HTML") {
        "text/html; charset=utf-8"
    } else {
        "text/plain; charset=utf-8"
    }
}

fn is_compressible(content_type: &str) -> bool {
    content_type.starts_with("text/") || content_type == "application/javascript"
}

/// Wraps any byte sink, buffering until either the MIME-sniff threshold or
/// an explicit flush, at which point it decides once (and only once)
/// whether to gzip the remainder of the stream.
pub struct GzipCompressor<W> {
    inner: W,
    encoder: Option<GzEncoder<Vec<u8>>>,
    browser_accepts_gzip: bool,
    content_type: Option<String>,
    buf: Vec<u8>,
    detect_done: bool,
    compressing: bool,
}

impl<W: std::io::Write> GzipCompressor<W> {
    /// `accept_encoding` is the request's `Accept-Encoding` header value.
    pub fn new(inner: W, accept_encoding: Option<&str>) -> Self {
        Self {
            inner,
            encoder: None,
            browser_accepts_gzip: accept_encoding.is_some_and(|v| v.contains("gzip")),
            content_type: None,
            buf: Vec::new(),
            detect_done: false,
            compressing: false,
        }
    }

    /// Explicit content type, if the caller already knows it (skips
    /// sniffing); otherwise sniffed from the first bytes written.
    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = Some(content_type.into());
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// True once the compress/no-compress decision has been made; a
    /// `Vary: accept-encoding` header should be emitted alongside it when
    /// `is_compressing()` is true.
    pub fn is_compressing(&self) -> bool {
        self.compressing
    }

    fn detect(&mut self, is_flush: bool) -> std::io::Result<()> {
        if self.detect_done {
            return Ok(());
        }
        if self.content_type.is_none() {
            self.content_type = Some(detect_content_type(&self.buf).to_string());
        }
        let uncompressed_type = is_compressible(self.content_type.as_deref().unwrap_or(""));
        let compress_candidate = uncompressed_type && (is_flush || self.buf.len() >= MIN_GZIP_SIZE);
        if self.browser_accepts_gzip && compress_candidate {
            self.compressing = true;
            self.encoder = Some(GzEncoder::new(Vec::new(), Compression::default()));
        }
        self.detect_done = true;
        Ok(())
    }

    fn write_buffer(&mut self) -> std::io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let buffered = std::mem::take(&mut self.buf);
        match &mut self.encoder {
            Some(enc) => {
                enc.write_all(&buffered)?;
            }
            None => self.inner.write_all(&buffered)?,
        }
        Ok(())
    }

    pub fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if !self.detect_done {
            self.buf.extend_from_slice(bytes);
            if self.buf.len() < SNIFF_LEN {
                return Ok(());
            }
            self.detect(false)?;
            self.write_buffer()?;
            return Ok(());
        }
        self.write_buffer()?;
        match &mut self.encoder {
            Some(enc) => enc.write_all(bytes),
            None => self.inner.write_all(bytes),
        }
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.detect(true)?;
        self.write_buffer()?;
        if let Some(enc) = &mut self.encoder {
            // GzEncoder<Vec<u8>> buffers in memory; flush() drains whatever
            // the deflate stream is willing to emit so far, same as the
            // reference implementation's Flush() forcing a partial gzip block.
            enc.flush()?;
            let pending = std::mem::take(enc.get_mut());
            self.inner.write_all(&pending)?;
        }
        self.inner.flush()
    }

    /// Finalizes the gzip stream (if any) and flushes the underlying sink.
    pub fn close(mut self) -> std::io::Result<W> {
        self.detect(false)?;
        self.write_buffer()?;
        if let Some(enc) = self.encoder.take() {
            let finished = enc.finish()?;
            self.inner.write_all(&finished)?;
        }
        Ok(self.inner)
    }
}
