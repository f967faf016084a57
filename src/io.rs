use crate::IngestResult;
use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, BufReader};
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::codec::Utf8Transcoder;

#[derive(Debug, Clone)]
pub struct StreamMeta {
    /// e.g. "application/json" or "application/gzip"; parameters are ignored
    pub content_type: String,
    /// e.g. "gzip", "zstd", or empty
    pub content_encoding: String,
    /// file or object name, used for extension fallback
    pub name_hint: String,
    /// Source character encoding (defaults to UTF-8)
    pub charset: &'static encoding_rs::Encoding,
}

impl Default for StreamMeta {
    fn default() -> Self {
        Self {
            content_type: String::new(),
            content_encoding: String::new(),
            name_hint: String::new(),
            charset: encoding_rs::UTF_8,
        }
    }
}

impl StreamMeta {
    /// Meta for an HTTP-style response body. A `charset=` parameter on the
    /// content type selects the source encoding; unknown labels fall back to UTF-8.
    pub fn from_headers(content_type: &str, content_encoding: &str) -> Self {
        let mut parts = content_type.split(';');
        let base = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let charset = parts
            .filter_map(|p| p.split_once('='))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("charset"))
            .and_then(|(_, v)| {
                encoding_rs::Encoding::for_label(v.trim().trim_matches('"').as_bytes())
            })
            .unwrap_or(encoding_rs::UTF_8);
        Self {
            content_type: base,
            content_encoding: content_encoding.trim().to_ascii_lowercase(),
            charset,
            ..Default::default()
        }
    }

    // Fields may be set directly, so every comparison is case-insensitive.
    fn has_coding(&self, coding: &str) -> bool {
        self.content_encoding
            .split(',')
            .any(|s| s.trim().eq_ignore_ascii_case(coding))
    }

    fn has_type(&self, types: &[&str]) -> bool {
        types
            .iter()
            .any(|t| self.content_type.trim().eq_ignore_ascii_case(t))
    }

    fn is_gzip(&self) -> bool {
        self.has_coding("gzip")
            || self.has_type(&["application/gzip", "application/x-gzip"])
            || self.name_hint.ends_with(".gz")
    }

    fn is_zstd(&self) -> bool {
        self.has_coding("zstd")
            || self.has_type(&["application/zstd"])
            || self.name_hint.ends_with(".zst")
    }
}

/// Wrap a raw byte source with optional decompression and UTF-8 transcoding.
/// Decompression is chosen by encoding, then type, then name extension.
pub fn build_json_reader<R>(
    raw: R,
    meta: StreamMeta,
) -> (impl AsyncRead + Unpin + Send, StreamMeta)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf = BufReader::with_capacity(1 << 20, raw);
    let decompressed: Box<dyn AsyncRead + Unpin + Send> = if meta.is_gzip() {
        Box::new(GzipDecoder::new(buf))
    } else if meta.is_zstd() {
        Box::new(ZstdDecoder::new(buf))
    } else {
        Box::new(buf)
    };

    // UTF-8 input is passed through untouched
    let reader: Box<dyn AsyncRead + Unpin + Send> = if meta.charset == encoding_rs::UTF_8 {
        decompressed
    } else {
        let framed = FramedRead::new(decompressed, Utf8Transcoder::new(meta.charset));
        Box::new(StreamReader::new(framed))
    };

    (reader, meta)
}

/// Open a local file, deriving meta from its extension.
pub async fn reader_from_path(
    path: &Path,
) -> IngestResult<(impl AsyncRead + Unpin + Send, StreamMeta)> {
    let file = File::open(path).await?;
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();

    let mut meta = StreamMeta {
        name_hint: name,
        ..Default::default()
    };

    match path.extension().and_then(|s| s.to_str()).unwrap_or_default() {
        "gz" => {
            meta.content_type = "application/gzip".into();
            meta.content_encoding = "gzip".into();
        }
        "zst" => {
            meta.content_type = "application/zstd".into();
            meta.content_encoding = "zstd".into();
        }
        _ => {
            meta.content_type = "application/json".into();
        }
    }

    Ok(build_json_reader(file, meta))
}
