use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::header::CONTENT_ENCODING;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;

use crate::util::lock_unpoisoned;

#[derive(Debug, Error)]
#[error("failed to decode `{encoding}` response body: {source}")]
pub(crate) struct DecodeError {
    encoding: String,
    #[source]
    source: io::Error,
}

#[derive(Clone, Default)]
struct Sink(Arc<Mutex<Vec<u8>>>);

impl Sink {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *lock_unpoisoned(&self.0))
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock_unpoisoned(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Decoder {
    Gzip(flate2::write::GzDecoder<Sink>),
    Deflate(flate2::write::ZlibDecoder<Sink>),
    Brotli(Box<brotli::DecompressorWriter<Sink>>),
    Zstd(zstd::stream::write::Decoder<'static, Sink>),
}

struct Stage {
    encoding: &'static str,
    decoder: Decoder,
    sink: Sink,
}

impl Stage {
    fn new(encoding: &str) -> io::Result<Option<Self>> {
        let sink = Sink::default();
        let (encoding, decoder) = match encoding {
            "gzip" | "x-gzip" => ("gzip", Decoder::Gzip(flate2::write::GzDecoder::new(sink.clone()))),
            "deflate" => (
                "deflate",
                Decoder::Deflate(flate2::write::ZlibDecoder::new(sink.clone())),
            ),
            "br" => (
                "br",
                Decoder::Brotli(Box::new(brotli::DecompressorWriter::new(sink.clone(), 4096))),
            ),
            "zstd" => (
                "zstd",
                Decoder::Zstd(zstd::stream::write::Decoder::new(sink.clone())?),
            ),
            _ => return Ok(None),
        };
        Ok(Some(Self {
            encoding,
            decoder,
            sink,
        }))
    }

    fn push(&mut self, input: &[u8]) -> io::Result<Vec<u8>> {
        match &mut self.decoder {
            Decoder::Gzip(decoder) => decoder.write_all(input)?,
            Decoder::Deflate(decoder) => decoder.write_all(input)?,
            Decoder::Brotli(decoder) => decoder.write_all(input)?,
            Decoder::Zstd(decoder) => decoder.write_all(input)?,
        }
        Ok(self.sink.take())
    }

    fn finish(&mut self) -> io::Result<Vec<u8>> {
        match &mut self.decoder {
            Decoder::Gzip(decoder) => decoder.try_finish()?,
            Decoder::Deflate(decoder) => decoder.try_finish()?,
            Decoder::Brotli(decoder) => decoder.flush()?,
            Decoder::Zstd(decoder) => decoder.flush()?,
        }
        Ok(self.sink.take())
    }
}

/// Incremental decoder for a stacked `content-encoding` header.
pub(crate) struct ContentDecoder {
    stages: Vec<Stage>,
}

impl std::fmt::Debug for ContentDecoder {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let encodings: Vec<&str> = self.stages.iter().map(|stage| stage.encoding).collect();
        formatter
            .debug_struct("ContentDecoder")
            .field("stages", &encodings)
            .finish()
    }
}

pub(crate) fn should_decode_content_encoded_body(method: &Method, status: StatusCode) -> bool {
    if *method == Method::HEAD {
        return false;
    }
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

impl ContentDecoder {
    /// Returns `None` when the body should pass through untouched, which
    /// includes any encoding this decoder does not know.
    pub(crate) fn for_response(
        method: &Method,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Option<Self> {
        if !should_decode_content_encoded_body(method, status) {
            return None;
        }
        let content_encoding = headers.get(CONTENT_ENCODING)?.to_str().ok()?;
        let encodings = content_encoding
            .split(',')
            .map(|item| item.trim().to_ascii_lowercase())
            .filter(|item| !item.is_empty() && item != "identity")
            .collect::<Vec<_>>();
        if encodings.is_empty() {
            return None;
        }

        let mut stages = Vec::with_capacity(encodings.len());
        for encoding in encodings.iter().rev() {
            stages.push(Stage::new(encoding).ok()??);
        }
        Some(Self { stages })
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> Result<Bytes, DecodeError> {
        let mut data = chunk.to_vec();
        for stage in &mut self.stages {
            if data.is_empty() {
                break;
            }
            data = stage.push(&data).map_err(|source| DecodeError {
                encoding: stage.encoding.to_owned(),
                source,
            })?;
        }
        Ok(Bytes::from(data))
    }

    pub(crate) fn finish(&mut self) -> Result<Bytes, DecodeError> {
        let mut carried = Vec::new();
        for stage in &mut self.stages {
            let encoding = stage.encoding;
            let error = |source| DecodeError {
                encoding: encoding.to_owned(),
                source,
            };
            let mut output = if carried.is_empty() {
                Vec::new()
            } else {
                stage.push(&carried).map_err(error)?
            };
            output.extend(stage.finish().map_err(error)?);
            carried = output;
        }
        Ok(Bytes::from(carried))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use http::header::CONTENT_ENCODING;
    use http::{HeaderMap, HeaderValue, Method, StatusCode};

    use super::ContentDecoder;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn headers(encoding: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
        headers
    }

    fn decode_in_chunks(decoder: &mut ContentDecoder, encoded: &[u8]) -> Vec<u8> {
        let mut decoded = Vec::new();
        for chunk in encoded.chunks(7) {
            decoded.extend_from_slice(&decoder.push(chunk).unwrap());
        }
        decoded.extend_from_slice(&decoder.finish().unwrap());
        decoded
    }

    #[test]
    fn gzip_decodes_across_chunk_boundaries() {
        let encoded = gzip(b"hello streaming world");
        let mut decoder =
            ContentDecoder::for_response(&Method::GET, StatusCode::OK, &headers("gzip")).unwrap();
        assert_eq!(decode_in_chunks(&mut decoder, &encoded), b"hello streaming world");
    }

    #[test]
    fn stacked_encodings_decode_in_reverse_order() {
        let inner = gzip(b"twice");
        let mut encoder = zstd::stream::write::Encoder::new(Vec::new(), 0).unwrap();
        encoder.write_all(&inner).unwrap();
        let encoded = encoder.finish().unwrap();

        let mut decoder =
            ContentDecoder::for_response(&Method::GET, StatusCode::OK, &headers("gzip, zstd"))
                .unwrap();
        assert_eq!(decode_in_chunks(&mut decoder, &encoded), b"twice");
    }

    #[test]
    fn unknown_encoding_and_head_pass_through() {
        assert!(
            ContentDecoder::for_response(&Method::GET, StatusCode::OK, &headers("compress")).is_none()
        );
        assert!(
            ContentDecoder::for_response(&Method::HEAD, StatusCode::OK, &headers("gzip")).is_none()
        );
        assert!(
            ContentDecoder::for_response(&Method::GET, StatusCode::NO_CONTENT, &headers("gzip"))
                .is_none()
        );
    }

    #[test]
    fn corrupt_gzip_fails() {
        let mut decoder =
            ContentDecoder::for_response(&Method::GET, StatusCode::OK, &headers("gzip")).unwrap();
        let pushed = decoder.push(b"definitely not gzip data");
        assert!(pushed.is_err() || decoder.finish().is_err());
    }
}
