use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderValue, Method};
use tokio::sync::mpsc;

use crate::error::{Error, ErrorCode};
use crate::options::{BodySource, NormalizedOptions};
use crate::transport::{AttemptProbe, BoxBodyStream, RequestBody};
use crate::util::method_can_have_body;

const OPEN: u8 = 0;
const LOCKED: u8 = 1;
const FINISHED: u8 = 2;

/// Who owns the writable side of a streamed request.
#[derive(Debug, Default)]
pub(crate) struct WriteLock(AtomicU8);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteLockState {
    /// Caller may write.
    Open,
    /// The body came from options, or the method cannot carry one.
    Locked,
    /// Caller finished writing.
    Finished,
}

impl WriteLock {
    pub(crate) fn state(&self) -> WriteLockState {
        match self.0.load(Ordering::Acquire) {
            OPEN => WriteLockState::Open,
            LOCKED => WriteLockState::Locked,
            _ => WriteLockState::Finished,
        }
    }

    pub(crate) fn lock(&self) {
        let _ = self
            .0
            .compare_exchange(OPEN, LOCKED, Ordering::AcqRel, Ordering::Acquire);
    }

    pub(crate) fn finish(&self) -> bool {
        self.0
            .compare_exchange(OPEN, FINISHED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// The writable side handed to the engine by the stream adapter.
#[derive(Debug)]
pub(crate) struct WriterSlot {
    pub(crate) receiver: Option<mpsc::UnboundedReceiver<Bytes>>,
    pub(crate) lock: Arc<WriteLock>,
}

pub(crate) enum PreparedBody {
    Empty,
    Bytes(Bytes),
    Stream {
        stream: BoxBodyStream,
        length: Option<u64>,
    },
    Writer(mpsc::UnboundedReceiver<Bytes>),
}

impl PreparedBody {
    /// Upload size when it is known up front.
    pub(crate) fn total(&self) -> Option<u64> {
        match self {
            Self::Empty => Some(0),
            Self::Bytes(bytes) => Some(bytes.len() as u64),
            Self::Stream { length, .. } => *length,
            Self::Writer(_) => None,
        }
    }

    pub(crate) fn into_request_body(self, probe: AttemptProbe) -> RequestBody {
        match self {
            Self::Empty => RequestBody::empty(probe),
            Self::Bytes(bytes) => RequestBody::full(bytes, probe),
            Self::Stream { stream, length } => RequestBody::stream(stream, length, probe),
            Self::Writer(receiver) => RequestBody::channel(receiver, None, probe),
        }
    }
}

fn body_forbidden(method: &Method, allow_get_body: bool) -> bool {
    !method_can_have_body(method) && !(allow_get_body && *method == Method::GET)
}

/// Checks the payload options against each other and the method.
pub(crate) fn validate_payload(options: &NormalizedOptions) -> Result<(), Error> {
    let supplied = [
        options.body.is_some(),
        options.json.is_some(),
        options.form.is_some(),
    ]
    .into_iter()
    .filter(|supplied| *supplied)
    .count();
    if supplied > 1 {
        return Err(Error::invalid_options(
            "the `body`, `json` and `form` options are mutually exclusive",
        ));
    }
    if supplied == 1 && body_forbidden(&options.method, options.allow_get_body) {
        return Err(Error::invalid_options(format!(
            "the `{}` method cannot be used with a body",
            options.method
        )));
    }
    Ok(())
}

/// Whether the writable side must be locked before the caller gets it.
pub(crate) fn locks_writer(options: &NormalizedOptions) -> bool {
    options.has_payload() || body_forbidden(&options.method, options.allow_get_body)
}

/// False once a single-use body was handed to an earlier attempt.
pub(crate) fn is_replayable(options: &NormalizedOptions, writer: Option<&WriterSlot>) -> bool {
    if let Some(BodySource::Stream(stream)) = &options.body {
        return !stream.is_consumed();
    }
    if options.has_payload() || body_forbidden(&options.method, options.allow_get_body) {
        return true;
    }
    match writer {
        Some(slot) => slot.lock.state() == WriteLockState::Locked || slot.receiver.is_some(),
        None => true,
    }
}

pub(crate) fn consumed_body_error() -> Error {
    Error::request(
        ErrorCode::Generic,
        "cannot retry or redirect with a consumed body stream",
    )
}

fn set_default_header(options: &mut NormalizedOptions, name: http::HeaderName, value: HeaderValue) {
    if !options.headers.contains_key(&name) {
        options.headers.insert(name, value);
    }
}

fn set_content_length(options: &mut NormalizedOptions, length: u64) {
    if options.headers.contains_key(CONTENT_LENGTH) || options.headers.contains_key(TRANSFER_ENCODING)
    {
        return;
    }
    options.headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
}

/// Serializes the payload and fills in `content-type` / `content-length`.
pub(crate) fn prepare(
    options: &mut NormalizedOptions,
    writer: Option<&mut WriterSlot>,
) -> Result<PreparedBody, Error> {
    validate_payload(options)?;

    if let Some(json) = &options.json {
        let bytes = serde_json::to_vec(json)
            .map_err(|source| Error::invalid_options(format!("failed to encode json body: {source}")))?;
        set_default_header(options, CONTENT_TYPE, HeaderValue::from_static("application/json"));
        set_content_length(options, bytes.len() as u64);
        return Ok(PreparedBody::Bytes(Bytes::from(bytes)));
    }

    if let Some(form) = &options.form {
        let encoded = serde_urlencoded::to_string(form)
            .map_err(|source| Error::invalid_options(format!("failed to encode form body: {source}")))?;
        set_default_header(
            options,
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        set_content_length(options, encoded.len() as u64);
        return Ok(PreparedBody::Bytes(Bytes::from(encoded)));
    }

    match options.body.clone() {
        Some(BodySource::Bytes(bytes)) => {
            set_content_length(options, bytes.len() as u64);
            return Ok(PreparedBody::Bytes(bytes));
        }
        Some(BodySource::Stream(shared)) => {
            let stream = shared.take().ok_or_else(consumed_body_error)?;
            if let Some(length) = shared.length() {
                set_content_length(options, length);
            }
            return Ok(PreparedBody::Stream {
                stream,
                length: shared.length(),
            });
        }
        None => {}
    }

    let Some(slot) = writer else {
        return Ok(PreparedBody::Empty);
    };
    // A redirect may have rewritten the method to GET after the caller wrote.
    if slot.lock.state() == WriteLockState::Locked
        || body_forbidden(&options.method, options.allow_get_body)
    {
        return Ok(PreparedBody::Empty);
    }
    let receiver = slot.receiver.take().ok_or_else(consumed_body_error)?;
    Ok(PreparedBody::Writer(receiver))
}
