//! Route handlers organized by resource

pub mod files;
pub mod health;
pub mod large_objects;
pub mod upload_stream;

use std::error::Error as StdError;
use std::io;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use blobrelay_core::{Download, DownloadHeaders};
use futures::{Stream, TryStreamExt};
use bytes::Bytes;

use super::error::ApiError;

/// Response for a started download: headers first, then the streamed body.
///
/// The transfer task keeps running detached; dropping the response body
/// is what tells it the client went away.
pub(crate) fn stream_response(headers: DownloadHeaders, download: Download) -> Result<Response, ApiError> {
    let mut map = HeaderMap::new();
    map.insert(header::CONTENT_TYPE, header_value(&headers.content_type)?);
    map.insert(header::CONTENT_LENGTH, HeaderValue::from(headers.content_length));
    map.insert(header::CONTENT_DISPOSITION, header_value(&headers.content_disposition)?);

    Ok((StatusCode::OK, map, Body::from_stream(download.body)).into_response())
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_bytes(value.as_bytes()).map_err(|_| ApiError::BadRequest {
        message: format!("invalid header value: {value:?}"),
    })
}

/// Request body as a chunk stream for the pump.
pub(crate) fn body_stream(body: Body) -> impl Stream<Item = io::Result<Bytes>> + Send {
    body.into_data_stream().map_err(body_error)
}

/// Wrap a body or multipart error in an `io::Error` whose kind is that of
/// the underlying failure. A client that hung up mid-body reads as
/// `ConnectionReset`, so the upload ends as cancelled, not as a store error.
pub(crate) fn body_error<E>(err: E) -> io::Error
where
    E: StdError + Send + Sync + 'static,
{
    let kind = underlying_kind(&err).unwrap_or(io::ErrorKind::Other);
    io::Error::new(kind, err)
}

fn underlying_kind(err: &(dyn StdError + 'static)) -> Option<io::ErrorKind> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() || hyper_err.is_canceled() || hyper_err.is_closed() {
                return Some(io::ErrorKind::ConnectionReset);
            }
        }
        current = err.source();
    }
    None
}

/// `Content-Type` of the request, if it is usable as a mimetype.
pub(crate) fn request_content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_error_keeps_nested_io_kind() {
        let err = body_error(axum::Error::new(io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn opaque_body_error_is_other() {
        let err = body_error(axum::Error::new("malformed chunk"));
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }
}
