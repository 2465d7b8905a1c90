use super::{Head, Object, Range, Store};
use crate::Error;
use futures::{StreamExt, TryStreamExt};
use reqwest::{
    header::{HeaderMap, HeaderName, CONTENT_LENGTH, CONTENT_RANGE, RANGE},
    Client, StatusCode, Url,
};
use tracing::trace;

/// Object store served over HTTP (for example, a public bucket endpoint).
///
/// Objects are addressed by joining their key onto a base URL. Range reads use the
/// `Range` header; a `404` is reported as a missing object and a `416` (a range that starts
/// past the end of the object) as an empty body. Requests are not retried.
#[derive(Clone)]
pub struct Http {
    client: Client,
    base: Url,
}

impl Http {
    /// Create a store rooted at `base`.
    pub fn new(client: Client, base: Url) -> Self {
        Self { client, base }
    }

    fn url(&self, key: &str) -> Result<Url, Error> {
        self.base
            .join(key)
            .map_err(|err| Error::Store(format!("invalid key {key}: {err}")))
    }
}

/// Format `range` as the value of a `Range` header.
///
/// The last byte saturates at `u64::MAX`.
fn header(range: &Range) -> String {
    match range.length {
        Some(length) => {
            let last = range.offset.saturating_add(length.max(1) - 1);
            format!("bytes={}-{}", range.offset, last)
        }
        None => format!("bytes={}-", range.offset),
    }
}

/// Extract the total object size from a `Content-Range` value (`bytes a-b/size`).
fn total_size(content_range: &str) -> Option<u64> {
    content_range.rsplit('/').next()?.parse().ok()
}

impl Store for Http {
    async fn head(&self, key: &str) -> Result<Option<Head>, Error> {
        let url = self.url(key)?;
        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|err| Error::Store(format!("head {url}: {err}")))?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let size = response
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse().ok())
                    .ok_or_else(|| Error::Store(format!("head {url}: missing content length")))?;
                Ok(Some(Head { size }))
            }
            status => Err(Error::Store(format!("head {url}: unexpected status {status}"))),
        }
    }

    async fn get(&self, key: &str, range: Option<Range>) -> Result<Option<Object>, Error> {
        let url = self.url(key)?;
        let mut request = self.client.get(url.clone());
        if let Some(range) = &range {
            if range.length == Some(0) {
                // An empty range cannot be expressed in a header
                let Some(head) = self.head(key).await? else {
                    return Ok(None);
                };
                return Ok(Some(Object {
                    size: head.size,
                    body: futures::stream::empty().boxed(),
                }));
            }
            request = request.header(RANGE, header(range));
        }
        trace!(%url, ?range, "fetching");
        let response = request
            .send()
            .await
            .map_err(|err| Error::Store(format!("get {url}: {err}")))?;
        let (size, skip) = match outcome(response.status(), response.headers(), range.as_ref())
            .map_err(|reason| Error::Store(format!("get {url}: {reason}")))?
        {
            Outcome::Missing => return Ok(None),
            Outcome::Empty { size } => {
                return Ok(Some(Object {
                    size,
                    body: futures::stream::empty().boxed(),
                }))
            }
            Outcome::Body { size, skip } => (size, skip),
        };
        let stream = response
            .bytes_stream()
            .map_err(move |err| Error::Store(format!("read {url}: {err}")));
        let body = match skip {
            Some((start, end)) => trim(stream, start, end).boxed(),
            None => stream.boxed(),
        };
        Ok(Some(Object { size, body }))
    }
}

/// How to serve a read from the response it received.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    /// The object does not exist.
    Missing,

    /// The object holds `size` bytes, none of them in the requested range.
    Empty { size: u64 },

    /// Stream the body of an object of `size` bytes, keeping only `[start, end)` if set.
    Body { size: u64, skip: Option<(u64, u64)> },
}

/// Interpret the status and headers of a response to a read of `range`.
fn outcome(
    status: StatusCode,
    headers: &HeaderMap,
    range: Option<&Range>,
) -> Result<Outcome, String> {
    let value = |name: HeaderName| headers.get(name).and_then(|value| value.to_str().ok());
    match status {
        StatusCode::NOT_FOUND => Ok(Outcome::Missing),
        StatusCode::RANGE_NOT_SATISFIABLE => {
            let size = value(CONTENT_RANGE).and_then(total_size).unwrap_or(0);
            Ok(Outcome::Empty { size })
        }
        StatusCode::PARTIAL_CONTENT => {
            let size = value(CONTENT_RANGE)
                .and_then(total_size)
                .ok_or("missing object size")?;
            Ok(Outcome::Body { size, skip: None })
        }
        StatusCode::OK => {
            let size = value(CONTENT_LENGTH)
                .and_then(|value| value.parse().ok())
                .ok_or("missing object size")?;

            // A server that ignores the range returns the whole object
            let skip = range.map(|range| range.clamp(size));
            Ok(Outcome::Body { size, skip })
        }
        status => Err(format!("unexpected status {status}")),
    }
}

/// Restrict a whole-object stream to the bytes in `[start, end)`.
fn trim(
    stream: impl futures::Stream<Item = Result<bytes::Bytes, Error>> + Send + 'static,
    start: u64,
    end: u64,
) -> impl futures::Stream<Item = Result<bytes::Bytes, Error>> + Send + 'static {
    stream
        .scan(0u64, move |position, chunk| {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => return futures::future::ready(Some(Some(Err(err)))),
            };
            let chunk_start = *position;
            let chunk_end = chunk_start + chunk.len() as u64;
            *position = chunk_end;
            if chunk_start >= end {
                return futures::future::ready(None);
            }
            let from = start.saturating_sub(chunk_start).min(chunk.len() as u64) as usize;
            let to = (end.min(chunk_end) - chunk_start) as usize;
            if from >= to {
                return futures::future::ready(Some(None));
            }
            futures::future::ready(Some(Some(Ok(chunk.slice(from..to)))))
        })
        .filter_map(futures::future::ready)
}
