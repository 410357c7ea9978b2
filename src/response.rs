use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

type CloseHook = Box<dyn FnOnce() + Send + 'static>;

/// Response body owned by the caller.
///
/// The underlying resource is released exactly once: either by an explicit
/// [`ResponseBody::close`] or when the body is dropped.
pub struct ResponseBody {
    content: Bytes,
    on_close: Option<CloseHook>,
}

impl ResponseBody {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            on_close: None,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.content
    }

    pub fn is_open(&self) -> bool {
        self.on_close.is_some()
    }

    pub fn close(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ResponseBody")
            .field("len", &self.content.len())
            .field("open", &self.is_open())
            .finish()
    }
}

#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
    attachments: http::Extensions,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: ResponseBody::new(body),
            attachments: http::Extensions::new(),
        }
    }

    pub fn from_status(status: u16) -> Self {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, HeaderMap::new(), Bytes::new())
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Registers the action that releases the transport resource behind the body.
    pub fn with_close_hook<F>(mut self, on_close: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.body.on_close = Some(Box::new(on_close));
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    pub fn close(mut self) {
        self.body.close();
    }

    pub(crate) fn attachments(&self) -> &http::Extensions {
        &self.attachments
    }

    pub(crate) fn attachments_mut(&mut self) -> &mut http::Extensions {
        &mut self.attachments
    }
}
