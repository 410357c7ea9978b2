use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};

/// Fairness key for queued calls.
///
/// Calls sharing a context are served in arrival order; the queue rotates
/// between contexts so one bursty producer cannot monopolise the head.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubmissionContext(pub u64);

#[derive(Clone, Debug)]
pub struct RequestBody {
    content: Bytes,
    repeatable: bool,
}

impl RequestBody {
    pub fn new(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            repeatable: true,
        }
    }

    /// A body that the transport consumes as it writes, so it cannot be resent.
    pub fn one_shot(content: impl Into<Bytes>) -> Self {
        Self {
            content: content.into(),
            repeatable: false,
        }
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn is_repeatable(&self) -> bool {
        self.repeatable
    }
}

#[derive(Clone, Debug, Default)]
pub struct Request {
    headers: HeaderMap,
    body: Option<RequestBody>,
    attachments: http::Extensions,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_submission_context(mut self, context: SubmissionContext) -> Self {
        self.attachments.insert(context);
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    pub fn is_repeatable(&self) -> bool {
        self.body.as_ref().is_none_or(RequestBody::is_repeatable)
    }

    pub fn submission_context(&self) -> Option<SubmissionContext> {
        self.attachments.get::<SubmissionContext>().copied()
    }

    pub(crate) fn attachments(&self) -> &http::Extensions {
        &self.attachments
    }

    pub(crate) fn attachments_mut(&mut self) -> &mut http::Extensions {
        &mut self.attachments
    }
}
