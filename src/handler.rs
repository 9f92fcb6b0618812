//! Request handlers.
//!
//! A handler maps one request payload to one response payload. Any
//! `Fn(Bytes) -> R` closure is a handler as long as `R` converts into a
//! response (`Bytes`, `Vec<u8>`, `String`, `&'static [u8]`, or a `Result`
//! of those).
//!
//! Handlers are shared across concurrent connections and run on the
//! blocking pool; they may block, but must not assume exclusive access to
//! anything process-wide.

use bytes::Bytes;

use crate::error::HandlerError;

pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Bytes) -> Result<Bytes, HandlerError>;
}

/// Conversion of a handler's return value into a response payload.
pub trait IntoResponse {
    fn into_response(self) -> Result<Bytes, HandlerError>;
}

impl IntoResponse for Bytes {
    fn into_response(self) -> Result<Bytes, HandlerError> {
        Ok(self)
    }
}

impl IntoResponse for Vec<u8> {
    fn into_response(self) -> Result<Bytes, HandlerError> {
        Ok(Bytes::from(self))
    }
}

impl IntoResponse for String {
    fn into_response(self) -> Result<Bytes, HandlerError> {
        Ok(Bytes::from(self))
    }
}

impl IntoResponse for &'static [u8] {
    fn into_response(self) -> Result<Bytes, HandlerError> {
        Ok(Bytes::from_static(self))
    }
}

impl<T, E> IntoResponse for Result<T, E>
where
    T: IntoResponse,
    E: Into<HandlerError>,
{
    fn into_response(self) -> Result<Bytes, HandlerError> {
        self.map_err(Into::into)?.into_response()
    }
}

impl<F, R> Handler for F
where
    F: Fn(Bytes) -> R + Send + Sync + 'static,
    R: IntoResponse,
{
    fn handle(&self, request: Bytes) -> Result<Bytes, HandlerError> {
        self(request).into_response()
    }
}

/// Built-in handlers for the binary and for smoke tests.
pub mod builtin {
    use bytes::Bytes;

    /// Return the request unchanged.
    pub fn echo(request: Bytes) -> Bytes {
        request
    }

    /// Return the request bytes in reverse order.
    pub fn reverse(request: Bytes) -> Bytes {
        request.iter().rev().copied().collect::<Vec<u8>>().into()
    }
}
