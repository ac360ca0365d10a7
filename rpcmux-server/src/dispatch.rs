//! Method dispatch.
//!
//! The server decodes each request body into [`Dispatcher::Args`] and hands it
//! to the dispatcher together with the request header. Whatever the
//! dispatcher returns is written back under the same sequence number; an
//! error's `Display` text becomes the response header's error field.

use rpcmux_protocol::Header;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Dispatch errors reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),

    #[error("rpc server: service/method request ill-formed: {0}")]
    MalformedMethod(String),

    #[error("{0}")]
    Failed(String),
}

/// Resolves a service method and produces its reply.
///
/// Called once per request from that request's worker task.
pub trait Dispatcher: Send + Sync + 'static {
    type Args: DeserializeOwned + Send + 'static;
    type Reply: Serialize + Send + 'static;

    fn dispatch(&self, header: &Header, args: Self::Args) -> Result<Self::Reply, DispatchError>;
}

/// Answers every request with `"rpcmux resp <seq>"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoDispatcher;

impl Dispatcher for EchoDispatcher {
    type Args = String;
    type Reply = String;

    fn dispatch(&self, header: &Header, args: String) -> Result<String, DispatchError> {
        tracing::debug!("{} (seq={}) args: {}", header.service_method, header.seq, args);
        Ok(format!("rpcmux resp {}", header.seq))
    }
}

type Handler<A, R> = Box<dyn Fn(A) -> Result<R, DispatchError> + Send + Sync>;

/// Routes `"Service.Method"` names to handler closures sharing one argument
/// and reply type.
pub struct MethodRouter<A, R> {
    methods: HashMap<String, Handler<A, R>>,
}

impl<A, R> MethodRouter<A, R> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Registers a handler, replacing any previous one for the same name.
    pub fn register<F>(&mut self, service_method: &str, handler: F) -> Result<(), DispatchError>
    where
        F: Fn(A) -> Result<R, DispatchError> + Send + Sync + 'static,
    {
        split_service_method(service_method)?;
        self.methods
            .insert(service_method.to_string(), Box::new(handler));
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_method<F>(mut self, service_method: &str, handler: F) -> Result<Self, DispatchError>
    where
        F: Fn(A) -> Result<R, DispatchError> + Send + Sync + 'static,
    {
        self.register(service_method, handler)?;
        Ok(self)
    }

    pub fn contains(&self, service_method: &str) -> bool {
        self.methods.contains_key(service_method)
    }

    /// Returns the registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<A, R> Default for MethodRouter<A, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, R> fmt::Debug for MethodRouter<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRouter")
            .field("methods", &self.methods())
            .finish()
    }
}

impl<A, R> Dispatcher for MethodRouter<A, R>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    type Args = A;
    type Reply = R;

    fn dispatch(&self, header: &Header, args: A) -> Result<R, DispatchError> {
        split_service_method(&header.service_method)?;
        let handler = self
            .methods
            .get(&header.service_method)
            .ok_or_else(|| DispatchError::MethodNotFound(header.service_method.clone()))?;
        handler(args)
    }
}

/// Splits `"Service.Method"` at the last dot.
pub fn split_service_method(service_method: &str) -> Result<(&str, &str), DispatchError> {
    match service_method.rsplit_once('.') {
        Some((service, method)) if !service.is_empty() && !method.is_empty() => {
            Ok((service, method))
        }
        _ => Err(DispatchError::MalformedMethod(service_method.to_string())),
    }
}
