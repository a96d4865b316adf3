//! Per-request context threaded through a pipeline.
//!
//! A [`Context`] is created when a request starts, owned by the single
//! pipeline invocation that handles it, and dropped once the response is
//! written. Guards communicate with later stages only through it: the string
//! keyed value bag, the typed extension map, and the response headers they
//! stage for whatever terminal response is eventually produced.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use serde_json::Value;

use crate::http::{Headers, Request};
use crate::security::token::Claims;

/// Context key under which the token authenticator stores decoded claims.
pub const IDENTITY_KEY: &str = "user";

/// Context key under which the schema validator stores the validated body.
pub const BODY_KEY: &str = "body";

/// Type-erased extensions map, keyed by type.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any previous value of the same type.
    pub fn insert<T>(&mut self, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.map.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Path parameters bound by the router, e.g. `id → "42"` for `/todos/:id`.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct PathParams {
    map: HashMap<String, String>,
}

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: String) {
        self.map.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Per-request state bag.
pub struct Context {
    request: Request,
    params: PathParams,
    values: HashMap<String, Value>,
    extensions: Extensions,
    response_headers: Headers,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self::with_params(request, PathParams::new())
    }

    pub fn with_params(request: Request, params: PathParams) -> Self {
        Self {
            request,
            params,
            values: HashMap::new(),
            extensions: Extensions::new(),
            response_headers: Headers::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    pub(crate) fn set_params(&mut self, params: PathParams) {
        self.params = params;
    }

    /// Attach a decoded value for downstream stages.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Claims of the authenticated caller, if a token authenticator admitted it.
    pub fn identity(&self) -> Option<&Claims> {
        self.extensions.get::<Claims>()
    }

    /// The body accepted by a schema validator, if one ran.
    pub fn body(&self) -> Option<&Value> {
        self.values.get(BODY_KEY)
    }

    /// Headers staged for the eventual response.
    pub fn response_headers_mut(&mut self) -> &mut Headers {
        &mut self.response_headers
    }

    pub(crate) fn take_response_headers(&mut self) -> Headers {
        std::mem::take(&mut self.response_headers)
    }

    /// Deserialize the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body_bytes())
    }
}
