//! Per-request context: path parameters and type-keyed request extensions.
//!
//! Middleware stores request-scoped values (the resolved session, the request
//! id) in [`Extensions`]; handlers read them back by type.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use crate::Request;
use crate::security::Session;

/// Type-erased request extensions map.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, replacing any previous value of the same type.
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

/// Path parameters extracted from the matched route.
#[derive(Default, Debug, Clone)]
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

/// Identifier attached to every request by the logger middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Everything a handler gets to see about one request.
pub struct Context {
    request: Request,
    params: PathParams,
    extensions: Extensions,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            params: PathParams::new(),
            extensions: Extensions::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    /// Replaces the path parameters; called by the router once a route matches.
    pub fn set_params(&mut self, params: PathParams) {
        self.params = params;
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// The session resolved by [`SessionMiddleware`](crate::security::SessionMiddleware).
    pub fn session(&self) -> Option<&Session> {
        self.extensions.get::<Session>()
    }

    pub fn request_id(&self) -> Option<&str> {
        self.extensions.get::<RequestId>().map(|id| id.0.as_str())
    }

    /// Deserializes the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        self.request.json()
    }
}
